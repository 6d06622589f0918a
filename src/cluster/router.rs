use crate::clock::SharedClock;
use crate::config::CacheConfig;
use crate::driver::MemcacheDriver;
use crate::error::{CacheError, Result};
use crate::observability::RequestStats;
use crate::storage::{Backend, Connector};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info};

#[derive(Default)]
struct RouterState {
    /// Bin name -> adapter bound to that bin
    drivers: HashMap<String, Arc<MemcacheDriver>>,
    /// Cluster name -> the one connection object serving it
    clusters: HashMap<String, Arc<dyn Backend>>,
    /// Addresses that refused a connection. Kept for the life of the router.
    failed_servers: HashSet<String>,
}

/// Hands out bin adapters, connecting each cluster lazily on first use.
///
/// Bins mapped to the same cluster share one connection object; closing it
/// through one bin closes it for all of them.
pub struct ClusterRouter {
    config: CacheConfig,
    connector: Connector,
    clock: SharedClock,
    stats: Option<Arc<RequestStats>>,
    state: Mutex<RouterState>,
}

impl ClusterRouter {
    pub fn new(config: CacheConfig, clock: SharedClock) -> Self {
        let connector = Connector::from_config(&config);
        Self::with_connector(config, connector, clock)
    }

    /// Use `connector` to open cluster connections instead of the
    /// configured driver
    pub fn with_connector(config: CacheConfig, connector: Connector, clock: SharedClock) -> Self {
        let stats = config.stats.then(|| Arc::new(RequestStats::new()));
        Self {
            config,
            connector,
            clock,
            stats,
            state: Mutex::new(RouterState::default()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Request statistics, when enabled in the configuration
    pub fn stats(&self) -> Option<&Arc<RequestStats>> {
        self.stats.as_ref()
    }

    /// The adapter for `bin`. Fails only when no server of the bin's
    /// cluster can be reached.
    pub fn get(&self, bin: &str) -> Result<Arc<MemcacheDriver>> {
        let mut state = self.lock()?;
        if let Some(driver) = state.drivers.get(bin) {
            return Ok(driver.clone());
        }

        let cluster = self.config.cluster_for(bin).to_string();
        let connection = match state.clusters.get(&cluster) {
            Some(connection) => connection.clone(),
            None => {
                let connection = self.connect(&cluster, &mut state)?;
                state.clusters.insert(cluster.clone(), connection.clone());
                connection
            }
        };

        debug!(bin = %bin, cluster = %cluster, "binding bin to cluster");
        let driver = Arc::new(MemcacheDriver::new(
            bin,
            connection,
            &self.config,
            self.stats.clone(),
            self.clock.clone(),
        ));
        state.drivers.insert(bin.to_string(), driver.clone());
        Ok(driver)
    }

    /// Close every cluster connection and forget all bins. The next `get`
    /// reconnects.
    pub fn flush(&self) {
        let Ok(mut state) = self.lock() else {
            return;
        };
        for (cluster, connection) in state.clusters.drain() {
            debug!(cluster = %cluster, "closing cluster connection");
            connection.close();
        }
        state.drivers.clear();
    }

    /// Names of clusters with a live connection
    pub fn connected_clusters(&self) -> Vec<String> {
        self.lock()
            .map(|state| {
                let mut names: Vec<String> = state.clusters.keys().cloned().collect();
                names.sort();
                names
            })
            .unwrap_or_default()
    }

    pub fn failed_servers(&self) -> Vec<String> {
        self.lock()
            .map(|state| {
                let mut servers: Vec<String> = state.failed_servers.iter().cloned().collect();
                servers.sort();
                servers
            })
            .unwrap_or_default()
    }

    fn connect(&self, cluster: &str, state: &mut RouterState) -> Result<Arc<dyn Backend>> {
        let connection = self.connector.open();
        let mut connected = 0;

        for server in self.config.servers_for(cluster) {
            if state.failed_servers.contains(server) {
                continue;
            }
            match connection.add_server(server, self.config.persistent) {
                Ok(()) => connected += 1,
                Err(e) => {
                    error!(server = %server, cluster = %cluster, error = %e, "failed to connect to memcache server");
                    state.failed_servers.insert(server.clone());
                }
            }
        }

        if connected == 0 {
            error!(cluster = %cluster, "no server of the cluster is reachable");
            return Err(CacheError::Connection {
                cluster: cluster.to_string(),
            });
        }
        info!(cluster = %cluster, servers = connected, "connected cluster");
        Ok(connection)
    }

    fn lock(&self) -> Result<MutexGuard<'_, RouterState>> {
        self.state
            .lock()
            .map_err(|e| CacheError::Backend(format!("Lock error: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::storage::{DriverKind, MemoryBackend};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config() -> CacheConfig {
        let mut clusters = BTreeMap::new();
        clusters.insert("default".to_string(), vec!["10.0.0.1:11211".to_string()]);
        clusters.insert(
            "clusterA".to_string(),
            vec!["10.0.0.2:11211".to_string(), "10.0.0.3:11211".to_string()],
        );
        clusters.insert("down".to_string(), vec!["10.0.0.9:11211".to_string()]);
        let mut bins = BTreeMap::new();
        bins.insert("cache".to_string(), "default".to_string());
        bins.insert("alpha".to_string(), "clusterA".to_string());
        bins.insert("beta".to_string(), "clusterA".to_string());
        bins.insert("broken".to_string(), "down".to_string());
        CacheConfig {
            clusters,
            bins,
            driver: DriverKind::Memory,
            ..Default::default()
        }
    }

    fn router_counting(opened: Arc<AtomicUsize>) -> ClusterRouter {
        let connector = Connector::custom(move || {
            opened.fetch_add(1, Ordering::SeqCst);
            Arc::new(MemoryBackend::new(1024 * 1024).refusing(["10.0.0.9:11211", "10.0.0.3:11211"]))
        });
        ClusterRouter::with_connector(config(), connector, Arc::new(SystemClock))
    }

    #[test]
    fn test_bins_of_one_cluster_share_a_connection() {
        let opened = Arc::new(AtomicUsize::new(0));
        let router = router_counting(opened.clone());
        let alpha = router.get("alpha").unwrap();
        let beta = router.get("beta").unwrap();
        assert!(Arc::ptr_eq(alpha.connection(), beta.connection()));
        assert_eq!(opened.load(Ordering::SeqCst), 1);

        alpha.connection().close();
        assert!(beta.connection().is_closed());
    }

    #[test]
    fn test_same_bin_returns_same_adapter() {
        let router = router_counting(Arc::new(AtomicUsize::new(0)));
        let a = router.get("alpha").unwrap();
        let b = router.get("alpha").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_unmapped_bin_uses_default_bin_cluster() {
        let router = router_counting(Arc::new(AtomicUsize::new(0)));
        let cache = router.get("cache").unwrap();
        let other = router.get("render").unwrap();
        assert!(Arc::ptr_eq(cache.connection(), other.connection()));
        assert_eq!(other.bin(), "render");
        assert_ne!(cache.key("k"), other.key("k"));
    }

    #[test]
    fn test_partially_reachable_cluster() {
        let router = router_counting(Arc::new(AtomicUsize::new(0)));
        assert!(router.get("alpha").is_ok());
        assert_eq!(router.failed_servers(), vec!["10.0.0.3:11211".to_string()]);
    }

    #[test]
    fn test_unreachable_cluster_is_fatal_and_remembered() {
        let opened = Arc::new(AtomicUsize::new(0));
        let router = router_counting(opened.clone());
        let err = router.get("broken").err().unwrap();
        assert!(err.is_fatal());
        assert!(matches!(err, CacheError::Connection { ref cluster } if cluster == "down"));

        // The refused address is not dialed again
        assert!(router.get("broken").is_err());
        assert_eq!(router.failed_servers(), vec!["10.0.0.9:11211".to_string()]);
        assert!(router.connected_clusters().is_empty());
    }

    #[test]
    fn test_flush_closes_and_reconnects() {
        let opened = Arc::new(AtomicUsize::new(0));
        let router = router_counting(opened.clone());
        let before = router.get("alpha").unwrap();
        router.flush();
        assert!(before.connection().is_closed());
        assert!(router.connected_clusters().is_empty());

        let after = router.get("alpha").unwrap();
        assert!(!Arc::ptr_eq(before.connection(), after.connection()));
        assert!(!after.connection().is_closed());
        assert_eq!(opened.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_stats_follow_configuration() {
        let router = ClusterRouter::with_connector(
            CacheConfig { stats: true, ..config() },
            Connector::custom(|| Arc::new(MemoryBackend::new(1024 * 1024))),
            Arc::new(SystemClock),
        );
        let driver = router.get("cache").unwrap();
        driver.set("k", "v", 0);
        assert_eq!(router.stats().unwrap().snapshot().ops["set"].hits, 1);
    }
}
