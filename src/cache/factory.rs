use super::CacheBackend;
use crate::cluster::ClusterRouter;
use crate::error::Result;
use crate::tags::{TagChecksum, TimestampInvalidator};
use std::sync::Arc;

/// Builds [`CacheBackend`] handles that share one router and one tag
/// checksum service.
pub struct CacheBackendFactory {
    router: Arc<ClusterRouter>,
    checksum: Arc<TagChecksum>,
}

impl CacheBackendFactory {
    /// Connects the invalidation bin right away, so an unreachable
    /// invalidation cluster fails here.
    pub fn new(router: Arc<ClusterRouter>) -> Result<Self> {
        let driver = router.get(&router.config().invalidation_bin)?;
        let invalidator = TimestampInvalidator::new(driver, router.clock().clone());
        Ok(Self {
            router,
            checksum: Arc::new(TagChecksum::new(invalidator)),
        })
    }

    pub fn router(&self) -> &Arc<ClusterRouter> {
        &self.router
    }

    pub fn checksum(&self) -> &Arc<TagChecksum> {
        &self.checksum
    }

    pub fn get(&self, bin: &str) -> Result<CacheBackend> {
        let driver = self.router.get(bin)?;
        Ok(CacheBackend::new(
            driver,
            self.checksum.clone(),
            self.router.clock().clone(),
            self.router.config().bin_deletion_skew_ms,
        ))
    }
}
