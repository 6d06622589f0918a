//! Synchronous memcached client speaking the ASCII protocol.

use super::hashring::server_index;
use super::protocol::{self, Reply, ReplyKind, ReplyParser};
use super::{Backend, ServerStats};
use crate::error::{CacheError, Result};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const READ_CHUNK: usize = 16 * 1024;

enum Transport {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Transport {
    fn connect(address: &str, connect_timeout: Duration, io_timeout: Duration) -> io::Result<Self> {
        #[cfg(unix)]
        {
            if let Some(path) = address.strip_prefix("unix://") {
                let stream = UnixStream::connect(path)?;
                stream.set_read_timeout(Some(io_timeout))?;
                stream.set_write_timeout(Some(io_timeout))?;
                return Ok(Transport::Unix(stream));
            }
        }

        let mut last_err = io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no address resolved for {}", address),
        );
        for addr in address.to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, connect_timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(io_timeout))?;
                    stream.set_write_timeout(Some(io_timeout))?;
                    stream.set_nodelay(true)?;
                    return Ok(Transport::Tcp(stream));
                }
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Tcp(s) => s.read(buf),
            #[cfg(unix)]
            Transport::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Tcp(s) => s.write(buf),
            #[cfg(unix)]
            Transport::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Tcp(s) => s.flush(),
            #[cfg(unix)]
            Transport::Unix(s) => s.flush(),
        }
    }
}

enum ConnState {
    Connected(Transport),
    /// Lost; redialled by the first request at or after `retry_at`
    Disconnected { retry_at: Instant },
}

struct ServerConnection {
    address: String,
    persistent: bool,
    state: Mutex<(ConnState, ReplyParser)>,
}

impl ServerConnection {
    /// When a lost connection may be redialled. Persistent servers redial
    /// right away, others wait one connect timeout.
    fn retry_at(&self, connect_timeout: Duration) -> Instant {
        if self.persistent {
            Instant::now()
        } else {
            Instant::now() + connect_timeout
        }
    }

    fn request(
        &self,
        payload: &[u8],
        kind: ReplyKind,
        connect_timeout: Duration,
        io_timeout: Duration,
    ) -> Result<Reply> {
        let mut guard = self
            .state
            .lock()
            .map_err(|e| CacheError::Backend(format!("Lock error: {}", e)))?;
        let (state, parser) = &mut *guard;

        if let ConnState::Disconnected { retry_at } = &mut *state {
            if Instant::now() < *retry_at {
                return Err(CacheError::Backend(format!(
                    "server {} is down, retrying later",
                    self.address
                )));
            }
            debug!(server = %self.address, "reconnecting to memcached");
            match Transport::connect(&self.address, connect_timeout, io_timeout) {
                Ok(transport) => {
                    *state = ConnState::Connected(transport);
                    parser.clear();
                }
                Err(e) => {
                    *retry_at = self.retry_at(connect_timeout);
                    return Err(e.into());
                }
            }
        }
        let ConnState::Connected(transport) = &mut *state else {
            return Err(CacheError::Backend(format!(
                "server {} is not connected",
                self.address
            )));
        };

        match Self::exchange(transport, parser, payload, kind) {
            Ok(reply) => Ok(reply),
            Err(e) => {
                warn!(server = %self.address, error = %e, "memcached request failed");
                parser.clear();
                *state = ConnState::Disconnected {
                    retry_at: self.retry_at(connect_timeout),
                };
                Err(e)
            }
        }
    }

    fn exchange(
        transport: &mut Transport,
        parser: &mut ReplyParser,
        payload: &[u8],
        kind: ReplyKind,
    ) -> Result<Reply> {
        transport.write_all(payload)?;
        transport.flush()?;

        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            if let Some(reply) = parser.parse(kind)? {
                return Ok(reply);
            }
            let n = transport.read(&mut chunk)?;
            if n == 0 {
                return Err(CacheError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed by server",
                )));
            }
            parser.feed(&chunk[..n]);
        }
    }
}

/// One connection object per cluster. Keys are spread over the connected
/// servers by CRC16 of the physical key.
pub struct MemcachedBackend {
    servers: RwLock<Vec<Arc<ServerConnection>>>,
    connect_timeout: Duration,
    io_timeout: Duration,
    item_max_size: usize,
    closed: AtomicBool,
}

impl MemcachedBackend {
    pub fn new(connect_timeout: Duration, io_timeout: Duration, item_max_size: usize) -> Self {
        Self {
            servers: RwLock::new(Vec::new()),
            connect_timeout,
            io_timeout,
            item_max_size,
            closed: AtomicBool::new(false),
        }
    }

    fn servers(&self) -> Result<Vec<Arc<ServerConnection>>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CacheError::Closed);
        }
        let servers = self
            .servers
            .read()
            .map_err(|e| CacheError::Backend(format!("Lock error: {}", e)))?;
        if servers.is_empty() {
            return Err(CacheError::Backend("no servers connected".to_string()));
        }
        Ok(servers.clone())
    }

    fn server_for(&self, key: &str) -> Result<Arc<ServerConnection>> {
        let servers = self.servers()?;
        Ok(servers[server_index(key, servers.len())].clone())
    }

    fn request(&self, server: &ServerConnection, payload: &[u8], kind: ReplyKind) -> Result<Reply> {
        server.request(payload, kind, self.connect_timeout, self.io_timeout)
    }

    fn store(&self, command: &str, key: &str, value: &Bytes, exptime: u32) -> Result<Reply> {
        if key.len() + value.len() > self.item_max_size {
            return Err(CacheError::ObjectTooLarge(format!(
                "{} bytes exceeds item limit of {}",
                key.len() + value.len(),
                self.item_max_size
            )));
        }
        let server = self.server_for(key)?;
        let payload = protocol::encode_storage(command, key, 0, exptime, value);
        let reply = self.request(&server, &payload, ReplyKind::Storage)?;
        if reply.is_too_large() {
            return Err(CacheError::ObjectTooLarge(format!("{:?}", reply)));
        }
        Ok(reply)
    }
}

fn unexpected_reply(reply: Reply) -> CacheError {
    match reply {
        Reply::ServerError(msg) => CacheError::Backend(format!("SERVER_ERROR {}", msg)),
        Reply::ClientError(msg) => CacheError::Backend(format!("CLIENT_ERROR {}", msg)),
        other => CacheError::Protocol(format!("Unexpected reply: {:?}", other)),
    }
}

impl Backend for MemcachedBackend {
    fn add_server(&self, address: &str, persistent: bool) -> Result<()> {
        let transport = Transport::connect(address, self.connect_timeout, self.io_timeout)?;
        let connection = Arc::new(ServerConnection {
            address: address.to_string(),
            persistent,
            state: Mutex::new((ConnState::Connected(transport), ReplyParser::new(READ_CHUNK))),
        });
        let mut servers = self
            .servers
            .write()
            .map_err(|e| CacheError::Backend(format!("Lock error: {}", e)))?;
        servers.push(connection);
        self.closed.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let server = self.server_for(key)?;
        match self.request(&server, &protocol::encode_get(&[key]), ReplyKind::Retrieval)? {
            Reply::Values(values) => Ok(values
                .into_iter()
                .find(|v| v.key == key)
                .map(|v| v.data)),
            other => Err(unexpected_reply(other)),
        }
    }

    fn get_multi(&self, keys: &[String]) -> Result<HashMap<String, Bytes>> {
        let servers = self.servers()?;
        let mut by_server: BTreeMap<usize, Vec<&str>> = BTreeMap::new();
        for key in keys {
            by_server
                .entry(server_index(key, servers.len()))
                .or_default()
                .push(key.as_str());
        }

        let mut found = HashMap::with_capacity(keys.len());
        for (index, server_keys) in by_server {
            let server = &servers[index];
            match self.request(server, &protocol::encode_get(&server_keys), ReplyKind::Retrieval) {
                Ok(Reply::Values(values)) => {
                    for value in values {
                        found.insert(value.key, value.data);
                    }
                }
                Ok(other) => {
                    debug!(server = %server.address, reply = ?other, "unexpected multi-get reply");
                }
                Err(e) => {
                    debug!(server = %server.address, error = %e, "multi-get failed for server");
                }
            }
        }
        Ok(found)
    }

    fn set(&self, key: &str, value: Bytes, exptime: u32) -> Result<()> {
        match self.store("set", key, &value, exptime)? {
            Reply::Stored => Ok(()),
            other => Err(unexpected_reply(other)),
        }
    }

    fn add(&self, key: &str, value: Bytes, exptime: u32) -> Result<bool> {
        match self.store("add", key, &value, exptime)? {
            Reply::Stored => Ok(true),
            Reply::NotStored | Reply::Exists => Ok(false),
            other => Err(unexpected_reply(other)),
        }
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let server = self.server_for(key)?;
        match self.request(&server, &protocol::encode_delete(key), ReplyKind::Deletion)? {
            Reply::Deleted => Ok(true),
            Reply::NotFound => Ok(false),
            other => Err(unexpected_reply(other)),
        }
    }

    fn flush(&self) -> Result<()> {
        for server in self.servers()? {
            match self.request(&server, &protocol::encode_flush_all(), ReplyKind::Flush)? {
                Reply::Ok => {}
                other => return Err(unexpected_reply(other)),
            }
        }
        Ok(())
    }

    fn stats(&self) -> Result<ServerStats> {
        let mut stats = ServerStats::new();
        for server in self.servers()? {
            match self.request(&server, &protocol::encode_stats(), ReplyKind::Stats) {
                Ok(Reply::Stats(rows)) => {
                    stats.insert(server.address.clone(), rows.into_iter().collect());
                }
                Ok(other) => debug!(server = %server.address, reply = ?other, "unexpected stats reply"),
                Err(e) => debug!(server = %server.address, error = %e, "stats failed for server"),
            }
        }
        Ok(stats)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Ok(servers) = self.servers.read() {
            for server in servers.iter() {
                if let Ok(mut guard) = server.state.lock() {
                    guard.0 = ConnState::Disconnected {
                        retry_at: Instant::now(),
                    };
                    guard.1.clear();
                }
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader};
    use std::net::TcpListener;
    use std::thread;

    /// Accepts one connection and answers each request line with a canned reply
    fn fake_server(replies: Vec<&'static [u8]>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut writer = stream;
            for reply in replies {
                let mut line = String::new();
                if reader.read_line(&mut line).unwrap() == 0 {
                    return;
                }
                if line.starts_with("set ") || line.starts_with("add ") {
                    let len: usize = line.split_whitespace().nth(4).unwrap().parse().unwrap();
                    let mut data = vec![0u8; len + 2];
                    reader.read_exact(&mut data).unwrap();
                }
                writer.write_all(reply).unwrap();
            }
        });
        address
    }

    /// Drops the first connection after its first request, then answers
    /// every request on later connections with an empty retrieval reply
    fn flaky_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        thread::spawn(move || {
            let (first, _) = listener.accept().unwrap();
            let mut line = String::new();
            let _ = BufReader::new(&first).read_line(&mut line);
            drop(first);

            for stream in listener.incoming() {
                let Ok(stream) = stream else { return };
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                let mut writer = stream;
                let mut line = String::new();
                while reader.read_line(&mut line).unwrap_or(0) > 0 {
                    if writer.write_all(b"END\r\n").is_err() {
                        break;
                    }
                    line.clear();
                }
            }
        });
        address
    }

    fn backend() -> MemcachedBackend {
        MemcachedBackend::new(Duration::from_secs(1), Duration::from_secs(1), 1024 * 1024)
    }

    #[test]
    fn test_set_and_get_against_fake_server() {
        let address = fake_server(vec![b"STORED\r\n", b"VALUE k 0 5\r\nhello\r\nEND\r\n"]);
        let backend = backend();
        backend.add_server(&address, false).unwrap();
        backend.set("k", Bytes::from("hello"), 0).unwrap();
        assert_eq!(backend.get("k").unwrap(), Some(Bytes::from("hello")));
    }

    #[test]
    fn test_too_large_reply_maps_to_object_too_large() {
        let address = fake_server(vec![b"SERVER_ERROR object too large for cache\r\n"]);
        let backend = backend();
        backend.add_server(&address, false).unwrap();
        let err = backend.set("k", Bytes::from("v"), 0).unwrap_err();
        assert!(matches!(err, CacheError::ObjectTooLarge(_)));
    }

    #[test]
    fn test_client_side_size_check() {
        let backend = MemcachedBackend::new(Duration::from_secs(1), Duration::from_secs(1), 8);
        let err = backend.set("key", Bytes::from("0123456789"), 0).unwrap_err();
        assert!(matches!(err, CacheError::ObjectTooLarge(_)));
    }

    #[test]
    fn test_multi_get_reassociates_by_key() {
        let address = fake_server(vec![
            b"VALUE c 0 1\r\n3\r\nVALUE a 0 1\r\n1\r\nEND\r\n",
        ]);
        let backend = backend();
        backend.add_server(&address, false).unwrap();
        let found = backend
            .get_multi(&["a".to_string(), "b".to_string(), "c".to_string()])
            .unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found["a"], Bytes::from("1"));
        assert_eq!(found["c"], Bytes::from("3"));
    }

    #[test]
    fn test_persistent_server_redials_after_io_error() {
        let address = flaky_server();
        let backend = backend();
        backend.add_server(&address, true).unwrap();

        assert!(backend.get("k").is_err());
        assert_eq!(backend.get("k").unwrap(), None);
        assert_eq!(backend.get("k").unwrap(), None);
    }

    #[test]
    fn test_non_persistent_server_recovers_after_backoff() {
        let address = flaky_server();
        let backend = MemcachedBackend::new(
            Duration::from_millis(200),
            Duration::from_secs(1),
            1024 * 1024,
        );
        backend.add_server(&address, false).unwrap();

        assert!(backend.get("k").is_err());
        // Still backing off
        assert!(backend.get("k").is_err());

        thread::sleep(Duration::from_millis(300));
        assert_eq!(backend.get("k").unwrap(), None);
        assert_eq!(backend.get("k").unwrap(), None);
    }

    #[test]
    fn test_unreachable_server() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);
        let backend = backend();
        assert!(backend.add_server(&address, false).is_err());
        assert!(backend.get("k").is_err());
    }

    #[test]
    fn test_close_is_observable() {
        let address = fake_server(vec![]);
        let backend = backend();
        backend.add_server(&address, true).unwrap();
        backend.close();
        assert!(backend.is_closed());
        assert!(matches!(backend.get("k").unwrap_err(), CacheError::Closed));
    }
}
