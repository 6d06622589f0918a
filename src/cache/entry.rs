use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// When an entry stops being fresh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Expire {
    #[default]
    Permanent,
    /// UNIX time in seconds
    At(i64),
}

impl Expire {
    pub fn is_expired(&self, now_secs: i64) -> bool {
        match self {
            Expire::Permanent => false,
            Expire::At(at) => *at <= now_secs,
        }
    }
}

/// An entry as it is stored. `data` holds the value already encoded with
/// the bin's serializer, so an entry can be rewritten without knowing the
/// type of its value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryRecord {
    pub cid: String,
    pub data: Bytes,
    /// Milliseconds since the UNIX epoch
    pub created: i64,
    pub expire: Expire,
    /// Deduplicated and sorted, including the bin tag
    pub tags: Vec<String>,
    pub checksum: i64,
}

/// An entry handed back to callers
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
    pub cid: String,
    pub data: T,
    pub created: i64,
    pub expire: Expire,
    pub tags: Vec<String>,
    pub checksum: i64,
    /// False for expired or tag-invalidated entries, which are only
    /// returned when asked for
    pub valid: bool,
}

/// One item for [`super::CacheBackend::set_multiple`]
#[derive(Debug, Clone)]
pub struct NewEntry<T> {
    pub data: T,
    pub expire: Expire,
    pub tags: Vec<String>,
}

impl<T> NewEntry<T> {
    pub fn new(data: T) -> Self {
        Self {
            data,
            expire: Expire::Permanent,
            tags: Vec::new(),
        }
    }

    pub fn expire(mut self, expire: Expire) -> Self {
        self.expire = expire;
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}
