use super::entry::{CacheEntry, EntryRecord, Expire, NewEntry};
use crate::clock::SharedClock;
use crate::driver::MemcacheDriver;
use crate::tags::{TagChecksum, TagMemo};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Entry manager for one bin.
///
/// Entries are stored without a store-level expiration; freshness, tag
/// validity and bin flushes are all decided here on read. Store failures
/// read as misses and write as `false`.
pub struct CacheBackend {
    bin: String,
    bin_tag: String,
    driver: Arc<MemcacheDriver>,
    checksum: Arc<TagChecksum>,
    clock: SharedClock,
    skew_ms: i64,
}

impl CacheBackend {
    pub fn new(
        driver: Arc<MemcacheDriver>,
        checksum: Arc<TagChecksum>,
        clock: SharedClock,
        skew_ms: i64,
    ) -> Self {
        let bin = driver.bin().to_string();
        let backend = Self {
            bin_tag: format!("memcache:{}", bin),
            bin,
            driver,
            checksum,
            clock,
            skew_ms,
        };
        backend.ensure_bin_deletion_time();
        backend
    }

    pub fn bin(&self) -> &str {
        &self.bin
    }

    pub fn driver(&self) -> &Arc<MemcacheDriver> {
        &self.driver
    }

    /// Tag every entry of this bin carries
    pub fn bin_tag(&self) -> &str {
        &self.bin_tag
    }

    pub fn get<T: DeserializeOwned>(&self, cid: &str, allow_invalid: bool) -> Option<CacheEntry<T>> {
        let (mut found, _) = self.get_multiple(&[cid], allow_invalid);
        found.remove(cid)
    }

    /// Fetch several entries at once. Returns the entries found and the
    /// requested ids that were not, in request order.
    pub fn get_multiple<T, S>(
        &self,
        cids: &[S],
        allow_invalid: bool,
    ) -> (HashMap<String, CacheEntry<T>>, Vec<String>)
    where
        T: DeserializeOwned,
        S: AsRef<str>,
    {
        let mut found = HashMap::new();
        for (record, valid) in self.fetch_records(cids, allow_invalid) {
            match self.driver.serializer().decode::<T>(&record.data) {
                Ok(data) => {
                    found.insert(
                        record.cid.clone(),
                        CacheEntry {
                            cid: record.cid,
                            data,
                            created: record.created,
                            expire: record.expire,
                            tags: record.tags,
                            checksum: record.checksum,
                            valid,
                        },
                    );
                }
                Err(e) => debug!(bin = %self.bin, cid = %record.cid, error = %e, "undecodable entry"),
            }
        }

        let mut remaining = Vec::new();
        for cid in cids {
            let cid: &str = cid.as_ref();
            if !found.contains_key(cid) {
                remaining.push(cid.to_string());
            }
        }
        (found, remaining)
    }

    /// Store an entry tagged with `tags` plus the bin tag.
    ///
    /// Cids share the bin's key space with the bookkeeping items
    /// (`bin_deletion:<bin>` and [`crate::driver::REGISTRY_KEY`]); callers must not use
    /// those names.
    pub fn set<T, S>(&self, cid: &str, data: &T, expire: Expire, tags: &[S]) -> bool
    where
        T: Serialize + ?Sized,
        S: AsRef<str>,
    {
        let data = match self.driver.serializer().encode(data) {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                warn!(bin = %self.bin, cid = %cid, error = %e, "failed to encode entry data");
                return false;
            }
        };

        let mut tags: Vec<String> = tags.iter().map(|t| t.as_ref().to_string()).collect();
        tags.push(self.bin_tag.clone());
        tags.sort();
        tags.dedup();

        let checksum = self.checksum.get_current_checksum(tags.as_slice(), &mut TagMemo::new());
        let record = EntryRecord {
            cid: cid.to_string(),
            data,
            created: self.clock.now_ms(),
            expire,
            tags,
            checksum,
        };
        // Kept permanently by the store; expiration is decided on read
        self.driver.set(cid, &record, 0)
    }

    /// Store every item. True only if all writes succeeded.
    pub fn set_multiple<T, K, I>(&self, items: I) -> bool
    where
        T: Serialize,
        K: AsRef<str>,
        I: IntoIterator<Item = (K, NewEntry<T>)>,
    {
        items.into_iter().fold(true, |ok, (cid, item)| {
            self.set(cid.as_ref(), &item.data, item.expire, item.tags.as_slice()) && ok
        })
    }

    pub fn delete(&self, cid: &str) -> bool {
        self.driver.delete(cid)
    }

    pub fn delete_multiple<S: AsRef<str>>(&self, cids: &[S]) -> bool {
        cids.iter()
            .fold(true, |ok, cid| self.driver.delete(cid.as_ref()) && ok)
    }

    /// Logically empty the bin by moving its deletion marker to now
    pub fn delete_all(&self) -> bool {
        self.update_bin_deletion_time()
    }

    pub fn invalidate(&self, cid: &str) -> bool {
        self.invalidate_multiple(&[cid])
    }

    /// Mark entries expired without deleting them, so callers accepting
    /// stale data can still read them.
    pub fn invalidate_multiple<S: AsRef<str>>(&self, cids: &[S]) -> bool {
        let expired = Expire::At(self.clock.now_secs() - 1);
        self.fetch_records(cids, false)
            .into_iter()
            .fold(true, |ok, (mut record, _)| {
                record.expire = expired;
                let cid = record.cid.clone();
                self.driver.set(&cid, &record, 0) && ok
            })
    }

    pub fn invalidate_tags<S: AsRef<str>>(&self, tags: &[S]) {
        self.checksum.invalidate_tags(tags, &mut TagMemo::new());
    }

    /// Invalidate every entry of the bin through its bin tag
    pub fn invalidate_all(&self) {
        self.invalidate_tags(&[self.bin_tag.as_str()]);
    }

    pub fn remove_bin(&self) -> bool {
        self.update_bin_deletion_time()
    }

    /// Nothing to do: the store evicts on its own.
    pub fn garbage_collection(&self) {}

    /// The store cannot enumerate a bin, so it is never known to be empty
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Time of the last bin flush in milliseconds.
    ///
    /// A marker that went missing is written again with the current time,
    /// which hides everything written before.
    pub fn bin_deletion_time(&self) -> i64 {
        match self.driver.get::<i64>(&self.bin_deletion_key()) {
            Some(time) => time,
            None => {
                let now = self.clock.now_ms();
                debug!(bin = %self.bin, "bin deletion marker missing, resetting");
                self.write_bin_deletion_time(now);
                now
            }
        }
    }

    fn bin_deletion_key(&self) -> String {
        format!("bin_deletion:{}", self.bin)
    }

    fn ensure_bin_deletion_time(&self) {
        if self.driver.get::<i64>(&self.bin_deletion_key()).is_none() {
            self.update_bin_deletion_time();
        }
    }

    fn update_bin_deletion_time(&self) -> bool {
        self.write_bin_deletion_time(self.clock.now_ms())
    }

    fn write_bin_deletion_time(&self, time: i64) -> bool {
        let written = self.driver.set(&self.bin_deletion_key(), &time, 0);
        if !written {
            warn!(bin = %self.bin, "failed to write bin deletion marker");
        }
        written
    }

    /// Entries created within the skew window of a flush count as flushed
    fn created_after_deletion(&self, created: i64, deletion: i64) -> bool {
        created >= deletion.saturating_add(self.skew_ms)
    }

    /// Visible records in request order, each with its validity. Invalid
    /// records are only included with `allow_invalid`.
    fn fetch_records<S: AsRef<str>>(
        &self,
        cids: &[S],
        allow_invalid: bool,
    ) -> Vec<(EntryRecord, bool)> {
        let mut records: HashMap<String, EntryRecord> = self.driver.get_multi(cids);
        if records.is_empty() {
            return Vec::new();
        }

        let deletion = self.bin_deletion_time();
        let now = self.clock.now_secs();
        let mut memo = TagMemo::new();
        let mut seen = HashSet::new();
        let mut out = Vec::with_capacity(records.len());

        for cid in cids {
            let cid: &str = cid.as_ref();
            if !seen.insert(cid) {
                continue;
            }
            let Some(record) = records.remove(cid) else {
                continue;
            };
            if record.cid != cid {
                debug!(bin = %self.bin, cid = %cid, stored = %record.cid, "key collision");
                continue;
            }
            if !self.created_after_deletion(record.created, deletion) {
                continue;
            }

            let valid = !record.expire.is_expired(now)
                && self
                    .checksum
                    .is_valid(record.checksum, record.tags.as_slice(), &mut memo);
            if valid || allow_invalid {
                out.push((record, valid));
            }
        }
        out
    }
}
