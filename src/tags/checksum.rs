use super::TimestampInvalidator;
use std::collections::HashMap;

/// Tag timestamps already looked up during one logical operation.
///
/// Other processes invalidate concurrently, so a memo must not outlive the
/// operation it was created for.
#[derive(Debug, Default)]
pub struct TagMemo {
    timestamps: HashMap<String, i64>,
}

impl TagMemo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, tag: &str) -> Option<i64> {
        self.timestamps.get(tag).copied()
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

/// Tag based validity of cache entries.
///
/// An entry stores the checksum of its tags at write time: the most recent
/// invalidation timestamp among them. It stays valid while that value does
/// not change.
pub struct TagChecksum {
    invalidator: TimestampInvalidator,
}

impl TagChecksum {
    pub fn new(invalidator: TimestampInvalidator) -> Self {
        Self { invalidator }
    }

    pub fn invalidator(&self) -> &TimestampInvalidator {
        &self.invalidator
    }

    pub fn get_current_checksum<S: AsRef<str>>(&self, tags: &[S], memo: &mut TagMemo) -> i64 {
        self.calculate_checksum(tags, memo)
    }

    pub fn is_valid<S: AsRef<str>>(&self, checksum: i64, tags: &[S], memo: &mut TagMemo) -> bool {
        if tags.is_empty() {
            return checksum == 0;
        }
        checksum == self.calculate_checksum(tags, memo)
    }

    pub fn invalidate_tags<S: AsRef<str>>(&self, tags: &[S], memo: &mut TagMemo) {
        for tag in tags {
            let tag = tag.as_ref();
            let timestamp = self.invalidator.invalidate_timestamp(tag);
            memo.timestamps.insert(tag.to_string(), timestamp);
        }
    }

    fn calculate_checksum<S: AsRef<str>>(&self, tags: &[S], memo: &mut TagMemo) -> i64 {
        let query: Vec<&str> = tags
            .iter()
            .map(AsRef::as_ref)
            .filter(|tag| !memo.timestamps.contains_key(*tag))
            .collect();

        if !query.is_empty() {
            let found = self.invalidator.last_timestamps(&query);
            for tag in query {
                let timestamp = match found.get(tag) {
                    Some(timestamp) => *timestamp,
                    // A tag without a record may have been evicted. Start
                    // tracking it again from now so that anything checksummed
                    // before the eviction can no longer match.
                    None => self.invalidator.invalidate_timestamp(tag),
                };
                memo.timestamps.insert(tag.to_string(), timestamp);
            }
        }

        tags.iter()
            .filter_map(|tag| memo.timestamps.get(tag.as_ref()))
            .copied()
            .fold(0, i64::max)
    }
}
