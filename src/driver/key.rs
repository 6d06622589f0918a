//! Physical key construction.
//!
//! A logical key becomes `<prefix>:<bin>:-<key>`, percent-encoded so it is
//! safe on the wire. Physical keys longer than the store allows are replaced
//! by the digest of the logical key followed by as much of the encoded key
//! as still fits.

use serde::Deserialize;
use sha1::{Digest, Sha1};
use sha2::Sha256;

/// Longest key memcached accepts
pub const MAX_KEY_LENGTH: usize = 250;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Sha1,
    Sha256,
}

impl HashAlgorithm {
    /// Lowercase hex digest of `data`
    pub fn hex_digest(&self, data: &[u8]) -> String {
        match self {
            HashAlgorithm::Sha1 => hex::encode(Sha1::digest(data)),
            HashAlgorithm::Sha256 => hex::encode(Sha256::digest(data)),
        }
    }
}

/// Builds bin-scoped physical keys
#[derive(Debug, Clone)]
pub struct KeyBuilder {
    prefix: String,
    algorithm: HashAlgorithm,
}

impl KeyBuilder {
    pub fn new(key_prefix: &str, bin: &str, algorithm: HashAlgorithm) -> Self {
        let mut prefix = String::new();
        if !key_prefix.is_empty() {
            prefix.push_str(key_prefix);
            prefix.push(':');
        }
        if !bin.is_empty() {
            prefix.push_str(bin);
            prefix.push(':');
        }
        Self { prefix, algorithm }
    }

    pub fn key(&self, key: &str) -> String {
        let full_key = encode_key(&format!("{}-{}", self.prefix, key));
        if full_key.len() <= MAX_KEY_LENGTH {
            return full_key;
        }

        let mut short_key = encode_key(&format!(
            "{}-{}",
            self.prefix,
            self.algorithm.hex_digest(key.as_bytes())
        ));
        if short_key.len() + 1 < MAX_KEY_LENGTH {
            let room = MAX_KEY_LENGTH - short_key.len() - 1;
            let encoded = encode_key(key);
            short_key.push('-');
            // Percent-encoded text is ASCII, any byte offset is a char boundary
            short_key.push_str(&encoded[..room.min(encoded.len())]);
        }
        short_key.truncate(MAX_KEY_LENGTH);
        short_key
    }
}

/// Percent-encode everything but unreserved characters and ':'
fn encode_key(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b':' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_keys_are_prefixed_and_encoded() {
        let keys = KeyBuilder::new("site1", "render", HashAlgorithm::Sha1);
        assert_eq!(keys.key("node:1"), "site1:render:-node:1");
        assert_eq!(keys.key("a b/c"), "site1:render:-a%20b%2Fc");

        let keys = KeyBuilder::new("", "cache", HashAlgorithm::Sha1);
        assert_eq!(keys.key("x"), "cache:-x");
    }

    #[test]
    fn test_long_keys_are_hashed_under_the_limit() {
        let keys = KeyBuilder::new("", "cache", HashAlgorithm::Sha1);
        let long_a = format!("{}a", "x".repeat(400));
        let long_b = format!("{}b", "x".repeat(400));

        let a = keys.key(&long_a);
        let b = keys.key(&long_b);
        assert!(a.len() <= MAX_KEY_LENGTH);
        assert!(b.len() <= MAX_KEY_LENGTH);
        assert_ne!(a, b);

        let digest = HashAlgorithm::Sha1.hex_digest(long_a.as_bytes());
        assert!(a.starts_with(&format!("cache:-{}-xxx", digest)));
    }

    #[test]
    fn test_multibyte_keys_stay_ascii() {
        let keys = KeyBuilder::new("", "cache", HashAlgorithm::Sha256);
        let key = keys.key(&"ü".repeat(200));
        assert!(key.is_ascii());
        assert!(key.len() <= MAX_KEY_LENGTH);
    }

    #[test]
    fn test_digest_lengths() {
        assert_eq!(HashAlgorithm::Sha1.hex_digest(b"abc").len(), 40);
        assert_eq!(HashAlgorithm::Sha256.hex_digest(b"abc").len(), 64);
        assert_eq!(
            HashAlgorithm::Sha1.hex_digest(b"abc"),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }
}
