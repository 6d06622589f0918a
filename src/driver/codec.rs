use crate::error::{CacheError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Codec used for stored entries and split values. The set of codecs is
/// fixed at build time; the choice is made once from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Serializer {
    /// Compact binary encoding (bincode)
    #[default]
    Bincode,
    /// MessagePack with named fields
    #[serde(rename = "msgpack", alias = "messagepack")]
    MessagePack,
    /// JSON, readable with any memcached client
    Json,
}

impl Serializer {
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            Serializer::Bincode => {
                bincode::serialize(value).map_err(|e| CacheError::Codec(e.to_string()))
            }
            Serializer::MessagePack => {
                rmp_serde::to_vec_named(value).map_err(|e| CacheError::Codec(e.to_string()))
            }
            Serializer::Json => {
                serde_json::to_vec(value).map_err(|e| CacheError::Codec(e.to_string()))
            }
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        match self {
            Serializer::Bincode => {
                bincode::deserialize(bytes).map_err(|e| CacheError::Codec(e.to_string()))
            }
            Serializer::MessagePack => {
                rmp_serde::from_slice(bytes).map_err(|e| CacheError::Codec(e.to_string()))
            }
            Serializer::Json => {
                serde_json::from_slice(bytes).map_err(|e| CacheError::Codec(e.to_string()))
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Serializer::Bincode => "bincode",
            Serializer::MessagePack => "msgpack",
            Serializer::Json => "json",
        }
    }
}

impl FromStr for Serializer {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "bincode" => Ok(Serializer::Bincode),
            "msgpack" | "messagepack" => Ok(Serializer::MessagePack),
            "json" => Ok(Serializer::Json),
            other => Err(CacheError::Config(format!("unknown serializer '{}'", other))),
        }
    }
}

impl fmt::Display for Serializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
