//! Tag invalidation on top of an unreliable store.
//!
//! Nothing is stored per entry except the checksum computed at write time.
//! Invalidating a tag moves its timestamp forward, which changes the
//! checksum of every tag set containing it.

pub mod checksum;
pub mod invalidator;

pub use checksum::{TagChecksum, TagMemo};
pub use invalidator::TimestampInvalidator;
