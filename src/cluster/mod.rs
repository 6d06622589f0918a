//! Bin to cluster routing.
//!
//! Every bin resolves to a cluster through the static `bins` mapping, falling
//! back to the cluster of the default bin. Each cluster gets exactly one
//! connection object, created on first use and shared by reference.

mod router;

pub use router::ClusterRouter;
