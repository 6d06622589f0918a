//! Observability: structured logging setup and per-operation statistics

pub mod logging;
pub mod stats;

pub use logging::{init_logging, LogSettings};
pub use stats::{OpRecord, OpTotals, RequestStats, StatsSnapshot};
