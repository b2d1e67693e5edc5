//! Observability: logging setup and feed counters

pub mod logger;
pub mod metrics;

pub use logger::{init, LogFormat};
pub use metrics::{FeedMetrics, MetricsSnapshot};
