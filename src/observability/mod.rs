//! Observability: structured logging, per-runtime metrics and the HTTP facade

pub mod api;
pub mod logging;
pub mod metrics;

pub use api::{ApiServer, TaskSubmission};
pub use logging::{init_default_logging, init_logging, parse_level, LogFormat};
pub use metrics::{MetricsCollector, MetricsSnapshot};

// Span macros for structured logging
pub use logging::{bus_span, lifecycle_span, task_span};
