//! Telemetry: structured logging and Prometheus metrics.
//!
//! - **Logging**: JSON/pretty/compact output through `tracing-subscriber`
//! - **Metrics**: Prometheus recorder for the limiter's counters and histograms
//!
//! # Example
//!
//! ```rust,no_run
//! use limiter_core::telemetry::{init_logging, init_metrics, LoggingConfig, MetricsConfig};
//!
//! init_logging(&LoggingConfig::default(), "development").expect("logging");
//! let registry = init_metrics(&MetricsConfig::default(), "limiter").expect("metrics");
//! println!("{}", registry.render());
//! ```

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogFormat, LoggingConfig};
pub use metrics::{init_metrics, MetricsConfig, MetricsRegistry};
