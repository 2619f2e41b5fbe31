//! Common utilities and types shared across rangeshift

pub mod config;
pub mod error;
pub mod keys;
pub mod metrics;
pub mod tracing_middleware;
pub mod utils;

pub use config::{ClusterConfig, Config, CoordinatorConfig, MigrationConfig};
pub use error::{Error, ErrorKind, OperationError, Result};
pub use metrics::METRICS;
pub use utils::{crc32, parse_duration, retry_with_backoff, timestamp_now_millis, validate_namespace};
