//! dbm-telemetry - database telemetry collection core.
//!
//! Building blocks for database monitoring checks:
//! - [`ConstantRateLimiter`] - fixed-frequency pacing of collection loops
//! - [`RateLimitingTtlCache`] - bounded "at most once per TTL" admission
//! - [`StatementMetrics`] - per-query deltas of cumulative statistics
//! - [`AsyncJob`] - recurring routines on a shared, bounded [`WorkerPool`]
//!
//! The `dbm-collectord` binary wires these to PostgreSQL
//! (see [`collector::pg`]).

pub mod cache;
pub mod cancel;
pub mod collector;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod job;
pub mod limiter;
pub mod pool;
pub mod row;
pub mod statement_metrics;

pub use cache::RateLimitingTtlCache;
pub use cancel::CancellationToken;
pub use config::{CacheConfig, CollectorConfig, EngineConfig, JobConfig, PoolConfig};
pub use diagnostics::{MemorySink, MetricKind, MetricSample, MetricsSink, TracingSink};
pub use error::{ConfigError, SchedulerError};
pub use job::{AsyncJob, JobRoutine, JobState, RunContext, StopReason};
pub use limiter::ConstantRateLimiter;
pub use pool::WorkerPool;
pub use row::{Row, Value};
pub use statement_metrics::{DerivativeRows, StatementMetrics};
