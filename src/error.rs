//! Error types for the collection core.
//!
//! Only construction-time misconfiguration and scheduler infrastructure
//! failures surface as errors. Everything a collection routine does wrong is
//! absorbed by the job loop and reported through diagnostics instead.

use thiserror::Error;

/// Invalid configuration detected while constructing a limiter, cache, job or pool.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// A numeric argument is out of its allowed range.
    #[error("invalid argument `{name}`: {reason}")]
    InvalidArgument { name: &'static str, reason: String },
    /// A configuration file could not be read or parsed.
    #[error("failed to load config: {0}")]
    Load(String),
}

impl ConfigError {
    pub(crate) fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidArgument {
            name,
            reason: reason.into(),
        }
    }
}

/// Failure of the scheduling infrastructure itself (never of a routine).
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Every slot of the shared worker pool is taken by a running job loop.
    #[error("worker pool exhausted: all {capacity} job slots are in use")]
    PoolExhausted { capacity: usize },
    /// The pool runtime has already been shut down.
    #[error("worker pool is shut down")]
    PoolShutdown,
    /// The pool runtime could not be started.
    #[error("failed to start worker pool: {0}")]
    Runtime(#[from] std::io::Error),
    /// Invalid job or pool configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Validates that a rate/duration style value is finite and strictly positive.
pub(crate) fn ensure_positive(name: &'static str, value: f64) -> Result<f64, ConfigError> {
    if !value.is_finite() {
        return Err(ConfigError::invalid(name, format!("{value} is not finite")));
    }
    if value <= 0.0 {
        return Err(ConfigError::invalid(name, format!("{value} must be > 0")));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_positive_rejects_zero_negative_and_nan() {
        assert!(ensure_positive("rate", 0.0).is_err());
        assert!(ensure_positive("rate", -1.0).is_err());
        assert!(ensure_positive("rate", f64::NAN).is_err());
        assert!(ensure_positive("rate", f64::INFINITY).is_err());
        assert_eq!(ensure_positive("rate", 0.5).unwrap(), 0.5);
    }

    #[test]
    fn invalid_argument_display_names_the_field() {
        let err = ensure_positive("ttl", 0.0).unwrap_err();
        assert_eq!(err.to_string(), "invalid argument `ttl`: 0 must be > 0");
    }
}
