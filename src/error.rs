//! Crate-wide error types.
//!
//! Module-local concerns keep their own error enums next to the code
//! ([`crate::demux::DemuxError`], [`crate::cache::CacheError`],
//! [`crate::engine::EngineError`], [`crate::connector::ConnectorError`]).
//! This module holds the errors that cross module boundaries: configuration
//! resolution and the provision/terminate entry points.

use crate::connector::ConnectorError;
use crate::engine::EngineError;

/// Error resolving configuration from the environment or a template.
///
/// Configuration errors fail fast at provision time and are never retried.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    ParseError(String),
    #[error("missing required setting: {0}")]
    Missing(String),
}

/// Error provisioning a new worker.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    /// The worker template is invalid. Fail-fast, not retryable.
    #[error("invalid worker template: {0}")]
    Template(#[from] ConfigError),
    /// The container engine rejected or failed an operation.
    #[error("container engine error: {0}")]
    Engine(#[from] EngineError),
    /// The connector could not make the container reachable.
    #[error("connector failed: {0}")]
    Connector(#[from] ConnectorError),
    /// The worker registry refused the new worker.
    #[error("registry rejected worker '{name}': {reason}")]
    Registry { name: String, reason: String },
}

impl ProvisionError {
    /// Whether the caller may reasonably retry the whole provision attempt.
    ///
    /// Only bounded connectivity waits that timed out qualify; configuration
    /// and engine errors need operator attention first.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connector(e) if e.is_retryable())
    }
}

/// Error tearing down a worker's container.
///
/// Teardown errors are surfaced so operators can see them, but they never
/// prevent the worker's deregistration.
#[derive(Debug, thiserror::Error)]
pub enum TerminateError {
    #[error("teardown of worker '{worker}' failed: {source}")]
    Engine {
        worker: String,
        #[source]
        source: EngineError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_provision_errors_are_retryable() {
        let err = ProvisionError::Connector(ConnectorError::Timeout {
            operation: "ssh port",
            attempts: 3,
            delay_ms: 100,
        });
        assert!(err.is_retryable());

        let err = ProvisionError::Template(ConfigError::Missing("image".into()));
        assert!(!err.is_retryable());
    }
}
