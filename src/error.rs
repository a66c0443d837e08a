//! Error types for dockyard.

use std::time::Duration;

use thiserror::Error;

use crate::resource::{ResourceKind, ResourceState};

/// Result type for provisioning operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by builders and the orchestrator.
#[derive(Debug, Error)]
pub enum Error {
    /// One or more required fields were missing or invalid at build time.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// The engine rejected the creation of a resource.
    #[error("Failed to create {kind} '{name}': {reason}")]
    CreateResource {
        /// Kind of resource that failed.
        kind: ResourceKind,
        /// Resource name or image reference.
        name: String,
        /// Reason for failure.
        reason: String,
    },

    /// The resource was created but could not be started.
    #[error("Failed to start container '{name}': {reason}")]
    Start {
        /// Container name or id.
        name: String,
        /// Reason for failure.
        reason: String,
    },

    /// A readiness predicate never succeeded within its deadline.
    #[error("Container '{name}' was not ready within {timeout:?} ({strategy}): {last_failure}")]
    WaitStrategyTimeout {
        /// Container name or id.
        name: String,
        /// Description of the strategy that timed out.
        strategy: String,
        /// The strategy's deadline.
        timeout: Duration,
        /// Last observed failure, for diagnostics.
        last_failure: String,
    },

    /// A readiness predicate failed more often than its policy tolerates.
    #[error("Wait strategy {strategy} for '{name}' gave up after {failures} failures: {last_failure}")]
    WaitStrategyFaulted {
        /// Container name or id.
        name: String,
        /// Description of the strategy.
        strategy: String,
        /// Number of consecutive failures observed.
        failures: u32,
        /// Last observed failure.
        last_failure: String,
    },

    /// A lifecycle request that would move a resource backward.
    #[error("Cannot move {kind} '{name}' from {from} to {to}")]
    InvalidTransition {
        /// Kind of resource.
        kind: ResourceKind,
        /// Resource name.
        name: String,
        /// Current state.
        from: ResourceState,
        /// Requested state.
        to: ResourceState,
    },

    /// The reaper could not be reached or refused a filter.
    #[error(transparent)]
    ReaperProtocol(#[from] ReaperError),

    /// The caller cancelled the operation.
    #[error("Operation cancelled while {during}")]
    Cancelled {
        /// What was in progress when the cancellation arrived.
        during: String,
    },

    /// Raw engine failure outside of create/start.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Runtime settings could not be resolved.
    #[error(transparent)]
    Settings(#[from] ConfigError),
}

impl Error {
    /// True for timeouts, so callers can tell "gave up" from "cancelled".
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::WaitStrategyTimeout { .. })
    }

    /// True for caller-requested aborts.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled { .. })
    }
}

/// Validation failure reported by `build()`; lists every violation found.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid {kind} configuration: {}", .violations.join("; "))]
pub struct ConfigurationError {
    /// Kind of resource whose configuration is invalid.
    pub kind: ResourceKind,
    /// Every violation, in field order.
    pub violations: Vec<String>,
}

/// Errors returned by a [`ContainerEngine`](crate::engine::ContainerEngine).
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// The engine daemon is not reachable.
    #[error("Docker not available: {reason}")]
    Unavailable {
        /// Reason why the engine is unavailable.
        reason: String,
    },

    /// The referenced object does not exist.
    #[error("No such {kind}: {id}")]
    NotFound {
        /// Kind of object.
        kind: ResourceKind,
        /// Identifier that was looked up.
        id: String,
    },

    /// Any other API failure.
    #[error("Engine API error ({status}): {reason}")]
    Api {
        /// HTTP status code reported by the engine, 0 when unknown.
        status: u16,
        /// Reason for failure.
        reason: String,
    },
}

impl EngineError {
    /// Removal of an object that is already gone is not a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound { .. })
    }
}

/// Errors on the reaper channel.
#[derive(Debug, Clone, Error)]
pub enum ReaperError {
    /// The reaper could not be reached.
    #[error("Reaper unreachable at {addr}: {reason}")]
    Unreachable {
        /// Address that was dialled.
        addr: String,
        /// Reason for failure.
        reason: String,
    },

    /// The reaper answered a filter with something other than `ACK`.
    #[error("Reaper refused filter '{filter}': {reply}")]
    Refused {
        /// The filter that was sent.
        filter: String,
        /// The reply received.
        reply: String,
    },

    /// The connection broke mid-exchange.
    #[error("Reaper connection lost: {reason}")]
    ConnectionLost {
        /// Reason for failure.
        reason: String,
    },

    /// A protocol line could not be parsed.
    #[error("Malformed reaper message '{line}': {reason}")]
    Malformed {
        /// The offending line.
        line: String,
        /// Reason for failure.
        reason: String,
    },

    /// The reaper sidecar could not be launched.
    #[error("Reaper sidecar failed to start: {reason}")]
    Sidecar {
        /// Reason for failure.
        reason: String,
    },
}

/// Runtime settings errors.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("Missing required setting {key}: {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_error_lists_every_violation() {
        let err = ConfigurationError {
            kind: ResourceKind::Container,
            violations: vec!["image is required".to_string(), "name must not be empty".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("image is required"));
        assert!(msg.contains("name must not be empty"));
    }

    #[test]
    fn test_timeout_and_cancel_are_distinct() {
        let timeout = Error::WaitStrategyTimeout {
            name: "db".to_string(),
            strategy: "tcp 5432".to_string(),
            timeout: Duration::from_secs(30),
            last_failure: "connection refused".to_string(),
        };
        let cancelled = Error::Cancelled {
            during: "waiting".to_string(),
        };
        assert!(timeout.is_timeout() && !timeout.is_cancelled());
        assert!(cancelled.is_cancelled() && !cancelled.is_timeout());
    }
}
