//! Core types and error definitions for the Maestro coordination framework.
//!
//! This crate provides the foundation shared across all Maestro crates:
//! the unified error enum and the publish/subscribe event bus that every
//! component reports through.
//!
//! # Main types
//!
//! - [`MaestroError`] — Unified error enum for all Maestro subsystems.
//! - [`MaestroResult`] — Convenience alias for `Result<T, MaestroError>`.
//! - [`EventBus`] — Topic-based publish/subscribe dispatcher.
//! - [`SystemEvent`] — The payload delivered to event subscribers.

/// Publish/subscribe event bus and event payloads.
pub mod event;

pub use event::{EventBus, SystemEvent};

use uuid::Uuid;

// --- Error types ---

/// Top-level error type for the Maestro framework.
///
/// Each variant names a failure kind and carries the id(s) a caller needs
/// to act on it, so logging and UI layers can group errors without string
/// parsing.
#[derive(Debug, thiserror::Error)]
pub enum MaestroError {
    /// Lookup of an agent id that is not in the registry.
    #[error("Agent not found: {0}")]
    AgentNotFound(Uuid),

    /// Lookup of a task id that is not in the registry.
    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    /// Task distribution found no candidate agent.
    #[error("No eligible agent for task {0}")]
    NoEligibleAgent(Uuid),

    /// An agent was asked to take a task beyond its concurrency limit.
    #[error("Agent {agent_id} at capacity ({limit} concurrent tasks)")]
    CapacityExceeded {
        /// The agent that is already full.
        agent_id: Uuid,
        /// The agent's maximum concurrent task count.
        limit: usize,
    },

    /// A message was routed to an agent with no registered mailbox.
    #[error("Agent not registered for messaging: {0}")]
    UnknownAgent(Uuid),

    /// A message subscriber returned an error during delivery.
    #[error("Handler failed for message {message_id}: {reason}")]
    HandlerFailure {
        /// The message whose delivery failed.
        message_id: Uuid,
        /// The subscriber's error text.
        reason: String,
    },

    /// The health probe itself errored. A measured threshold breach is a
    /// health issue, not an error.
    #[error("Health check failed for agent {agent_id}: {reason}")]
    HealthCheckFailure {
        /// The agent being probed.
        agent_id: Uuid,
        /// The probe's error text.
        reason: String,
    },

    /// An agent specification failed validation at registration time.
    #[error("Invalid agent specification: {0}")]
    InvalidSpecification(String),

    /// A status change that the state machine does not allow.
    #[error("Invalid transition for {id}: {from} -> {to}")]
    InvalidTransition {
        /// The task or agent being transitioned.
        id: Uuid,
        /// The current state.
        from: String,
        /// The rejected target state.
        to: String,
    },

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`MaestroError`].
pub type MaestroResult<T> = Result<T, MaestroError>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_carries_ids() {
        let id = Uuid::new_v4();
        let err = MaestroError::NoEligibleAgent(id);
        assert!(err.to_string().contains(&id.to_string()));

        let err = MaestroError::CapacityExceeded {
            agent_id: id,
            limit: 3,
        };
        assert!(err.to_string().contains("3 concurrent tasks"));
    }

    #[test]
    fn test_json_error_conversion() {
        let parse: Result<serde_json::Value, _> = serde_json::from_str("not json");
        let err: MaestroError = parse.unwrap_err().into();
        assert!(matches!(err, MaestroError::Json(_)));
    }
}
