//! Crate-level error types for fragment submission, group reads, and
//! administrative control.

use crate::correlation::CorrelationId;

/// Error returned when submitting a fragment to the aggregator fails.
#[derive(Debug, thiserror::Error)]
pub enum AggregationError {
    /// Inbound message rejected before correlation.
    ///
    /// The message never reached the group store. A discard-log entry is
    /// written alongside the returned error.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The same event was already admitted for this correlation id.
    ///
    /// The original delivery has completed (or is completing) exactly once,
    /// so callers may log and drop this error.
    #[error("duplicate delivery of event '{event_id}' for '{correlation_id}'")]
    DuplicateDelivery {
        /// Group the duplicate was addressed to.
        correlation_id: CorrelationId,
        /// Identity of the duplicated event.
        event_id: String,
    },

    /// The aggregator has been stopped through the control surface.
    #[error("component '{component}' is not running")]
    NotRunning {
        /// Logical name of the stopped component.
        component: String,
    },

    /// The downstream sink rejected a merged result.
    ///
    /// Every group mutation made by the failed submission has been rolled
    /// back, so a retry sees the same match opportunity.
    #[error("merged result was not delivered: {0}")]
    Emission(#[source] EmissionError),

    /// Group store I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Actor thread exited unexpectedly.
    ///
    /// The actor that owns the correlation group shut down before
    /// replying.
    #[error("correlation group actor is no longer running")]
    ActorGone,
}

/// Reasons an inbound message cannot be turned into an event fragment.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    /// No `messageEventType` header was present.
    #[error("missing message event type header")]
    MissingEventType,

    /// The `messageEventType` header carried an unrecognised value.
    #[error("unknown message event type '{0}'")]
    UnknownEventType(String),

    /// The message declared a content type other than JSON.
    #[error("unsupported content type '{0}'")]
    UnsupportedContentType(String),

    /// The payload could not be parsed as a message event payload.
    #[error("malformed message payload: {0}")]
    MalformedPayload(#[source] serde_json::Error),

    /// Neither payload nor headers named the message.
    #[error("message name is missing")]
    MissingMessageName,
}

/// Failure reported by a [`MergedResultSink`](crate::MergedResultSink).
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct EmissionError {
    message: String,
}

impl EmissionError {
    /// Build an emission error carrying a human-readable reason.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The reason reported by the sink.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Error returned when reading or clearing a correlation group fails.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Group store I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Actor thread exited unexpectedly.
    #[error("correlation group actor is no longer running")]
    ActorGone,
}

/// Error returned by the [`ControlBus`](crate::ControlBus).
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// No component is registered under this name.
    #[error("no component named '{0}'")]
    UnknownComponent(String),

    /// The textual command did not match `@<name>.<start|stop>()`.
    #[error("invalid control command '{0}'")]
    InvalidCommand(String),
}

/// Error returned when building a [`MessageAggregator`](crate::MessageAggregator).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// `build` was called without a downstream sink.
    #[error("no merged result sink configured")]
    MissingSink,

    /// The component name was empty.
    #[error("component name must not be empty")]
    EmptyName,
}
