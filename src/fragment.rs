//! Event fragments, message payloads, and merged results.
//!
//! These are the plain data types every other module depends on. No I/O
//! happens here.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::correlation::CorrelationId;

/// The lifecycle stage a message event reports.
///
/// The serialized form is the wire discriminator carried in the
/// `messageEventType` header (e.g. `"MESSAGE_SENT"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FragmentKind {
    /// A start-message definition was deployed and waits for sends.
    #[serde(rename = "START_MESSAGE_DEPLOYED")]
    StartDeployed,
    /// A process threw a message carrying business data.
    #[serde(rename = "MESSAGE_SENT")]
    Sent,
    /// A process is blocked on an intermediate catch event.
    #[serde(rename = "MESSAGE_WAITING")]
    Waiting,
    /// A waiting process consumed its message.
    #[serde(rename = "MESSAGE_RECEIVED")]
    Received,
    /// A message subscription was cancelled.
    #[serde(rename = "MESSAGE_SUBSCRIPTION_CANCELLED")]
    SubscriptionCancelled,
}

impl FragmentKind {
    /// The wire discriminator for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            FragmentKind::StartDeployed => "START_MESSAGE_DEPLOYED",
            FragmentKind::Sent => "MESSAGE_SENT",
            FragmentKind::Waiting => "MESSAGE_WAITING",
            FragmentKind::Received => "MESSAGE_RECEIVED",
            FragmentKind::SubscriptionCancelled => "MESSAGE_SUBSCRIPTION_CANCELLED",
        }
    }
}

impl fmt::Display for FragmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown wire discriminator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown fragment kind '{0}'")]
pub struct UnknownKind(pub String);

impl FromStr for FragmentKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "START_MESSAGE_DEPLOYED" => Ok(FragmentKind::StartDeployed),
            "MESSAGE_SENT" => Ok(FragmentKind::Sent),
            "MESSAGE_WAITING" => Ok(FragmentKind::Waiting),
            "MESSAGE_RECEIVED" => Ok(FragmentKind::Received),
            "MESSAGE_SUBSCRIPTION_CANCELLED" => Ok(FragmentKind::SubscriptionCancelled),
            other => Err(UnknownKind(other.to_owned())),
        }
    }
}

/// Business content of a message event.
///
/// Serialized in camelCase so it matches the JSON payloads produced by the
/// workflow engine.
///
/// # Examples
///
/// ```
/// use message_aggregator::MessagePayload;
/// use serde_json::json;
///
/// let payload = MessagePayload::new("order-paid")
///     .with_correlation_key("42")
///     .with_business_key("order-42")
///     .with_variable("amount", json!(99));
///
/// assert_eq!(payload.name, "order-paid");
/// assert_eq!(payload.variables["amount"], json!(99));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    /// BPMN message name.
    #[serde(default)]
    pub name: String,
    /// Key distinguishing exchanges that share a message name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_key: Option<String>,
    /// Business key of the process that produced the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_key: Option<String>,
    /// Process variables carried by the message.
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
}

impl MessagePayload {
    /// Create a payload for the named message with no key or variables.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Set the correlation key.
    pub fn with_correlation_key(mut self, key: impl Into<String>) -> Self {
        self.correlation_key = Some(key.into());
        self
    }

    /// Set the business key.
    pub fn with_business_key(mut self, key: impl Into<String>) -> Self {
        self.business_key = Some(key.into());
        self
    }

    /// Add a single variable.
    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    /// Replace all variables.
    pub fn with_variables(mut self, variables: BTreeMap<String, Value>) -> Self {
        self.variables = variables;
        self
    }
}

/// One arrived message event.
///
/// Immutable once built: the aggregator only moves fragments between the
/// group store and merged results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFragment {
    /// Unique identity of the delivery, used for duplicate detection.
    pub event_id: String,
    /// Lifecycle stage reported by the event.
    pub kind: FragmentKind,
    /// Application that produced the event, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_name: Option<String>,
    /// Business content.
    pub payload: MessagePayload,
    /// Unix milliseconds at which the fragment was created.
    #[serde(default)]
    pub received_at: u64,
}

impl EventFragment {
    /// Create a fragment with a fresh UUID v4 event id.
    pub fn new(kind: FragmentKind, payload: MessagePayload) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            kind,
            app_name: None,
            payload,
            received_at: now_millis(),
        }
    }

    /// Override the event id, e.g. with the id carried by the transport.
    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = event_id.into();
        self
    }

    /// Set the producing application.
    pub fn with_app_name(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = Some(app_name.into());
        self
    }

    /// Shorthand for a [`FragmentKind::StartDeployed`] fragment.
    pub fn start_deployed(payload: MessagePayload) -> Self {
        Self::new(FragmentKind::StartDeployed, payload)
    }

    /// Shorthand for a [`FragmentKind::Sent`] fragment.
    pub fn sent(payload: MessagePayload) -> Self {
        Self::new(FragmentKind::Sent, payload)
    }

    /// Shorthand for a [`FragmentKind::Waiting`] fragment.
    pub fn waiting(payload: MessagePayload) -> Self {
        Self::new(FragmentKind::Waiting, payload)
    }

    /// Shorthand for a [`FragmentKind::Received`] fragment.
    pub fn received(payload: MessagePayload) -> Self {
        Self::new(FragmentKind::Received, payload)
    }

    /// Shorthand for a [`FragmentKind::SubscriptionCancelled`] fragment.
    pub fn subscription_cancelled(payload: MessagePayload) -> Self {
        Self::new(FragmentKind::SubscriptionCancelled, payload)
    }

    /// The group this fragment belongs to.
    pub fn correlation_id(&self) -> CorrelationId {
        CorrelationId::derive(self)
    }
}

/// The command a release asks the workflow engine to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReleaseKind {
    /// Start a new process instance from a deployed start-message definition.
    StartMessage,
    /// Deliver the message to a process blocked on a catch event.
    ReceiveMessage,
}

/// Output of a successful release.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedResult {
    /// Which command the result represents.
    pub kind: ReleaseKind,
    /// Group the participating fragments belonged to.
    pub correlation_id: CorrelationId,
    /// Application that owns the matched definition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_name: Option<String>,
    /// Merged business content.
    pub payload: MessagePayload,
    /// Event ids of the definition and the sent fragment, in that order.
    pub event_ids: Vec<String>,
}

impl MergedResult {
    /// Merge a definition fragment (StartDeployed or Waiting) with the Sent
    /// fragment that satisfies it.
    ///
    /// The definition provides the message identity; the sent fragment
    /// provides the business data.
    pub fn merge(
        correlation_id: CorrelationId,
        definition: &EventFragment,
        sent: &EventFragment,
    ) -> Self {
        let kind = match definition.kind {
            FragmentKind::StartDeployed => ReleaseKind::StartMessage,
            _ => ReleaseKind::ReceiveMessage,
        };
        let payload = MessagePayload {
            name: definition.payload.name.clone(),
            correlation_key: definition
                .payload
                .correlation_key
                .clone()
                .or_else(|| sent.payload.correlation_key.clone()),
            business_key: sent
                .payload
                .business_key
                .clone()
                .or_else(|| definition.payload.business_key.clone()),
            variables: sent.payload.variables.clone(),
        };
        Self {
            kind,
            correlation_id,
            app_name: definition.app_name.clone(),
            payload,
            event_ids: vec![definition.event_id.clone(), sent.event_id.clone()],
        }
    }
}

/// Current wall-clock time in unix milliseconds, or zero if the clock is
/// before the epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::UNIX_EPOCH
        .elapsed()
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
