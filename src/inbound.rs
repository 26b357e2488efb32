//! Inbound transport messages and their decoding into event fragments.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::fragment::{EventFragment, FragmentKind, MessagePayload};

/// Header carrying the [`FragmentKind`] wire discriminator. Required.
pub const EVENT_TYPE_HEADER: &str = "messageEventType";
/// Header carrying the message name; overrides the payload's `name`.
pub const EVENT_NAME_HEADER: &str = "messageEventName";
/// Header carrying the correlation key; overrides the payload's `correlationKey`.
pub const CORRELATION_KEY_HEADER: &str = "messageEventCorrelationKey";
/// Header carrying the delivery's event id.
pub const EVENT_ID_HEADER: &str = "messageEventId";
/// Header naming the producing application.
pub const APP_NAME_HEADER: &str = "appName";
/// Header declaring the payload's content type.
pub const CONTENT_TYPE_HEADER: &str = "contentType";

const JSON_CONTENT_TYPE: &str = "application/json";

/// A message as received from the transport: string headers plus a raw
/// JSON payload.
///
/// # Examples
///
/// ```
/// use message_aggregator::{FragmentKind, InboundMessage};
///
/// let msg = InboundMessage::new(r#"{"name":"order-paid","correlationKey":"42"}"#)
///     .with_header("messageEventType", "MESSAGE_SENT")
///     .with_header("messageEventId", "evt-1");
///
/// let fragment = msg.decode().unwrap();
/// assert_eq!(fragment.kind, FragmentKind::Sent);
/// assert_eq!(fragment.event_id, "evt-1");
/// assert_eq!(fragment.correlation_id().as_str(), "order-paid:42");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Transport headers.
    pub headers: BTreeMap<String, String>,
    /// Raw payload text.
    pub payload: String,
}

impl InboundMessage {
    /// Create a message with the given payload and no headers.
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            headers: BTreeMap::new(),
            payload: payload.into(),
        }
    }

    /// Set a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Render a fragment back into its transport form.
    ///
    /// Used to record fragments submitted directly (not through a
    /// transport) in the discard log.
    pub fn from_fragment(fragment: &EventFragment) -> Self {
        let mut msg = Self::new(serde_json::to_string(&fragment.payload).unwrap_or_default())
            .with_header(EVENT_TYPE_HEADER, fragment.kind.as_str())
            .with_header(EVENT_ID_HEADER, fragment.event_id.as_str())
            .with_header(EVENT_NAME_HEADER, fragment.payload.name.as_str())
            .with_header(CONTENT_TYPE_HEADER, JSON_CONTENT_TYPE);
        if let Some(key) = &fragment.payload.correlation_key {
            msg = msg.with_header(CORRELATION_KEY_HEADER, key.as_str());
        }
        if let Some(app) = &fragment.app_name {
            msg = msg.with_header(APP_NAME_HEADER, app.as_str());
        }
        msg
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// Validate the message and build the fragment it describes.
    ///
    /// Header values for the message name and correlation key take
    /// precedence over the payload. A missing event id is replaced with a
    /// fresh UUID v4, so such a message is processed but never
    /// deduplicated.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] when the event type header is missing
    /// or unknown, the content type is not JSON, the payload is not a
    /// valid message payload, or no message name is present.
    pub fn decode(&self) -> Result<EventFragment, ValidationError> {
        let kind: FragmentKind = self
            .header(EVENT_TYPE_HEADER)
            .ok_or(ValidationError::MissingEventType)?
            .parse()
            .map_err(|e: crate::fragment::UnknownKind| ValidationError::UnknownEventType(e.0))?;

        if let Some(content_type) = self.header(CONTENT_TYPE_HEADER) {
            let mime = content_type.split(';').next().unwrap_or_default().trim();
            if !mime.eq_ignore_ascii_case(JSON_CONTENT_TYPE) {
                return Err(ValidationError::UnsupportedContentType(
                    content_type.to_owned(),
                ));
            }
        }

        let mut payload = if self.payload.trim().is_empty() {
            MessagePayload::default()
        } else {
            serde_json::from_str::<MessagePayload>(&self.payload)
                .map_err(ValidationError::MalformedPayload)?
        };
        if let Some(name) = self.header(EVENT_NAME_HEADER) {
            payload.name = name.to_owned();
        }
        if let Some(key) = self.header(CORRELATION_KEY_HEADER) {
            payload.correlation_key = Some(key.to_owned());
        }
        if payload.name.trim().is_empty() {
            return Err(ValidationError::MissingMessageName);
        }

        let mut fragment = EventFragment::new(kind, payload);
        if let Some(event_id) = self.header(EVENT_ID_HEADER) {
            fragment = fragment.with_event_id(event_id);
        }
        if let Some(app) = self.header(APP_NAME_HEADER) {
            fragment = fragment.with_app_name(app);
        }
        Ok(fragment)
    }
}
