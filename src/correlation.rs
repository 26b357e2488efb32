//! Correlation id derivation.
//!
//! Fragments that share a [`CorrelationId`], and only those, belong to the
//! same message exchange.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::fragment::EventFragment;

/// Fixed namespace for the UUID v5 form of a correlation id.
///
/// Durable stores use [`CorrelationId::uuid`] as a file-system safe name for
/// a group. The namespace keeps that mapping stable across processes.
const GROUP_NAMESPACE: Uuid = Uuid::from_bytes([
    0x4f, 0x1c, 0x8a, 0x62, 0x0d, 0x7e, 0x45, 0x1b, 0x9c, 0x3a, 0x5e, 0x27, 0xd0, 0x84, 0x6b, 0x19,
]);

/// Stable key grouping fragments of one logical message exchange.
///
/// Rendered as `[app/]name[:key]`, with `%`, `/` and `:` percent-escaped
/// inside each component so that distinct inputs never render the same.
///
/// # Examples
///
/// ```
/// use message_aggregator::CorrelationId;
///
/// let id = CorrelationId::new("order-paid", Some("42"), None);
/// assert_eq!(id.as_str(), "order-paid:42");
/// assert_eq!(id, CorrelationId::new("order-paid", Some("42"), None));
/// assert_ne!(id, CorrelationId::new("order-paid", None, None));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Derive the id from its components.
    pub fn new(message_name: &str, correlation_key: Option<&str>, app_name: Option<&str>) -> Self {
        let mut id = String::with_capacity(message_name.len() + 16);
        if let Some(app) = app_name {
            escape_into(&mut id, app);
            id.push('/');
        }
        escape_into(&mut id, message_name);
        if let Some(key) = correlation_key {
            id.push(':');
            escape_into(&mut id, key);
        }
        Self(id)
    }

    /// Derive the id of the group `fragment` belongs to.
    pub fn derive(fragment: &EventFragment) -> Self {
        Self::new(
            &fragment.payload.name,
            fragment.payload.correlation_key.as_deref(),
            fragment.app_name.as_deref(),
        )
    }

    /// The rendered id.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Deterministic UUID v5 of the rendered id.
    pub fn uuid(&self) -> Uuid {
        Uuid::new_v5(&GROUP_NAMESPACE, self.0.as_bytes())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CorrelationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn escape_into(out: &mut String, component: &str) {
    for c in component.chars() {
        match c {
            '%' => out.push_str("%25"),
            '/' => out.push_str("%2F"),
            ':' => out.push_str("%3A"),
            c => out.push(c),
        }
    }
}
