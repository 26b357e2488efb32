//! Order-independent correlation of BPMN message events.
//!
//! Fragments describing the same message exchange (a deployed start
//! definition, a waiting catch event, a thrown message) may arrive in any
//! order and concurrently. The [`MessageAggregator`] groups them by
//! [`CorrelationId`], releases a [`MergedResult`] as soon as a group
//! satisfies its [`ReleaseStrategy`], and hands it to a
//! [`MergedResultSink`]. A sink failure rolls the group back.

mod actor;
mod aggregator;
mod control;
mod correlation;
mod discard;
mod error;
mod fragment;
mod group_store;
mod idempotency;
mod inbound;
mod policy;
mod sink;

pub use aggregator::{MessageAggregator, MessageAggregatorBuilder};
pub use control::{ControlBus, Lifecycle};
pub use correlation::CorrelationId;
pub use discard::{DiscardEntry, DiscardLog, DiscardReason};
pub use error::{
    AggregationError, ConfigError, ControlError, EmissionError, StateError, ValidationError,
};
pub use fragment::{
    EventFragment, FragmentKind, MergedResult, MessagePayload, ReleaseKind, UnknownKind,
};
pub use group_store::{
    FileGroupStore, GroupChange, GroupListener, InMemoryGroupStore, MessageGroupStore,
    ObservedGroupStore,
};
pub use idempotency::{
    DEFAULT_DEDUP_CAPACITY, DEFAULT_DEDUP_GROUPS, DuplicateDelivery, IdempotencyGuard,
};
pub use inbound::{
    APP_NAME_HEADER, CONTENT_TYPE_HEADER, CORRELATION_KEY_HEADER, EVENT_ID_HEADER,
    EVENT_NAME_HEADER, EVENT_TYPE_HEADER, InboundMessage,
};
pub use policy::{Correlation, MessageLifecycle, ReleaseStrategy};
pub use sink::{ChannelSink, MergedResultSink};
