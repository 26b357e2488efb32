//! Top-level entry point that composes correlation, group actors, the
//! idempotency guard, and the discard log into a single
//! [`MessageAggregator`].
//!
//! The aggregator is built via [`MessageAggregatorBuilder`]. Each
//! correlation group is owned by a lazily spawned actor thread; the
//! aggregator keeps a cache of live actor handles and routes every
//! submission to the owner of its group.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{RwLock, oneshot};

use crate::actor::{
    ActorConfig, GroupContext, GroupHandle, GroupMessage, HandleCache, spawn_group_actor,
};
use crate::control::Lifecycle;
use crate::correlation::CorrelationId;
use crate::discard::{DiscardEntry, DiscardLog, DiscardReason};
use crate::error::{AggregationError, ConfigError, StateError};
use crate::fragment::{EventFragment, MergedResult};
use crate::group_store::{
    GroupChange, GroupListener, InMemoryGroupStore, MessageGroupStore, ObservedGroupStore,
};
use crate::idempotency::{DEFAULT_DEDUP_CAPACITY, DEFAULT_DEDUP_GROUPS, IdempotencyGuard};
use crate::inbound::InboundMessage;
use crate::policy::{MessageLifecycle, ReleaseStrategy};
use crate::sink::MergedResultSink;

/// Default idle timeout for group actors: 5 minutes.
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Default bound of each group actor's mailbox.
const DEFAULT_MAILBOX_CAPACITY: usize = 32;

/// Default component name used by the control surface.
const DEFAULT_NAME: &str = "aggregator";

/// Deliveries that find a retired actor are retried against a fresh one.
const MAX_DELIVERY_ATTEMPTS: usize = 2;

/// Correlates message event fragments and emits merged results.
///
/// `Clone` is cheap: all internal state is `Arc`-wrapped, and every clone
/// shares the same groups, actors and running flag.
///
/// # Examples
///
/// ```
/// use message_aggregator::{ChannelSink, EventFragment, MessageAggregator, MessagePayload};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let (sink, mut results) = ChannelSink::new();
/// let aggregator = MessageAggregator::builder().sink(sink).build()?;
///
/// let payload = MessagePayload::new("order-paid").with_correlation_key("42");
/// aggregator.submit(EventFragment::start_deployed(payload.clone())).await?;
/// let released = aggregator.submit(EventFragment::sent(payload)).await?;
///
/// assert_eq!(released.len(), 1);
/// assert_eq!(results.recv().await, Some(released[0].clone()));
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct MessageAggregator {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    ctx: GroupContext,
    cache: Arc<RwLock<HandleCache>>,
    config: ActorConfig,
    running: AtomicBool,
    discards: DiscardLog,
}

// Manual `Debug` because the context holds trait objects.
impl std::fmt::Debug for MessageAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageAggregator")
            .field("name", &self.inner.name)
            .field("running", &self.is_running())
            .field("discard_log", &self.inner.discards.path())
            .finish()
    }
}

impl MessageAggregator {
    /// Start configuring an aggregator.
    pub fn builder() -> MessageAggregatorBuilder {
        MessageAggregatorBuilder::new()
    }

    /// Name the aggregator is addressed by on the control surface.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Correlate one fragment against its group.
    ///
    /// Returns the merged results released by this fragment, in release
    /// order; an empty vector means the fragment was buffered or only
    /// changed group state. Each result has been emitted to the sink before
    /// this returns.
    ///
    /// # Errors
    ///
    /// * [`AggregationError::NotRunning`] -- the aggregator is stopped.
    /// * [`AggregationError::DuplicateDelivery`] -- the event id was already
    ///   admitted for this group; a discard entry is written.
    /// * [`AggregationError::Emission`] -- the sink rejected a result; the
    ///   group and the admission were rolled back.
    /// * [`AggregationError::Io`] -- the group store failed.
    /// * [`AggregationError::ActorGone`] -- the group actor exited.
    pub async fn submit(
        &self,
        fragment: EventFragment,
    ) -> Result<Vec<MergedResult>, AggregationError> {
        self.ensure_running()?;
        let transport = InboundMessage::from_fragment(&fragment);
        self.correlate(fragment, transport).await
    }

    /// Decode an inbound transport message and correlate it.
    ///
    /// # Errors
    ///
    /// As [`submit`](MessageAggregator::submit), plus
    /// [`AggregationError::Validation`] when the message cannot be decoded.
    /// Validation failures are written to the discard log and never reach
    /// the group store.
    pub async fn submit_message(
        &self,
        message: InboundMessage,
    ) -> Result<Vec<MergedResult>, AggregationError> {
        self.ensure_running()?;
        let fragment = match message.decode() {
            Ok(fragment) => fragment,
            Err(e) => {
                self.discard(DiscardReason::Invalid, &e.to_string(), message);
                return Err(e.into());
            }
        };
        self.correlate(fragment, message).await
    }

    async fn correlate(
        &self,
        fragment: EventFragment,
        transport: InboundMessage,
    ) -> Result<Vec<MergedResult>, AggregationError> {
        let id = fragment.correlation_id();
        let (reply, rx) = oneshot::channel();
        if !self
            .dispatch(&id, GroupMessage::Submit { fragment, reply })
            .await?
        {
            return Err(AggregationError::ActorGone);
        }
        let result = rx.await.map_err(|_| AggregationError::ActorGone)?;
        if let Err(err @ AggregationError::DuplicateDelivery { .. }) = &result {
            self.discard(DiscardReason::Duplicate, &err.to_string(), transport);
        }
        result
    }

    /// Read the fragments currently buffered for `id`, oldest first.
    ///
    /// # Errors
    ///
    /// * [`StateError::Io`] -- the group store failed.
    /// * [`StateError::ActorGone`] -- the group actor exited.
    pub async fn group(&self, id: &CorrelationId) -> Result<Vec<EventFragment>, StateError> {
        let (reply, rx) = oneshot::channel();
        if !self.dispatch(id, GroupMessage::GetGroup { reply }).await? {
            return Err(StateError::ActorGone);
        }
        rx.await.map_err(|_| StateError::ActorGone)?
    }

    /// Drop every fragment buffered for `id`.
    ///
    /// Admitted event ids are kept, so redeliveries of already-seen events
    /// are still rejected.
    ///
    /// # Errors
    ///
    /// * [`StateError::Io`] -- the group store failed.
    /// * [`StateError::ActorGone`] -- the group actor exited.
    pub async fn remove_group(&self, id: &CorrelationId) -> Result<(), StateError> {
        let (reply, rx) = oneshot::channel();
        if !self.dispatch(id, GroupMessage::RemoveGroup { reply }).await? {
            return Err(StateError::ActorGone);
        }
        rx.await.map_err(|_| StateError::ActorGone)?
    }

    /// Ids of every non-empty group.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if the group store fails.
    pub fn group_ids(&self) -> io::Result<Vec<CorrelationId>> {
        self.inner.ctx.store.group_ids()
    }

    /// Entries written to the discard log so far.
    ///
    /// Empty when no discard log path was configured.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if the log cannot be read.
    pub fn discards(&self) -> io::Result<Vec<DiscardEntry>> {
        self.inner.discards.read_all()
    }

    /// Resume accepting submissions.
    pub fn start(&self) {
        if !self.inner.running.swap(true, Ordering::SeqCst) {
            tracing::info!(component = %self.inner.name, "aggregator started");
        }
    }

    /// Reject new submissions with [`AggregationError::NotRunning`].
    ///
    /// Submissions already queued at a group actor complete normally.
    pub fn stop(&self) {
        if self.inner.running.swap(false, Ordering::SeqCst) {
            tracing::info!(component = %self.inner.name, "aggregator stopped");
        }
    }

    /// Whether submissions are currently accepted.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<(), AggregationError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(AggregationError::NotRunning {
                component: self.inner.name.clone(),
            })
        }
    }

    fn discard(&self, reason: DiscardReason, error: &str, message: InboundMessage) {
        if let Err(e) = self
            .inner
            .discards
            .append(reason, error, message.headers, message.payload)
        {
            tracing::error!(error = %e, "failed to write discard log entry");
        }
    }

    /// Post `msg` to the actor owning `id`, spawning one if needed.
    ///
    /// Returns `false` if every attempt found a retired actor.
    async fn dispatch(&self, id: &CorrelationId, mut msg: GroupMessage) -> io::Result<bool> {
        for _ in 0..MAX_DELIVERY_ATTEMPTS {
            let handle = self.handle(id).await?;
            match handle.deliver(msg).await {
                Ok(()) => return Ok(true),
                Err(returned) => msg = returned,
            }
        }
        Ok(false)
    }

    /// Get the handle of the actor owning `id`, spawning it if needed.
    async fn handle(&self, id: &CorrelationId) -> io::Result<GroupHandle> {
        // Fast path: check cache with read lock.
        {
            let cache = self.inner.cache.read().await;
            if let Some(handle) = cache.get(id)
                && handle.is_alive()
            {
                return Ok(handle.clone());
            }
        }

        // Slow path: re-check under the write lock so two callers never
        // spawn two actors for the same group.
        loop {
            let draining = {
                let mut cache = self.inner.cache.write().await;
                let draining = match cache.get(id) {
                    Some(handle) if handle.is_alive() => return Ok(handle.clone()),
                    Some(handle) if !handle.has_exited() => Some(handle.clone()),
                    _ => None,
                };
                match draining {
                    Some(draining) => draining,
                    None => {
                        tracing::debug!(correlation_id = %id, "spawning group actor");
                        let handle = spawn_group_actor(
                            id.clone(),
                            self.inner.ctx.clone(),
                            Arc::downgrade(&self.inner.cache),
                            self.inner.config,
                        )?;
                        cache.insert(id.clone(), handle.clone());
                        return Ok(handle);
                    }
                }
            };

            // A retiring actor is still finishing its queue; its successor
            // may only start once it is gone.
            tracing::debug!(correlation_id = %id, "waiting for retiring group actor");
            draining.exited().await;
        }
    }

    #[cfg(test)]
    pub(crate) async fn live_actors(&self) -> usize {
        self.inner.cache.read().await.len()
    }
}

impl Lifecycle for MessageAggregator {
    fn name(&self) -> &str {
        MessageAggregator::name(self)
    }

    fn start(&self) {
        MessageAggregator::start(self);
    }

    fn stop(&self) {
        MessageAggregator::stop(self);
    }

    fn is_running(&self) -> bool {
        MessageAggregator::is_running(self)
    }
}

/// Builder for configuring a [`MessageAggregator`].
///
/// Only [`sink`](MessageAggregatorBuilder::sink) is required.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use message_aggregator::{ChannelSink, MessageAggregator};
///
/// let (sink, _rx) = ChannelSink::new();
/// let aggregator = MessageAggregator::builder()
///     .name("orders")
///     .sink(sink)
///     .idle_timeout(Duration::from_secs(60))
///     .auto_startup(false)
///     .build()
///     .unwrap();
///
/// assert_eq!(aggregator.name(), "orders");
/// assert!(!aggregator.is_running());
/// ```
pub struct MessageAggregatorBuilder {
    name: String,
    group_store: Option<Arc<dyn MessageGroupStore>>,
    strategy: Arc<dyn ReleaseStrategy>,
    sink: Option<Arc<dyn MergedResultSink>>,
    discard_log: Option<PathBuf>,
    idle_timeout: Duration,
    mailbox_capacity: usize,
    dedup_capacity: usize,
    dedup_groups: usize,
    listeners: Vec<GroupListener>,
    auto_startup: bool,
}

impl MessageAggregatorBuilder {
    /// Create a builder with default settings and no sink.
    pub fn new() -> Self {
        Self {
            name: DEFAULT_NAME.to_owned(),
            group_store: None,
            strategy: Arc::new(MessageLifecycle),
            sink: None,
            discard_log: None,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            dedup_groups: DEFAULT_DEDUP_GROUPS,
            listeners: Vec::new(),
            auto_startup: true,
        }
    }

    /// Set the component name used by the control surface.
    ///
    /// Defaults to `"aggregator"`.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set where groups are buffered.
    ///
    /// Defaults to an [`InMemoryGroupStore`]. Pass an `Arc` to keep access
    /// to the store from outside the aggregator.
    pub fn group_store(mut self, store: impl MessageGroupStore) -> Self {
        self.group_store = Some(Arc::new(store));
        self
    }

    /// Replace the release rules.
    ///
    /// Defaults to [`MessageLifecycle`].
    pub fn release_strategy(mut self, strategy: impl ReleaseStrategy) -> Self {
        self.strategy = Arc::new(strategy);
        self
    }

    /// Set the downstream sink for merged results. Required.
    pub fn sink(mut self, sink: impl MergedResultSink) -> Self {
        self.sink = Some(Arc::new(sink));
        self
    }

    /// Append discarded messages to the JSONL file at `path`.
    ///
    /// Without a path, discards are only traced.
    pub fn discard_log(mut self, path: impl AsRef<Path>) -> Self {
        self.discard_log = Some(path.as_ref().to_owned());
        self
    }

    /// Set how long a group actor may stay idle before shutting down.
    ///
    /// The next submission for the group transparently spawns a new actor
    /// that reloads the group from the store. Defaults to 5 minutes.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the bound of each group actor's mailbox. Defaults to 32.
    pub fn mailbox_capacity(mut self, capacity: usize) -> Self {
        self.mailbox_capacity = capacity;
        self
    }

    /// Set how many admitted event ids are remembered per group.
    ///
    /// Defaults to 10 000.
    pub fn dedup_capacity(mut self, capacity: usize) -> Self {
        self.dedup_capacity = capacity;
        self
    }

    /// Set how many groups have their admitted event ids remembered.
    ///
    /// Past the bound, the group with the oldest admission is forgotten and
    /// a redelivery to it is accepted again. Defaults to 65 536.
    pub fn dedup_groups(mut self, groups: usize) -> Self {
        self.dedup_groups = groups;
        self
    }

    /// Register a callback invoked after every group save or delete,
    /// including rollbacks.
    pub fn on_group_change<F>(mut self, listener: F) -> Self
    where
        F: Fn(&GroupChange) + Send + Sync + 'static,
    {
        self.listeners.push(Arc::new(listener));
        self
    }

    /// Whether the aggregator accepts submissions as soon as it is built.
    ///
    /// Defaults to `true`.
    pub fn auto_startup(mut self, auto_startup: bool) -> Self {
        self.auto_startup = auto_startup;
        self
    }

    /// Build the aggregator.
    ///
    /// # Errors
    ///
    /// * [`ConfigError::MissingSink`] -- no sink was configured.
    /// * [`ConfigError::EmptyName`] -- the name is empty.
    pub fn build(self) -> Result<MessageAggregator, ConfigError> {
        let sink = self.sink.ok_or(ConfigError::MissingSink)?;
        if self.name.trim().is_empty() {
            return Err(ConfigError::EmptyName);
        }

        let mut store: Arc<dyn MessageGroupStore> = match self.group_store {
            Some(store) => store,
            None => Arc::new(InMemoryGroupStore::new()),
        };
        if !self.listeners.is_empty() {
            store = Arc::new(ObservedGroupStore::new(store, self.listeners));
        }

        let discards = match self.discard_log {
            Some(path) => DiscardLog::new(path),
            None => DiscardLog::disabled(),
        };

        Ok(MessageAggregator {
            inner: Arc::new(Inner {
                name: self.name,
                ctx: GroupContext {
                    store,
                    strategy: self.strategy,
                    sink,
                    guard: Arc::new(
                        IdempotencyGuard::new(self.dedup_capacity)
                            .with_max_groups(self.dedup_groups),
                    ),
                },
                cache: Arc::new(RwLock::new(HashMap::new())),
                config: ActorConfig {
                    idle_timeout: self.idle_timeout,
                    mailbox_capacity: self.mailbox_capacity,
                },
                running: AtomicBool::new(self.auto_startup),
                discards,
            }),
        })
    }
}

impl Default for MessageAggregatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
