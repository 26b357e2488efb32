//! Actor loop that owns one correlation group and serializes its updates.
//!
//! Every [`CorrelationId`] is owned by at most one actor thread. The actor
//! processes its mailbox sequentially, so the admit, correlate, save and emit
//! steps of a submission form a critical section that no other submission
//! for the same group can interleave with.
//!
//! An idle actor closes its mailbox, finishes what was already queued and
//! only then removes itself from the aggregator's handle cache. Until its
//! thread exits, callers for the same group wait instead of spawning a
//! second owner.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::runtime::Runtime;
use tokio::sync::{RwLock, mpsc, oneshot, watch};

use crate::correlation::CorrelationId;
use crate::error::{AggregationError, StateError};
use crate::fragment::{EventFragment, MergedResult};
use crate::group_store::MessageGroupStore;
use crate::idempotency::IdempotencyGuard;
use crate::policy::{Correlation, ReleaseStrategy};
use crate::sink::MergedResultSink;

/// Live actor handles keyed by the group they own.
pub(crate) type HandleCache = HashMap<CorrelationId, GroupHandle>;

static NEXT_ACTOR_ID: AtomicU64 = AtomicU64::new(1);

/// Configuration for the actor loop.
///
/// Internal to the crate. Callers configure it through
/// [`MessageAggregatorBuilder`](crate::MessageAggregatorBuilder).
#[derive(Debug, Clone, Copy)]
pub(crate) struct ActorConfig {
    /// How long the actor waits for a message before shutting down.
    pub idle_timeout: Duration,
    /// Bound of the actor's mailbox.
    pub mailbox_capacity: usize,
}

/// Collaborators shared by every group actor of one aggregator.
#[derive(Clone)]
pub(crate) struct GroupContext {
    pub store: Arc<dyn MessageGroupStore>,
    pub strategy: Arc<dyn ReleaseStrategy>,
    pub sink: Arc<dyn MergedResultSink>,
    pub guard: Arc<IdempotencyGuard>,
}

type SubmitResult = Result<Vec<MergedResult>, AggregationError>;

/// Messages sent from the aggregator to a group actor.
pub(crate) enum GroupMessage {
    /// Correlate one fragment against the group.
    Submit {
        fragment: EventFragment,
        reply: oneshot::Sender<SubmitResult>,
    },

    /// Read the group's current contents.
    GetGroup {
        reply: oneshot::Sender<Result<Vec<EventFragment>, StateError>>,
    },

    /// Drop the group's contents.
    RemoveGroup {
        reply: oneshot::Sender<Result<(), StateError>>,
    },
}

/// Async handle to a running group actor.
#[derive(Debug, Clone)]
pub(crate) struct GroupHandle {
    sender: mpsc::Sender<GroupMessage>,
    actor_id: u64,
    // Never written to; closes when the actor thread exits.
    exited: watch::Receiver<()>,
}

impl GroupHandle {
    /// Post a message to the actor's mailbox.
    ///
    /// Hands the message back if the actor has closed its mailbox, so the
    /// caller can retry against a fresh actor.
    pub(crate) async fn deliver(&self, msg: GroupMessage) -> Result<(), GroupMessage> {
        self.sender.send(msg).await.map_err(|mpsc::error::SendError(msg)| msg)
    }

    /// Whether the actor is still accepting messages.
    pub(crate) fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }

    /// Whether the actor thread has finished, including any drain after
    /// its mailbox closed.
    pub(crate) fn has_exited(&self) -> bool {
        self.exited.has_changed().is_err()
    }

    /// Wait until the actor thread has finished.
    pub(crate) async fn exited(&self) {
        let mut exited = self.exited.clone();
        while exited.changed().await.is_ok() {}
    }
}

/// A handle whose mailbox is closed but whose actor has not exited yet.
/// Dropping the returned sender lets it exit.
#[cfg(test)]
pub(crate) fn draining_handle() -> (GroupHandle, watch::Sender<()>) {
    let (tx, mut rx) = mpsc::channel(1);
    rx.close();
    let (exit_tx, exited) = watch::channel(());
    let handle = GroupHandle {
        sender: tx,
        actor_id: NEXT_ACTOR_ID.fetch_add(1, Ordering::Relaxed),
        exited,
    };
    (handle, exit_tx)
}

/// Spawn the actor owning `correlation_id` on a dedicated thread.
///
/// `cache` is the aggregator's handle cache. The actor holds it weakly, so
/// dropping the aggregator drops every handle and lets the actors exit.
///
/// # Errors
///
/// Returns `io::Error` if the actor's runtime or thread cannot be created.
pub(crate) fn spawn_group_actor(
    correlation_id: CorrelationId,
    ctx: GroupContext,
    cache: Weak<RwLock<HandleCache>>,
    config: ActorConfig,
) -> io::Result<GroupHandle> {
    // Sinks may drive their own I/O, so the actor's runtime enables all drivers.
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let (tx, rx) = mpsc::channel(config.mailbox_capacity.max(1));
    let actor_id = NEXT_ACTOR_ID.fetch_add(1, Ordering::Relaxed);
    let (exit_tx, exited) = watch::channel(());

    std::thread::Builder::new()
        .name("group-actor".into())
        .spawn(move || {
            run_actor(GroupActor {
                correlation_id,
                actor_id,
                ctx,
                rt,
                rx,
                cache,
                idle_timeout: config.idle_timeout,
                _exit: exit_tx,
            });
        })?;

    Ok(GroupHandle {
        sender: tx,
        actor_id,
        exited,
    })
}

struct GroupActor {
    correlation_id: CorrelationId,
    actor_id: u64,
    ctx: GroupContext,
    rt: Runtime,
    rx: mpsc::Receiver<GroupMessage>,
    cache: Weak<RwLock<HandleCache>>,
    idle_timeout: Duration,
    _exit: watch::Sender<()>,
}

fn run_actor(mut actor: GroupActor) {
    loop {
        let idle_timeout = actor.idle_timeout;
        let rx = &mut actor.rx;
        let msg = actor
            .rt
            .block_on(async { tokio::time::timeout(idle_timeout, rx.recv()).await });

        match msg {
            Ok(Some(msg)) => actor.handle(msg),
            // Every handle dropped: the aggregator is gone.
            Ok(None) => break,
            Err(_elapsed) => {
                if actor.retire() {
                    tracing::info!(
                        correlation_id = %actor.correlation_id,
                        "group actor idle, shutting down"
                    );
                    break;
                }
            }
        }
    }
}

impl GroupActor {
    fn handle(&self, msg: GroupMessage) {
        match msg {
            GroupMessage::Submit { fragment, reply } => {
                let result = self.submit(fragment);
                // The caller may have given up waiting; the outcome stands.
                let _ = reply.send(result);
            }
            GroupMessage::GetGroup { reply } => {
                tracing::debug!(correlation_id = %self.correlation_id, "reading group");
                let _ = reply.send(self.ctx.store.load(&self.correlation_id).map_err(Into::into));
            }
            GroupMessage::RemoveGroup { reply } => {
                let _ = reply.send(self.ctx.store.delete(&self.correlation_id).map_err(Into::into));
            }
        }
    }

    /// Try to leave the handle cache after an idle timeout.
    ///
    /// Returns `false` if a message slipped in, in which case it has been
    /// processed and the actor keeps running.
    fn retire(&mut self) -> bool {
        if let Ok(msg) = self.rx.try_recv() {
            self.handle(msg);
            return false;
        }

        // Senders that raced past the cache now see a closed mailbox and
        // retry once this thread exits; anything already queued is still
        // ours to finish. The cache lock is not held meanwhile.
        self.rx.close();
        while let Some(msg) = self.rt.block_on(self.rx.recv()) {
            self.handle(msg);
        }

        if let Some(shared) = self.cache.upgrade() {
            let mut cache = shared.blocking_write();
            if cache
                .get(&self.correlation_id)
                .is_some_and(|h| h.actor_id == self.actor_id)
            {
                cache.remove(&self.correlation_id);
            }
        }
        true
    }

    /// The critical section: admit, correlate, persist, emit, or roll back.
    fn submit(&self, fragment: EventFragment) -> SubmitResult {
        let id = &self.correlation_id;
        let _span = tracing::info_span!(
            "correlate",
            correlation_id = %id,
            kind = %fragment.kind,
        )
        .entered();

        let event_id = fragment.event_id.clone();
        self.ctx.guard.admit(id, &event_id).map_err(|dup| {
            tracing::warn!(event_id = %dup.event_id, "duplicate delivery");
            AggregationError::DuplicateDelivery {
                correlation_id: dup.correlation_id,
                event_id: dup.event_id,
            }
        })?;

        let snapshot = match self.ctx.store.load(id) {
            Ok(group) => group,
            Err(e) => {
                self.ctx.guard.retract(id, &event_id);
                return Err(e.into());
            }
        };

        let Correlation { group, released } =
            self.ctx.strategy.correlate(id, snapshot.clone(), fragment);

        if let Err(e) = self.ctx.store.save(id, &group) {
            self.ctx.guard.retract(id, &event_id);
            return Err(e.into());
        }

        for (delivered, result) in released.iter().enumerate() {
            if let Err(e) = self.rt.block_on(self.ctx.sink.emit(result)) {
                tracing::error!(
                    error = %e,
                    delivered,
                    "emission failed, rolling back group"
                );
                // Sent fragments behind results that already went out stay
                // consumed; a retry must not release them again.
                let consumed: HashSet<&str> = released[..delivered]
                    .iter()
                    .flat_map(|r| r.event_ids.iter().skip(1))
                    .map(String::as_str)
                    .collect();
                let restored: Vec<EventFragment> = snapshot
                    .into_iter()
                    .filter(|f| !consumed.contains(f.event_id.as_str()))
                    .collect();
                // Saving an empty group deletes it.
                if let Err(restore) = self.ctx.store.save(id, &restored) {
                    tracing::error!(error = %restore, "failed to restore group snapshot");
                }
                self.ctx.guard.retract(id, &event_id);
                return Err(AggregationError::Emission(e));
            }
        }

        if !released.is_empty() {
            tracing::info!(count = released.len(), "merged results released");
        }
        Ok(released)
    }
}
