//! Duplicate-delivery detection keyed by correlation id and event id.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::correlation::CorrelationId;

const GUARD_SHARDS: usize = 64;

/// Default number of admitted event ids remembered per group.
pub const DEFAULT_DEDUP_CAPACITY: usize = 10_000;

/// Default number of groups whose admissions are remembered at once.
pub const DEFAULT_DEDUP_GROUPS: usize = 65_536;

/// Returned when an event id was already admitted for a group.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("event '{event_id}' already admitted for '{correlation_id}'")]
pub struct DuplicateDelivery {
    /// Group the event was addressed to.
    pub correlation_id: CorrelationId,
    /// The duplicated event id.
    pub event_id: String,
}

/// Remembers which event ids have been admitted for each group.
///
/// Sharded by a SipHash of the correlation id so unrelated groups rarely
/// contend on the same mutex. Each group remembers at most `capacity` ids;
/// beyond that the oldest admission is forgotten. The number of tracked
/// groups is bounded too: once a shard is full, the group whose last
/// admission is oldest is forgotten as a whole.
#[derive(Debug)]
pub struct IdempotencyGuard {
    shards: Vec<Mutex<HashMap<CorrelationId, AdmittedIds>>>,
    capacity: usize,
    groups_per_shard: usize,
    clock: AtomicU64,
}

#[derive(Debug, Default)]
struct AdmittedIds {
    order: VecDeque<String>,
    ids: HashSet<String>,
    last_used: u64,
}

impl AdmittedIds {
    fn insert(&mut self, event_id: &str, capacity: usize) -> bool {
        if !self.ids.insert(event_id.to_owned()) {
            return false;
        }
        self.order.push_back(event_id.to_owned());
        while self.order.len() > capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.ids.remove(&evicted);
            }
        }
        true
    }

    fn remove(&mut self, event_id: &str) {
        if self.ids.remove(event_id) {
            self.order.retain(|id| id != event_id);
        }
    }
}

impl IdempotencyGuard {
    /// Create a guard remembering up to `capacity` ids per group and
    /// [`DEFAULT_DEDUP_GROUPS`] groups.
    pub fn new(capacity: usize) -> Self {
        Self {
            shards: (0..GUARD_SHARDS).map(|_| Mutex::default()).collect(),
            capacity: capacity.max(1),
            groups_per_shard: DEFAULT_DEDUP_GROUPS.div_ceil(GUARD_SHARDS),
            clock: AtomicU64::new(0),
        }
    }

    /// Bound the number of groups tracked at once.
    ///
    /// The bound is enforced per shard, so the guard holds at most
    /// `max_groups` rounded up to a multiple of the shard count.
    pub fn with_max_groups(mut self, max_groups: usize) -> Self {
        self.groups_per_shard = max_groups.div_ceil(GUARD_SHARDS).max(1);
        self
    }

    /// Admit `event_id` for `correlation_id`.
    ///
    /// # Errors
    ///
    /// Returns [`DuplicateDelivery`] if the id was already admitted for this
    /// group and has not been retracted or evicted since. Of two racing
    /// admissions of the same id, exactly one succeeds.
    pub fn admit(
        &self,
        correlation_id: &CorrelationId,
        event_id: &str,
    ) -> Result<(), DuplicateDelivery> {
        let tick = self.clock.fetch_add(1, Ordering::Relaxed);
        let mut shard = self.lock_shard(correlation_id);
        if !shard.contains_key(correlation_id) && shard.len() >= self.groups_per_shard {
            let coldest = shard
                .iter()
                .min_by_key(|(_, admitted)| admitted.last_used)
                .map(|(id, _)| id.clone());
            if let Some(coldest) = coldest {
                tracing::debug!(correlation_id = %coldest, "forgetting admissions of idle group");
                shard.remove(&coldest);
            }
        }
        let admitted = shard.entry(correlation_id.clone()).or_default();
        admitted.last_used = tick;
        if admitted.insert(event_id, self.capacity) {
            Ok(())
        } else {
            Err(DuplicateDelivery {
                correlation_id: correlation_id.clone(),
                event_id: event_id.to_owned(),
            })
        }
    }

    /// Undo an admission, so a retried delivery of the same event is
    /// accepted again.
    pub fn retract(&self, correlation_id: &CorrelationId, event_id: &str) {
        let mut shard = self.lock_shard(correlation_id);
        if let Some(admitted) = shard.get_mut(correlation_id) {
            admitted.remove(event_id);
            if admitted.ids.is_empty() {
                shard.remove(correlation_id);
            }
        }
    }

    /// Whether `event_id` is currently remembered for `correlation_id`.
    pub fn contains(&self, correlation_id: &CorrelationId, event_id: &str) -> bool {
        self.lock_shard(correlation_id)
            .get(correlation_id)
            .is_some_and(|admitted| admitted.ids.contains(event_id))
    }

    /// Number of ids remembered for `correlation_id`.
    pub fn admitted_count(&self, correlation_id: &CorrelationId) -> usize {
        self.lock_shard(correlation_id)
            .get(correlation_id)
            .map_or(0, |admitted| admitted.ids.len())
    }

    /// Number of groups with at least one remembered id.
    pub fn tracked_groups(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.lock().unwrap_or_else(|p| p.into_inner()).len())
            .sum()
    }

    fn shard_index(&self, correlation_id: &CorrelationId) -> usize {
        let mut hasher = DefaultHasher::new();
        correlation_id.hash(&mut hasher);
        (hasher.finish() as usize) % self.shards.len()
    }

    fn lock_shard(
        &self,
        correlation_id: &CorrelationId,
    ) -> std::sync::MutexGuard<'_, HashMap<CorrelationId, AdmittedIds>> {
        let idx = self.shard_index(correlation_id);
        // Every update leaves `ids` and `order` consistent; poisoning is recovered.
        self.shards[idx]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for IdempotencyGuard {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_CAPACITY)
    }
}
