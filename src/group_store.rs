//! Message group storage: the trait and built-in backends.
//!
//! A message group is the ordered list of fragments buffered under one
//! [`CorrelationId`]. Stores are only mutated from inside the owning group
//! actor, so implementations need to be thread-safe but never see two
//! concurrent writers for the same id.
//!
//! The file-backed store writes one JSON document per group:
//!
//! ```text
//! <base_dir>/
//!     groups/
//!         <uuid-v5 of correlation id>.json
//! ```
//!
//! Writes are atomic via a temp-rename pattern, so a crash mid-write never
//! leaves a partially-written group behind.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::correlation::CorrelationId;
use crate::fragment::EventFragment;

/// Keyed, ordered storage for not-yet-released fragments.
///
/// # Contract
///
/// - [`load`](MessageGroupStore::load) returns fragments in insertion order
///   and an empty vector for unknown ids.
/// - [`save`](MessageGroupStore::save) replaces the whole group. Saving an
///   empty slice is equivalent to [`delete`](MessageGroupStore::delete).
/// - [`delete`](MessageGroupStore::delete) of an unknown id succeeds.
pub trait MessageGroupStore: Send + Sync + 'static {
    /// Read the fragments currently held for `id`.
    fn load(&self, id: &CorrelationId) -> io::Result<Vec<EventFragment>>;

    /// Replace the fragments held for `id`.
    fn save(&self, id: &CorrelationId, fragments: &[EventFragment]) -> io::Result<()>;

    /// Drop the group for `id`.
    fn delete(&self, id: &CorrelationId) -> io::Result<()>;

    /// Ids of every non-empty group.
    fn group_ids(&self) -> io::Result<Vec<CorrelationId>>;

    /// Append one fragment to the group.
    fn add(&self, id: &CorrelationId, fragment: EventFragment) -> io::Result<()> {
        let mut fragments = self.load(id)?;
        fragments.push(fragment);
        self.save(id, &fragments)
    }

    /// Remove the fragment with `event_id`, returning it if it was present.
    fn remove(&self, id: &CorrelationId, event_id: &str) -> io::Result<Option<EventFragment>> {
        let mut fragments = self.load(id)?;
        let Some(pos) = fragments.iter().position(|f| f.event_id == event_id) else {
            return Ok(None);
        };
        let removed = fragments.remove(pos);
        self.save(id, &fragments)?;
        Ok(Some(removed))
    }

    /// Drop every fragment of the group.
    fn clear(&self, id: &CorrelationId) -> io::Result<()> {
        self.delete(id)
    }
}

impl<S: MessageGroupStore + ?Sized> MessageGroupStore for Arc<S> {
    fn load(&self, id: &CorrelationId) -> io::Result<Vec<EventFragment>> {
        (**self).load(id)
    }

    fn save(&self, id: &CorrelationId, fragments: &[EventFragment]) -> io::Result<()> {
        (**self).save(id, fragments)
    }

    fn delete(&self, id: &CorrelationId) -> io::Result<()> {
        (**self).delete(id)
    }

    fn group_ids(&self) -> io::Result<Vec<CorrelationId>> {
        (**self).group_ids()
    }
}

fn poisoned<T>(_: T) -> io::Error {
    io::Error::other("group store lock poisoned")
}

/// Process-local store backed by a `HashMap`.
///
/// Suitable for tests and for deployments that accept losing buffered
/// fragments on restart.
#[derive(Debug, Default)]
pub struct InMemoryGroupStore {
    groups: RwLock<HashMap<CorrelationId, Vec<EventFragment>>>,
}

impl InMemoryGroupStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl MessageGroupStore for InMemoryGroupStore {
    fn load(&self, id: &CorrelationId) -> io::Result<Vec<EventFragment>> {
        let groups = self.groups.read().map_err(poisoned)?;
        Ok(groups.get(id).cloned().unwrap_or_default())
    }

    fn save(&self, id: &CorrelationId, fragments: &[EventFragment]) -> io::Result<()> {
        let mut groups = self.groups.write().map_err(poisoned)?;
        if fragments.is_empty() {
            groups.remove(id);
        } else {
            groups.insert(id.clone(), fragments.to_vec());
        }
        Ok(())
    }

    fn delete(&self, id: &CorrelationId) -> io::Result<()> {
        self.groups.write().map_err(poisoned)?.remove(id);
        Ok(())
    }

    fn group_ids(&self) -> io::Result<Vec<CorrelationId>> {
        let groups = self.groups.read().map_err(poisoned)?;
        let mut ids: Vec<_> = groups.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

/// On-disk representation of one group.
#[derive(Debug, Serialize, Deserialize)]
struct GroupDocument {
    correlation_id: CorrelationId,
    fragments: Vec<EventFragment>,
}

/// Durable store keeping one JSON document per group.
#[derive(Debug, Clone)]
pub struct FileGroupStore {
    groups_dir: PathBuf,
}

impl FileGroupStore {
    /// Create a store rooted at `base_dir`.
    ///
    /// The directory does not need to exist yet; it is created on the first
    /// save.
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            groups_dir: base_dir.as_ref().join("groups"),
        }
    }

    /// Path of the document holding the group for `id`.
    ///
    /// # Returns
    ///
    /// `<base_dir>/groups/<uuid-v5>.json`
    pub fn group_path(&self, id: &CorrelationId) -> PathBuf {
        self.groups_dir.join(format!("{}.json", id.uuid()))
    }

    fn read_document(path: &Path) -> io::Result<Option<GroupDocument>> {
        match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content)
                .map(Some)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl MessageGroupStore for FileGroupStore {
    fn load(&self, id: &CorrelationId) -> io::Result<Vec<EventFragment>> {
        Ok(Self::read_document(&self.group_path(id))?
            .map(|doc| doc.fragments)
            .unwrap_or_default())
    }

    fn save(&self, id: &CorrelationId, fragments: &[EventFragment]) -> io::Result<()> {
        if fragments.is_empty() {
            return self.delete(id);
        }
        std::fs::create_dir_all(&self.groups_dir)?;
        let path = self.group_path(id);
        let tmp_path = path.with_extension("json.tmp");
        let doc = GroupDocument {
            correlation_id: id.clone(),
            fragments: fragments.to_vec(),
        };
        let json = serde_json::to_string(&doc).map_err(io::Error::other)?;
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    fn delete(&self, id: &CorrelationId) -> io::Result<()> {
        match std::fs::remove_file(self.group_path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn group_ids(&self) -> io::Result<Vec<CorrelationId>> {
        let entries = match std::fs::read_dir(&self.groups_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut ids = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(doc) = Self::read_document(&path)? {
                ids.push(doc.correlation_id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// State change reported to group listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupChange {
    /// The group now holds `size` fragments.
    Saved {
        /// Group that changed.
        correlation_id: CorrelationId,
        /// Number of fragments after the change.
        size: usize,
    },
    /// The group was removed.
    Deleted {
        /// Group that was removed.
        correlation_id: CorrelationId,
    },
}

/// Callback invoked after every successful group mutation.
pub type GroupListener = Arc<dyn Fn(&GroupChange) + Send + Sync>;

/// Store decorator that reports every successful mutation to listeners.
///
/// Rollbacks are mutations too and are reported like any other save.
pub struct ObservedGroupStore {
    inner: Arc<dyn MessageGroupStore>,
    listeners: Vec<GroupListener>,
}

impl ObservedGroupStore {
    /// Wrap `inner`, reporting to `listeners`.
    pub fn new(inner: Arc<dyn MessageGroupStore>, listeners: Vec<GroupListener>) -> Self {
        Self { inner, listeners }
    }

    fn notify(&self, change: GroupChange) {
        for listener in &self.listeners {
            listener(&change);
        }
    }
}

impl std::fmt::Debug for ObservedGroupStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservedGroupStore")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl MessageGroupStore for ObservedGroupStore {
    fn load(&self, id: &CorrelationId) -> io::Result<Vec<EventFragment>> {
        self.inner.load(id)
    }

    fn save(&self, id: &CorrelationId, fragments: &[EventFragment]) -> io::Result<()> {
        self.inner.save(id, fragments)?;
        if fragments.is_empty() {
            self.notify(GroupChange::Deleted {
                correlation_id: id.clone(),
            });
        } else {
            self.notify(GroupChange::Saved {
                correlation_id: id.clone(),
                size: fragments.len(),
            });
        }
        Ok(())
    }

    fn delete(&self, id: &CorrelationId) -> io::Result<()> {
        self.inner.delete(id)?;
        self.notify(GroupChange::Deleted {
            correlation_id: id.clone(),
        });
        Ok(())
    }

    fn group_ids(&self) -> io::Result<Vec<CorrelationId>> {
        self.inner.group_ids()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tempfile::TempDir;

    use super::*;
    use crate::fragment::MessagePayload;

    fn id() -> CorrelationId {
        CorrelationId::new("message", Some("1"), None)
    }

    fn sent(tag: &str) -> EventFragment {
        EventFragment::sent(MessagePayload::new("message").with_correlation_key("1"))
            .with_event_id(tag)
    }

    fn exercise_contract(store: &dyn MessageGroupStore) {
        let id = id();
        assert!(store.load(&id).unwrap().is_empty());

        store.add(&id, sent("a")).unwrap();
        store.add(&id, sent("b")).unwrap();
        let ids: Vec<_> = store.load(&id).unwrap().into_iter().map(|f| f.event_id).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(store.group_ids().unwrap(), vec![id.clone()]);

        let removed = store.remove(&id, "a").unwrap();
        assert_eq!(removed.map(|f| f.event_id).as_deref(), Some("a"));
        assert!(store.remove(&id, "missing").unwrap().is_none());
        assert_eq!(store.load(&id).unwrap().len(), 1);

        store.clear(&id).unwrap();
        assert!(store.load(&id).unwrap().is_empty());
        assert!(store.group_ids().unwrap().is_empty());

        // Deleting an unknown group is fine.
        store.delete(&id).unwrap();
    }

    #[test]
    fn in_memory_store_contract() {
        exercise_contract(&InMemoryGroupStore::new());
    }

    #[test]
    fn file_store_contract() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        exercise_contract(&FileGroupStore::new(tmp.path()));
    }

    #[test]
    fn saving_empty_group_removes_it() {
        let store = InMemoryGroupStore::new();
        store.save(&id(), &[sent("a")]).unwrap();
        store.save(&id(), &[]).unwrap();
        assert!(store.group_ids().unwrap().is_empty());
    }

    #[test]
    fn file_store_survives_reopen() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        FileGroupStore::new(tmp.path())
            .save(&id(), &[sent("a"), sent("b")])
            .unwrap();

        let reopened = FileGroupStore::new(tmp.path());
        assert_eq!(reopened.load(&id()).unwrap().len(), 2);
        assert_eq!(reopened.group_ids().unwrap(), vec![id()]);
    }

    #[test]
    fn file_store_leaves_no_temp_file() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let store = FileGroupStore::new(tmp.path());
        store.save(&id(), &[sent("a")]).unwrap();

        let path = store.group_path(&id());
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn file_store_rejects_corrupt_document() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let store = FileGroupStore::new(tmp.path());
        store.save(&id(), &[sent("a")]).unwrap();
        std::fs::write(store.group_path(&id()), "not json").unwrap();

        let err = store.load(&id()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn observed_store_reports_changes() {
        let changes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&changes);
        let listener: GroupListener = Arc::new(move |change: &GroupChange| {
            sink.lock().unwrap().push(change.clone());
        });
        let store = ObservedGroupStore::new(Arc::new(InMemoryGroupStore::new()), vec![listener]);

        store.add(&id(), sent("a")).unwrap();
        store.save(&id(), &[]).unwrap();
        store.delete(&id()).unwrap();

        let changes = changes.lock().unwrap();
        assert_eq!(
            *changes,
            vec![
                GroupChange::Saved {
                    correlation_id: id(),
                    size: 1
                },
                GroupChange::Deleted {
                    correlation_id: id()
                },
                GroupChange::Deleted {
                    correlation_id: id()
                },
            ]
        );
    }
}
