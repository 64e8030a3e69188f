//! Listener capabilities and the dependency registry
//!
//! Every listener is registered once and addressed by a [`ListenerId`].
//! Cells keep lists of ids, and the registry records, for "active"
//! listeners, the name of the cell whose value they compute. Together these
//! form the dependency graph the notifier walks: an edge runs from each cell
//! a listener watches to the cell it computes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::{HashMap, HashSet};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Kind of change a [`DataEvent`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    ValueChanged,
    DataAdded,
    DataRemoved,
}

/// One cell's change, delivered to listeners in batches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataEvent {
    pub name: String,
    pub kind: EventKind,
    pub value: Option<Value>,
}

impl DataEvent {
    pub fn value_changed(name: impl Into<String>, value: Option<Value>) -> Self {
        Self { name: name.into(), kind: EventKind::ValueChanged, value }
    }
}

/// Receives batched value changes for the names it subscribed to.
pub trait DataListener: Send + Sync {
    /// Called once per notification pass with every pending change, in the
    /// order the names were touched.
    fn data_values_changed(&self, events: &[DataEvent]);
}

/// Receives cell creation and removal under a prefix.
pub trait RepositoryListener: Send + Sync {
    fn data_added(&self, name: &str);

    fn data_removed(&self, _name: &str, _old_value: Option<&Value>) {}
}

/// Handle for a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

struct Entry {
    listener: Arc<dyn DataListener>,
    computing: Option<String>,
}

/// Arena of registered listeners plus the computed-name back edges.
pub(crate) struct ListenerRegistry {
    entries: RwLock<HashMap<ListenerId, Entry>>,
    active_by_name: RwLock<HashMap<String, ListenerId>>,
    watches: RwLock<HashMap<ListenerId, HashSet<String>>>,
    next_id: AtomicU64,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            active_by_name: RwLock::new(HashMap::new()),
            watches: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate an id without registering anything under it.
    pub fn allocate(&self) -> ListenerId {
        ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn register(&self, listener: Arc<dyn DataListener>, computing: Option<String>) -> ListenerId {
        let id = self.allocate();
        self.insert(id, listener, computing);
        id
    }

    pub fn insert(&self, id: ListenerId, listener: Arc<dyn DataListener>, computing: Option<String>) {
        if let Some(name) = &computing {
            self.active_by_name.write().insert(name.clone(), id);
        }
        self.entries.write().insert(id, Entry { listener, computing });
    }

    pub fn unregister(&self, id: ListenerId) -> bool {
        let removed = self.entries.write().remove(&id);
        match removed {
            Some(entry) => {
                if let Some(name) = entry.computing {
                    let mut active = self.active_by_name.write();
                    if active.get(&name) == Some(&id) {
                        active.remove(&name);
                    }
                }
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: ListenerId) -> Option<Arc<dyn DataListener>> {
        self.entries.read().get(&id).map(|e| Arc::clone(&e.listener))
    }

    /// Name of the cell this listener computes, if it is an active listener.
    pub fn computing_name(&self, id: ListenerId) -> Option<String> {
        self.entries.read().get(&id).and_then(|e| e.computing.clone())
    }

    /// The active listener computing `name`, if any.
    pub fn active_for(&self, name: &str) -> Option<ListenerId> {
        self.active_by_name.read().get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Record that `id` is now on the listener list of `name`.
    pub fn note_watch(&self, id: ListenerId, name: &str) {
        self.watches.write().entry(id).or_default().insert(name.to_string());
    }

    pub fn note_unwatch(&self, id: ListenerId, name: &str) {
        let mut watches = self.watches.write();
        if let Some(names) = watches.get_mut(&id) {
            names.remove(name);
            if names.is_empty() {
                watches.remove(&id);
            }
        }
    }

    /// Forget and return every name `id` watches.
    pub fn take_watches(&self, id: ListenerId) -> Vec<String> {
        self.watches.write().remove(&id).map(|s| s.into_iter().collect()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;

    impl DataListener for Nop {
        fn data_values_changed(&self, _events: &[DataEvent]) {}
    }

    #[test]
    fn test_register_and_unregister() {
        let reg = ListenerRegistry::new();
        let a = reg.register(Arc::new(Nop), None);
        let b = reg.register(Arc::new(Nop), Some("/p/Total".into()));
        assert_ne!(a, b);
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.active_for("/p/Total"), Some(b));
        assert_eq!(reg.computing_name(b).as_deref(), Some("/p/Total"));
        assert_eq!(reg.computing_name(a), None);

        assert!(reg.unregister(b));
        assert!(!reg.unregister(b));
        assert_eq!(reg.active_for("/p/Total"), None);
        assert!(reg.get(a).is_some());
    }

    #[test]
    fn test_watch_bookkeeping() {
        let reg = ListenerRegistry::new();
        let id = reg.register(Arc::new(Nop), None);
        reg.note_watch(id, "/a");
        reg.note_watch(id, "/b");
        reg.note_unwatch(id, "/a");
        assert_eq!(reg.take_watches(id), vec!["/b".to_string()]);
        assert!(reg.take_watches(id).is_empty());
    }

    #[test]
    fn test_replacing_active_listener_keeps_newest() {
        let reg = ListenerRegistry::new();
        let old = reg.register(Arc::new(Nop), Some("/x".into()));
        let new = reg.register(Arc::new(Nop), Some("/x".into()));
        reg.unregister(old);
        assert_eq!(reg.active_for("/x"), Some(new));
    }

    #[test]
    fn test_event_serializes_value_as_wire_string() {
        let e = DataEvent::value_changed("/p/A", Some(Value::number(5.0)));
        let json = serde_json::to_string(&e).unwrap();
        assert!(json.contains("\"value\":\"5\""));
        let back: DataEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, e);
    }
}
