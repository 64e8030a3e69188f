//! Change notification
//!
//! Writes record, per listener, the set of names whose values changed. A
//! listener that computes another cell ("active" listener) pulls the
//! listeners of that cell into the same pass, so derived values are queued
//! before anything downstream of them fires.
//!
//! Firing a listener delivers everything pending for it as one batch. Any
//! active listener responsible for one of those names fires first. A
//! listener that becomes pending again while its own delivery is still on
//! the stack is a notification cycle: the repeat is dropped and logged once.

use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Weak;
use std::thread::{self, ThreadId};
use std::time::Instant;

use hashbrown::HashMap;
use indexmap::{IndexMap, IndexSet};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use crate::error::DataResult;
use crate::listener::{DataEvent, ListenerId};
use crate::repository::DataRepository;
use crate::worker::{WorkerHandle, POLL};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Firing the active listeners this one depends on
    Ordering,
    /// Inside the listener's callback
    Delivering,
}

/// Pending notification table shared by every writer and the notifier thread.
pub(crate) struct Notifier {
    pending: Mutex<IndexMap<ListenerId, IndexSet<String>>>,
    wake: Condvar,
    firing: Mutex<HashMap<ListenerId, (ThreadId, Phase)>>,
    fired: Condvar,
    flagged: Mutex<HashSet<ListenerId>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(IndexMap::new()),
            wake: Condvar::new(),
            firing: Mutex::new(HashMap::new()),
            fired: Condvar::new(),
            flagged: Mutex::new(HashSet::new()),
        }
    }

    fn record(&self, id: ListenerId, name: &str) {
        let mut pending = self.pending.lock();
        let names = pending.entry(id).or_default();
        if !names.contains(name) {
            names.insert(name.to_string());
        }
    }

    fn is_pending(&self, id: ListenerId) -> bool {
        self.pending.lock().contains_key(&id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Drop a pending change for one name (the listener unsubscribed).
    pub fn forget_name(&self, id: ListenerId, name: &str) {
        let mut pending = self.pending.lock();
        if let Some(names) = pending.get_mut(&id) {
            names.shift_remove(name);
            if names.is_empty() {
                pending.shift_remove(&id);
            }
        }
    }

    /// Drop everything pending for a deleted listener.
    pub fn forget(&self, id: ListenerId) {
        self.pending.lock().shift_remove(&id);
        self.flagged.lock().remove(&id);
    }

    fn set_phase(&self, id: ListenerId, phase: Phase) {
        if let Some(entry) = self.firing.lock().get_mut(&id) {
            entry.1 = phase;
        }
    }
}

/// Clears a listener's firing mark, waking threads waiting on it.
struct FiringMark<'a> {
    notifier: &'a Notifier,
    id: ListenerId,
}

impl Drop for FiringMark<'_> {
    fn drop(&mut self) {
        self.notifier.firing.lock().remove(&self.id);
        self.notifier.fired.notify_all();
    }
}

impl DataRepository {
    /// Queue notifications for every listener of `name`, following active
    /// listeners into the cells they compute.
    pub(crate) fn data_changed(&self, name: &str) {
        let mut visited = HashSet::new();
        self.queue_notifications(name, &mut visited);
        self.notifier.wake.notify_one();
    }

    fn queue_notifications(&self, name: &str, visited: &mut HashSet<String>) {
        if !visited.insert(name.to_string()) {
            return;
        }
        for id in self.listeners_of(name).into_iter().rev() {
            self.notifier.record(id, name);
            if let Some(computed) = self.listeners.computing_name(id) {
                self.queue_notifications(&computed, visited);
            }
        }
    }

    /// Queue one name for one listener and deliver it right away.
    pub(crate) fn notify_now(&self, id: ListenerId, name: &str) {
        self.notifier.record(id, name);
        self.fire_listener(id);
    }

    /// Deliver everything pending for `id`.
    ///
    /// Returns `true` once nothing is left pending for the listener, so
    /// callers draining the table can tell progress from a stall.
    pub(crate) fn fire_listener(&self, id: ListenerId) -> bool {
        let me = thread::current().id();
        {
            let mut firing = self.notifier.firing.lock();
            match firing.get(&id).copied() {
                Some((owner, phase)) if owner == me => {
                    drop(firing);
                    if phase == Phase::Delivering {
                        self.abort_recursive_notification(id);
                        return true;
                    }
                    // the outer frame delivers once its ordering pass is done
                    return false;
                }
                Some(_) => {
                    let deadline = Instant::now() + self.config.listener_wait;
                    while firing.contains_key(&id) {
                        if self.notifier.fired.wait_until(&mut firing, deadline).timed_out() {
                            debug!("[notifier] gave up waiting for listener {}", id.as_u64());
                            break;
                        }
                    }
                    drop(firing);
                    return !self.notifier.is_pending(id);
                }
                None => {
                    firing.insert(id, (me, Phase::Ordering));
                }
            }
        }
        let _mark = FiringMark { notifier: &self.notifier, id };

        let names: Vec<String> = self
            .notifier
            .pending
            .lock()
            .get(&id)
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default();
        for name in &names {
            if let Some(active) = self.listeners.active_for(name) {
                if active != id && self.notifier.is_pending(active) {
                    self.fire_listener(active);
                }
            }
        }

        let Some(names) = self.notifier.pending.lock().shift_remove(&id) else {
            return true;
        };
        let Some(listener) = self.listeners.get(id) else {
            return true;
        };

        let events: Vec<DataEvent> = names
            .into_iter()
            .map(|name| {
                let value = self.get_simple_value(&name);
                DataEvent::value_changed(name, value)
            })
            .collect();

        self.notifier.set_phase(id, Phase::Delivering);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| listener.data_values_changed(&events)));
        if outcome.is_err() {
            warn!("[notifier] listener {} panicked while handling {} events", id.as_u64(), events.len());
        }
        true
    }

    fn abort_recursive_notification(&self, id: ListenerId) {
        let names = self.notifier.pending.lock().shift_remove(&id);
        self.stats.notify_recursion_aborts.fetch_add(1, Ordering::Relaxed);
        if self.notifier.flagged.lock().insert(id) {
            let culprit = self
                .listeners
                .computing_name(id)
                .or_else(|| names.and_then(|n| n.first().cloned()))
                .unwrap_or_else(|| format!("listener {}", id.as_u64()));
            error!("[notifier] infinite recursion encountered when notifying listeners of {} - ABORTING", culprit);
        }
    }

    /// Drain all pending notifications on the calling thread.
    pub(crate) fn flush_notifications(&self) {
        let passes = self.config.max_recursion_depth;
        for _ in 0..passes {
            let ids: Vec<ListenerId> = self.notifier.pending.lock().keys().copied().collect();
            if ids.is_empty() {
                return;
            }
            let mut progressed = false;
            for id in ids {
                if self.fire_listener(id) {
                    progressed = true;
                }
            }
            if !progressed {
                return;
            }
        }
        let left = self.notifier.pending_count();
        if left > 0 {
            warn!("[notifier] {} listeners still pending after {} passes", left, passes);
        }
    }
}

/// Start the notifier thread.
pub(crate) fn start_notifier(repo: Weak<DataRepository>) -> DataResult<WorkerHandle> {
    WorkerHandle::spawn("notifier", move |shutdown| {
        while !shutdown.load(Ordering::Acquire) {
            let Some(repo) = repo.upgrade() else { break };
            let next = {
                let mut pending = repo.notifier.pending.lock();
                if pending.is_empty() {
                    repo.notifier.wake.wait_for(&mut pending, POLL);
                }
                pending.keys().next().copied()
            };
            if let Some(id) = next {
                repo.fire_listener(id);
                thread::yield_now();
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::listener::DataListener;
    use crate::value::Value;
    use std::sync::Arc;

    #[derive(Default)]
    struct Recorder {
        batches: Mutex<Vec<Vec<String>>>,
    }

    impl DataListener for Recorder {
        fn data_values_changed(&self, events: &[DataEvent]) {
            self.batches.lock().push(events.iter().map(|e| e.name.clone()).collect());
        }
    }

    fn repo() -> Arc<DataRepository> {
        DataRepository::new(Config::testing()).unwrap()
    }

    #[test]
    fn test_batches_names_in_touch_order() {
        let repo = repo();
        let rec = Arc::new(Recorder::default());
        let id = repo.register_listener(rec.clone());
        for n in ["/p/B", "/p/A", "/p/C"] {
            repo.add_data_listener(n, id);
        }
        rec.batches.lock().clear();

        repo.put("/p/C", Value::number(1.0));
        repo.put("/p/A", Value::number(2.0));
        repo.put("/p/C", Value::number(3.0));
        repo.flush_notifications();

        let batches = rec.batches.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0], vec!["/p/C".to_string(), "/p/A".to_string()]);
    }

    #[test]
    fn test_initial_event_on_subscribe() {
        let repo = repo();
        repo.put("/p/A", Value::number(1.0));
        let rec = Arc::new(Recorder::default());
        let id = repo.register_listener(rec.clone());
        repo.add_data_listener("/p/A", id);
        assert_eq!(rec.batches.lock().as_slice(), &[vec!["/p/A".to_string()]]);
    }

    struct Echo {
        repo: Weak<DataRepository>,
    }

    impl DataListener for Echo {
        fn data_values_changed(&self, events: &[DataEvent]) {
            let Some(repo) = self.repo.upgrade() else { return };
            for e in events {
                let next = e.value.as_ref().and_then(Value::as_number).unwrap_or(0.0) + 1.0;
                repo.put(&e.name, Value::number(next));
                repo.flush_notifications();
            }
        }
    }

    #[test]
    fn test_self_triggering_listener_is_aborted() {
        let repo = repo();
        let id = repo.register_listener(Arc::new(Echo { repo: Arc::downgrade(&repo) }));
        repo.add_data_listener("/loop", id);
        repo.put("/loop", Value::number(1.0));
        repo.flush_notifications();

        assert!(repo.stats().notify_recursion_aborts >= 1);
        assert_eq!(repo.notifier.pending_count(), 0);
    }

    #[test]
    fn test_forget_drops_pending() {
        let repo = repo();
        let rec = Arc::new(Recorder::default());
        let id = repo.register_listener(rec.clone());
        repo.add_data_listener("/x", id);
        rec.batches.lock().clear();

        repo.put("/x", Value::number(1.0));
        assert_eq!(repo.notifier.pending_count(), 1);
        repo.notifier.forget_name(id, "/x");
        assert_eq!(repo.notifier.pending_count(), 0);
        repo.flush_notifications();
        assert!(rec.batches.lock().is_empty());
    }
}
