//! Freezing and thawing
//!
//! A [`FrozenSet`] ties a boolean flag cell to the cells under a prefix whose
//! names match a pattern. While the flag is true those cells hold read-only
//! snapshots; when it turns false they get their former values back.
//!
//! Requests go through two sorted queues drained by one worker, and only
//! while the repository is consistent (no datafile open or close in flight).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};
use regex::Regex;
use tracing::{debug, info, warn};

use crate::error::{DataError, DataResult};
use crate::listener::{DataEvent, DataListener, ListenerId, RepositoryListener};
use crate::names::{create_data_name, PathKey};
use crate::repository::DataRepository;
use crate::stored::{Former, FrozenValue, StoredValue};
use crate::value::Value;
use crate::worker::{WorkerHandle, POLL};

/// Where a frozen set stands relative to its flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreezeState {
    /// The flag has not been observed yet
    Grandfathered,
    Frozen,
    Thawed,
}

#[derive(Default)]
struct Work {
    freeze: BTreeMap<PathKey, String>,
    thaw: BTreeMap<PathKey, String>,
}

/// Pending freeze/thaw work plus cell ownership.
pub(crate) struct FreezeQueues {
    work: Mutex<Work>,
    ready: Condvar,
    /// Frozen cell name -> flag that froze it
    owners: Mutex<HashMap<String, String>>,
    sets: Mutex<Vec<Arc<FrozenSet>>>,
}

impl FreezeQueues {
    pub fn new() -> Self {
        Self {
            work: Mutex::new(Work::default()),
            ready: Condvar::new(),
            owners: Mutex::new(HashMap::new()),
            sets: Mutex::new(Vec::new()),
        }
    }

    /// The latest request for a name wins over an older opposite one.
    fn enqueue(&self, names: impl IntoIterator<Item = String>, flag: &str, freeze: bool) {
        let mut work = self.work.lock();
        for name in names {
            let key = PathKey(name);
            if freeze {
                work.thaw.remove(&key);
                work.freeze.insert(key, flag.to_string());
            } else {
                work.freeze.remove(&key);
                work.thaw.insert(key, flag.to_string());
            }
        }
        drop(work);
        self.ready.notify_one();
    }

    fn next(&self) -> Option<(bool, String, String)> {
        let mut work = self.work.lock();
        if let Some((name, flag)) = work.freeze.pop_first() {
            return Some((true, name.0, flag));
        }
        work.thaw.pop_first().map(|(name, flag)| (false, name.0, flag))
    }

    pub fn pending(&self) -> usize {
        let work = self.work.lock();
        work.freeze.len() + work.thaw.len()
    }

    fn wait_for_work(&self) {
        let mut work = self.work.lock();
        if work.freeze.is_empty() && work.thaw.is_empty() {
            self.ready.wait_for(&mut work, POLL);
        }
    }
}

/// A freeze flag and the cells it governs.
pub struct FrozenSet {
    flag: String,
    prefix: String,
    pattern: Regex,
    id: ListenerId,
    state: Mutex<FreezeState>,
    tracked: Mutex<BTreeSet<PathKey>>,
    repo: Weak<DataRepository>,
}

impl std::fmt::Debug for FrozenSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrozenSet")
            .field("flag", &self.flag)
            .field("pattern", &self.pattern.as_str())
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl FrozenSet {
    pub fn flag(&self) -> &str {
        &self.flag
    }

    pub fn state(&self) -> FreezeState {
        *self.state.lock()
    }

    /// Tracked cell names in path order.
    pub fn tracked(&self) -> Vec<String> {
        self.tracked.lock().iter().map(|k| k.0.clone()).collect()
    }

    fn matches(&self, name: &str) -> bool {
        name.len() > self.prefix.len()
            && name.starts_with(&self.prefix)
            && name.as_bytes()[self.prefix.len()] == b'/'
            && name != self.flag
            && self.pattern.is_match(name)
    }

    fn flag_changed(&self, raised: bool) {
        let action = {
            let mut state = self.state.lock();
            let (next, action) = match (*state, raised) {
                (FreezeState::Frozen, true) | (FreezeState::Thawed, false) => (*state, None),
                (FreezeState::Grandfathered, false) => (FreezeState::Thawed, None),
                (FreezeState::Grandfathered, true) | (FreezeState::Thawed, true) => {
                    (FreezeState::Frozen, Some(true))
                }
                (FreezeState::Frozen, false) => (FreezeState::Thawed, Some(false)),
            };
            if next != *state {
                debug!("[freezer] {} {:?} -> {:?}", self.flag, *state, next);
            }
            *state = next;
            action
        };
        let Some(freeze) = action else { return };
        let Some(repo) = self.repo.upgrade() else { return };
        repo.freezer.enqueue(self.tracked(), &self.flag, freeze);
    }

    fn item_added(&self, name: &str) {
        let Some(repo) = self.repo.upgrade() else { return };
        let looks_frozen = repo.peek_value(name).is_some_and(|v| v.is_frozen());
        let mut state = self.state.lock();
        match *state {
            FreezeState::Frozen if !looks_frozen => {
                drop(state);
                repo.freezer.enqueue([name.to_string()], &self.flag, true);
            }
            FreezeState::Grandfathered if looks_frozen => {
                debug!("[freezer] {} found frozen; treating {} as raised", name, self.flag);
                *state = FreezeState::Frozen;
            }
            _ => {}
        }
    }
}

impl DataListener for FrozenSet {
    fn data_values_changed(&self, events: &[DataEvent]) {
        for event in events.iter().filter(|e| e.name == self.flag) {
            self.flag_changed(event.value.as_ref().is_some_and(Value::test));
        }
    }
}

impl RepositoryListener for FrozenSet {
    fn data_added(&self, name: &str) {
        if self.matches(name) {
            self.tracked.lock().insert(PathKey(name.to_string()));
            self.item_added(name);
        }
    }

    fn data_removed(&self, name: &str, _old_value: Option<&Value>) {
        self.tracked.lock().remove(&PathKey(name.to_string()));
    }
}

impl DataRepository {
    /// Watch `flag` (relative to `prefix`) and freeze the cells under
    /// `prefix` whose full names match `pattern` while it is true.
    pub fn add_frozen_set(&self, flag: &str, prefix: &str, pattern: &str) -> DataResult<Arc<FrozenSet>> {
        let pattern = Regex::new(pattern).map_err(|e| DataError::InvalidConfig(format!("freeze pattern: {}", e)))?;
        let prefix = prefix.trim_end_matches('/').to_string();
        let flag = create_data_name(Some(&prefix), flag);
        let id = self.listeners.allocate();
        let set = Arc::new(FrozenSet {
            flag: flag.clone(),
            prefix: prefix.clone(),
            pattern,
            id,
            state: Mutex::new(FreezeState::Grandfathered),
            tracked: Mutex::new(BTreeSet::new()),
            repo: self.weak(),
        });
        self.listeners.insert(id, Arc::clone(&set) as Arc<dyn DataListener>, None);
        self.freezer.sets.lock().push(Arc::clone(&set));

        self.add_repository_listener(Arc::clone(&set) as Arc<dyn RepositoryListener>, &prefix);
        self.add_data_listener(&flag, id);
        info!("[freezer] watching {} ({} cells)", flag, set.tracked.lock().len());
        Ok(set)
    }

    /// Stop watching a freeze flag. Cells stay as they are.
    pub fn remove_frozen_set(&self, set: &Arc<FrozenSet>) {
        let as_repo_listener = Arc::clone(set) as Arc<dyn RepositoryListener>;
        self.remove_repository_listener(&as_repo_listener);
        self.delete_data_listener(set.id);
        self.freezer.sets.lock().retain(|s| !Arc::ptr_eq(s, set));
    }

    /// Run queued freeze/thaw work on the calling thread. Does nothing while
    /// the repository is inconsistent.
    pub fn drain_freeze_queues(&self) -> usize {
        let mut done = 0;
        while self.consistency.is_consistent() {
            let Some((freeze, name, flag)) = self.freezer.next() else { break };
            if freeze {
                self.freeze_cell(&name, &flag);
            } else {
                self.thaw_cell(&name, &flag);
            }
            done += 1;
        }
        done
    }

    pub fn pending_freeze_work(&self) -> usize {
        self.freezer.pending()
    }

    /// Snapshot one cell. Already-frozen cells are left alone.
    pub fn freeze_cell(&self, name: &str, flag: &str) {
        self.flush_notifications();
        let Some(stored) = self.get_value(name) else { return };
        if stored.is_frozen() {
            return;
        }
        if let StoredValue::Malformed(_) = stored {
            warn!("[freezer] not freezing malformed value {}", name);
            return;
        }
        {
            let mut owners = self.freezer.owners.lock();
            if let Some(owner) = owners.get(name) {
                if owner != flag {
                    warn!("[freezer] {} is already frozen by {}; not freezing it for {}", name, owner, flag);
                    return;
                }
            }
            owners.insert(name.to_string(), flag.to_string());
        }

        let current = self.simple_value_of(&stored);
        let former = match self.default_text(name) {
            Some(default) if default == stored.datafile_text() => Former::Default,
            _ => Former::Saved { text: stored.save_string(), editable: stored.is_editable() },
        };
        debug!("[freezer] freezing {}", name);
        self.put_value(name, Some(StoredValue::Frozen(FrozenValue::new(current, former))));
    }

    /// Restore one cell's former value. Cells that are not frozen are left alone.
    pub fn thaw_cell(&self, name: &str, flag: &str) {
        self.flush_notifications();
        let Some(StoredValue::Frozen(frozen)) = self.get_value(name) else { return };
        {
            let mut owners = self.freezer.owners.lock();
            match owners.get(name) {
                Some(owner) if owner != flag => {
                    debug!("[freezer] {} belongs to {}; not thawing it for {}", name, owner, flag);
                    return;
                }
                _ => {
                    owners.remove(name);
                }
            }
        }

        debug!("[freezer] thawing {}", name);
        match frozen.former {
            Former::Default => self.restore_default_value(name),
            Former::Saved { text, editable } => {
                let prefix = self.prefix_for(name);
                let value = self.stored_from_text(name, &text, &prefix).map(|v| match v {
                    StoredValue::Simple(simple) => StoredValue::Simple(simple.with_editable(editable)),
                    other => other,
                });
                self.put_value(name, value);
            }
        }
    }
}

/// Start the freeze/thaw worker.
pub(crate) fn start_freezer(repo: Weak<DataRepository>) -> DataResult<WorkerHandle> {
    WorkerHandle::spawn("freezer", move |shutdown| {
        while !shutdown.load(Ordering::Acquire) {
            let Some(repo) = repo.upgrade() else { break };
            repo.freezer.wait_for_work();
            if repo.freezer.pending() == 0 {
                continue;
            }
            if !repo.consistency.wait(POLL) {
                continue;
            }
            let done = repo.drain_freeze_queues();
            if done > 0 {
                debug!("[freezer] processed {} requests", done);
            }
        }
    })
}
