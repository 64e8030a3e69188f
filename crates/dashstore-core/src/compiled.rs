//! Calculated cells
//!
//! A [`CompiledFunction`] owns a script and listens to every name the script
//! read on its last run. A change to any of them marks the function dirty;
//! the next read recalculates. Each run re-derives the watch set, so the
//! dependency graph follows whatever branch the script actually took.

use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::listener::{DataEvent, DataListener, ListenerId};
use crate::repository::DataRepository;
use crate::script::{EvalContext, Script};
use crate::value::Value;

thread_local! {
    /// Functions being calculated on this thread, by address.
    static CURRENTLY_CALCULATING: RefCell<HashSet<usize>> = RefCell::new(HashSet::new());
}

/// Outcome of a recalculation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recalc {
    Updated,
    Unchanged,
    /// The function was already being calculated further up this thread's stack
    Circular,
    Disposed,
}

struct CalcState {
    value: Option<Value>,
    /// Change notifications received since the last settled calculation
    unhandled_changes: u32,
}

/// A cell value computed by a script over other cells.
pub struct CompiledFunction {
    name: String,
    prefix: String,
    script: Script,
    repo: Weak<DataRepository>,
    id: ListenerId,
    calc: Mutex<CalcState>,
    /// Held for a whole recalculation so runs on different threads don't interleave
    recalc_lock: Mutex<()>,
    subscriptions: Mutex<HashSet<String>>,
    disposed: AtomicBool,
}

impl fmt::Debug for CompiledFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledFunction")
            .field("name", &self.name)
            .field("script", &self.script.save_string())
            .finish()
    }
}

impl CompiledFunction {
    /// Build the function for `name` and register it as the active listener
    /// computing that name.
    pub(crate) fn create(repo: &DataRepository, name: &str, script: Script, prefix: &str) -> Arc<Self> {
        let id = repo.listeners.allocate();
        let function = Arc::new(Self {
            name: name.to_string(),
            prefix: prefix.to_string(),
            script,
            repo: repo.weak(),
            id,
            calc: Mutex::new(CalcState { value: None, unhandled_changes: 1 }),
            recalc_lock: Mutex::new(()),
            subscriptions: Mutex::new(HashSet::new()),
            disposed: AtomicBool::new(false),
        });
        repo.listeners.insert(id, Arc::clone(&function) as Arc<dyn DataListener>, Some(name.to_string()));
        function
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn listener_id(&self) -> ListenerId {
        self.id
    }

    pub fn save_string(&self) -> &str {
        self.script.save_string()
    }

    pub fn is_dirty(&self) -> bool {
        self.calc.lock().unhandled_changes > 0
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Names the function currently listens to.
    pub fn subscriptions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.subscriptions.lock().iter().cloned().collect();
        names.sort();
        names
    }

    /// The calculated value, recalculating first if anything changed.
    pub fn simple_value(&self) -> Option<Value> {
        if !self.is_disposed() && self.is_dirty() {
            self.recalc();
        }
        self.calc.lock().value.clone()
    }

    /// Run the script until it settles.
    ///
    /// A run is accepted only if no change notification arrived while it
    /// was executing; otherwise it is repeated, up to the configured retry
    /// count.
    pub fn recalc(&self) -> Recalc {
        if self.is_disposed() {
            return Recalc::Disposed;
        }
        let Some(repo) = self.repo.upgrade() else {
            return Recalc::Disposed;
        };

        let key = self as *const Self as usize;
        let entered = CURRENTLY_CALCULATING.with(|c| c.borrow_mut().insert(key));
        if !entered {
            warn!("[compiled] Encountered recursively defined data when calculating {} - ABORTING", self.name);
            repo.stats.recursion_aborts.fetch_add(1, Ordering::Relaxed);
            return Recalc::Circular;
        }
        let _guard = CalcGuard(key);

        // bounded, since two threads can each hold one half of a dependency cycle
        let Some(_running) = self.recalc_lock.try_lock_for(repo.config.listener_wait) else {
            debug!("[compiled] {} is being calculated elsewhere; keeping current value", self.name);
            return Recalc::Unchanged;
        };

        let previous = self.calc.lock().value.clone();
        let mut retries = repo.config.max_recalc_retries;
        let settled = loop {
            let seen = self.calc.lock().unhandled_changes;
            let value = self.evaluate(&repo);
            retries = retries.saturating_sub(1);

            let mut calc = self.calc.lock();
            if calc.unhandled_changes == seen {
                calc.value = value;
                calc.unhandled_changes = 0;
                break true;
            }
            if retries == 0 {
                calc.value = value;
                calc.unhandled_changes = calc.unhandled_changes.saturating_sub(seen);
                break false;
            }
            trace!("[compiled] retrying calculation of {}", self.name);
        };
        if !settled {
            warn!("[compiled] Ran out of retries while calculating {}", self.name);
        }

        let current = self.calc.lock().value.clone();
        if current == previous {
            Recalc::Unchanged
        } else {
            Recalc::Updated
        }
    }

    fn evaluate(&self, repo: &DataRepository) -> Option<Value> {
        let known = self.subscriptions.lock().clone();
        let mut context = SubscribingContext {
            repo,
            prefix: &self.prefix,
            known,
            touched: HashSet::new(),
            missing: Vec::new(),
        };
        let result = self.script.run(&mut context);
        let SubscribingContext { known, touched, missing, .. } = context;

        for name in missing {
            if self.is_disposed() {
                break;
            }
            if self.subscriptions.lock().insert(name.clone()) {
                repo.add_data_listener_quietly(&name, self.id);
            }
        }
        let stale: Vec<String> = known.into_iter().filter(|n| !touched.contains(n)).collect();
        for name in stale {
            if self.subscriptions.lock().remove(&name) {
                debug!("[compiled] {} no longer depends on {}", self.name, name);
                repo.remove_data_listener(&name, self.id);
            }
        }

        match result {
            Ok(value) => value.map(|v| v.with_editable(false)),
            Err(e) => {
                warn!("[compiled] Error executing {}: {}", self.name, e);
                repo.stats.evaluation_failures.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn set_dirty(&self) {
        if self.is_disposed() {
            return;
        }
        let became_dirty = {
            let mut calc = self.calc.lock();
            calc.unhandled_changes += 1;
            calc.unhandled_changes == 1
        };
        // downstream listeners were already told when this went dirty
        if became_dirty {
            if let Some(repo) = self.repo.upgrade() {
                repo.data_changed(&self.name);
            }
        }
    }

    /// Unsubscribe from everything and retire the listener id.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(repo) = self.repo.upgrade() else { return };
        let names: Vec<String> = self.subscriptions.lock().drain().collect();
        for name in names {
            repo.remove_data_listener(&name, self.id);
        }
        repo.notifier.forget(self.id);
        repo.listeners.unregister(self.id);
    }
}

impl DataListener for CompiledFunction {
    fn data_values_changed(&self, _events: &[DataEvent]) {
        self.set_dirty();
    }
}

struct CalcGuard(usize);

impl Drop for CalcGuard {
    fn drop(&mut self) {
        CURRENTLY_CALCULATING.with(|c| {
            c.borrow_mut().remove(&self.0);
        });
    }
}

/// Evaluation context that records which names a run reads.
struct SubscribingContext<'a> {
    repo: &'a DataRepository,
    prefix: &'a str,
    /// Names subscribed before this run
    known: HashSet<String>,
    touched: HashSet<String>,
    /// Names read this run that were not subscribed yet
    missing: Vec<String>,
}

impl EvalContext for SubscribingContext<'_> {
    fn prefix(&self) -> &str {
        self.prefix
    }

    fn get(&mut self, name: &str) -> Option<Value> {
        if self.touched.insert(name.to_string()) && !self.known.contains(name) {
            self.missing.push(name.to_string());
        }
        self.repo.get(name)
    }
}
