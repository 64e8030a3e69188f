//! Data consistency gate
//!
//! Opening or closing a datafile mounts or unmounts many cells at once.
//! While any such operation is in flight the repository is "inconsistent",
//! and work that must see a whole datafile (freezing, observers) waits.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

pub type ConsistencyObserver = Box<dyn FnOnce() + Send>;

pub(crate) struct Consistency {
    depth: Mutex<usize>,
    settled: Condvar,
    observers: Mutex<Vec<ConsistencyObserver>>,
}

impl Consistency {
    pub fn new() -> Self {
        Self { depth: Mutex::new(0), settled: Condvar::new(), observers: Mutex::new(Vec::new()) }
    }

    pub fn begin(&self) {
        *self.depth.lock() += 1;
    }

    /// Leave one inconsistent section. Returns the observers to run when
    /// this brought the depth back to zero.
    pub fn end(&self) -> Vec<ConsistencyObserver> {
        let mut depth = self.depth.lock();
        *depth = depth.saturating_sub(1);
        if *depth > 0 {
            return Vec::new();
        }
        self.settled.notify_all();
        drop(depth);
        std::mem::take(&mut *self.observers.lock())
    }

    pub fn is_consistent(&self) -> bool {
        *self.depth.lock() == 0
    }

    /// Queue `observer` for the next return to consistency, or hand it back
    /// if the data is consistent right now.
    pub fn add_observer(&self, observer: ConsistencyObserver) -> Option<ConsistencyObserver> {
        let depth = self.depth.lock();
        if *depth == 0 {
            return Some(observer);
        }
        self.observers.lock().push(observer);
        None
    }

    /// Block until consistent or until `timeout` passes.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut depth = self.depth.lock();
        while *depth > 0 {
            if self.settled.wait_until(&mut depth, deadline).timed_out() {
                return *depth == 0;
            }
        }
        true
    }
}

/// Holds the repository inconsistent until dropped.
pub(crate) struct InconsistentSection<'a> {
    repo: &'a crate::repository::DataRepository,
}

impl<'a> InconsistentSection<'a> {
    pub fn enter(repo: &'a crate::repository::DataRepository) -> Self {
        repo.consistency.begin();
        Self { repo }
    }
}

impl Drop for InconsistentSection<'_> {
    fn drop(&mut self) {
        self.repo.end_inconsistency();
    }
}
