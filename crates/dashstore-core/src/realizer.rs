//! Background realization of deferred cells
//!
//! Cells loaded from datafiles hold their expression text until first read.
//! The realizer compiles them ahead of time at low priority so the first
//! reader does not pay for it.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Weak;

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::error::DataResult;
use crate::repository::DataRepository;
use crate::worker::{sleep_unless_shutdown, WorkerHandle, POLL};

/// Names waiting to be realized.
pub(crate) struct RealizeQueue {
    names: Mutex<VecDeque<String>>,
    ready: Condvar,
}

impl RealizeQueue {
    pub fn new() -> Self {
        Self { names: Mutex::new(VecDeque::new()), ready: Condvar::new() }
    }

    pub fn enqueue(&self, name: &str) {
        self.names.lock().push_back(name.to_string());
        self.ready.notify_one();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.names.lock().len()
    }

    fn pop(&self) -> Option<String> {
        let mut names = self.names.lock();
        if names.is_empty() {
            self.ready.wait_for(&mut names, POLL);
        }
        names.pop_front()
    }

    fn drain(&self) -> Vec<String> {
        self.names.lock().drain(..).collect()
    }
}

impl DataRepository {
    /// Realize every queued cell on the calling thread.
    pub fn realize_deferred(&self) -> usize {
        let names = self.realizer.drain();
        for name in &names {
            self.realize(name);
        }
        names.len()
    }
}

/// Start the realizer thread.
pub(crate) fn start_realizer(repo: Weak<DataRepository>) -> DataResult<WorkerHandle> {
    WorkerHandle::spawn("realizer", move |shutdown| {
        while !shutdown.load(Ordering::Acquire) {
            let (name, delay) = {
                let Some(repo) = repo.upgrade() else { break };
                (repo.realizer.pop(), repo.config.realizer_delay)
            };
            let Some(name) = name else { continue };
            if sleep_unless_shutdown(delay, &shutdown) {
                break;
            }
            let Some(repo) = repo.upgrade() else { break };
            trace!("[realizer] realizing {}", name);
            repo.realize(&name);
        }
    })
}
