//! Background worker threads
//!
//! Each engine (notifier, realizer, freezer, saver) runs one named thread
//! holding only a weak reference to the repository. Threads poll a shared
//! shutdown flag between waits of at most [`POLL`], so a dropped handle
//! always gets its thread back promptly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::error::{DataError, DataResult};

/// Longest a worker sleeps before re-checking its shutdown flag.
pub(crate) const POLL: Duration = Duration::from_millis(100);

/// Handle to a running background thread.
/// Dropping this handle signals the thread to stop and joins it.
pub struct WorkerHandle {
    name: &'static str,
    shutdown: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    /// Spawn `body` on a named thread. The body receives the shutdown flag
    /// and must return soon after it becomes true.
    pub(crate) fn spawn<F>(name: &'static str, body: F) -> DataResult<Self>
    where
        F: FnOnce(Arc<AtomicBool>) + Send + 'static,
    {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let thread = thread::Builder::new()
            .name(format!("dashstore-{}", name))
            .spawn(move || body(flag))
            .map_err(|e| DataError::Io {
                path: None,
                kind: e.kind(),
                message: format!("Failed to spawn {} thread: {}", name, e),
            })?;
        Ok(Self { name, shutdown, thread: Some(thread) })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Ask the thread to stop without waiting for it.
    pub fn signal(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    /// Request shutdown and wait for the thread to finish.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    /// Check if the thread is still running.
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().map_or(false, |h| !h.is_finished())
    }

    fn stop_and_join(&mut self) {
        self.signal();
        if let Some(handle) = self.thread.take() {
            // the last repository reference can be released on the worker
            // itself; joining there would wait forever
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

/// Sleep for `total`, waking every [`POLL`] to check `shutdown`.
/// Returns `true` if shutdown was requested.
pub(crate) fn sleep_unless_shutdown(total: Duration, shutdown: &AtomicBool) -> bool {
    let deadline = std::time::Instant::now() + total;
    loop {
        if shutdown.load(Ordering::Acquire) {
            return true;
        }
        let now = std::time::Instant::now();
        if now >= deadline {
            return false;
        }
        thread::sleep((deadline - now).min(POLL));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_worker_start_shutdown() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let t = Arc::clone(&ticks);
        let handle = WorkerHandle::spawn("test", move |shutdown| {
            while !sleep_unless_shutdown(Duration::from_millis(10), &shutdown) {
                t.fetch_add(1, Ordering::Relaxed);
            }
        })
        .unwrap();
        assert!(handle.is_running());
        assert_eq!(handle.name(), "test");

        thread::sleep(Duration::from_millis(100));
        handle.shutdown();
        assert!(ticks.load(Ordering::Relaxed) >= 1);
    }

    #[test]
    fn test_drop_joins_thread() {
        let done = Arc::new(AtomicBool::new(false));
        let d = Arc::clone(&done);
        {
            let _handle = WorkerHandle::spawn("drop", move |shutdown| {
                while !sleep_unless_shutdown(Duration::from_secs(60), &shutdown) {}
                d.store(true, Ordering::Release);
            })
            .unwrap();
        }
        assert!(done.load(Ordering::Acquire));
    }

    #[test]
    fn test_sleep_returns_early_on_shutdown() {
        let flag = AtomicBool::new(true);
        let start = std::time::Instant::now();
        assert!(sleep_unless_shutdown(Duration::from_secs(10), &flag));
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
