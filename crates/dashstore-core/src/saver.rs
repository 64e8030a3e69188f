//! Background saver: periodic flush of dirty datafiles to disk
//!
//! The saver wakes every `save_interval` and saves each datafile whose
//! dirty counter is non-zero. Writes between saves stay in memory; a
//! datafile that passes `max_dirty` modifications is saved immediately by
//! the writer instead (see `DataRepository::datafile_modified`).
//!
//! A failed save leaves its datafile dirty, so the next cycle retries it.

use std::sync::atomic::Ordering;
use std::sync::Weak;
use std::time::Duration;

use tracing::debug;

use crate::error::DataResult;
use crate::repository::DataRepository;
use crate::worker::{sleep_unless_shutdown, WorkerHandle};

impl DataRepository {
    /// One saver cycle: save dirty datafiles and count the cycle.
    pub fn run_save_cycle(&self) -> usize {
        let written = self.save_all_datafiles();
        self.stats.save_cycles.fetch_add(1, Ordering::Relaxed);
        if written > 0 {
            debug!("[saver] cycle wrote {} datafiles", written);
        }
        written
    }
}

/// Start the saver thread. On shutdown it runs one final cycle if the
/// repository is still alive.
pub(crate) fn start_saver(repo: Weak<DataRepository>, interval: Duration) -> DataResult<WorkerHandle> {
    WorkerHandle::spawn("saver", move |shutdown| loop {
        if sleep_unless_shutdown(interval, &shutdown) {
            if let Some(repo) = repo.upgrade() {
                repo.run_save_cycle();
            }
            return;
        }
        let Some(repo) = repo.upgrade() else { return };
        repo.run_save_cycle();
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::value::Value;
    use std::fs;
    use std::thread;
    use tempfile::TempDir;

    #[test]
    fn test_cycle_counts_even_when_clean() {
        let repo = DataRepository::new(Config::testing()).unwrap();
        assert_eq!(repo.run_save_cycle(), 0);
        assert_eq!(repo.run_save_cycle(), 0);
        assert_eq!(repo.stats().save_cycles, 2);
    }

    #[test]
    fn test_saver_thread_writes_dirty_datafile() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("p.dat");
        fs::write(&path, "A=1\n").unwrap();

        let repo = DataRepository::new(Config::testing()).unwrap();
        repo.open_datafile("/p", &path).unwrap();
        let handle = start_saver(repo.weak(), Duration::from_millis(50)).unwrap();
        assert!(handle.is_running());

        repo.put("/p/A", Value::number(2.0));
        thread::sleep(Duration::from_millis(300));

        assert!(repo.stats().save_cycles >= 1);
        assert_eq!(fs::read_to_string(&path).unwrap(), "A=2\n");
        handle.shutdown();
    }

    #[test]
    fn test_final_cycle_on_shutdown() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("p.dat");
        fs::write(&path, "A=1\n").unwrap();

        let repo = DataRepository::new(Config::testing()).unwrap();
        repo.open_datafile("/p", &path).unwrap();
        let handle = start_saver(repo.weak(), Duration::from_secs(3600)).unwrap();
        repo.put("/p/A", Value::number(3.0));
        handle.shutdown();

        assert_eq!(repo.stats().save_cycles, 1);
        assert_eq!(fs::read_to_string(&path).unwrap(), "A=3\n");
    }
}
