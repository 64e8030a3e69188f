//! Configuration management for the repository
//!
//! Provides presets for the common deployment shapes and a `validate()`
//! check for custom configurations.

use std::path::PathBuf;
use std::time::Duration;

/// Repository configuration with usage presets
#[derive(Debug, Clone)]
pub struct Config {
    /// Background saver cadence for dirty datafiles
    pub save_interval: Duration,
    /// A datafile is saved immediately once its dirty counter exceeds this
    pub max_dirty: u32,
    /// Ceiling on nested `put` calls before the write chain is abandoned
    pub max_recursion_depth: usize,
    /// Attempts at a compiled-function recalculation when changes arrive mid-flight
    pub max_recalc_retries: u32,
    /// Deliver notifications on the writing thread instead of the notifier thread
    pub synchronous_notify: bool,
    /// How long a thread waits for another thread's in-progress listener delivery
    pub listener_wait: Duration,
    /// Pause before the realizer thread realizes each deferred cell
    pub realizer_delay: Duration,
    /// Attempts at reading a datafile before `open_datafile` gives up
    pub open_retries: u32,
    /// Pause between datafile open attempts
    pub open_retry_delay: Duration,
    /// Directories searched for `#include <name>` files
    pub template_dirs: Vec<PathBuf>,
}

impl Config {
    /// Interactive dashboard: background notifier, saves every two minutes.
    pub fn dashboard() -> Self {
        Self {
            save_interval: Duration::from_secs(120),
            max_dirty: 10,
            max_recursion_depth: 100,
            max_recalc_retries: 10,
            synchronous_notify: false,
            listener_wait: Duration::from_secs(2),
            realizer_delay: Duration::from_millis(100),
            open_retries: 10,
            open_retry_delay: Duration::from_millis(250),
            template_dirs: Vec::new(),
        }
    }

    /// Headless batch use: notifications settle before each write returns.
    pub fn headless() -> Self {
        Self {
            save_interval: Duration::from_secs(30),
            max_dirty: 50,
            max_recursion_depth: 100,
            max_recalc_retries: 10,
            synchronous_notify: true,
            listener_wait: Duration::from_secs(2),
            realizer_delay: Duration::ZERO,
            open_retries: 10,
            open_retry_delay: Duration::from_millis(250),
            template_dirs: Vec::new(),
        }
    }

    /// Fast cadences for tests.
    pub fn testing() -> Self {
        Self {
            save_interval: Duration::from_millis(50),
            max_dirty: 10,
            max_recursion_depth: 100,
            max_recalc_retries: 10,
            synchronous_notify: false,
            listener_wait: Duration::from_millis(200),
            realizer_delay: Duration::ZERO,
            open_retries: 1,
            open_retry_delay: Duration::from_millis(10),
            template_dirs: Vec::new(),
        }
    }

    /// Add a template search directory (builder style).
    pub fn with_template_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.template_dirs.push(dir.into());
        self
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.save_interval.as_millis() == 0 {
            return Err("save_interval must be > 0".into());
        }
        if self.max_dirty == 0 {
            return Err("max_dirty must be > 0".into());
        }
        if self.max_recursion_depth == 0 || self.max_recursion_depth > 10_000 {
            return Err("max_recursion_depth must be in [1, 10000]".into());
        }
        if self.max_recalc_retries == 0 {
            return Err("max_recalc_retries must be > 0".into());
        }
        if self.listener_wait.as_millis() == 0 {
            return Err("listener_wait must be > 0".into());
        }
        if self.open_retries == 0 {
            return Err("open_retries must be > 0".into());
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self { Self::dashboard() }
}
