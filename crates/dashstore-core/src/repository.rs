//! The repository: named cells, their listeners, and the engines around them.
//!
//! DataRepository owns the name -> cell table and ties together the
//! notifier, the realizer, the freeze engine, datafile persistence and the
//! background saver.
//!
//! **Read path**: table read lock, then the cell's own lock; deferred values
//! are realized in place on first read.
//! **Write path**: replace the cell value, mark the owning datafile dirty,
//! queue notifications, drop the cell if nothing needs it anymore.
//! **Lock order**: table before cell. Scripts and listener callbacks never
//! run with either lock held.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use hashbrown::hash_map::Entry;
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{error, info, warn};

use crate::compiled::CompiledFunction;
use crate::config::Config;
use crate::consistency::{Consistency, ConsistencyObserver};
use crate::datafile::{canonical_text, Datafile, ValueMap};
use crate::error::{DataError, DataResult};
use crate::freeze::{start_freezer, FreezeQueues};
use crate::listener::{DataListener, ListenerId, ListenerRegistry, RepositoryListener};
use crate::names::{compare_paths, last_segment, parent, ANONYMOUS_PREFIX};
use crate::notify::{start_notifier, Notifier};
use crate::persistence::PathIds;
use crate::realizer::{start_realizer, RealizeQueue};
use crate::saver::start_saver;
use crate::script;
use crate::stored::{parse_text, ParsedText, StoredValue, ERROR_DISPLAY};
use crate::value::{Value, NULL_LITERAL};
use crate::worker::WorkerHandle;

/// Base name used by [`DataRepository::make_unique_name`] when none is given.
pub const INTERNAL_NAME_BASE: &str = "///Internal_Name";

/// A named value slot.
pub(crate) struct Cell {
    pub(crate) state: Mutex<CellState>,
}

pub(crate) struct CellState {
    pub(crate) value: Option<StoredValue>,
    pub(crate) datafile: Option<Arc<Datafile>>,
    /// `None`: nobody ever listened. `Some(empty)`: everybody left.
    pub(crate) listeners: Option<Vec<ListenerId>>,
}

impl Cell {
    fn new(value: Option<StoredValue>, datafile: Option<Arc<Datafile>>) -> Arc<Self> {
        Arc::new(Self { state: Mutex::new(CellState { value, datafile, listeners: None }) })
    }
}

/// Failure and activity counters (atomic, relaxed).
#[derive(Default)]
pub(crate) struct StatCounters {
    pub circular_aborts: AtomicU64,
    pub recursion_aborts: AtomicU64,
    pub notify_recursion_aborts: AtomicU64,
    pub evaluation_failures: AtomicU64,
    pub malformed_values: AtomicU64,
    pub datafile_saves: AtomicU64,
    pub save_failures: AtomicU64,
    pub save_cycles: AtomicU64,
}

/// Snapshot of repository counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepositoryStats {
    /// Write chains abandoned at the recursion ceiling
    pub circular_aborts: u64,
    /// Calculations that found themselves already in progress
    pub recursion_aborts: u64,
    /// Listeners re-notified during their own delivery
    pub notify_recursion_aborts: u64,
    pub evaluation_failures: u64,
    pub malformed_values: u64,
    pub datafile_saves: u64,
    pub save_failures: u64,
    pub save_cycles: u64,
    pub cells: usize,
    pub datafiles: usize,
    pub listeners: usize,
}

struct RepoListenerEntry {
    prefix: String,
    listener: Arc<dyn RepositoryListener>,
}

/// Decrements the shared write depth on drop.
struct DepthGuard<'a>(&'a AtomicUsize);

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Reactive named-value repository.
///
/// Constructed behind an `Arc`; background engines and calculated cells
/// hold weak references back to it. Call [`start_workers`](Self::start_workers)
/// for the notifier/realizer/freezer/saver threads, or drive everything
/// explicitly with [`flush`](Self::flush) and
/// [`save_all_datafiles`](Self::save_all_datafiles).
pub struct DataRepository {
    pub(crate) cells: RwLock<HashMap<String, Arc<Cell>>>,
    pub(crate) listeners: ListenerRegistry,
    repo_listeners: RwLock<Vec<RepoListenerEntry>>,
    pub(crate) notifier: Notifier,
    pub(crate) realizer: RealizeQueue,
    pub(crate) freezer: FreezeQueues,
    pub(crate) datafiles: RwLock<Vec<Arc<Datafile>>>,
    pub(crate) includes: Mutex<HashMap<String, Arc<ValueMap>>>,
    pub(crate) template_dirs: RwLock<Vec<PathBuf>>,
    pub(crate) ids: Mutex<PathIds>,
    pub(crate) consistency: Consistency,
    depth: AtomicUsize,
    pub(crate) stats: StatCounters,
    pub(crate) config: Config,
    self_ref: Weak<DataRepository>,
    workers: Mutex<Vec<WorkerHandle>>,
}

impl DataRepository {
    /// Create an empty repository. No threads are started.
    pub fn new(config: Config) -> DataResult<Arc<Self>> {
        config.validate().map_err(DataError::InvalidConfig)?;
        let template_dirs = config.template_dirs.clone();
        Ok(Arc::new_cyclic(|weak| Self {
            cells: RwLock::new(HashMap::new()),
            listeners: ListenerRegistry::new(),
            repo_listeners: RwLock::new(Vec::new()),
            notifier: Notifier::new(),
            realizer: RealizeQueue::new(),
            freezer: FreezeQueues::new(),
            datafiles: RwLock::new(Vec::new()),
            includes: Mutex::new(HashMap::new()),
            template_dirs: RwLock::new(template_dirs),
            ids: Mutex::new(PathIds::default()),
            consistency: Consistency::new(),
            depth: AtomicUsize::new(0),
            stats: StatCounters::default(),
            config,
            self_ref: weak.clone(),
            workers: Mutex::new(Vec::new()),
        }))
    }

    pub(crate) fn weak(&self) -> Weak<DataRepository> {
        self.self_ref.clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Start the notifier, realizer, freezer and saver threads.
    pub fn start_workers(&self) -> DataResult<()> {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return Ok(());
        }
        workers.push(start_notifier(self.weak())?);
        workers.push(start_realizer(self.weak())?);
        workers.push(start_freezer(self.weak())?);
        workers.push(start_saver(self.weak(), self.config.save_interval)?);
        info!("[repository] started {} workers", workers.len());
        Ok(())
    }

    /// Names of running worker threads.
    pub fn running_workers(&self) -> Vec<&'static str> {
        self.workers.lock().iter().filter(|w| w.is_running()).map(|w| w.name()).collect()
    }

    /// Stop the worker threads, settle pending work and save every datafile.
    pub fn shutdown(&self) {
        let workers: Vec<WorkerHandle> = std::mem::take(&mut *self.workers.lock());
        for worker in &workers {
            worker.signal();
        }
        for worker in workers {
            worker.shutdown();
        }
        self.flush();
        self.save_all_datafiles();
    }

    /// Drain notifications and freeze/thaw work on the calling thread.
    pub fn flush(&self) {
        self.flush_notifications();
        if self.drain_freeze_queues() > 0 {
            self.flush_notifications();
        }
    }

    pub fn stats(&self) -> RepositoryStats {
        let s = &self.stats;
        RepositoryStats {
            circular_aborts: s.circular_aborts.load(Ordering::Relaxed),
            recursion_aborts: s.recursion_aborts.load(Ordering::Relaxed),
            notify_recursion_aborts: s.notify_recursion_aborts.load(Ordering::Relaxed),
            evaluation_failures: s.evaluation_failures.load(Ordering::Relaxed),
            malformed_values: s.malformed_values.load(Ordering::Relaxed),
            datafile_saves: s.datafile_saves.load(Ordering::Relaxed),
            save_failures: s.save_failures.load(Ordering::Relaxed),
            save_cycles: s.save_cycles.load(Ordering::Relaxed),
            cells: self.cells.read().len(),
            datafiles: self.datafiles.read().len(),
            listeners: self.listeners.len(),
        }
    }

    // ---- reading -------------------------------------------------------

    pub(crate) fn cell(&self, name: &str) -> Option<Arc<Cell>> {
        self.cells.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.cells.read().contains_key(name)
    }

    /// Number of cells in the table, including valueless placeholders.
    pub fn len(&self) -> usize {
        self.cells.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.read().is_empty()
    }

    /// Realized current value of `name`, creating `% X of Y` ratio cells on
    /// demand.
    pub fn get(&self, name: &str) -> Option<Value> {
        if !self.contains(name) {
            self.maybe_vivify(name);
        }
        self.get_simple_value(name)
    }

    /// Realized current value of `name`.
    pub fn get_simple_value(&self, name: &str) -> Option<Value> {
        let cell = self.cell(name)?;
        let stored = self.realized(name, &cell)?;
        self.simple_value_of(&stored)
    }

    /// What the cell holds, with deferred text compiled.
    pub fn get_value(&self, name: &str) -> Option<StoredValue> {
        let cell = self.cell(name)?;
        self.realized(name, &cell)
    }

    /// What the cell holds, without realizing anything.
    pub fn peek_value(&self, name: &str) -> Option<StoredValue> {
        self.cell(name)?.state.lock().value.clone()
    }

    /// Text a user would see for the cell; malformed values show as `ERROR`.
    pub fn display(&self, name: &str) -> Option<String> {
        match self.get_value(name)? {
            StoredValue::Malformed(_) => Some(ERROR_DISPLAY.to_string()),
            other => Some(self.simple_value_of(&other).map_or_else(|| NULL_LITERAL.to_string(), |v| v.format())),
        }
    }

    pub(crate) fn simple_value_of(&self, stored: &StoredValue) -> Option<Value> {
        match stored {
            StoredValue::Simple(v) => Some(v.clone()),
            StoredValue::Compiled(f) => f.simple_value(),
            StoredValue::Frozen(fz) => fz.current.clone(),
            StoredValue::Malformed(_) | StoredValue::Deferred { .. } => None,
        }
    }

    /// Compile a deferred value in place and return what the cell holds.
    fn realized(&self, name: &str, cell: &Cell) -> Option<StoredValue> {
        let mut state = cell.state.lock();
        if let Some(StoredValue::Deferred { text, prefix }) = &state.value {
            let (text, prefix) = (text.clone(), prefix.clone());
            state.value = Some(self.compile_stored(name, &text, &prefix));
        }
        state.value.clone()
    }

    /// Realize the named cell if it still holds deferred text.
    pub(crate) fn realize(&self, name: &str) {
        if let Some(cell) = self.cell(name) {
            self.realized(name, &cell);
        }
    }

    pub(crate) fn compile_stored(&self, name: &str, text: &str, prefix: &str) -> StoredValue {
        match script::compile(text) {
            Ok(script) => StoredValue::Compiled(CompiledFunction::create(self, name, script, prefix)),
            Err(e) => {
                warn!("[repository] malformed expression for {}: {}", name, e);
                self.stats.malformed_values.fetch_add(1, Ordering::Relaxed);
                StoredValue::Malformed(text.to_string())
            }
        }
    }

    /// Build a stored value from datafile text. A leading `=` makes it
    /// read-only. `null` yields `None`.
    pub fn stored_from_text(&self, name: &str, text: &str, prefix: &str) -> Option<StoredValue> {
        let value = self.decode_stored(text, prefix);
        if let Some(StoredValue::Malformed(raw)) = &value {
            warn!("[repository] malformed value for {}: {:?}", name, raw);
            self.stats.malformed_values.fetch_add(1, Ordering::Relaxed);
        }
        value
    }

    pub(crate) fn decode_stored(&self, text: &str, prefix: &str) -> Option<StoredValue> {
        let (read_only, body) = match text.strip_prefix('=') {
            Some(rest) => (true, rest),
            None => (false, text),
        };
        match parse_text(body) {
            ParsedText::Absent => None,
            ParsedText::Simple(v) => Some(StoredValue::Simple(if read_only { v.with_editable(false) } else { v })),
            ParsedText::Function(expr) => {
                Some(StoredValue::Deferred { text: canonical_text(&expr).into_owned(), prefix: prefix.to_string() })
            }
            ParsedText::Frozen(fz) => Some(StoredValue::Frozen(fz)),
            ParsedText::Malformed(_) => Some(StoredValue::Malformed(text.to_string())),
        }
    }

    /// Auto-create `…/% Num of Den` as a transient ratio cell.
    fn maybe_vivify(&self, name: &str) {
        let Some(ratio) = last_segment(name).strip_prefix("% ") else { return };
        let Some((num, den)) = ratio.split_once(" of ") else { return };
        if num.is_empty() || den.is_empty() {
            return;
        }
        let prefix = parent(name);
        let text = format!("!(/ [{}] [{}])", num, den);
        let value = self.compile_stored(name, &text, prefix);
        self.insert_cell(name, Some(value), None);
    }

    // ---- writing -------------------------------------------------------

    /// Store a plain value.
    pub fn put(&self, name: &str, value: Value) {
        self.put_value(name, Some(StoredValue::Simple(value)));
    }

    /// Parse `text` (datafile encoding) and store it.
    pub fn put_text(&self, name: &str, text: &str, prefix: &str) {
        let value = self.stored_from_text(name, text, prefix);
        self.put_value(name, value);
    }

    /// Replace a cell's value.
    ///
    /// Nested writes share one depth counter; past the configured ceiling
    /// the write is dropped and logged as a circular dependency.
    pub fn put_value(&self, name: &str, value: Option<StoredValue>) {
        let depth = self.depth.fetch_add(1, Ordering::AcqRel);
        let _depth = DepthGuard(&self.depth);
        if depth >= self.config.max_recursion_depth {
            error!(
                "[repository] detected circular dependency in data, bailed out after {} iterations (writing {})",
                self.config.max_recursion_depth, name
            );
            self.stats.circular_aborts.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let deferred = matches!(value, Some(StoredValue::Deferred { .. }));
        match self.cell(name) {
            Some(cell) => self.replace_value(name, &cell, value),
            None if value.is_none() => {}
            None => {
                let datafile = self.guess_datafile(name);
                if let Some(existing) = self.insert_cell(name, value.clone(), datafile.clone()) {
                    self.replace_value(name, &existing, value);
                } else if let Some(df) = datafile {
                    self.datafile_modified(&df);
                }
            }
        }
        if deferred {
            self.realizer.enqueue(name);
        }
        if self.config.synchronous_notify {
            self.flush_notifications();
        }
    }

    fn replace_value(&self, name: &str, cell: &Arc<Cell>, value: Option<StoredValue>) {
        let (old, datafile) = {
            let mut state = cell.state.lock();
            let old = std::mem::replace(&mut state.value, value.clone());
            (old, state.datafile.clone())
        };

        let changed = old.as_ref().map(StoredValue::save_string) != value.as_ref().map(StoredValue::save_string);
        if let (Some(df), true) = (&datafile, changed) {
            self.datafile_modified(df);
        }
        if let Some(old) = &old {
            if !value.as_ref().is_some_and(|v| v.same_as(old)) {
                old.dispose();
            }
        }
        self.data_changed(name);
        self.maybe_delete(name, cell);
    }

    /// Add a new cell. Returns the existing cell instead if another thread
    /// created it first.
    pub(crate) fn insert_cell(&self, name: &str, value: Option<StoredValue>, datafile: Option<Arc<Datafile>>) -> Option<Arc<Cell>> {
        {
            let mut cells = self.cells.write();
            match cells.entry(name.to_string()) {
                Entry::Occupied(e) => return Some(Arc::clone(e.get())),
                Entry::Vacant(e) => {
                    e.insert(Cell::new(value, datafile));
                }
            }
        }
        self.dispatch_added(name);
        None
    }

    /// Like [`put`](Self::put), but refuses to overwrite read-only values.
    pub fn user_put_value(&self, name: &str, value: Value) -> bool {
        if let Some(existing) = self.get_value(name) {
            if !existing.is_editable() {
                warn!("[repository] refusing to overwrite read-only value {}", name);
                return false;
            }
        }
        self.put(name, value);
        true
    }

    /// Create a value from text only if the cell is absent or empty.
    pub fn maybe_create_value(&self, name: &str, text: &str, prefix: &str) {
        if self.get_value(name).is_some() {
            return;
        }
        if let Some(value) = self.stored_from_text(name, text, prefix) {
            self.put_value(name, Some(value));
        }
    }

    /// Clear a cell's value. The cell itself goes away once nothing listens.
    pub fn remove_value(&self, name: &str) {
        let Some(cell) = self.cell(name) else { return };
        let old_value = self.get_simple_value(name);
        let (old, datafile) = {
            let mut state = cell.state.lock();
            (state.value.take(), state.datafile.clone())
        };
        if let Some(old) = &old {
            old.dispose();
        }
        self.dispatch_removed(name, old_value.as_ref());
        if let Some(df) = &datafile {
            if let Some(relative) = df.relative_name(name) {
                df.note_removed(relative);
            }
            self.datafile_modified(df);
        }
        self.data_changed(name);
        self.maybe_delete(name, &cell);
        if self.config.synchronous_notify {
            self.flush_notifications();
        }
    }

    /// Drop a cell with no value and no listeners, or a transient value
    /// whose listeners have all left.
    pub(crate) fn maybe_delete(&self, name: &str, cell: &Arc<Cell>) {
        let discarded = {
            let mut cells = self.cells.write();
            if !cells.get(name).is_some_and(|c| Arc::ptr_eq(c, cell)) {
                return;
            }
            let mut state = cell.state.lock();
            let discard = match &state.listeners {
                None => state.value.is_none(),
                Some(listeners) if listeners.is_empty() => state.value.is_none() || state.datafile.is_none(),
                Some(_) => false,
            };
            if !discard {
                return;
            }
            cells.remove(name);
            state.value.take()
        };
        if let Some(value) = discarded {
            value.dispose();
        }
    }

    /// Reserve `base` + the first free number and return the name.
    pub fn make_unique_name(&self, base: Option<&str>) -> String {
        let base = base.unwrap_or(INTERNAL_NAME_BASE);
        let mut id = 0u64;
        loop {
            let name = format!("{}{}", base, id);
            if !self.contains(&name) && self.insert_cell(&name, None, None).is_none() {
                return name;
            }
            id += 1;
        }
    }

    /// Names with values under `prefix`, in path order.
    pub fn list_data_names(&self, prefix: &str) -> Vec<String> {
        let candidates: Vec<(String, Arc<Cell>)> = self
            .cells
            .read()
            .iter()
            .filter(|(name, _)| name.starts_with(prefix) && !name.starts_with(ANONYMOUS_PREFIX))
            .map(|(n, c)| (n.clone(), Arc::clone(c)))
            .collect();
        let mut names: Vec<String> = candidates
            .into_iter()
            .filter(|(_, cell)| cell.state.lock().value.is_some())
            .map(|(n, _)| n)
            .collect();
        names.sort_by(|a, b| compare_paths(a, b));
        names
    }

    // ---- data listeners ------------------------------------------------

    pub fn register_listener(&self, listener: Arc<dyn DataListener>) -> ListenerId {
        self.listeners.register(listener, None)
    }

    /// Register a listener that recalculates `computing` when notified.
    pub fn register_active_listener(&self, listener: Arc<dyn DataListener>, computing: &str) -> ListenerId {
        self.listeners.register(listener, Some(computing.to_string()))
    }

    fn attach(&self, name: &str, id: ListenerId) {
        let cell = match self.cell(name) {
            Some(cell) => cell,
            None => {
                let datafile = self.guess_datafile(name);
                match self.insert_cell(name, None, datafile) {
                    Some(existing) => existing,
                    None => match self.cell(name) {
                        Some(cell) => cell,
                        None => return,
                    },
                }
            }
        };
        {
            let mut state = cell.state.lock();
            let listeners = state.listeners.get_or_insert_with(Vec::new);
            if !listeners.contains(&id) {
                listeners.push(id);
            }
        }
        self.listeners.note_watch(id, name);
    }

    /// Subscribe `id` to `name` and deliver its current value right away.
    pub fn add_data_listener(&self, name: &str, id: ListenerId) {
        self.attach(name, id);
        self.notify_now(id, name);
    }

    /// Subscribe without the initial event.
    pub(crate) fn add_data_listener_quietly(&self, name: &str, id: ListenerId) {
        self.attach(name, id);
    }

    pub fn remove_data_listener(&self, name: &str, id: ListenerId) {
        self.notifier.forget_name(id, name);
        self.listeners.note_unwatch(id, name);
        let Some(cell) = self.cell(name) else { return };
        {
            let mut state = cell.state.lock();
            if let Some(listeners) = state.listeners.as_mut() {
                listeners.retain(|l| *l != id);
            }
        }
        self.maybe_delete(name, &cell);
    }

    /// Remove `id` from every cell and forget it entirely.
    pub fn delete_data_listener(&self, id: ListenerId) {
        for name in self.listeners.take_watches(id) {
            if let Some(cell) = self.cell(&name) {
                {
                    let mut state = cell.state.lock();
                    if let Some(listeners) = state.listeners.as_mut() {
                        listeners.retain(|l| *l != id);
                    }
                }
                self.maybe_delete(&name, &cell);
            }
        }
        self.notifier.forget(id);
        self.listeners.unregister(id);
    }

    pub(crate) fn listeners_of(&self, name: &str) -> Vec<ListenerId> {
        self.cell(name).and_then(|c| c.state.lock().listeners.clone()).unwrap_or_default()
    }

    pub fn listener_count(&self, name: &str) -> usize {
        self.listeners_of(name).len()
    }

    // ---- repository listeners -----------------------------------------

    /// Watch cell creation/removal under `prefix`. The listener is told
    /// about every matching cell that already exists.
    pub fn add_repository_listener(&self, listener: Arc<dyn RepositoryListener>, prefix: &str) {
        self.repo_listeners
            .write()
            .push(RepoListenerEntry { prefix: prefix.to_string(), listener: Arc::clone(&listener) });
        let existing: Vec<String> = self
            .cells
            .read()
            .keys()
            .filter(|n| n.starts_with(prefix) && !n.starts_with(ANONYMOUS_PREFIX))
            .cloned()
            .collect();
        for name in existing {
            listener.data_added(&name);
        }
    }

    pub fn remove_repository_listener(&self, listener: &Arc<dyn RepositoryListener>) {
        self.repo_listeners.write().retain(|e| !Arc::ptr_eq(&e.listener, listener));
    }

    fn interested(&self, name: &str) -> Vec<Arc<dyn RepositoryListener>> {
        if name.starts_with(ANONYMOUS_PREFIX) {
            return Vec::new();
        }
        self.repo_listeners
            .read()
            .iter()
            .filter(|e| name.starts_with(&e.prefix))
            .map(|e| Arc::clone(&e.listener))
            .collect()
    }

    pub(crate) fn dispatch_added(&self, name: &str) {
        for listener in self.interested(name) {
            listener.data_added(name);
        }
    }

    pub(crate) fn dispatch_removed(&self, name: &str, old: Option<&Value>) {
        for listener in self.interested(name) {
            listener.data_removed(name, old);
        }
    }

    // ---- consistency ---------------------------------------------------

    pub(crate) fn end_inconsistency(&self) {
        for observer in self.consistency.end() {
            observer();
        }
    }

    /// Run `observer` once no datafile open/close is in flight.
    pub fn add_data_consistency_observer(&self, observer: ConsistencyObserver) {
        if let Some(now) = self.consistency.add_observer(observer) {
            now();
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.consistency.is_consistent()
    }
}

impl Drop for DataRepository {
    fn drop(&mut self) {
        let workers: Vec<WorkerHandle> = std::mem::take(&mut *self.workers.lock());
        for worker in &workers {
            worker.signal();
        }
        drop(workers);
    }
}
