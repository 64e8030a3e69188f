//! Mounting, saving and closing datafiles
//!
//! Opening a datafile reads and parses it, resolves its `#include` chain
//! into a map of inherited defaults, and mounts one cell per value under the
//! file's prefix. Saving renders only the values that differ from those
//! defaults and replaces the file atomically (see [`crate::durability`]).

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use hashbrown::HashMap;
use tracing::{debug, error, info, warn};

use crate::consistency::InconsistentSection;
use crate::datafile::{self, canonical_text, Datafile, IncludeDirective, ValueMap};
use crate::durability::replace_file;
use crate::error::{DataError, DataResult};
use crate::names::{compare_paths, parent, PathKey};
use crate::repository::{Cell, DataRepository};
use crate::stored::StoredValue;
use crate::value::NULL_LITERAL;

const NOW_LITERAL: &str = "@now";

/// Short IDs handed to remote clients in place of datafile prefixes.
#[derive(Debug, Default)]
pub(crate) struct PathIds {
    by_id: HashMap<String, String>,
    by_prefix: HashMap<String, String>,
}

impl PathIds {
    /// Assign an ID derived from the datafile path, stepping past collisions.
    fn assign(&mut self, prefix: &str, path: &Path) -> String {
        if let Some(id) = self.by_prefix.get(prefix) {
            return id.clone();
        }
        let mut n = crc32c::crc32c(path.to_string_lossy().as_bytes());
        while self.by_id.contains_key(&n.to_string()) {
            n = n.wrapping_add(1);
        }
        let id = n.to_string();
        self.by_id.insert(id.clone(), prefix.to_string());
        self.by_prefix.insert(prefix.to_string(), id.clone());
        id
    }

    fn release(&mut self, prefix: &str) {
        if let Some(id) = self.by_prefix.remove(prefix) {
            self.by_id.remove(&id);
        }
    }
}

fn read_text(path: &Path) -> DataResult<String> {
    fs::read_to_string(path).map_err(|e| DataError::io_at(path, &e, "Failed to read datafile"))
}

fn is_writable(path: &Path) -> bool {
    fs::metadata(path).map(|m| !m.permissions().readonly()).unwrap_or(false)
}

impl DataRepository {
    /// Mount the datafile at `path` under `prefix`.
    ///
    /// Reading is retried `open_retries` times. Values of a file that cannot
    /// be written are mounted read-only.
    pub fn open_datafile(&self, prefix: &str, path: impl AsRef<Path>) -> DataResult<()> {
        let path = path.as_ref();
        let prefix = prefix.trim_end_matches('/');
        if self.find_datafile(prefix).is_some() {
            return Err(DataError::DatafileAlreadyOpen { prefix: prefix.to_string() });
        }

        let text = self.read_with_retries(path)?;
        let parsed = datafile::parse(&text, Some(path))?;
        let defaults = self.include_defaults(parsed.include.as_ref())?;
        let read_only = !is_writable(path);
        let include_line = parsed.include.as_ref().map(|i| i.line.clone());
        let df = Arc::new(Datafile::new(prefix, Some(path.to_path_buf()), include_line, defaults, read_only));

        let _section = InconsistentSection::enter(self);
        self.datafiles.write().push(Arc::clone(&df));
        self.ids.lock().assign(df.prefix(), path);
        let mounted = self.mount(&df, &parsed.values);
        info!("[repository] opened {} under {} ({} values)", path.display(), df.prefix(), mounted);
        drop(_section);

        if self.config.synchronous_notify {
            self.flush_notifications();
        }
        Ok(())
    }

    fn read_with_retries(&self, path: &Path) -> DataResult<String> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match read_text(path) {
                Ok(text) => return Ok(text),
                Err(e) if attempt < self.config.open_retries && e.is_transient() => {
                    debug!("[repository] retrying {} after: {}", path.display(), e);
                    thread::sleep(self.config.open_retry_delay);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Defaults a file inherits through its `#include` line, exclusions applied.
    fn include_defaults(&self, include: Option<&IncludeDirective>) -> DataResult<Arc<ValueMap>> {
        let Some(include) = include else {
            return Ok(Arc::new(ValueMap::new()));
        };
        let inherited = self.resolve_include(&include.name, &mut Vec::new())?;
        Ok(Arc::new(include.filter(&inherited)))
    }

    /// Load an include file by bare name, merged over its own includes.
    fn resolve_include(&self, name: &str, chain: &mut Vec<String>) -> DataResult<Arc<ValueMap>> {
        if let Some(cached) = self.includes.lock().get(name) {
            return Ok(Arc::clone(cached));
        }
        if chain.iter().any(|n| n == name) {
            return Err(DataError::InvalidDatafile {
                path: None,
                line: 1,
                reason: format!("circular #include of <{}>", name),
            });
        }
        let path = self
            .template_dirs
            .read()
            .iter()
            .map(|dir| dir.join(name))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| DataError::IncludeNotFound { name: name.to_string() })?;

        let parsed = datafile::parse(&read_text(&path)?, Some(&path))?;
        let mut merged = match &parsed.include {
            Some(include) => {
                chain.push(name.to_string());
                let inherited = self.resolve_include(&include.name, chain)?;
                chain.pop();
                include.filter(&inherited)
            }
            None => ValueMap::new(),
        };
        merged.extend(parsed.values);

        let merged = Arc::new(merged);
        self.includes.lock().insert(name.to_string(), Arc::clone(&merged));
        Ok(merged)
    }

    /// Create a cell for every default and file value. Returns the count.
    fn mount(&self, df: &Arc<Datafile>, values: &ValueMap) -> usize {
        let mut merged: ValueMap = df.defaults().clone();
        for (name, text) in values {
            merged.insert(name.clone(), text.clone());
        }

        let mut count = 0;
        for (relative, text) in &merged {
            let name = format!("{}/{}", df.prefix(), relative);
            if text.trim_start_matches('=') == NOW_LITERAL {
                df.mark_dirty();
            }
            let value = match self.decode_stored(text, df.prefix()) {
                Some(StoredValue::Malformed(raw)) => {
                    warn!(
                        "[repository] malformed value in {}: {}={:?} ({})",
                        df.prefix(),
                        relative,
                        raw,
                        df.path().map(|p| p.display().to_string()).unwrap_or_default()
                    );
                    self.stats.malformed_values.fetch_add(1, Ordering::Relaxed);
                    Some(StoredValue::Malformed(raw))
                }
                Some(StoredValue::Simple(v)) if df.is_read_only() => Some(StoredValue::Simple(v.with_editable(false))),
                other => other,
            };
            // an explicit null over a default must be written back as null
            if value.is_none() && values.contains_key(relative) && df.default_for(relative).is_some() {
                df.note_removed(relative);
            }
            let deferred = matches!(value, Some(StoredValue::Deferred { .. }));
            self.mount_cell(&name, value, df);
            if deferred {
                self.realizer.enqueue(&name);
            }
            count += 1;
        }
        count
    }

    fn mount_cell(&self, name: &str, value: Option<StoredValue>, df: &Arc<Datafile>) {
        if value.is_none() && !self.contains(name) {
            return;
        }
        let existing = self.insert_cell(name, value.clone(), Some(Arc::clone(df)));
        let Some(cell) = existing else { return };
        let old = {
            let mut state = cell.state.lock();
            state.datafile = Some(Arc::clone(df));
            std::mem::replace(&mut state.value, value)
        };
        if let Some(old) = old {
            old.dispose();
        }
        self.data_changed(name);
    }

    /// Save pending changes, then unmount every cell the datafile owns.
    pub fn close_datafile(&self, prefix: &str) -> DataResult<()> {
        let prefix = prefix.trim_end_matches('/');
        let df = self.find_datafile(prefix).ok_or_else(|| DataError::DatafileNotOpen { prefix: prefix.to_string() })?;

        let _section = InconsistentSection::enter(self);
        self.flush_notifications();
        if let Err(e) = self.save(&df) {
            warn!("[repository] closing {} with unsaved changes: {}", prefix, e);
        }

        for (name, cell) in self.owned_cells(&df) {
            let old_value = self.get_simple_value(&name);
            let old = {
                let mut state = cell.state.lock();
                state.datafile = None;
                state.value.take()
            };
            if let Some(old) = &old {
                old.dispose();
                self.dispatch_removed(&name, old_value.as_ref());
            }
            self.data_changed(&name);
            self.maybe_delete(&name, &cell);
        }

        self.datafiles.write().retain(|d| !Arc::ptr_eq(d, &df));
        self.ids.lock().release(prefix);
        info!("[repository] closed {}", prefix);
        drop(_section);

        if self.config.synchronous_notify {
            self.flush_notifications();
        }
        Ok(())
    }

    /// Save, close and reopen a datafile under a new prefix.
    pub fn rename_datafile(&self, old_prefix: &str, new_prefix: &str) -> DataResult<()> {
        let old_prefix = old_prefix.trim_end_matches('/');
        let df =
            self.find_datafile(old_prefix).ok_or_else(|| DataError::DatafileNotOpen { prefix: old_prefix.to_string() })?;
        let path = df.path().map(Path::to_path_buf).ok_or_else(|| DataError::InvalidConfig(format!(
            "{} has no backing file",
            old_prefix
        )))?;
        if self.find_datafile(new_prefix.trim_end_matches('/')).is_some() {
            return Err(DataError::DatafileAlreadyOpen { prefix: new_prefix.to_string() });
        }
        self.close_datafile(old_prefix)?;
        self.open_datafile(new_prefix, &path)
    }

    /// Mount read-only definitions visible from every prefix.
    pub fn add_global_definitions(&self, path: impl AsRef<Path>) -> DataResult<()> {
        let path = path.as_ref();
        let parsed = datafile::parse(&self.read_with_retries(path)?, Some(path))?;
        let defaults = self.include_defaults(parsed.include.as_ref())?;
        let df = Arc::new(Datafile::new("", Some(path.to_path_buf()), None, defaults, true));
        let _section = InconsistentSection::enter(self);
        self.datafiles.write().push(Arc::clone(&df));
        let mounted = self.mount(&df, &parsed.values);
        info!("[repository] loaded {} global definitions from {}", mounted, path.display());
        Ok(())
    }

    /// Add a directory searched for `#include <name>` files.
    pub fn add_datafile_search_dir(&self, dir: impl Into<PathBuf>) {
        let dir = dir.into();
        let mut dirs = self.template_dirs.write();
        if !dirs.contains(&dir) {
            dirs.push(dir);
        }
    }

    /// Save one datafile by prefix. Returns `false` when nothing was written.
    pub fn save_datafile(&self, prefix: &str) -> DataResult<bool> {
        let prefix = prefix.trim_end_matches('/');
        let df = self.find_datafile(prefix).ok_or_else(|| DataError::DatafileNotOpen { prefix: prefix.to_string() })?;
        self.save(&df)
    }

    /// Save every dirty datafile, logging failures. Returns how many files
    /// were written.
    pub fn save_all_datafiles(&self) -> usize {
        let files: Vec<Arc<Datafile>> = self.datafiles.read().clone();
        let mut written = 0;
        for df in files.iter().filter(|d| d.dirty_count() > 0) {
            if let Ok(true) = self.save(df) {
                written += 1;
            }
        }
        written
    }

    fn save(&self, df: &Arc<Datafile>) -> DataResult<bool> {
        let Some(path) = df.path().filter(|_| !df.is_read_only()) else {
            return Ok(false);
        };
        let _guard = df.save_lock.lock();
        // changes made while rendering re-dirty the file
        df.mark_clean();

        let mut lines: BTreeMap<PathKey, String> = BTreeMap::new();
        let mut empty: Vec<String> = df.removed();
        let mut present: BTreeSet<String> = BTreeSet::new();
        for (name, cell) in self.owned_cells(df) {
            let Some(relative) = df.relative_name(&name) else { continue };
            let text = cell.state.lock().value.as_ref().map(StoredValue::datafile_text);
            match text {
                Some(text) => {
                    present.insert(relative.to_string());
                    let default = df.default_for(relative).map(canonical_text);
                    if default.as_deref() != Some(&*canonical_text(&text)) {
                        lines.insert(PathKey(relative.to_string()), text);
                    }
                }
                None => empty.push(relative.to_string()),
            }
        }
        for relative in empty {
            // removed once, restored since
            if present.contains(&relative) {
                continue;
            }
            if matches!(df.default_for(&relative), Some(d) if d != NULL_LITERAL) {
                lines.insert(PathKey(relative), NULL_LITERAL.to_string());
            }
        }

        let contents = datafile::render(df.include_line(), lines.iter().map(|(k, v)| (k.0.as_str(), v.as_str())));
        let checksum = crc32c::crc32c(contents.as_bytes());
        if !df.content_changed(checksum) {
            debug!("[saver] {} unchanged", path.display());
            return Ok(false);
        }

        match replace_file(path, contents.as_bytes()) {
            Ok(()) => {
                df.saved(checksum);
                self.stats.datafile_saves.fetch_add(1, Ordering::Relaxed);
                info!("[saver] Saved {}", path.display());
                Ok(true)
            }
            Err(e) => {
                df.mark_dirty();
                self.stats.save_failures.fetch_add(1, Ordering::Relaxed);
                error!("[saver] Unable to save {}: {}", path.display(), e);
                Err(e)
            }
        }
    }

    /// Count one modification; save once the count passes `max_dirty`.
    pub(crate) fn datafile_modified(&self, df: &Arc<Datafile>) {
        if df.is_read_only() {
            return;
        }
        if df.mark_dirty() > self.config.max_dirty {
            // failures are logged and leave the file dirty
            let _ = self.save(df);
        }
    }

    pub(crate) fn find_datafile(&self, prefix: &str) -> Option<Arc<Datafile>> {
        self.datafiles.read().iter().find(|d| d.prefix() == prefix).cloned()
    }

    /// The writable datafile with the longest prefix containing `name`.
    pub(crate) fn guess_datafile(&self, name: &str) -> Option<Arc<Datafile>> {
        if name.contains("//") {
            return None;
        }
        self.datafiles
            .read()
            .iter()
            .filter(|d| !d.is_read_only() && d.relative_name(name).is_some())
            .max_by_key(|d| d.prefix().len())
            .cloned()
    }

    fn datafile_for(&self, name: &str) -> Option<Arc<Datafile>> {
        self.cell(name).and_then(|c| c.state.lock().datafile.clone()).or_else(|| self.guess_datafile(name))
    }

    fn owned_cells(&self, df: &Arc<Datafile>) -> Vec<(String, Arc<Cell>)> {
        let candidates: Vec<(String, Arc<Cell>)> = self
            .cells
            .read()
            .iter()
            .filter(|(name, _)| df.relative_name(name).is_some())
            .map(|(n, c)| (n.clone(), Arc::clone(c)))
            .collect();
        candidates
            .into_iter()
            .filter(|(_, cell)| cell.state.lock().datafile.as_ref().is_some_and(|d| Arc::ptr_eq(d, df)))
            .collect()
    }

    /// Canonical text of the inherited default for `name`, if any.
    pub fn default_text(&self, name: &str) -> Option<String> {
        let df = self.datafile_for(name)?;
        let relative = df.relative_name(name)?;
        df.default_for(relative).map(|d| canonical_text(d).into_owned())
    }

    /// Prefix expressions in `name` resolve against.
    pub fn prefix_for(&self, name: &str) -> String {
        match self.datafile_for(name) {
            Some(df) => df.prefix().to_string(),
            None => parent(name).to_string(),
        }
    }

    /// Put the inherited default back, or clear the value if there is none.
    pub fn restore_default_value(&self, name: &str) {
        match self.default_text(name) {
            Some(text) => {
                let prefix = self.prefix_for(name);
                self.put_text(name, &text, &prefix);
            }
            None => self.remove_value(name),
        }
    }

    /// Short ID for the datafile mounted at `prefix`.
    pub fn get_id(&self, prefix: &str) -> Option<String> {
        self.ids.lock().by_prefix.get(prefix.trim_end_matches('/')).cloned()
    }

    /// Prefix of the datafile with the given ID.
    pub fn get_path(&self, id: &str) -> Option<String> {
        self.ids.lock().by_id.get(id).cloned()
    }

    /// Prefixes of all mounted datafiles.
    pub fn datafile_prefixes(&self) -> Vec<String> {
        self.datafiles.read().iter().map(|d| d.prefix().to_string()).collect()
    }

    /// `(name, display text)` for datafile-backed cells under `prefix`.
    pub fn dump(&self, prefix: &str) -> Vec<(String, String)> {
        let names: Vec<String> = self
            .cells
            .read()
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(n, c)| (n.clone(), Arc::clone(c)))
            .collect::<Vec<_>>()
            .into_iter()
            .filter(|(_, cell)| cell.state.lock().datafile.is_some())
            .map(|(n, _)| n)
            .collect();
        let mut out: Vec<(String, String)> =
            names.into_iter().filter_map(|n| self.display(&n).map(|d| (n, d))).collect();
        out.sort_by(|a, b| compare_paths(&a.0, &b.0));
        out
    }
}
