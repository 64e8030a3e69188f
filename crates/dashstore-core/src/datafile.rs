//! Datafile text format
//!
//! A datafile is a flat list of `name=value` lines, names relative to the
//! prefix the file is mounted under:
//!
//! ```text
//! #include <psp2.txt> exclude (Size Estimate, /^Defect/)
//! = lines starting with '=' are comments
//! Size="10
//! Total=!(+ A B)
//! New Name=<=Old Name
//! Phase (\w+) Time=>~$1 Time
//! ```
//!
//! `#include` is only recognized on the first line. Included files supply
//! defaults: they are loaded once, cached, and values equal to a default are
//! not written back. `newName=<=oldName` moves a value (renames chain);
//! `regex=>~replacement` renames every matching name once.

use std::borrow::Cow;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use regex::Regex;
use tracing::debug;

use crate::error::{DataError, DataResult};

const INCLUDE_KEYWORD: &str = "include";
const SIMPLE_RENAME: &str = "<=";
const PATTERN_RENAME: &str = "=>~";

/// Name -> raw value text, in file order.
pub type ValueMap = IndexMap<String, String>;

/// Names left out of an included file.
#[derive(Debug, Clone)]
pub enum Exclusion {
    Name(String),
    Pattern(Regex),
}

impl Exclusion {
    pub fn excludes(&self, name: &str) -> bool {
        match self {
            Exclusion::Name(n) => n == name,
            Exclusion::Pattern(re) => re.is_match(name),
        }
    }
}

/// A parsed `#include <name> [exclude (…)]` line.
#[derive(Debug, Clone)]
pub struct IncludeDirective {
    pub name: String,
    pub exclusions: Vec<Exclusion>,
    /// The line as written, re-emitted on save
    pub line: String,
}

impl IncludeDirective {
    pub fn parse(line: &str, path: Option<&Path>) -> DataResult<Self> {
        let invalid = |reason: &str| DataError::InvalidDatafile {
            path: path.map(Path::to_path_buf),
            line: 1,
            reason: reason.to_string(),
        };

        let rest = line.trim_start_matches('#');
        let rest = rest.strip_prefix(INCLUDE_KEYWORD).ok_or_else(|| invalid("not an include directive"))?.trim();
        if rest.starts_with('"') {
            return Err(invalid("relative #include paths are no longer supported"));
        }
        let rest = rest.strip_prefix('<').ok_or_else(|| invalid("#include target must be written <name>"))?;
        let (name, rest) = rest.split_once('>').ok_or_else(|| invalid("unterminated #include target"))?;
        if name.trim().is_empty() {
            return Err(invalid("empty #include target"));
        }

        let mut exclusions = Vec::new();
        let rest = rest.trim();
        if !rest.is_empty() {
            let list = rest
                .strip_prefix("exclude")
                .map(str::trim)
                .and_then(|l| l.strip_prefix('('))
                .and_then(|l| l.strip_suffix(')'))
                .ok_or_else(|| invalid("expected exclude (…) after #include target"))?;
            for item in list.split(',').map(str::trim).filter(|i| !i.is_empty()) {
                match item.strip_prefix('/').and_then(|i| i.strip_suffix('/')) {
                    Some(re) => {
                        let re = Regex::new(re).map_err(|e| invalid(&format!("bad exclusion pattern: {}", e)))?;
                        exclusions.push(Exclusion::Pattern(re));
                    }
                    None => exclusions.push(Exclusion::Name(item.to_string())),
                }
            }
        }

        Ok(Self { name: name.trim().to_string(), exclusions, line: line.trim_end().to_string() })
    }

    /// Apply exclusions to the included values.
    pub fn filter(&self, values: &ValueMap) -> ValueMap {
        values
            .iter()
            .filter(|(name, _)| !self.exclusions.iter().any(|x| x.excludes(name)))
            .map(|(n, v)| (n.clone(), v.clone()))
            .collect()
    }
}

/// One file's contents with renames applied.
#[derive(Debug, Clone, Default)]
pub struct ParsedDatafile {
    pub include: Option<IncludeDirective>,
    pub values: ValueMap,
}

/// Parse datafile text. `path` is only used in error messages.
pub fn parse(text: &str, path: Option<&Path>) -> DataResult<ParsedDatafile> {
    let mut parsed = ParsedDatafile::default();
    let mut simple_renames: Vec<(String, String)> = Vec::new();
    let mut pattern_renames: Vec<(Regex, String)> = Vec::new();

    for (index, raw) in text.lines().enumerate() {
        let line = raw.strip_suffix('\r').unwrap_or(raw);
        let line_no = index + 1;
        if index == 0 && line.starts_with('#') && line.trim_start_matches('#').starts_with(INCLUDE_KEYWORD) {
            parsed.include = Some(IncludeDirective::parse(line, path)?);
            continue;
        }
        if line.trim().is_empty() || line.starts_with('=') {
            continue;
        }
        let pattern_rename = line.find('=').and_then(|pos| {
            line[pos..].starts_with(PATTERN_RENAME).then(|| (&line[..pos], &line[pos + PATTERN_RENAME.len()..]))
        });
        if let Some((pattern, replacement)) = pattern_rename {
            let re = Regex::new(&format!("^(?:{})$", pattern)).map_err(|e| DataError::InvalidDatafile {
                path: path.map(Path::to_path_buf),
                line: line_no,
                reason: format!("bad rename pattern: {}", e),
            })?;
            pattern_renames.push((re, replacement.to_string()));
            continue;
        }
        let (name, value) = line.split_once('=').ok_or_else(|| DataError::InvalidDatafile {
            path: path.map(Path::to_path_buf),
            line: line_no,
            reason: "expected name=value".to_string(),
        })?;
        match value.strip_prefix(SIMPLE_RENAME) {
            Some(old) => simple_renames.push((name.to_string(), old.to_string())),
            None => {
                parsed.values.insert(name.to_string(), value.to_string());
            }
        }
    }

    apply_simple_renames(&mut parsed.values, &simple_renames);
    apply_pattern_renames(&mut parsed.values, &pattern_renames);
    Ok(parsed)
}

/// Move each renamed value to its new name, following chains of renames.
fn apply_simple_renames(values: &mut ValueMap, renames: &[(String, String)]) {
    if renames.is_empty() {
        return;
    }
    let targets: IndexMap<&str, &str> = renames.iter().map(|(new, old)| (new.as_str(), old.as_str())).collect();
    let sources: BTreeSet<&str> = renames.iter().map(|(_, old)| old.as_str()).collect();

    let mut moves = Vec::new();
    for (new, old) in renames {
        // intermediate links of a chain end up empty
        if sources.contains(new.as_str()) {
            continue;
        }
        let mut source = old.as_str();
        let mut seen = BTreeSet::from([new.as_str()]);
        while let Some(next) = targets.get(source) {
            if !seen.insert(source) {
                break;
            }
            source = next;
        }
        if let Some(value) = values.get(source) {
            moves.push((new.clone(), source.to_string(), value.clone()));
        }
    }
    for (_, source, _) in &moves {
        values.shift_remove(source);
    }
    for (new, source, value) in moves {
        debug!("renamed {} to {}", source, new);
        values.insert(new, value);
    }
}

/// Rename every name matching a pattern. Results are not matched again, and
/// a name already present in the file keeps its own value.
fn apply_pattern_renames(values: &mut ValueMap, renames: &[(Regex, String)]) {
    let mut produced = BTreeSet::new();
    for (re, replacement) in renames {
        let matching: Vec<String> =
            values.keys().filter(|n| !produced.contains(*n) && re.is_match(n)).cloned().collect();
        for old in matching {
            let new = re.replace(&old, replacement.as_str()).into_owned();
            if new == old || values.contains_key(&new) {
                continue;
            }
            if let Some(value) = values.shift_remove(&old) {
                values.insert(new.clone(), value);
                produced.insert(new);
            }
        }
    }
}

/// Canonical form of raw value text, used when comparing against defaults.
/// Expression text is normalized to `!` plus the trimmed body.
pub fn canonical_text(raw: &str) -> Cow<'_, str> {
    let (marker, body) = match raw.strip_prefix('=') {
        Some(rest) => ("=", rest),
        None => ("", raw),
    };
    match body.strip_prefix('!').or_else(|| body.strip_prefix('{')) {
        Some(expr) => Cow::Owned(format!("{}!{}", marker, expr.trim())),
        None => Cow::Borrowed(raw),
    }
}

/// Render file text: the include line, then `name=value` lines.
pub fn render<'a>(include: Option<&str>, lines: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    let mut out = String::new();
    if let Some(line) = include {
        out.push_str(line);
        out.push('\n');
    }
    for (name, value) in lines {
        out.push_str(name);
        out.push('=');
        out.push_str(value);
        out.push('\n');
    }
    out
}

/// A mounted datafile.
#[derive(Debug)]
pub struct Datafile {
    prefix: String,
    path: Option<PathBuf>,
    include_line: Option<String>,
    defaults: Arc<ValueMap>,
    read_only: bool,
    dirty: AtomicU32,
    removed: Mutex<BTreeSet<String>>,
    last_checksum: Mutex<Option<u32>>,
    pub(crate) save_lock: Mutex<()>,
}

impl Datafile {
    pub(crate) fn new(
        prefix: &str,
        path: Option<PathBuf>,
        include_line: Option<String>,
        defaults: Arc<ValueMap>,
        read_only: bool,
    ) -> Self {
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
            path,
            include_line,
            defaults,
            read_only,
            dirty: AtomicU32::new(0),
            removed: Mutex::new(BTreeSet::new()),
            last_checksum: Mutex::new(None),
            save_lock: Mutex::new(()),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn include_line(&self) -> Option<&str> {
        self.include_line.as_deref()
    }

    /// Read-only datafiles are never saved and their values are not editable.
    pub fn is_read_only(&self) -> bool {
        self.read_only || self.path.is_none()
    }

    pub fn dirty_count(&self) -> u32 {
        self.dirty.load(Ordering::Acquire)
    }

    /// Bump the dirty counter, returning the new count.
    pub(crate) fn mark_dirty(&self) -> u32 {
        self.dirty.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn mark_clean(&self) {
        self.dirty.store(0, Ordering::Release);
    }

    /// Inherited default for a relative name.
    pub fn default_for(&self, relative: &str) -> Option<&str> {
        self.defaults.get(relative).map(String::as_str)
    }

    pub(crate) fn defaults(&self) -> &ValueMap {
        &self.defaults
    }

    /// The name relative to this file's prefix, if the file could own it.
    pub fn relative_name<'a>(&self, name: &'a str) -> Option<&'a str> {
        name.strip_prefix(self.prefix.as_str())?.strip_prefix('/')
    }

    pub(crate) fn note_removed(&self, relative: &str) {
        self.removed.lock().insert(relative.to_string());
    }

    pub(crate) fn removed(&self) -> Vec<String> {
        self.removed.lock().iter().cloned().collect()
    }

    /// Record the checksum of rendered content. Returns `false` if it equals
    /// the last saved content.
    pub(crate) fn content_changed(&self, checksum: u32) -> bool {
        *self.last_checksum.lock() != Some(checksum)
    }

    pub(crate) fn saved(&self, checksum: u32) {
        *self.last_checksum.lock() = Some(checksum);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_values_and_comments() {
        let text = "= header comment\nSize=\"10\n\nTotal=!(+ A B)\nDate=@1000\n";
        let parsed = parse(text, None).unwrap();
        assert!(parsed.include.is_none());
        let names: Vec<&str> = parsed.values.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["Size", "Total", "Date"]);
        assert_eq!(parsed.values["Size"], "\"10");
    }

    #[test]
    fn test_include_directive_with_exclusions() {
        let text = "#include <psp2.txt> exclude (Size, /^Defect/)\nA=1\n";
        let parsed = parse(text, None).unwrap();
        let inc = parsed.include.unwrap();
        assert_eq!(inc.name, "psp2.txt");
        assert_eq!(inc.line, "#include <psp2.txt> exclude (Size, /^Defect/)");

        let mut defaults = ValueMap::new();
        for n in ["Size", "Defect Count", "Time"] {
            defaults.insert(n.to_string(), "0".to_string());
        }
        let kept: Vec<String> = inc.filter(&defaults).into_keys().collect();
        assert_eq!(kept, vec!["Time".to_string()]);
    }

    #[test]
    fn test_include_only_on_first_line() {
        let err = parse("A=1\n#include <x>\n", None).unwrap_err();
        assert!(matches!(err, DataError::InvalidDatafile { line: 2, .. }));
    }

    #[test]
    fn test_relative_include_rejected() {
        let err = parse("#include \"x.txt\"\n", Some(Path::new("/d/p.dat"))).unwrap_err();
        match err {
            DataError::InvalidDatafile { path, reason, .. } => {
                assert_eq!(path, Some(PathBuf::from("/d/p.dat")));
                assert!(reason.contains("no longer supported"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_line_without_equals_is_invalid() {
        let err = parse("A=1\njunk\n", None).unwrap_err();
        assert!(matches!(err, DataError::InvalidDatafile { line: 2, .. }));
    }

    #[test]
    fn test_simple_renames_chain() {
        let text = "Old=5\nMiddle=<=Old\nNew=<=Middle\n";
        let parsed = parse(text, None).unwrap();
        assert_eq!(parsed.values.get("New").map(String::as_str), Some("5"));
        assert!(!parsed.values.contains_key("Old"));
        assert!(!parsed.values.contains_key("Middle"));
    }

    #[test]
    fn test_simple_rename_cycle_terminates() {
        let parsed = parse("A=<=B\nB=<=A\nC=1\n", None).unwrap();
        assert_eq!(parsed.values.len(), 1);
    }

    #[test]
    fn test_pattern_renames_apply_once() {
        let text = "Design Time=10\nCode Time=20\n(\\w+) Time=>~Phase $1 Time\nPhase (\\w+) Time=>~$1 Time\n";
        let parsed = parse(text, None).unwrap();
        let mut names: Vec<&str> = parsed.values.keys().map(String::as_str).collect();
        names.sort();
        assert_eq!(names, vec!["Phase Code Time", "Phase Design Time"]);
    }

    #[test]
    fn test_pattern_rename_keeps_explicit_target() {
        let text = "Old A=1\nNew A=2\nOld (\\w)=>~New $1\n";
        let parsed = parse(text, None).unwrap();
        assert_eq!(parsed.values.get("New A").map(String::as_str), Some("2"));
        assert_eq!(parsed.values.get("Old A").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_value_containing_rename_marker() {
        let parsed = parse("Note=\"a=>~b\n", None).unwrap();
        assert_eq!(parsed.values.get("Note").map(String::as_str), Some("\"a=>~b"));
    }

    #[test]
    fn test_canonical_text() {
        assert_eq!(canonical_text("{(+ A B) "), "!(+ A B)");
        assert_eq!(canonical_text("=!(+ A B)"), "=!(+ A B)");
        assert_eq!(canonical_text("\"x"), "\"x");
    }

    #[test]
    fn test_render_lines() {
        let text = render(Some("#include <t>"), [("A", "1"), ("B", "\"x")]);
        assert_eq!(text, "#include <t>\nA=1\nB=\"x\n");
    }

    #[test]
    fn test_relative_name() {
        let df = Datafile::new("/proj", None, None, Arc::new(ValueMap::new()), false);
        assert_eq!(df.relative_name("/proj/Size"), Some("Size"));
        assert_eq!(df.relative_name("/project/Size"), None);
        assert!(df.is_read_only());
    }
}
