//! Hierarchical data names
//!
//! Names are `/`-delimited paths such as `/Project/Task/Size`. A name given
//! relative to a prefix is joined to it; leading `../` segments walk up one
//! path level each before joining.

use std::cmp::Ordering;

/// Prefix of names that are never announced to repository listeners
pub const ANONYMOUS_PREFIX: &str = "///Anonymous";

/// Join `name` to `prefix`, resolving leading `../` segments.
///
/// Absolute names (starting with `/`) are returned unchanged. A `None` or
/// empty prefix treats the name as already absolute.
pub fn create_data_name(prefix: Option<&str>, name: &str) -> String {
    if name.starts_with('/') {
        return name.to_string();
    }
    let prefix = match prefix {
        Some(p) if !p.is_empty() => p,
        _ => return format!("/{}", name),
    };

    let mut base = prefix.trim_end_matches('/').to_string();
    let mut rest = name;
    loop {
        if let Some(r) = rest.strip_prefix("../") {
            base = parent(&base).to_string();
            rest = r;
        } else if rest == ".." {
            base = parent(&base).to_string();
            rest = "";
        } else if let Some(r) = rest.strip_prefix("./") {
            rest = r;
        } else {
            break;
        }
    }

    if rest.is_empty() {
        if base.is_empty() { "/".to_string() } else { base }
    } else {
        format!("{}/{}", base, rest)
    }
}

/// The parent path of `path` (`""` for a top-level name).
pub fn parent(path: &str) -> &str {
    match path.trim_end_matches('/').rfind('/') {
        Some(i) => &path[..i],
        None => "",
    }
}

/// The final segment of `path`.
pub fn last_segment(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[i + 1..],
        None => path,
    }
}

/// Search from `prefix` upward for a name `bare_name` accepted by `found`.
///
/// Returns the prefix at which the match was made together with whatever
/// `found` extracted, or `None` once the root has been tried.
pub fn inheritable_lookup<T, F>(prefix: &str, bare_name: &str, mut found: F) -> Option<(String, T)>
where
    F: FnMut(&str) -> Option<T>,
{
    let mut current = prefix.trim_end_matches('/').to_string();
    loop {
        let candidate = format!("{}/{}", current, bare_name);
        if let Some(v) = found(&candidate) {
            return Some((current, v));
        }
        if current.is_empty() {
            return None;
        }
        current = parent(&current).to_string();
    }
}

/// Orders paths segment by segment, so `/a/b` sorts before `/a b`.
pub fn compare_paths(a: &str, b: &str) -> Ordering {
    let mut left = a.split('/');
    let mut right = b.split('/');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => match x.cmp(y) {
                Ordering::Equal => continue,
                other => return other,
            },
        }
    }
}

/// A sortable wrapper around a path using [`compare_paths`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathKey(pub String);

impl Ord for PathKey {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_paths(&self.0, &other.0)
    }
}

impl PartialOrd for PathKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
