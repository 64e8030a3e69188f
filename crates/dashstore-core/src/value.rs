//! Semantic values and their save-string encoding
//!
//! A [`Value`] is what readers of the repository see. Values are immutable:
//! changing a cell means replacing its value, never editing one in place.
//!
//! Save strings:
//!
//! | kind   | encoding                                  |
//! |--------|-------------------------------------------|
//! | number | `12`, `0.25`, `NaN`, `Infinity`           |
//! | text   | `"` + escaped body (`\\`, `\n`, `\t`, `\r`) |
//! | date   | `@` + milliseconds since the epoch        |
//! | tag    | `TAG`                                     |
//! | list   | `[` + tab-separated escaped items + `]`   |
//!
//! A leading `?` marks a value as undefined (awaiting user input). When
//! decoding, a leading `=` marks the value read-only.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{DataError, DataResult};

/// Literal used for an absent value in datafiles and on the wire
pub const NULL_LITERAL: &str = "null";

/// Literal for the tag marker
pub const TAG_LITERAL: &str = "TAG";

/// A semantic value held by (or computed for) a cell.
#[derive(Debug, Clone)]
pub enum Value {
    /// Double precision number
    Number { value: f64, editable: bool, defined: bool },
    /// Character string
    Text { value: String, editable: bool, defined: bool },
    /// Milliseconds since the Unix epoch
    Date { millis: i64, editable: bool, defined: bool },
    /// Marker whose mere presence is meaningful
    Tag,
    /// Ordered sequence of strings
    List(Vec<String>),
}

impl Value {
    /// An editable, defined number.
    pub fn number(value: f64) -> Self {
        Value::Number { value, editable: true, defined: true }
    }

    /// An editable, defined string.
    pub fn text(value: impl Into<String>) -> Self {
        Value::Text { value: value.into(), editable: true, defined: true }
    }

    /// An editable, defined date.
    pub fn date(millis: i64) -> Self {
        Value::Date { millis, editable: true, defined: true }
    }

    /// A list of strings.
    pub fn list<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Value::List(items.into_iter().map(Into::into).collect())
    }

    /// The current wall-clock time as a date value.
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Value::date(millis)
    }

    pub fn is_editable(&self) -> bool {
        match self {
            Value::Number { editable, .. }
            | Value::Text { editable, .. }
            | Value::Date { editable, .. } => *editable,
            Value::Tag | Value::List(_) => true,
        }
    }

    pub fn is_defined(&self) -> bool {
        match self {
            Value::Number { defined, .. }
            | Value::Text { defined, .. }
            | Value::Date { defined, .. } => *defined,
            Value::Tag | Value::List(_) => true,
        }
    }

    /// A copy of this value with the given editability.
    pub fn with_editable(&self, editable: bool) -> Self {
        let mut v = self.clone();
        match &mut v {
            Value::Number { editable: e, .. }
            | Value::Text { editable: e, .. }
            | Value::Date { editable: e, .. } => *e = editable,
            Value::Tag | Value::List(_) => {}
        }
        v
    }

    /// A copy of this value with the given definedness.
    pub fn with_defined(&self, defined: bool) -> Self {
        let mut v = self.clone();
        match &mut v {
            Value::Number { defined: d, .. }
            | Value::Text { defined: d, .. }
            | Value::Date { defined: d, .. } => *d = defined,
            Value::Tag | Value::List(_) => {}
        }
        v
    }

    /// Truthiness, as used by freeze flags and logical operators.
    pub fn test(&self) -> bool {
        match self {
            Value::Number { value, defined, .. } => *defined && *value != 0.0 && !value.is_nan(),
            Value::Text { value, .. } => !value.is_empty(),
            Value::Date { .. } | Value::Tag => true,
            Value::List(items) => !items.is_empty(),
        }
    }

    /// Numeric view of a defined number.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number { value, defined: true, .. } => Some(*value),
            _ => None,
        }
    }

    /// Canonical save string, including the `?` marker for undefined values.
    pub fn save_string(&self) -> String {
        let body = match self {
            Value::Number { value, .. } => format_number(*value),
            Value::Text { value, .. } => format!("\"{}", escape(value)),
            Value::Date { millis, .. } => format!("@{}", millis),
            Value::Tag => TAG_LITERAL.to_string(),
            Value::List(items) => {
                let escaped: Vec<String> = items.iter().map(|i| escape_item(i)).collect();
                format!("[{}]", escaped.join("\t"))
            }
        };
        if self.is_defined() {
            body
        } else {
            format!("?{}", body)
        }
    }

    /// Save string carrying the read-only marker as well.
    pub fn wire_string(&self) -> String {
        if self.is_editable() {
            self.save_string()
        } else {
            format!("={}", self.save_string())
        }
    }

    /// Display form for user-facing collaborators.
    pub fn format(&self) -> String {
        match self {
            Value::Number { value, .. } => format_number(*value),
            Value::Text { value, .. } => value.clone(),
            Value::Date { millis, .. } => millis.to_string(),
            Value::Tag => TAG_LITERAL.to_string(),
            Value::List(items) => items.join(", "),
        }
    }

    /// Decode a save string. `null` decodes to `None`.
    pub fn decode(text: &str) -> DataResult<Option<Value>> {
        let mut body = text;
        let mut editable = true;
        let mut defined = true;
        loop {
            if let Some(rest) = body.strip_prefix('=') {
                editable = false;
                body = rest;
            } else if let Some(rest) = body.strip_prefix('?') {
                defined = false;
                body = rest;
            } else {
                break;
            }
        }

        if body == NULL_LITERAL {
            return Ok(None);
        }

        let value = if let Some(s) = body.strip_prefix('"') {
            Value::text(unescape(s))
        } else if let Some(d) = body.strip_prefix('@') {
            if d.eq_ignore_ascii_case("now") {
                Value::now()
            } else {
                let millis = d.trim().parse::<i64>()
                    .map_err(|e| DataError::malformed(text, format!("bad date: {}", e)))?;
                Value::date(millis)
            }
        } else if body == TAG_LITERAL {
            return Ok(Some(Value::Tag));
        } else if body.starts_with('[') && body.ends_with(']') && body.len() >= 2 {
            let inner = &body[1..body.len() - 1];
            if inner.is_empty() {
                return Ok(Some(Value::List(Vec::new())));
            }
            return Ok(Some(Value::List(inner.split('\t').map(unescape_item).collect())));
        } else {
            Value::number(parse_number(body).ok_or_else(|| DataError::malformed(text, "not a number"))?)
        };

        Ok(Some(value.with_editable(editable).with_defined(defined)))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Value::Number { value: a, editable: ea, defined: da },
                Value::Number { value: b, editable: eb, defined: db },
            ) => (a == b || (a.is_nan() && b.is_nan())) && ea == eb && da == db,
            (
                Value::Text { value: a, editable: ea, defined: da },
                Value::Text { value: b, editable: eb, defined: db },
            ) => a == b && ea == eb && da == db,
            (
                Value::Date { millis: a, editable: ea, defined: da },
                Value::Date { millis: b, editable: eb, defined: db },
            ) => a == b && ea == eb && da == db,
            (Value::Tag, Value::Tag) => true,
            (Value::List(a), Value::List(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format())
    }
}

// Values travel as their wire string so NaN and the flags survive JSON.
impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.wire_string())
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        match Value::decode(&text) {
            Ok(Some(v)) => Ok(v),
            Ok(None) => Err(serde::de::Error::custom("null is not a value")),
            Err(e) => Err(serde::de::Error::custom(e.to_string())),
        }
    }
}

/// Shortest round-trip rendering; integral values print without a fraction.
pub fn format_number(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v.is_infinite() {
        if v > 0.0 { "Infinity".to_string() } else { "-Infinity".to_string() }
    } else if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{}", v)
    }
}

/// Parse a numeric literal, accepting the spellings `format_number` emits.
pub fn parse_number(text: &str) -> Option<f64> {
    let t = text.trim();
    match t {
        "" => None,
        "NaN" => Some(f64::NAN),
        "Infinity" | "+Infinity" => Some(f64::INFINITY),
        "-Infinity" => Some(f64::NEG_INFINITY),
        _ => t.parse::<f64>().ok(),
    }
}

/// Escape a string body for a save string.
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '\u{1}' => out.push_str("\\1"),
            c => out.push(c),
        }
    }
    out
}

/// `escape` can never produce this, so it stands for an empty list item.
const EMPTY_ITEM: &str = "\\e";

fn escape_item(item: &str) -> String {
    if item.is_empty() {
        EMPTY_ITEM.to_string()
    } else {
        escape(item)
    }
}

fn unescape_item(item: &str) -> String {
    if item == EMPTY_ITEM {
        String::new()
    } else {
        unescape(item)
    }
}

/// Inverse of [`escape`]. Unknown escapes keep the escaped character.
pub fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('1') => out.push('\u{1}'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}
