//! What a cell actually holds
//!
//! Readers see [`Value`]s, but a cell may hold something richer: an
//! unrealized expression, a compiled function, a frozen snapshot, or text
//! that failed to decode and is kept verbatim so saving never corrupts it.

use std::sync::Arc;

use crate::compiled::CompiledFunction;
use crate::error::DataResult;
use crate::value::{Value, NULL_LITERAL};

/// Separates the frozen value from its former value in the envelope
pub const FROZEN_SEPARATOR: char = '\u{1}';

/// Former-value token meaning "restore the inherited default on thaw"
pub const DEFAULT_TOKEN: &str = "@@@default";

/// Display text for cells holding malformed data
pub const ERROR_DISPLAY: &str = "ERROR";

/// The contents of a cell.
#[derive(Clone)]
pub enum StoredValue {
    /// A plain value
    Simple(Value),
    /// Expression text not compiled yet; realized on first access
    Deferred { text: String, prefix: String },
    /// A calculated value
    Compiled(Arc<CompiledFunction>),
    /// A read-only snapshot taken under a freeze flag
    Frozen(FrozenValue),
    /// Text that could not be decoded, kept for lossless re-saving
    Malformed(String),
}

impl std::fmt::Debug for StoredValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoredValue::Simple(v) => write!(f, "Simple({:?})", v),
            StoredValue::Deferred { text, .. } => write!(f, "Deferred({:?})", text),
            StoredValue::Compiled(c) => write!(f, "Compiled({:?})", c.save_string()),
            StoredValue::Frozen(fz) => write!(f, "Frozen({:?})", fz.save_string()),
            StoredValue::Malformed(t) => write!(f, "Malformed({:?})", t),
        }
    }
}

impl StoredValue {
    pub fn save_string(&self) -> String {
        match self {
            StoredValue::Simple(v) => v.save_string(),
            StoredValue::Deferred { text, .. } => text.clone(),
            StoredValue::Compiled(c) => c.save_string().to_string(),
            StoredValue::Frozen(fz) => fz.save_string(),
            StoredValue::Malformed(t) => t.clone(),
        }
    }

    /// Text as written to a datafile: read-only plain values carry `=`.
    pub fn datafile_text(&self) -> String {
        match self {
            StoredValue::Simple(v) if !v.is_editable() => format!("={}", v.save_string()),
            other => other.save_string(),
        }
    }

    pub fn is_editable(&self) -> bool {
        match self {
            StoredValue::Simple(v) => v.is_editable(),
            _ => false,
        }
    }

    pub fn is_frozen(&self) -> bool {
        matches!(self, StoredValue::Frozen(_))
    }

    /// Release resources (listener subscriptions) held by the value.
    pub fn dispose(&self) {
        if let StoredValue::Compiled(c) = self {
            c.dispose();
        }
    }

    /// Same underlying value object (identity, not equality).
    pub fn same_as(&self, other: &StoredValue) -> bool {
        match (self, other) {
            (StoredValue::Compiled(a), StoredValue::Compiled(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// What a thawed cell goes back to.
#[derive(Debug, Clone, PartialEq)]
pub enum Former {
    /// The save string of the value before freezing
    Saved { text: String, editable: bool },
    /// The inherited default for the cell
    Default,
}

/// A read-only snapshot plus the value it replaced.
#[derive(Debug, Clone, PartialEq)]
pub struct FrozenValue {
    pub current: Option<Value>,
    pub former: Former,
}

impl FrozenValue {
    pub fn new(current: Option<Value>, former: Former) -> Self {
        Self { current: current.map(|v| v.with_editable(false)), former }
    }

    /// `#` + current + U+0001 + former.
    pub fn save_string(&self) -> String {
        let current = self.current.as_ref().map_or_else(|| NULL_LITERAL.to_string(), Value::save_string);
        let former = match &self.former {
            Former::Default => DEFAULT_TOKEN.to_string(),
            Former::Saved { text, editable: true } => text.clone(),
            Former::Saved { text, editable: false } => format!("={}", text),
        };
        format!("#{}{}{}", current, FROZEN_SEPARATOR, former)
    }

    /// Decode an envelope (with the leading `#`).
    pub fn decode(text: &str) -> DataResult<FrozenValue> {
        let body = text.strip_prefix('#').unwrap_or(text);
        let (current, former) = body
            .split_once(FROZEN_SEPARATOR)
            .ok_or_else(|| crate::error::DataError::malformed(text, "frozen value lacks separator"))?;
        let current = Value::decode(current)?;
        let former = if former == DEFAULT_TOKEN {
            Former::Default
        } else if let Some(rest) = former.strip_prefix('=') {
            Former::Saved { text: rest.to_string(), editable: false }
        } else {
            Former::Saved { text: former.to_string(), editable: true }
        };
        Ok(FrozenValue::new(current, former))
    }
}

/// Datafile text classified before it becomes a [`StoredValue`].
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedText {
    /// `null`
    Absent,
    Simple(Value),
    /// `!…` or `{…}` expression text
    Function(String),
    Frozen(FrozenValue),
    Malformed(String),
}

/// Classify text as found in a datafile (after any `=` prefix was stripped).
pub fn parse_text(text: &str) -> ParsedText {
    if text.starts_with('!') || text.starts_with('{') {
        return ParsedText::Function(text.to_string());
    }
    if text.starts_with('#') {
        return match FrozenValue::decode(text) {
            Ok(fz) => ParsedText::Frozen(fz),
            Err(_) => ParsedText::Malformed(text.to_string()),
        };
    }
    match Value::decode(text) {
        Ok(Some(v)) => ParsedText::Simple(v),
        Ok(None) => ParsedText::Absent,
        Err(_) => ParsedText::Malformed(text.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frozen_envelope_round_trip() {
        let fz = FrozenValue::new(
            Some(Value::number(12.0)),
            Former::Saved { text: "!(+ A B)".into(), editable: true },
        );
        assert_eq!(fz.save_string(), "#12\u{1}!(+ A B)");
        let back = FrozenValue::decode(&fz.save_string()).unwrap();
        assert_eq!(back, fz);
        assert!(!back.current.unwrap().is_editable());
    }

    #[test]
    fn test_frozen_read_only_former_and_default() {
        let fz = FrozenValue::new(None, Former::Saved { text: "\"x".into(), editable: false });
        assert_eq!(fz.save_string(), "#null\u{1}=\"x");
        assert_eq!(FrozenValue::decode(&fz.save_string()).unwrap(), fz);

        let fz = FrozenValue::new(Some(Value::text("d")), Former::Default);
        assert_eq!(FrozenValue::decode(&fz.save_string()).unwrap().former, Former::Default);
    }

    #[test]
    fn test_parse_text_classification() {
        assert_eq!(parse_text("null"), ParsedText::Absent);
        assert_eq!(parse_text("5"), ParsedText::Simple(Value::number(5.0)));
        assert_eq!(parse_text("!(+ A B)"), ParsedText::Function("!(+ A B)".into()));
        assert_eq!(parse_text("{(+ A B)"), ParsedText::Function("{(+ A B)".into()));
        assert_eq!(parse_text("five"), ParsedText::Malformed("five".into()));
        assert_eq!(parse_text("#no-separator"), ParsedText::Malformed("#no-separator".into()));
        assert!(matches!(parse_text("#5\u{1}6"), ParsedText::Frozen(_)));
    }

    #[test]
    fn test_datafile_text_marks_read_only() {
        let ro = StoredValue::Simple(Value::number(3.0).with_editable(false));
        assert_eq!(ro.datafile_text(), "=3");
        let rw = StoredValue::Simple(Value::text("a"));
        assert_eq!(rw.datafile_text(), "\"a");
        let bad = StoredValue::Malformed("12x".into());
        assert_eq!(bad.datafile_text(), "12x");
        assert!(!bad.is_editable());
    }
}
