//! Redaction of secrets and oversized values before traces leave the host.

use regex::Regex;
use serde_json::{Map, Value};

use crate::{AppError, Result};

/// Replacement for redacted values.
pub const REDACTED: &str = "[REDACTED]";

/// Longest string kept verbatim, in bytes.
pub const MAX_STRING_BYTES: usize = 4096;

/// Object keys whose values are always redacted.
const SECRET_KEY_PATTERN: &str = r"(?i)(pass(word|wd)?|secret|token|api[_-]?key|authorization|credential|private[_-]?key|cookie)";

/// Secret-looking fragments inside free text.
const SECRET_VALUE_PATTERN: &str =
    r"(?i)(bearer\s+[a-z0-9._~+/=-]+|\bsk-[a-z0-9_-]{16,}|\bgh[pousr]_[a-z0-9]{20,})";

/// Compiled redaction rules.
#[derive(Debug, Clone)]
pub struct Sanitizer {
    secret_key: Regex,
    secret_value: Regex,
    max_string_bytes: usize,
}

impl Sanitizer {
    /// Compile the default rules.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if a pattern fails to compile.
    pub fn new() -> Result<Self> {
        Self::with_limit(MAX_STRING_BYTES)
    }

    /// Compile the default rules with a custom string limit.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if a pattern fails to compile.
    pub fn with_limit(max_string_bytes: usize) -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern)
                .map_err(|err| AppError::Config(format!("invalid redaction pattern: {err}")))
        };
        Ok(Self {
            secret_key: compile(SECRET_KEY_PATTERN)?,
            secret_value: compile(SECRET_VALUE_PATTERN)?,
            max_string_bytes,
        })
    }

    /// Sanitized copy of `value`.
    #[must_use]
    pub fn sanitize(&self, value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let cleaned: Map<String, Value> = map
                    .iter()
                    .map(|(key, inner)| {
                        let inner = if self.secret_key.is_match(key) {
                            Value::String(REDACTED.into())
                        } else {
                            self.sanitize(inner)
                        };
                        (key.clone(), inner)
                    })
                    .collect();
                Value::Object(cleaned)
            }
            Value::Array(items) => Value::Array(items.iter().map(|v| self.sanitize(v)).collect()),
            Value::String(text) => Value::String(self.sanitize_text(text)),
            other => other.clone(),
        }
    }

    /// Redact secret fragments in `text` and cap its length.
    #[must_use]
    pub fn sanitize_text(&self, text: &str) -> String {
        let redacted = self.secret_value.replace_all(text, REDACTED);
        truncate_text(&redacted, self.max_string_bytes)
    }
}

/// Cap `text` at `max_len` bytes on a char boundary, marking the cut with
/// `...` when there is room for it.
#[must_use]
pub fn truncate_text(text: &str, max_len: usize) -> String {
    if text.len() <= max_len {
        return text.to_owned();
    }
    let marker = if max_len >= 3 { "..." } else { "" };
    let mut cut = max_len - marker.len();
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{marker}", &text[..cut])
}
