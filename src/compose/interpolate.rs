//! Environment variable interpolation
//!
//! Compose file text is interpolated before YAML decoding. Supported forms
//! are `${NAME}`, `${NAME:-default}`, and `$NAME`; `$$` produces a literal
//! dollar sign. Unset variables without a default substitute as the empty
//! string.

use crate::error::{ConvoyError, Result};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Pattern an environment variable name must match
pub const ENV_NAME_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9_]*$";

fn env_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(ENV_NAME_PATTERN).expect("env name pattern"))
}

/// Whether `name` is a valid environment variable name.
pub fn is_valid_env_name(name: &str) -> bool {
    env_name_regex().is_match(name)
}

/// Interpolate variable references in `text` against `env`.
pub fn interpolate(text: &str, env: &BTreeMap<String, String>) -> Result<String> {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.char_indices().peekable();

    while let Some((pos, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some((_, '$')) => {
                chars.next();
                out.push('$');
            }
            Some((start, '{')) => {
                let start = *start;
                chars.next();
                let end = text[start..]
                    .find('}')
                    .map(|i| start + i)
                    .ok_or_else(|| {
                        ConvoyError::InvalidArgument(format!(
                            "unterminated variable reference at offset {}",
                            pos
                        ))
                    })?;
                let inner = &text[start + 1..end];
                while chars.peek().is_some_and(|(i, _)| *i <= end) {
                    chars.next();
                }
                let (name, default) = match inner.split_once(":-") {
                    Some((name, default)) => (name, Some(default)),
                    None => (inner, None),
                };
                if !is_valid_env_name(name) {
                    return Err(ConvoyError::InvalidArgument(format!(
                        "invalid variable name '{}' in interpolation",
                        name
                    )));
                }
                match env.get(name) {
                    Some(value) => out.push_str(value),
                    None => out.push_str(default.unwrap_or("")),
                }
            }
            Some((start, ch)) if ch.is_ascii_alphabetic() || *ch == '_' => {
                let start = *start;
                let mut end = text.len();
                for (i, ch) in text[start..].char_indices() {
                    if !(ch.is_ascii_alphanumeric() || ch == '_') {
                        end = start + i;
                        break;
                    }
                }
                let name = &text[start..end];
                while chars.peek().is_some_and(|(i, _)| *i < end) {
                    chars.next();
                }
                out.push_str(env.get(name).map(String::as_str).unwrap_or(""));
            }
            _ => {
                return Err(ConvoyError::InvalidArgument(format!(
                    "invalid variable reference at offset {}",
                    pos
                )));
            }
        }
    }

    Ok(out)
}
