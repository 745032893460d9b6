//! Environment file loading
//!
//! Two consumers share this module: the `.env` file that sits next to a
//! compose file (loaded into the interpolation environment before parsing),
//! and per-service `env_file:` entries (merged into the service environment
//! during conversion).

use crate::compose::interpolate::is_valid_env_name;
use crate::error::{ConvoyError, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Maximum size before a warning is emitted
const MAX_ENV_FILE_BYTES: u64 = 1024 * 1024;

/// Load the `.env` file in `dir`, if any, into `env`.
///
/// Keys already present in `env` win (shell environment beats dotenv).
/// Invalid names are warned and skipped. Oversized or group/other-readable
/// files produce warnings but still load.
pub fn load_dot_env(dir: &Path, env: &mut BTreeMap<String, String>) -> Result<()> {
    let path = dir.join(".env");
    if !path.exists() {
        return Ok(());
    }

    let metadata = std::fs::metadata(&path)?;
    if metadata.len() > MAX_ENV_FILE_BYTES {
        warn!(
            "{} is larger than 1 MB ({} bytes); loading anyway",
            path.display(),
            metadata.len()
        );
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = metadata.permissions().mode();
        if mode & 0o044 != 0 {
            warn!(
                "{} is readable by group or other (mode {:o})",
                path.display(),
                mode & 0o777
            );
        }
    }

    let content = std::fs::read_to_string(&path)?;
    for (key, value) in parse_env_content(&content, env) {
        env.entry(key).or_insert(value);
    }
    Ok(())
}

/// Read a service `env_file:` entry.
///
/// `./`-prefixed and relative paths resolve against `base_dir`; `~` expands
/// to the user home directory.
pub fn read_env_file(
    spec: &str,
    base_dir: &Path,
    base_env: &BTreeMap<String, String>,
) -> Result<Vec<(String, String)>> {
    let path = resolve_path(spec, base_dir, base_env);
    let content = std::fs::read_to_string(&path)
        .map_err(|e| ConvoyError::NotFound(format!("env file {}: {}", path.display(), e)))?;
    Ok(parse_env_content(&content, base_env))
}

/// Parse `KEY=VAL` content.
///
/// Supports `export` prefixes, `#` comments, quoted values, and nested
/// `${VAR}` / `$VAR` expansion against earlier keys in the same file, then
/// `base_env`. Entries with invalid names are warned and skipped.
pub fn parse_env_content(
    content: &str,
    base_env: &BTreeMap<String, String>,
) -> Vec<(String, String)> {
    let mut entries: Vec<(String, String)> = Vec::new();

    for (line_no, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").map(str::trim).unwrap_or(line);

        let Some((key, value)) = line.split_once('=') else {
            warn!("env line {} has no '=', skipping: {}", line_no + 1, raw);
            continue;
        };
        let key = key.trim();
        if !is_valid_env_name(key) {
            warn!("invalid environment variable name '{}', skipping", key);
            continue;
        }

        let value = value.trim();
        let value = if let Some(inner) = strip_quotes(value, '\'') {
            // single quotes suppress expansion
            inner.to_string()
        } else if let Some(inner) = strip_quotes(value, '"') {
            expand(&unescape(inner), &entries, base_env)
        } else {
            expand(value, &entries, base_env)
        };

        entries.push((key.to_string(), value));
    }

    entries
}

fn resolve_path(spec: &str, base_dir: &Path, env: &BTreeMap<String, String>) -> PathBuf {
    if let Some(rest) = spec.strip_prefix("~/") {
        if let Some(home) = env.get("HOME") {
            return Path::new(home).join(rest);
        }
    }
    let path = Path::new(spec.strip_prefix("./").unwrap_or(spec));
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

fn strip_quotes(s: &str, quote: char) -> Option<&str> {
    if s.len() >= 2 && s.starts_with(quote) && s.ends_with(quote) {
        Some(&s[1..s.len() - 1])
    } else {
        None
    }
}

fn unescape(s: &str) -> String {
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
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Lenient `${VAR}` / `$VAR` expansion: earlier keys in the same file win
/// over `base_env`; unresolvable references expand to the empty string, and
/// malformed references are left as written.
fn expand(value: &str, prior: &[(String, String)], base_env: &BTreeMap<String, String>) -> String {
    let lookup = |name: &str| -> String {
        prior
            .iter()
            .rev()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
            .or_else(|| base_env.get(name).cloned())
            .unwrap_or_default()
    };

    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(idx) = rest.find('$') {
        out.push_str(&rest[..idx]);
        let tail = &rest[idx + 1..];
        if let Some(inner_end) = tail.strip_prefix('{').and_then(|t| t.find('}')) {
            let inner = &tail[1..1 + inner_end];
            let (name, default) = match inner.split_once(":-") {
                Some((n, d)) => (n, Some(d)),
                None => (inner, None),
            };
            if is_valid_env_name(name) {
                let resolved = lookup(name);
                if resolved.is_empty() {
                    out.push_str(default.unwrap_or(""));
                } else {
                    out.push_str(&resolved);
                }
            } else {
                out.push('$');
                out.push('{');
                out.push_str(inner);
                out.push('}');
            }
            rest = &tail[inner_end + 2..];
        } else {
            let end = tail
                .char_indices()
                .find(|(_, c)| !(c.is_ascii_alphanumeric() || *c == '_'))
                .map(|(i, _)| i)
                .unwrap_or(tail.len());
            let name = &tail[..end];
            if !name.is_empty() && is_valid_env_name(name) {
                out.push_str(&lookup(name));
            } else {
                out.push('$');
                out.push_str(name);
            }
            rest = &tail[end..];
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_basic_pairs() {
        let entries = parse_env_content("A=1\nB=two\n", &base(&[]));
        assert_eq!(entries, vec![("A".into(), "1".into()), ("B".into(), "two".into())]);
    }

    #[test]
    fn test_comments_and_blanks_skipped() {
        let entries = parse_env_content("# comment\n\nA=1\n", &base(&[]));
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_export_prefix() {
        let entries = parse_env_content("export PATH_EXTRA=/opt/bin\n", &base(&[]));
        assert_eq!(entries[0].0, "PATH_EXTRA");
    }

    #[test]
    fn test_quoted_values() {
        let entries = parse_env_content("A=\"hello world\"\nB='single'\n", &base(&[]));
        assert_eq!(entries[0].1, "hello world");
        assert_eq!(entries[1].1, "single");
    }

    #[test]
    fn test_double_quote_escapes() {
        let entries = parse_env_content("A=\"line1\\nline2\"\n", &base(&[]));
        assert_eq!(entries[0].1, "line1\nline2");
    }

    #[test]
    fn test_nested_expansion_prior_keys_win() {
        let entries = parse_env_content("A=1\nB=${A}2\n", &base(&[("A", "nine")]));
        assert_eq!(entries[1].1, "12");
    }

    #[test]
    fn test_expansion_falls_back_to_base_env() {
        let entries = parse_env_content("B=$HOST:8080\n", &base(&[("HOST", "db")]));
        assert_eq!(entries[0].1, "db:8080");
    }

    #[test]
    fn test_single_quotes_suppress_expansion() {
        let entries = parse_env_content("B='$HOST'\n", &base(&[("HOST", "db")]));
        assert_eq!(entries[0].1, "$HOST");
    }

    #[test]
    fn test_invalid_name_skipped() {
        let entries = parse_env_content("9BAD=1\nGOOD=2\n", &base(&[]));
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "GOOD");
    }

    #[test]
    fn test_load_dot_env_shell_wins() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".env"), "A=from_file\nB=only_file\n").unwrap();

        let mut env = base(&[("A", "from_shell")]);
        load_dot_env(dir.path(), &mut env).unwrap();

        assert_eq!(env.get("A").unwrap(), "from_shell");
        assert_eq!(env.get("B").unwrap(), "only_file");
    }

    #[test]
    fn test_load_dot_env_missing_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = base(&[]);
        load_dot_env(dir.path(), &mut env).unwrap();
        assert!(env.is_empty());
    }

    #[test]
    fn test_read_env_file_relative() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("svc.env"), "PORT=9000\n").unwrap();

        let entries = read_env_file("./svc.env", dir.path(), &base(&[])).unwrap();
        assert_eq!(entries, vec![("PORT".into(), "9000".into())]);
    }

    #[test]
    fn test_read_env_file_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_env_file("missing.env", dir.path(), &base(&[])).unwrap_err();
        assert!(err.is_not_found());
    }
}
