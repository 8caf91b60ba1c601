//! `.env` parsing for the dotenv layer.
//!
//! Line grammar: `[export] KEY=VALUE`. Keys are `[A-Za-z0-9_]+`; anything
//! else on the left of `=` invalidates the line and it is dropped with a
//! warning count. Values may be double-quoted (`\"` and `\\` escapes),
//! single-quoted (no escapes), or bare; a bare value ends at an inline
//! ` #` comment.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::ConfigError;

/// Where to look for `.env`: `override_dir` when given, else the current
/// directory. `None` when no file is present.
fn dotenv_path(override_dir: Option<&Path>) -> Option<PathBuf> {
    let dir = match override_dir {
        Some(dir) => dir.to_path_buf(),
        None => std::env::current_dir().ok()?,
    };
    let path = dir.join(".env");
    path.is_file().then_some(path)
}

fn valid_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Classifies one line; `None` covers blanks, comments, and lines that
/// don't form a valid `KEY=VALUE` pair.
fn parse_line(line: &str) -> Option<(String, String)> {
    let line = line.trim_start();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let line = match line.strip_prefix("export ") {
        Some(rest) => rest.trim_start(),
        None => line,
    };
    let (key, rest) = line.split_once('=')?;
    let key = key.trim_end();
    if !valid_key(key) {
        return None;
    }
    Some((key.to_string(), parse_value(rest.trim())))
}

/// Decodes the right-hand side of a pair.
fn parse_value(raw: &str) -> String {
    let mut chars = raw.chars();
    match chars.next() {
        Some('"') => {
            let mut out = String::new();
            let mut escaped = false;
            for c in chars {
                if escaped {
                    out.push(c);
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == '"' {
                    break;
                } else {
                    out.push(c);
                }
            }
            out
        }
        Some('\'') => chars.take_while(|&c| c != '\'').collect(),
        _ => match raw.find(" #") {
            Some(cut) => raw[..cut].trim_end().to_string(),
            None => raw.to_string(),
        },
    }
}

/// Loads the `.env` layer. A missing file is an empty map, not an error;
/// an unreadable file is a [`ConfigError::Read`] carrying the path.
pub fn load_env_map(override_dir: Option<&Path>) -> Result<HashMap<String, String>, ConfigError> {
    let Some(path) = dotenv_path(override_dir) else {
        return Ok(HashMap::new());
    };
    let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.clone(),
        source,
    })?;
    Ok(content.lines().filter_map(parse_line).collect())
}
