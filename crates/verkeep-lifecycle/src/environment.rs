use std::fs;
use std::io;
use std::path::Path;

use anyhow::{Context, Result};

use crate::fs_utils::write_atomic;

/// Drops every `var=` / `export var=` line from `raw` and, when `value` is set,
/// appends a fresh `var=value` line. Everything else is kept as is.
pub fn apply_env_assignment(raw: &str, var: &str, value: Option<&str>) -> String {
    let mut out = String::with_capacity(raw.len() + var.len() + 32);
    for line in raw.lines() {
        if assigns(line, var) {
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    if let Some(value) = value {
        out.push_str(var);
        out.push('=');
        out.push_str(&quote_value(value));
        out.push('\n');
    }
    out
}

fn assigns(line: &str, var: &str) -> bool {
    let trimmed = line.trim_start();
    let trimmed = trimmed
        .strip_prefix("export")
        .filter(|rest| rest.starts_with(char::is_whitespace))
        .map(str::trim_start)
        .unwrap_or(trimmed);
    trimmed
        .strip_prefix(var)
        .is_some_and(|rest| rest.trim_start().starts_with('='))
}

fn quote_value(value: &str) -> String {
    if value.contains(char::is_whitespace) {
        format!("\"{value}\"")
    } else {
        value.to_string()
    }
}

/// Rewrites the assignment of `var` in `path`; a missing file counts as empty.
pub fn rewrite_env_file(path: &Path, var: &str, value: Option<&str>) -> Result<()> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => String::new(),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read environment file {}", path.display()));
        }
    };

    let updated = apply_env_assignment(&raw, var, value);
    if updated == raw {
        return Ok(());
    }
    write_atomic(path, updated.as_bytes())
        .with_context(|| format!("failed to update {var} in {}", path.display()))
}
