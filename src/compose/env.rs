//! Environment file loading
//!
//! Env files are read once per run, when a service is launched. Their
//! contents never become part of the loaded project.

use crate::error::{ComposeError, Result};
use indexmap::IndexMap;
use std::path::{Path, PathBuf};

/// Parse the contents of an env file.
///
/// Supports `KEY=VALUE`, an optional `export ` prefix, `#` comment lines and
/// single or double quoted values. Double quoted values understand `\n`, `\"`
/// and `\\` escapes; single quoted values are taken literally.
pub fn parse_env_str(content: &str) -> Result<IndexMap<String, String>> {
    let mut vars = IndexMap::new();

    for (idx, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line).trim_start();

        let Some((key, value)) = line.split_once('=') else {
            tracing::debug!("Ignoring env line {} without '=': {}", idx + 1, line);
            continue;
        };

        let key = key.trim();
        if key.is_empty() || key.chars().any(char::is_whitespace) {
            return Err(ComposeError::malformed(format!(
                "invalid variable name at line {}: '{}'",
                idx + 1,
                key
            )));
        }

        vars.insert(key.to_string(), unquote(value.trim()));
    }

    Ok(vars)
}

fn unquote(value: &str) -> String {
    if value.len() >= 2 && value.starts_with('\'') && value.ends_with('\'') {
        return value[1..value.len() - 1].to_string();
    }

    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        let inner = &value[1..value.len() - 1];
        let mut out = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            if c == '\\' {
                match chars.next() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some(other) => out.push(other),
                    None => out.push('\\'),
                }
            } else {
                out.push(c);
            }
        }
        return out;
    }

    // Unquoted values may carry a trailing comment
    match value.find(" #") {
        Some(pos) => value[..pos].trim_end().to_string(),
        None => value.to_string(),
    }
}

/// Read and parse a single env file
pub fn load_env_file(path: &Path) -> Result<IndexMap<String, String>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        ComposeError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read env file {}: {}", path.display(), e),
        ))
    })?;

    parse_env_str(&content)
}

/// Read env files in order; later files override earlier ones
pub fn load_env_files(paths: &[PathBuf]) -> Result<IndexMap<String, String>> {
    let mut vars = IndexMap::new();
    for path in paths {
        vars.extend(load_env_file(path)?);
    }
    Ok(vars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_env_str() {
        let content = r#"
# database
DATABASE_URL=psql://postgres@db:5432/postgres
export REDIS_URL=redis://redis:6379/0
QUOTED="hello \"world\""
LITERAL='$NOT_EXPANDED'
TRAILING=value # comment
EMPTY=
"#;

        let vars = parse_env_str(content).unwrap();
        assert_eq!(vars["DATABASE_URL"], "psql://postgres@db:5432/postgres");
        assert_eq!(vars["REDIS_URL"], "redis://redis:6379/0");
        assert_eq!(vars["QUOTED"], "hello \"world\"");
        assert_eq!(vars["LITERAL"], "$NOT_EXPANDED");
        assert_eq!(vars["TRAILING"], "value");
        assert_eq!(vars["EMPTY"], "");
    }

    #[test]
    fn test_invalid_key_is_rejected() {
        assert!(parse_env_str("BAD KEY=1").is_err());
    }

    #[test]
    fn test_later_files_override() {
        let temp = tempdir().unwrap();
        let first = temp.path().join(".env");
        let second = temp.path().join(".env.local");
        std::fs::write(&first, "A=1\nB=1\n").unwrap();
        std::fs::write(&second, "B=2\n").unwrap();

        let vars = load_env_files(&[first, second]).unwrap();
        assert_eq!(vars["A"], "1");
        assert_eq!(vars["B"], "2");
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let temp = tempdir().unwrap();
        assert!(load_env_file(&temp.path().join("missing.env")).is_err());
    }
}
