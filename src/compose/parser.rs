//! Compose file parser
//!
//! Loading goes text → YAML value → (merge keys, interpolation) → typed
//! [`ComposeConfig`] → validated [`Project`]. Anchors and aliases are resolved
//! by the YAML reader, so a descriptor that reuses a service through
//! `&anchor`/`<<: *anchor` yields the same project as one written out by hand.

use super::config::ComposeConfig;
use super::env::parse_env_str;
use super::model::Project;
use crate::error::{ComposeError, Result};
use regex::{Captures, Regex};
use serde_yaml::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Default compose file names
pub const DEFAULT_COMPOSE_FILES: &[&str] = &[
    "compose.yaml",
    "compose.yml",
    "docker-compose.yaml",
    "docker-compose.yml",
];

/// File in the project directory that supplies interpolation defaults
pub const DOTENV_FILE: &str = ".env";

static VARIABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\$(?:(\$)|\{([A-Za-z_][A-Za-z0-9_]*)(?:(:?[-?])([^}]*))?\}|([A-Za-z_][A-Za-z0-9_]*))",
    )
    .expect("variable pattern is valid")
});

/// Where to load a project from
#[derive(Debug, Clone, Default)]
pub struct ProjectOptions {
    /// Descriptor files, merged in order; empty means discover one in `working_dir`
    pub files: Vec<PathBuf>,
    /// Project name override
    pub project_name: Option<String>,
    /// Project directory
    pub working_dir: PathBuf,
}

/// Compose file parser
pub struct ComposeParser;

impl ComposeParser {
    /// Find compose file in directory
    pub fn find_compose_file(dir: &Path) -> Option<PathBuf> {
        for name in DEFAULT_COMPOSE_FILES {
            let path = dir.join(name);
            if path.exists() {
                return Some(path);
            }
        }
        None
    }

    /// Load and validate a project from disk.
    ///
    /// Interpolation variables come from the process environment, falling back
    /// to a `.env` file in the project directory.
    pub fn load(options: &ProjectOptions) -> Result<Project> {
        let files = if options.files.is_empty() {
            let found = Self::find_compose_file(&options.working_dir).ok_or_else(|| {
                ComposeError::malformed(format!(
                    "no compose file found in {}",
                    options.working_dir.display()
                ))
            })?;
            vec![found]
        } else {
            options.files.clone()
        };

        let env = Self::interpolation_env(&options.working_dir)?;

        let mut config = ComposeConfig::default();
        for path in &files {
            tracing::debug!("Reading compose file {}", path.display());
            let content = std::fs::read_to_string(path).map_err(|e| {
                ComposeError::malformed(format!("failed to read {}: {}", path.display(), e))
            })?;
            config = Self::merge_configs(config, Self::parse_str(&content, &env)?);
        }

        let name = Self::project_name(options.project_name.as_deref(), &config, &options.working_dir);
        Project::from_config(config, &name, &options.working_dir)
    }

    /// Load a project from descriptor text. Pure: reads nothing but its arguments.
    pub fn load_str(
        content: &str,
        project_name: &str,
        working_dir: &Path,
        env: &HashMap<String, String>,
    ) -> Result<Project> {
        let config = Self::parse_str(content, env)?;
        Project::from_config(config, project_name, working_dir)
    }

    /// Parse compose text into the raw descriptor
    pub fn parse_str(content: &str, env: &HashMap<String, String>) -> Result<ComposeConfig> {
        let mut value: Value = serde_yaml::from_str(content)
            .map_err(|e| ComposeError::malformed(format!("failed to parse YAML: {}", e)))?;

        if !value.is_mapping() {
            return Err(ComposeError::malformed(
                "top level of a compose file must be a mapping",
            ));
        }

        value
            .apply_merge()
            .map_err(|e| ComposeError::malformed(format!("failed to apply merge keys: {}", e)))?;
        interpolate(&mut value, env)?;

        serde_yaml::from_value(value)
            .map_err(|e| ComposeError::malformed(format!("invalid compose file: {}", e)))
    }

    /// Merge two compose configurations; `overlay` wins
    pub fn merge_configs(base: ComposeConfig, overlay: ComposeConfig) -> ComposeConfig {
        let mut result = base;

        if overlay.version.is_some() {
            result.version = overlay.version;
        }
        if overlay.name.is_some() {
            result.name = overlay.name;
        }

        for (name, service) in overlay.services {
            match result.services.get_mut(&name) {
                Some(existing) => existing.merge(service),
                None => {
                    result.services.insert(name, service);
                }
            }
        }

        for (name, volume) in overlay.volumes {
            result.volumes.insert(name, volume);
        }
        for (name, network) in overlay.networks {
            result.networks.insert(name, network);
        }

        result
    }

    /// Process environment layered over the project's `.env` file
    pub fn interpolation_env(working_dir: &Path) -> Result<HashMap<String, String>> {
        let mut env = HashMap::new();

        let dotenv = working_dir.join(DOTENV_FILE);
        if dotenv.is_file() {
            let content = std::fs::read_to_string(&dotenv)?;
            env.extend(parse_env_str(&content)?);
        }
        env.extend(std::env::vars());

        Ok(env)
    }

    fn project_name(explicit: Option<&str>, config: &ComposeConfig, working_dir: &Path) -> String {
        explicit
            .map(str::to_string)
            .or_else(|| config.name.clone())
            .unwrap_or_else(|| {
                working_dir
                    .file_name()
                    .and_then(|s| s.to_str())
                    .unwrap_or("default")
                    .to_string()
            })
    }
}

/// Interpolate variables in every string scalar of `value`
pub fn interpolate(value: &mut Value, env: &HashMap<String, String>) -> Result<()> {
    match value {
        Value::String(s) => {
            if s.contains('$') {
                *s = interpolate_string(s, env)?;
            }
        }
        Value::Sequence(seq) => {
            for item in seq {
                interpolate(item, env)?;
            }
        }
        Value::Mapping(map) => {
            for (_, item) in map.iter_mut() {
                interpolate(item, env)?;
            }
        }
        Value::Tagged(tagged) => interpolate(&mut tagged.value, env)?,
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
    Ok(())
}

/// Interpolate `$VAR`, `${VAR}`, `${VAR:-default}`, `${VAR-default}`,
/// `${VAR:?error}`, `${VAR?error}` and the `$$` escape
pub fn interpolate_string(s: &str, env: &HashMap<String, String>) -> Result<String> {
    let mut result = String::with_capacity(s.len());
    let mut last = 0;

    for caps in VARIABLE.captures_iter(s) {
        let Some(whole) = caps.get(0) else { continue };
        result.push_str(&s[last..whole.start()]);
        result.push_str(&substitute(&caps, env)?);
        last = whole.end();
    }
    result.push_str(&s[last..]);

    Ok(result)
}

fn substitute(caps: &Captures<'_>, env: &HashMap<String, String>) -> Result<String> {
    if caps.get(1).is_some() {
        return Ok("$".to_string());
    }

    if let Some(name) = caps.get(5) {
        return Ok(lookup(name.as_str(), env));
    }

    let name = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
    let value = env.get(name);
    let operand = caps.get(4).map(|m| m.as_str()).unwrap_or_default();

    match caps.get(3).map(|m| m.as_str()) {
        None => Ok(lookup(name, env)),
        Some(":-") => Ok(value
            .filter(|v| !v.is_empty())
            .cloned()
            .unwrap_or_else(|| operand.to_string())),
        Some("-") => Ok(value.cloned().unwrap_or_else(|| operand.to_string())),
        Some(":?") if value.map_or(true, |v| v.is_empty()) => Err(ComposeError::malformed(
            format!("required variable {} is missing a value: {}", name, operand),
        )),
        Some("?") if value.is_none() => Err(ComposeError::malformed(format!(
            "required variable {} is missing a value: {}",
            name, operand
        ))),
        Some(_) => Ok(value.cloned().unwrap_or_default()),
    }
}

fn lookup(name: &str, env: &HashMap<String, String>) -> String {
    match env.get(name) {
        Some(value) => value.clone(),
        None => {
            tracing::warn!("The {} variable is not set. Defaulting to a blank string.", name);
            String::new()
        }
    }
}
