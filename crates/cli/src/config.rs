//! Runtime configuration: `payplan.toml`, environment overrides, defaults.
//!
//! # Example
//!
//! ```toml
//! workers = 4
//! default_precision = "standard"
//! default_mode = "lenient"
//!
//! [precision_modes.payroll]
//! scale = 2
//! rounding = "half_up"
//! ```
//!
//! `PAYPLAN_WORKERS`, `PAYPLAN_PRECISION` and `PAYPLAN_MODE` override the
//! file; command-line flags override both.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use payplan_eval::{ExecutionMode, PrecisionMode, Rounding};
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("could not parse '{}': {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid {key}: {message}")]
    Invalid { key: String, message: String },

    #[error("unknown precision mode '{0}'")]
    UnknownPrecision(String),
}

// ── File format ───────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    workers: Option<usize>,
    default_precision: Option<String>,
    default_mode: Option<String>,
    #[serde(default)]
    precision_modes: BTreeMap<String, PrecisionModeConfig>,
}

/// `[precision_modes.<name>]`
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PrecisionModeConfig {
    scale: u32,
    rounding: String,
}

// ── Resolved settings ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Settings {
    pub workers: usize,
    pub default_precision: String,
    pub default_mode: ExecutionMode,
    custom_modes: BTreeMap<String, PrecisionMode>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            default_precision: PrecisionMode::standard().name,
            default_mode: ExecutionMode::Lenient,
            custom_modes: BTreeMap::new(),
        }
    }
}

impl Settings {
    /// Load from `path` (if any) and apply the process environment.
    pub fn load(path: Option<&Path>) -> Result<Settings, ConfigError> {
        let file = match path {
            Some(path) => read_file(path)?,
            None => FileConfig::default(),
        };
        Settings::resolve(file, |key| std::env::var(key).ok())
    }

    /// Parse TOML text and apply overrides from `env`.
    pub fn from_toml(
        text: &str,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Settings, ConfigError> {
        let file: FileConfig = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        Settings::resolve(file, env)
    }

    fn resolve(
        file: FileConfig,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Settings, ConfigError> {
        let mut settings = Settings::default();

        for (name, mode) in file.precision_modes {
            if PrecisionMode::builtin(&name).is_some() {
                return Err(invalid(
                    format!("precision_modes.{name}"),
                    "built-in precision modes cannot be redefined",
                ));
            }
            let rounding: Rounding = mode
                .rounding
                .parse()
                .map_err(|e: String| invalid(format!("precision_modes.{name}.rounding"), e))?;
            let resolved = PrecisionMode::new(name.clone(), mode.scale, rounding)
                .map_err(|e| invalid(format!("precision_modes.{name}.scale"), e))?;
            settings.custom_modes.insert(name, resolved);
        }

        if let Some(workers) = file.workers {
            settings.workers = workers;
        }
        if let Some(raw) = env("PAYPLAN_WORKERS") {
            settings.workers = raw
                .trim()
                .parse()
                .map_err(|_| invalid("PAYPLAN_WORKERS", format!("'{raw}' is not a number")))?;
        }
        settings.set_workers(settings.workers)?;

        if let Some(name) = env("PAYPLAN_PRECISION").or(file.default_precision) {
            settings.set_default_precision(&name)?;
        }

        if let Some(raw) = env("PAYPLAN_MODE").or(file.default_mode) {
            settings.default_mode = raw.parse().map_err(|e: String| invalid("mode", e))?;
        }

        tracing::debug!(
            workers = settings.workers,
            precision = %settings.default_precision,
            mode = settings.default_mode.as_str(),
            custom_modes = settings.custom_modes.len(),
            "configuration loaded"
        );
        Ok(settings)
    }

    pub fn set_workers(&mut self, workers: usize) -> Result<(), ConfigError> {
        if workers == 0 {
            return Err(invalid("workers", "must be at least 1"));
        }
        self.workers = workers;
        Ok(())
    }

    pub fn set_default_precision(&mut self, name: &str) -> Result<(), ConfigError> {
        self.precision(Some(name))?;
        self.default_precision = name.to_string();
        Ok(())
    }

    /// The named precision mode, or the default when `name` is `None`.
    pub fn precision(&self, name: Option<&str>) -> Result<PrecisionMode, ConfigError> {
        let name = name.unwrap_or(&self.default_precision);
        PrecisionMode::builtin(name)
            .or_else(|| self.custom_modes.get(name).cloned())
            .ok_or_else(|| ConfigError::UnknownPrecision(name.to_string()))
    }

    /// Names of every available precision mode.
    pub fn precision_names(&self) -> Vec<String> {
        PrecisionMode::builtins()
            .into_iter()
            .map(|m| m.name)
            .chain(self.custom_modes.keys().cloned())
            .collect()
    }
}

fn read_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn invalid(key: impl Into<String>, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key: key.into(),
        message: message.into(),
    }
}
