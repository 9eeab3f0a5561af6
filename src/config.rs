//! Runtime configuration.
//!
//! Loaded from TOML at `$XDG_CONFIG_HOME/loo-agent/config.toml` (or an
//! explicit path); every field has a default so an empty or absent file is
//! valid. Command-line flags are applied on top by the binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::EngineConfig;
use crate::oracle::registry;
use crate::oracle::{DevicePreference, OracleConfig};

/// Directory name under the XDG config home.
pub const APP_DIR: &str = "loo-agent";
pub const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("failed to read config: {path}")]
    #[diagnostic(
        code(loo::config::read),
        help("Ensure the config file exists and is readable.")
    )]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {path}: {message}")]
    #[diagnostic(
        code(loo::config::parse),
        help("Check the TOML syntax and field names in the config file.")
    )]
    Parse { path: String, message: String },

    #[error("invalid value for `{field}`: {message}")]
    #[diagnostic(code(loo::config::invalid))]
    Invalid { field: &'static str, message: String },
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LooConfig {
    /// Registry key or literal model identifier.
    #[serde(default = "default_model")]
    pub model: String,
    /// Hub revision to pin.
    #[serde(default)]
    pub revision: Option<String>,
    /// Force CPU even when an accelerator is present.
    #[serde(default)]
    pub cpu: bool,
    #[serde(default = "default_max_context")]
    pub max_context: usize,
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: usize,
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Wall-clock budget per attribution call, in seconds.
    #[serde(default)]
    pub budget_secs: Option<f64>,
    #[serde(default)]
    pub parallel: bool,
    /// Plain-text tables without colour or box drawing.
    #[serde(default)]
    pub plain: bool,
}

fn default_model() -> String {
    registry::DEFAULT_MODEL_KEY.to_string()
}

fn default_max_context() -> usize {
    2048
}

fn default_max_new_tokens() -> usize {
    150
}

fn default_retries() -> u32 {
    1
}

impl Default for LooConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            revision: None,
            cpu: false,
            max_context: default_max_context(),
            max_new_tokens: default_max_new_tokens(),
            retries: default_retries(),
            budget_secs: None,
            parallel: false,
            plain: false,
        }
    }
}

impl LooConfig {
    /// Load from a TOML file.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::parse(&content, path)
    }

    fn parse(content: &str, path: &Path) -> ConfigResult<Self> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load `explicit` if given (it must exist), else the XDG config file if
    /// present, else defaults.
    pub fn discover(explicit: Option<&Path>) -> ConfigResult<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match default_path() {
            Some(path) if path.is_file() => {
                tracing::debug!(path = %path.display(), "loading config");
                Self::load(&path)
            }
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.model.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "model",
                message: "must not be empty".into(),
            });
        }
        self.check_context(self.max_context)?;
        self.budget()?;
        Ok(())
    }

    /// Check that a context limit leaves room for a prompt next to
    /// `max_new_tokens`. The loaded model may lower the configured limit, so
    /// the binary repeats this check once the oracle is up.
    pub fn check_context(&self, max_context: usize) -> ConfigResult<()> {
        if max_context <= self.max_new_tokens {
            return Err(ConfigError::Invalid {
                field: "max_context",
                message: format!(
                    "{max_context} leaves no room for a prompt with max_new_tokens = {}",
                    self.max_new_tokens
                ),
            });
        }
        Ok(())
    }

    /// The budget as a duration.
    pub fn budget(&self) -> ConfigResult<Option<Duration>> {
        self.budget_secs
            .map(|secs| {
                Duration::try_from_secs_f64(secs).map_err(|e| ConfigError::Invalid {
                    field: "budget_secs",
                    message: e.to_string(),
                })
            })
            .transpose()
    }

    /// Model identifier after registry resolution.
    pub fn model_id(&self) -> String {
        registry::resolve(&self.model)
    }

    pub fn engine_config(&self) -> ConfigResult<EngineConfig> {
        Ok(EngineConfig {
            max_new_tokens: self.max_new_tokens,
            retries: self.retries,
            budget: self.budget()?,
            parallel: self.parallel,
        })
    }

    pub fn oracle_config(&self) -> OracleConfig {
        OracleConfig {
            model_id: self.model_id(),
            revision: self.revision.clone(),
            device: if self.cpu {
                DevicePreference::Cpu
            } else {
                DevicePreference::Auto
            },
            max_context: self.max_context,
        }
    }
}

/// `$XDG_CONFIG_HOME/loo-agent/config.toml`, falling back to `$HOME/.config`.
pub fn default_path() -> Option<PathBuf> {
    config_path_from(
        std::env::var_os("XDG_CONFIG_HOME").map(PathBuf::from),
        std::env::var_os("HOME").map(PathBuf::from),
    )
}

fn config_path_from(xdg: Option<PathBuf>, home: Option<PathBuf>) -> Option<PathBuf> {
    let base = xdg
        .filter(|p| p.is_absolute())
        .or_else(|| home.map(|h| h.join(".config")))?;
    Some(base.join(APP_DIR).join(CONFIG_FILE))
}
