//! Deployment settings
//!
//! Loaded from an optional TOML file, then overridden by `AUTOTRANSFORM_*`
//! environment variables (secrets and paths usually arrive that way).

use crate::error::SettingsError;
use crate::vcs::VcsProvider;
use at_model::{BackoffConfig, OpenAiConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "AUTOTRANSFORM_";

/// Version-control provider selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VcsSettings {
    pub provider: VcsProvider,
    pub token: Option<String>,
    /// REST API root of the provider
    pub api_url: String,
}

impl Default for VcsSettings {
    fn default() -> Self {
        Self {
            provider: VcsProvider::None,
            token: None,
            api_url: "https://api.github.com".to_string(),
        }
    }
}

/// Log output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
    pub json: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Everything a deployment configures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub model: OpenAiConfig,
    /// Transport retry for model and version-control calls
    pub transport_retry: BackoffConfig,
    /// Attempt budget per job
    pub max_attempts: u32,
    pub record_timeout_secs: u64,
    /// Records executed concurrently within one cycle
    pub execution_concurrency: usize,
    /// Root for stored input/output batches
    pub data_dir: PathBuf,
    /// Interpreter used by the subprocess sandbox
    pub python: String,
    pub vcs: VcsSettings,
    /// Public URL of this service, linked from change-request bodies
    pub base_url: Option<String>,
    /// Keep model transcripts on attempts
    pub debug_transcripts: bool,
    pub log: LogSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            model: OpenAiConfig::default(),
            transport_retry: BackoffConfig::default(),
            max_attempts: 5,
            record_timeout_secs: 10,
            execution_concurrency: 8,
            data_dir: PathBuf::from("./autotransform-data"),
            python: "python3".to_string(),
            vcs: VcsSettings::default(),
            base_url: None,
            debug_transcripts: false,
            log: LogSettings::default(),
        }
    }
}

impl Settings {
    /// Load `path` (if any) and apply process environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
        let mut settings = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml(&text)?
            }
            None => Self::default(),
        };
        settings.apply_overrides(std::env::vars())?;
        Ok(settings)
    }

    pub fn from_toml(text: &str) -> Result<Self, SettingsError> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `AUTOTRANSFORM_*` pairs; unrelated keys are ignored
    pub fn apply_overrides<I, K, V>(&mut self, vars: I) -> Result<(), SettingsError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        for (key, value) in vars {
            let Some(name) = key.as_ref().strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let value: String = value.into();
            let invalid = || SettingsError::InvalidOverride {
                key: key.as_ref().to_string(),
                value: value.clone(),
            };
            match name {
                "MODEL_BASE_URL" => self.model.base_url = value.clone(),
                "MODEL_API_KEY" => self.model.api_key = value.clone(),
                "MODEL_NAME" => self.model.model = value.clone(),
                "MODEL_TIMEOUT_SECS" => self.model.timeout_secs = value.parse().map_err(|_| invalid())?,
                "MAX_ATTEMPTS" => self.max_attempts = value.parse().map_err(|_| invalid())?,
                "RECORD_TIMEOUT_SECS" => {
                    self.record_timeout_secs = value.parse().map_err(|_| invalid())?;
                }
                "EXECUTION_CONCURRENCY" => {
                    self.execution_concurrency = value.parse().map_err(|_| invalid())?;
                }
                "DATA_DIR" => self.data_dir = PathBuf::from(&value),
                "PYTHON" => self.python = value.clone(),
                "VCS_PROVIDER" => self.vcs.provider = value.parse().map_err(|_| invalid())?,
                "VCS_TOKEN" => self.vcs.token = Some(value.clone()),
                "VCS_API_URL" => self.vcs.api_url = value.clone(),
                "BASE_URL" => self.base_url = Some(value.clone()),
                "DEBUG_TRANSCRIPTS" => self.debug_transcripts = parse_bool(&value).ok_or_else(invalid)?,
                "LOG_LEVEL" => self.log.level = value.clone(),
                "LOG_JSON" => self.log.json = parse_bool(&value).ok_or_else(invalid)?,
                other => tracing::debug!("ignoring unknown setting override {}{}", ENV_PREFIX, other),
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn record_timeout(&self) -> Duration {
        Duration::from_secs(self.record_timeout_secs)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
