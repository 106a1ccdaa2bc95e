//! Engine configuration
//!
//! Loaded from YAML (`config.yaml` in the data directory, or an explicit
//! path). Every field has a default, so an empty or missing file yields the
//! stock thresholds.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Allowed range for the post-hoc duplicate threshold
pub const POST_HOC_RANGE: (f32, f32) = (0.50, 0.95);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Similarity cutoffs and plan sizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    /// Backlog scan cutoff
    pub post_hoc: f32,
    /// Batch check cutoff
    pub pre_hoc: f32,
    /// AI merge plan cutoff
    pub plan: f32,
    /// Maximum pairs per plan
    pub plan_limit: usize,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            post_hoc: 0.80,
            pre_hoc: 0.85,
            plan: 0.92,
            plan_limit: 50,
        }
    }
}

/// Backlog health limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthLimits {
    pub max_pending: usize,
    pub max_oldest_days: i64,
}

impl Default for HealthLimits {
    fn default() -> Self {
        Self {
            max_pending: 100,
            max_oldest_days: 7,
        }
    }
}

/// Async job polling cadence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub interval_ms: u64,
    pub max_attempts: u32,
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: 2_000,
            max_attempts: 180,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub thresholds: ThresholdConfig,
    pub health: HealthLimits,
    pub poll: PollConfig,
    /// Rows returned by the refreshed candidate view after a mutation
    pub page_size: usize,
    /// SQLite database path; defaults to the data directory
    pub database: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            thresholds: ThresholdConfig::default(),
            health: HealthLimits::default(),
            poll: PollConfig::default(),
            page_size: 200,
            database: None,
        }
    }
}

impl EngineConfig {
    /// `~/.local/share/codebook` (or the platform equivalent)
    pub fn data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| dirs::home_dir().unwrap_or_default().join(".local/share"))
            .join("codebook")
    }

    pub fn default_path() -> PathBuf {
        Self::data_dir().join("config.yaml")
    }

    pub fn database_path(&self) -> PathBuf {
        self.database
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("codebook.db"))
    }

    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    /// Load `path`, or the default location if it exists, or defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => Self::load(p),
            None => {
                let default = Self::default_path();
                if default.exists() {
                    Self::load(default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.thresholds;
        let (lo, hi) = POST_HOC_RANGE;
        if !(lo..=hi).contains(&t.post_hoc) {
            return Err(ConfigError::Invalid(format!(
                "thresholds.post_hoc {} outside [{}, {}]",
                t.post_hoc, lo, hi
            )));
        }
        for (name, value) in [("pre_hoc", t.pre_hoc), ("plan", t.plan)] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(ConfigError::Invalid(format!(
                    "thresholds.{} {} outside (0, 1]",
                    name, value
                )));
            }
        }
        if t.plan_limit == 0 {
            return Err(ConfigError::Invalid("thresholds.plan_limit must be positive".into()));
        }
        if self.poll.max_attempts == 0 {
            return Err(ConfigError::Invalid("poll.max_attempts must be positive".into()));
        }
        if self.page_size == 0 {
            return Err(ConfigError::Invalid("page_size must be positive".into()));
        }
        Ok(())
    }
}
