//! Builder configuration.
//!
//! Read from `kiln.toml` in the working directory, or from the file named by
//! `--config` / `KILN_CONFIG`. Every key is optional:
//!
//! ```toml
//! cache_dir = "/var/cache/kiln"
//! max_parallel = 4
//!
//! [retry]
//! attempts = 3
//! backoff_ms = 250
//!
//! [log]
//! format = "json"
//! level = "debug"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use kiln_common::{KilnError, KilnPaths, KilnResult};
use serde::{Deserialize, Serialize};

use crate::executor::default_parallelism;
use crate::runner::RetryPolicy;

/// Builder configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KilnConfig {
    /// Layer cache directory. Defaults to `$KILN_ROOT/cache`.
    pub cache_dir: Option<PathBuf>,
    /// Parent directory for stage root filesystems. Defaults to `$KILN_ROOT/work`.
    pub work_dir: Option<PathBuf>,
    /// Maximum stages run at once. Defaults to the CPU count.
    pub max_parallel: Option<usize>,
    /// RUN retry settings.
    pub retry: RetryConfig,
    /// Logging settings.
    pub log: LogConfig,
}

/// `[retry]` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Total attempts per RUN.
    pub attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            attempts: policy.attempts,
            backoff_ms: u64::try_from(policy.backoff.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// `[log]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    /// Output format.
    pub format: LogFormat,
    /// Default level for kiln's own targets.
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Pretty,
            level: "info".to_string(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

impl KilnConfig {
    /// File looked up in the working directory.
    pub const FILE_NAME: &'static str = "kiln.toml";

    /// Parse TOML.
    ///
    /// # Errors
    ///
    /// Returns a config error for invalid TOML or unknown keys.
    pub fn from_toml(content: &str) -> KilnResult<Self> {
        let config: Self = toml::from_str(content).map_err(|e| KilnError::Config {
            message: format!("Failed to parse TOML: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Read a config file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is unreadable or invalid.
    pub fn from_file(path: &Path) -> KilnResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| KilnError::Config {
            message: format!("Failed to read {}: {e}", path.display()),
        })?;
        Self::from_toml(&content)
    }

    /// Load `explicit` if given, else `./kiln.toml` if present, else defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the chosen file is unreadable or invalid.
    pub fn load(explicit: Option<&Path>) -> KilnResult<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        let local = Path::new(Self::FILE_NAME);
        if local.is_file() {
            tracing::debug!(path = %local.display(), "Loading config");
            return Self::from_file(local);
        }
        Ok(Self::default())
    }

    fn validate(&self) -> KilnResult<()> {
        if self.max_parallel == Some(0) {
            return Err(KilnError::Config {
                message: "max_parallel must be at least 1".to_string(),
            });
        }
        if self.retry.attempts == 0 {
            return Err(KilnError::Config {
                message: "retry.attempts must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Effective cache directory.
    #[must_use]
    pub fn cache_dir(&self, paths: &KilnPaths) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(|| paths.cache())
    }

    /// Effective work directory.
    #[must_use]
    pub fn work_dir(&self, paths: &KilnPaths) -> PathBuf {
        self.work_dir.clone().unwrap_or_else(|| paths.work())
    }

    /// Effective parallelism.
    #[must_use]
    pub fn parallelism(&self) -> usize {
        self.max_parallel.unwrap_or_else(default_parallelism)
    }

    /// Effective retry policy.
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.retry.attempts,
            backoff: Duration::from_millis(self.retry.backoff_ms),
        }
    }
}
