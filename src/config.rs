use std::path::{Path, PathBuf};

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::cache::TtlPolicy;
use crate::error::{Error, Result};
use crate::store::DEFAULT_BATCH_SIZE;
use crate::sync::DEFAULT_SUBSCRIBER_SOFT_CAP;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Dashboard and class report freshness, in seconds.
    pub grade_ttl_secs: u64,
    /// Single-student history freshness, in seconds.
    pub student_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            grade_ttl_secs: 60,
            student_ttl_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub subscriber_soft_cap: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            subscriber_soft_cap: DEFAULT_SUBSCRIBER_SOFT_CAP,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub batch_size: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is not set (error, warn, info, debug).
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cache: CacheConfig,
    pub sync: SyncConfig,
    pub fetch: FetchConfig,
    pub logging: LoggingConfig,
    pub database: DatabaseConfig,
}

impl Config {
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Loads `path`, falling back to defaults when the file does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn default_path() -> Result<PathBuf> {
        let base = dirs::config_dir()
            .or_else(dirs::home_dir)
            .ok_or_else(|| Error::Config("no config or home directory found".to_string()))?;
        Ok(base.join("school-health").join("config.toml"))
    }

    pub fn ttl_policy(&self) -> TtlPolicy {
        TtlPolicy {
            short: Duration::seconds(secs(self.cache.grade_ttl_secs)),
            long: Duration::seconds(secs(self.cache.student_ttl_secs)),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.fetch.batch_size.max(1)
    }

    /// DATABASE_URL wins over the configured url.
    pub fn database_url(&self) -> Option<String> {
        std::env::var("DATABASE_URL")
            .ok()
            .filter(|url| !url.trim().is_empty())
            .or_else(|| Some(self.database.url.clone()).filter(|url| !url.trim().is_empty()))
    }
}

fn secs(value: u64) -> i64 {
    i64::try_from(value)
        .unwrap_or(i64::MAX)
        .min(i64::MAX / 1_000)
}
