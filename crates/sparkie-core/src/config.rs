//! Sparkie configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, SparkieError};

/// Environment variables consulted (in order) when no completion key is configured.
pub const COMPLETION_KEY_ENV_VARS: &[&str] = &["SPARKIE_COMPLETION_API_KEY", "OPENCODE_API_KEY"];

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SparkieConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub outreach: OutreachConfig,
}

impl SparkieConfig {
    /// Load config from `$SPARKIE_CONFIG` or the default path (~/.sparkie/config.toml).
    pub fn load() -> Result<Self> {
        let path = std::env::var("SPARKIE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| Self::default_path());
        if path.exists() {
            Self::load_from(&path)
        } else {
            tracing::debug!("no config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SparkieError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| SparkieError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to the given path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| SparkieError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.interval_secs == 0 {
            return Err(SparkieError::Config("scheduler.interval_secs must be > 0".into()));
        }
        if self.scheduler.task_timeout_secs == 0 {
            return Err(SparkieError::Config("scheduler.task_timeout_secs must be > 0".into()));
        }
        if self.scheduler.batch_size == 0 {
            return Err(SparkieError::Config("scheduler.batch_size must be > 0".into()));
        }
        if self.outreach.morning_start_hour >= self.outreach.morning_end_hour
            || self.outreach.morning_end_hour > 24
        {
            return Err(SparkieError::Config(format!(
                "outreach morning window [{}, {}) is empty or out of range",
                self.outreach.morning_start_hour, self.outreach.morning_end_hour
            )));
        }
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Sparkie home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".sparkie")
    }
}

/// Gateway (HTTP) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
}

fn default_port() -> u16 { 3000 }
fn default_host() -> String { "127.0.0.1".into() }

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file shared by every replica on this host.
    #[serde(default = "default_db_path")]
    pub path: String,
    /// When set (and built with the `postgres` feature), the heartbeat lock
    /// uses a Postgres advisory lock instead of the SQLite lease.
    #[serde(default)]
    pub postgres_url: Option<String>,
}

fn default_db_path() -> String { "~/.sparkie/sparkie.db".into() }

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            postgres_url: None,
        }
    }
}

/// Autonomous completion service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_completion_timeout")]
    pub timeout_secs: u64,
}

fn default_base_url() -> String { "https://opencode.ai/zen/v1".into() }
fn default_model() -> String { "kimi-k2.5-free".into() }
fn default_completion_timeout() -> u64 { 50 }

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_base_url(),
            model: default_model(),
            timeout_secs: default_completion_timeout(),
        }
    }
}

impl CompletionConfig {
    /// Resolve the API key: config value first, then environment variables.
    /// Returns `None` when no credential is available anywhere.
    pub fn resolve_api_key(&self) -> Option<String> {
        if !self.api_key.is_empty() {
            return Some(self.api_key.clone());
        }
        let (var, key) = COMPLETION_KEY_ENV_VARS.iter().find_map(|var| {
            std::env::var(var)
                .ok()
                .filter(|k| !k.is_empty())
                .map(|k| (*var, k))
        })?;
        tracing::debug!("completion api key taken from ${var}");
        Some(key)
    }
}

/// Heartbeat scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_initial_delay")]
    pub initial_delay_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_task_timeout")]
    pub task_timeout_secs: u64,
    #[serde(default = "default_max_result_chars")]
    pub max_result_chars: usize,
    #[serde(default = "default_lock_key")]
    pub lock_key: i64,
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_secs: u64,
    #[serde(default)]
    pub cron_utc_offset_minutes: i32,
}

fn bool_true() -> bool { true }
fn default_interval() -> u64 { 60 }
fn default_initial_delay() -> u64 { 5 }
fn default_batch_size() -> usize { 5 }
fn default_task_timeout() -> u64 { 50 }
fn default_max_result_chars() -> usize { 800 }
fn default_lock_key() -> i64 { 7_463_289_412 }
fn default_lock_ttl() -> u64 { 300 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_interval(),
            initial_delay_secs: default_initial_delay(),
            batch_size: default_batch_size(),
            task_timeout_secs: default_task_timeout(),
            max_result_chars: default_max_result_chars(),
            lock_key: default_lock_key(),
            lock_ttl_secs: default_lock_ttl(),
            cron_utc_offset_minutes: 0,
        }
    }
}

/// Proactive outreach configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutreachConfig {
    #[serde(default = "default_dedup_window")]
    pub dedup_window_hours: i64,
    #[serde(default = "default_morning_start")]
    pub morning_start_hour: u32,
    #[serde(default = "default_morning_end")]
    pub morning_end_hour: u32,
    #[serde(default = "default_morning_idle")]
    pub morning_idle_hours: i64,
    #[serde(default = "default_checkin_idle")]
    pub checkin_idle_days: i64,
    #[serde(default = "default_memory_hint_limit")]
    pub memory_hint_limit: usize,
}

fn default_dedup_window() -> i64 { 12 }
fn default_morning_start() -> u32 { 8 }
fn default_morning_end() -> u32 { 11 }
fn default_morning_idle() -> i64 { 5 }
fn default_checkin_idle() -> i64 { 3 }
fn default_memory_hint_limit() -> usize { 3 }

impl Default for OutreachConfig {
    fn default() -> Self {
        Self {
            dedup_window_hours: default_dedup_window(),
            morning_start_hour: default_morning_start(),
            morning_end_hour: default_morning_end(),
            morning_idle_hours: default_morning_idle(),
            checkin_idle_days: default_checkin_idle(),
            memory_hint_limit: default_memory_hint_limit(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SparkieConfig::default();
        assert_eq!(config.gateway.port, 3000);
        assert_eq!(config.scheduler.interval_secs, 60);
        assert_eq!(config.scheduler.batch_size, 5);
        assert_eq!(config.scheduler.lock_key, 7_463_289_412);
        assert_eq!(config.outreach.dedup_window_hours, 12);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            [gateway]
            port = 8080

            [completion]
            model = "glm-5-free"
            timeout_secs = 45

            [scheduler]
            batch_size = 3
            interval_secs = 30
        "#;

        let config: SparkieConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.gateway.port, 8080);
        assert_eq!(config.gateway.host, "127.0.0.1");
        assert_eq!(config.completion.model, "glm-5-free");
        assert_eq!(config.completion.timeout_secs, 45);
        assert_eq!(config.scheduler.batch_size, 3);
        assert_eq!(config.scheduler.max_result_chars, 800);
    }

    #[test]
    fn test_config_missing_fields_use_defaults() {
        let config: SparkieConfig = toml::from_str("").unwrap();
        assert_eq!(config.outreach.morning_start_hour, 8);
        assert_eq!(config.outreach.morning_end_hour, 11);
        assert!(config.database.postgres_url.is_none());
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut config = SparkieConfig::default();
        config.scheduler.interval_secs = 0;
        assert!(matches!(config.validate(), Err(SparkieError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_empty_morning_window() {
        let mut config = SparkieConfig::default();
        config.outreach.morning_start_hour = 11;
        config.outreach.morning_end_hour = 8;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_task_timeout() {
        let mut config = SparkieConfig::default();
        config.scheduler.task_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_configured_key_wins() {
        let completion = CompletionConfig {
            api_key: "sk-test".into(),
            ..CompletionConfig::default()
        };
        assert_eq!(completion.resolve_api_key().as_deref(), Some("sk-test"));
    }

    #[test]
    fn test_save_and_load_roundtrip_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = SparkieConfig::default();
        config.gateway.port = 4242;
        config.save_to(&path).unwrap();
        let loaded = SparkieConfig::load_from(&path).unwrap();
        assert_eq!(loaded.gateway.port, 4242);
    }

    #[test]
    fn test_home_dir() {
        let home = SparkieConfig::home_dir();
        assert!(home.to_string_lossy().contains(".sparkie"));
    }
}
