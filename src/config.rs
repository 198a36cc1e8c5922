//! Ledger configuration

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::LedgerError;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub rewards: RewardConfig,
    #[serde(default)]
    pub settlement: SettlementConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP API port
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Bind address
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
            bind_addr: default_bind_addr(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Data directory holding ledger.db
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl StorageConfig {
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("ledger.db")
    }
}

/// Point amounts and thresholds used by the reward rule engine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RewardConfig {
    pub signup_bonus: i64,
    pub upload_base: i64,
    /// Quality tier bonuses, highest tier first
    pub quality_top: i64,
    pub quality_high: i64,
    pub quality_mid: i64,
    pub quality_top_threshold: i64,
    pub quality_high_threshold: i64,
    pub quality_mid_threshold: i64,
    pub large_dataset_rows: i64,
    pub large_dataset_bonus: i64,
    pub first_upload_bonus: i64,
    pub review_reward: i64,
    pub verification_reward: i64,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            signup_bonus: 100,
            upload_base: 50,
            quality_top: 100,
            quality_high: 50,
            quality_mid: 25,
            quality_top_threshold: 90,
            quality_high_threshold: 80,
            quality_mid_threshold: 70,
            large_dataset_rows: 1000,
            large_dataset_bonus: 30,
            first_upload_bonus: 50,
            review_reward: 20,
            verification_reward: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementConfig {
    /// Run reconciler workers alongside the HTTP server
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Number of reconciler workers
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Transfer attempts before a withdrawal is reversed
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Claim lease duration
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,

    /// Hard timeout on a single external call
    #[serde(default = "default_transfer_timeout_secs")]
    pub transfer_timeout_secs: u64,

    /// Idle delay between claim cycles
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Records claimed per cycle
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Delay before re-checking an unconfirmed transfer
    #[serde(default = "default_confirmation_poll_ms")]
    pub confirmation_poll_ms: u64,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            workers: default_workers(),
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            lease_secs: default_lease_secs(),
            transfer_timeout_secs: default_transfer_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            batch_size: default_batch_size(),
            confirmation_poll_ms: default_confirmation_poll_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Treasury transfer gateway. Settlement is disabled when unset.
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub api_key: Option<String>,

    /// Token decimals used to convert points into base units
    #[serde(default = "default_token_decimals")]
    pub token_decimals: u32,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            token_decimals: default_token_decimals(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HS256 secret shared with the session provider
    #[serde(default)]
    pub jwt_secret: Option<String>,

    #[serde(default = "default_audience")]
    pub audience: String,

    /// Token roles granted elevated privilege
    #[serde(default = "default_admin_roles")]
    pub admin_roles: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            audience: default_audience(),
            admin_roles: default_admin_roles(),
        }
    }
}

// Defaults
fn default_http_port() -> u16 { 8080 }
fn default_bind_addr() -> String { "0.0.0.0".to_string() }
fn default_data_dir() -> PathBuf { PathBuf::from("./data") }
fn default_true() -> bool { true }
fn default_workers() -> usize { 2 }
fn default_max_attempts() -> u32 { 5 }
fn default_base_backoff_ms() -> u64 { 2_000 }
fn default_max_backoff_ms() -> u64 { 300_000 } // 5 minutes
fn default_lease_secs() -> u64 { 120 }
fn default_transfer_timeout_secs() -> u64 { 45 }
fn default_poll_interval_ms() -> u64 { 1_000 }
fn default_batch_size() -> usize { 16 }
fn default_confirmation_poll_ms() -> u64 { 5_000 }
fn default_token_decimals() -> u32 { 9 }
fn default_audience() -> String { "authenticated".to_string() }
fn default_admin_roles() -> Vec<String> {
    vec!["service_role".to_string(), "admin".to_string()]
}

impl Config {
    /// Load from a TOML file, falling back to defaults when it doesn't exist
    pub fn load(path: &Path) -> Result<Self, LedgerError> {
        if !path.exists() {
            info!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| LedgerError::Config(format!("reading {}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, LedgerError> {
        let config: Config =
            toml::from_str(content).map_err(|e| LedgerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), LedgerError> {
        let r = &self.rewards;
        if !(r.quality_top_threshold > r.quality_high_threshold
            && r.quality_high_threshold > r.quality_mid_threshold)
        {
            return Err(LedgerError::Config(
                "quality thresholds must be strictly descending (top > high > mid)".to_string(),
            ));
        }
        if r.quality_top_threshold > 100 || r.quality_mid_threshold < 0 {
            return Err(LedgerError::Config(
                "quality thresholds must lie within 0-100".to_string(),
            ));
        }

        let s = &self.settlement;
        if s.max_attempts == 0 {
            return Err(LedgerError::Config("max_attempts must be at least 1".to_string()));
        }
        if s.lease_secs <= s.transfer_timeout_secs {
            return Err(LedgerError::Config(format!(
                "lease_secs ({}) must exceed transfer_timeout_secs ({})",
                s.lease_secs, s.transfer_timeout_secs
            )));
        }
        if s.base_backoff_ms > s.max_backoff_ms {
            return Err(LedgerError::Config(
                "base_backoff_ms must not exceed max_backoff_ms".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.server.http_port, 8080);
        assert_eq!(config.rewards.signup_bonus, 100);
        assert_eq!(config.rewards.quality_top, 100);
        assert_eq!(config.settlement.max_attempts, 5);
        assert_eq!(config.transfer.token_decimals, 9);
        assert!(config.transfer.endpoint.is_none());
        assert_eq!(config.storage.db_path(), PathBuf::from("./data/ledger.db"));
    }

    #[test]
    fn test_partial_sections_keep_remaining_defaults() {
        let config = Config::from_toml(
            r#"
[rewards]
signup_bonus = 150

[settlement]
max_attempts = 3
lease_secs = 90

[transfer]
endpoint = "http://treasury.local:8787"
"#,
        )
        .unwrap();

        assert_eq!(config.rewards.signup_bonus, 150);
        assert_eq!(config.rewards.upload_base, 50);
        assert_eq!(config.settlement.max_attempts, 3);
        assert_eq!(config.settlement.lease_secs, 90);
        assert_eq!(config.settlement.batch_size, 16);
        assert_eq!(
            config.transfer.endpoint.as_deref(),
            Some("http://treasury.local:8787")
        );
    }

    #[test]
    fn test_overlapping_quality_tiers_rejected() {
        let err = Config::from_toml(
            r#"
[rewards]
quality_high_threshold = 95
"#,
        )
        .unwrap_err();
        assert!(matches!(err, LedgerError::Config(_)));
    }

    #[test]
    fn test_lease_must_outlive_transfer_timeout() {
        let err = Config::from_toml(
            r#"
[settlement]
lease_secs = 30
transfer_timeout_secs = 45
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("lease_secs"));
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = Config::load(Path::new("/nonexistent/arb-ledger.toml")).unwrap();
        assert_eq!(config.settlement.workers, 2);
    }
}
