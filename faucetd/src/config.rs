//! Faucet daemon configuration: a single YAML file covering the claim
//! policy, wallet RPC, claim log, alerting and HTTP server.

use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};

use chrono::Duration;
use faucet_core::FaucetConfig as CoreFaucetConfig;
use faucet_core::RateLimitConfig as CoreRateLimitConfig;

use crate::alerter::ExAlerterConfig;
use crate::db::DbConfig;
use crate::rpc::RpcConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitSettings {
    #[serde(default)]
    pub amount: f64,
    /// Rolling window, in seconds. Zero disables rate limiting.
    #[serde(default)]
    pub period_seconds: i64,
}

/// Claim policy settings, deserialized from YAML and converted to
/// `faucet_core::FaucetConfig` via [`FaucetSettings::to_core`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FaucetSettings {
    #[serde(default)]
    pub amount: f64,
    #[serde(default = "default_fee")]
    pub fee: f64,
    #[serde(default = "default_min_amount")]
    pub min_amount: f64,
    #[serde(default)]
    pub stingy_amount: f64,
    #[serde(default)]
    pub low_balance: f64,
    /// Per-client claim cooldown, in seconds. Below one second disables it.
    #[serde(default)]
    pub ip_claim_interval_seconds: i64,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    /// 16-byte AES key, hex-encoded. Absent means no token is required.
    #[serde(default)]
    pub token_key: Option<String>,
    #[serde(default)]
    pub address_versions: Vec<u32>,
}

#[derive(Debug, thiserror::Error)]
pub enum FaucetSettingsError {
    #[error("tokenKey must be 32 hex characters (16 bytes): {0}")]
    BadTokenKey(#[from] hex::FromHexError),
    #[error("tokenKey must decode to exactly 16 bytes, got {0}")]
    WrongTokenKeyLength(usize),
}

impl FaucetSettings {
    pub fn to_core(&self) -> Result<CoreFaucetConfig, FaucetSettingsError> {
        let token_key = match &self.token_key {
            None => None,
            Some(hex_str) => {
                let bytes = hex::decode(hex_str)?;
                let len = bytes.len();
                let arr: [u8; 16] = bytes
                    .try_into()
                    .map_err(|_| FaucetSettingsError::WrongTokenKeyLength(len))?;
                Some(arr)
            }
        };
        Ok(CoreFaucetConfig {
            amount: self.amount,
            fee: self.fee,
            min_amount: self.min_amount,
            stingy_amount: self.stingy_amount,
            low_balance: self.low_balance,
            ip_claim_interval: Duration::seconds(self.ip_claim_interval_seconds),
            rate_limit: CoreRateLimitConfig {
                amount: self.rate_limit.amount,
                period: Duration::seconds(self.rate_limit.period_seconds),
            },
            token_key,
            address_versions: self.address_versions.clone(),
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub listen: String,
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,
    #[serde(default)]
    pub allow_origin: String,
    #[serde(default)]
    pub use_fwd_addr: bool,
}

fn default_api_prefix() -> String {
    "/api".to_string()
}

fn default_fee() -> f64 {
    1.0
}

fn default_min_amount() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_true")]
    pub date: bool,
    #[serde(default = "default_true")]
    pub time: bool,
    #[serde(default)]
    pub microseconds: bool,
    #[serde(default)]
    pub utc: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            date: true,
            time: true,
            microseconds: false,
            utc: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FaucetdConfig {
    #[serde(default)]
    pub faucet: FaucetSettings,
    #[serde(default)]
    pub alerts: ExAlerterConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// The built-in defaults, matching the upstream daemon's `defCfg`: a $1
/// fee, a $2 floor, the `/api` prefix, a localhost wallet RPC endpoint, and
/// a log format with date and time but no microseconds or UTC.
pub fn default_config() -> FaucetdConfig {
    FaucetdConfig {
        faucet: FaucetSettings {
            fee: 1.0,
            min_amount: 2.0,
            ..Default::default()
        },
        alerts: ExAlerterConfig::default(),
        server: ServerConfig {
            api_prefix: default_api_prefix(),
            ..Default::default()
        },
        db: DbConfig::default(),
        rpc: RpcConfig {
            url: "http://localhost:44555".to_string(),
            ..Default::default()
        },
        log: LogConfig::default(),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file at {0}: {1}")]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("failed to write config file at {0}: {1}")]
    FileWrite(PathBuf, #[source] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
}

pub fn load_yaml(path: impl AsRef<Path>) -> Result<FaucetdConfig, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::FileRead(path.to_path_buf(), e))?;
    let cfg: FaucetdConfig = serde_yaml::from_str(&content)?;
    Ok(cfg)
}

pub fn store_yaml(path: impl AsRef<Path>, cfg: &FaucetdConfig) -> Result<(), ConfigError> {
    let path = path.as_ref();
    let content = serde_yaml::to_string(cfg)?;
    std::fs::write(path, content).map_err(|e| ConfigError::FileWrite(path.to_path_buf(), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_fall_back_to_upstream_defaults() {
        let cfg: FaucetdConfig = serde_yaml::from_str("faucet:\n  amount: 5\n").unwrap();
        assert_eq!(cfg.faucet.amount, 5.0);
        assert_eq!(cfg.faucet.fee, 1.0);
        assert_eq!(cfg.faucet.min_amount, 2.0);
        assert_eq!(cfg.server.api_prefix, "/api");
        assert!(cfg.log.date);
        assert!(cfg.log.time);
        assert_eq!(cfg.rpc.url, "http://localhost:44555");
    }

    #[test]
    fn explicit_fields_override_defaults() {
        let cfg: FaucetdConfig = serde_yaml::from_str("faucet:\n  fee: 0\nlog:\n  date: false\n").unwrap();
        assert_eq!(cfg.faucet.fee, 0.0);
        assert!(!cfg.log.date);
        assert!(cfg.log.time);
    }

    #[test]
    fn default_config_matches_upstream_defcfg() {
        let cfg = default_config();
        assert_eq!(cfg.faucet.fee, 1.0);
        assert_eq!(cfg.faucet.min_amount, 2.0);
        assert_eq!(cfg.server.api_prefix, "/api");
        assert_eq!(cfg.rpc.url, "http://localhost:44555");
    }

    #[test]
    fn to_core_decodes_a_valid_token_key() {
        let mut settings = FaucetSettings::default();
        settings.token_key = Some("00112233445566778899aabbccddeeff".to_string());
        let core = settings.to_core().unwrap();
        assert_eq!(core.token_key.unwrap().len(), 16);
    }

    #[test]
    fn to_core_rejects_a_wrong_length_token_key() {
        let mut settings = FaucetSettings::default();
        settings.token_key = Some("aabb".to_string());
        match settings.to_core() {
            Err(FaucetSettingsError::WrongTokenKeyLength(2)) => {}
            other => panic!("expected WrongTokenKeyLength(2), got {other:?}"),
        }
    }
}

/// `faucetd <config|db|serve> ...`
#[derive(Parser, Debug)]
#[command(name = "faucetd")]
#[command(about = "Dogecoin testnet faucet daemon")]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: crate::cli::Command,
}
