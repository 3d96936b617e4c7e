//! YAML configuration loader for the Wallet Guard control plane.
//!
//! Every section is optional and falls back to its defaults, so an empty file
//! is a valid configuration. `${VAR}` references are substituted from the
//! environment before parsing.

use crate::approval::DEFAULT_APPROVAL_TIMEOUT_SECS;
use crate::autostop::{AutoStopConfig, AutoStopError};
use crate::kill_switch::{KillSwitchConfig, MAX_RECOVERY_COOLDOWN_SECS, MIN_RECOVERY_COOLDOWN_SECS};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;
use wg_core::db::{DbError, PolicyRepository};
use wg_core::{Policy, PolicyRules};
use wg_observability::{LogFormat, LoggingConfig, LoggingError};

const ENV_VAR_PATTERN: &str = r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}";

/// Errors that can occur during configuration loading.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML configuration: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),

    #[error("Invalid logging configuration: {0}")]
    Logging(#[from] LoggingError),
}

impl From<AutoStopError> for ConfigError {
    fn from(err: AutoStopError) -> Self {
        ConfigError::InvalidValue(err.to_string())
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletGuardConfig {
    pub approval: ApprovalSettings,
    pub delay_queue: DelayQueueSettings,
    pub approval_sweep: ApprovalSweepSettings,
    pub autostop: AutoStopConfig,
    pub kill_switch: KillSwitchConfig,
    pub notifications: NotificationSettings,
    pub logging: LoggingSettings,
    /// Policies written to the store at startup.
    pub policies: Vec<SeedPolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalSettings {
    /// Approval window when the policy names none.
    pub default_timeout_secs: u64,
}

impl Default for ApprovalSettings {
    fn default() -> Self {
        Self {
            default_timeout_secs: DEFAULT_APPROVAL_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DelayQueueSettings {
    pub sweep_interval_secs: u64,
}

impl Default for DelayQueueSettings {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalSweepSettings {
    pub interval_secs: u64,
}

impl Default for ApprovalSweepSettings {
    fn default() -> Self {
        Self { interval_secs: 30 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationSettings {
    /// Minimum gap between two notifications of the same type for the same
    /// wallet. Zero disables the cooldown.
    pub cooldown_secs: u64,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self { cooldown_secs: 300 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    #[serde(skip_serializing)]
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Plain,
        }
    }
}

impl LoggingSettings {
    pub fn to_logging_config(&self) -> Result<LoggingConfig, ConfigError> {
        Ok(LoggingConfig::from_settings(&self.level, self.format)?)
    }
}

/// A policy declared in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedPolicy {
    #[serde(default)]
    pub wallet_id: Option<Uuid>,
    #[serde(default)]
    pub network: Option<String>,
    #[serde(flatten)]
    pub rules: PolicyRules,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl SeedPolicy {
    pub fn to_policy(&self) -> Policy {
        let mut policy = Policy::new(self.rules.clone()).with_priority(self.priority);
        if let Some(wallet_id) = self.wallet_id {
            policy = policy.for_wallet(wallet_id);
        }
        if let Some(network) = &self.network {
            policy = policy.on_network(network.clone());
        }
        if !self.enabled {
            policy = policy.disabled();
        }
        policy
    }
}

impl WalletGuardConfig {
    pub fn delay_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.delay_queue.sweep_interval_secs)
    }

    pub fn approval_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.approval_sweep.interval_secs)
    }

    /// Writes the seed policies to `repo`. Returns how many were written.
    pub async fn seed_policies(&self, repo: &dyn PolicyRepository) -> Result<usize, DbError> {
        for seed in &self.policies {
            repo.create(&seed.to_policy()).await?;
        }
        if !self.policies.is_empty() {
            info!(count = self.policies.len(), "Seeded policies from configuration");
        }
        Ok(self.policies.len())
    }
}

/// Substitutes environment variables in a string.
///
/// Replaces patterns like `${VAR_NAME}` with the variable's value. Every
/// missing variable is reported at once.
fn substitute_env_vars(input: &str) -> Result<String, ConfigError> {
    let re = Regex::new(ENV_VAR_PATTERN).map_err(|e| ConfigError::InvalidValue(e.to_string()))?;
    let mut missing = Vec::new();

    let result = re.replace_all(input, |caps: &regex::Captures| match env::var(&caps[1]) {
        Ok(value) => value,
        Err(_) => {
            missing.push(caps[1].to_string());
            String::new()
        }
    });

    if !missing.is_empty() {
        return Err(ConfigError::EnvVarNotFound(missing.join(", ")));
    }
    Ok(result.into_owned())
}

/// Loads and validates the configuration from a YAML file.
///
/// # Example
/// ```no_run
/// use std::path::Path;
/// use wg_policy::config::load_config;
///
/// let config = load_config(Path::new("config/wallet-guard.yaml")).unwrap();
/// ```
pub fn load_config(path: &Path) -> Result<WalletGuardConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    parse_config(&content)
}

/// Parses and validates configuration text.
pub fn parse_config(content: &str) -> Result<WalletGuardConfig, ConfigError> {
    let content = substitute_env_vars(content)?;
    let config: WalletGuardConfig = if content.trim().is_empty() {
        WalletGuardConfig::default()
    } else {
        serde_yaml::from_str(&content)?
    };
    validate_config(&config)?;
    Ok(config)
}

fn validate_config(config: &WalletGuardConfig) -> Result<(), ConfigError> {
    if config.delay_queue.sweep_interval_secs == 0 {
        return Err(ConfigError::InvalidValue(
            "delay_queue.sweep_interval_secs must be greater than 0".to_string(),
        ));
    }
    if config.approval_sweep.interval_secs == 0 {
        return Err(ConfigError::InvalidValue(
            "approval_sweep.interval_secs must be greater than 0".to_string(),
        ));
    }

    config.autostop.validate()?;

    let cooldown = config.kill_switch.recovery_cooldown_secs;
    if !(MIN_RECOVERY_COOLDOWN_SECS..=MAX_RECOVERY_COOLDOWN_SECS).contains(&cooldown) {
        return Err(ConfigError::InvalidValue(format!(
            "kill_switch.recovery_cooldown_secs must be between {} and {}, got {}",
            MIN_RECOVERY_COOLDOWN_SECS, MAX_RECOVERY_COOLDOWN_SECS, cooldown
        )));
    }
    if !(1..=10).contains(&config.kill_switch.max_recovery_attempts) {
        return Err(ConfigError::InvalidValue(format!(
            "kill_switch.max_recovery_attempts must be between 1 and 10, got {}",
            config.kill_switch.max_recovery_attempts
        )));
    }

    config.logging.to_logging_config()?;

    for (index, seed) in config.policies.iter().enumerate() {
        if let PolicyRules::SpendingLimit(limits) = &seed.rules {
            if !limits.is_consistent() {
                return Err(ConfigError::InvalidValue(format!(
                    "policies[{}]: spending limits must satisfy instant_max <= notify_max <= delay_max",
                    index
                )));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;
    use wg_core::db::memory::InMemoryPolicyRepository;
    use wg_core::{Amount, PolicyType, Tier};

    fn create_valid_yaml() -> &'static str {
        r#"
approval:
  default_timeout_secs: 1800

delay_queue:
  sweep_interval_secs: 10

autostop:
  consecutive_failures_threshold: 3
  idle_timeout_secs: 7200

kill_switch:
  recovery_cooldown_secs: 900
  max_recovery_attempts: 5

notifications:
  cooldown_secs: 0

logging:
  level: debug
  format: json

policies:
  - type: SPENDING_LIMIT
    rules:
      instant_max: "500000000"
      notify_max: "1000000000"
      delay_max: "5000000000"
      delay_seconds: 600
  - type: ALLOWED_TOKENS
    wallet_id: 6f1c2a52-98e4-4d3c-9a1b-3f0d7c2e8b41
    network: polygon-mainnet
    priority: 10
    rules:
      tokens:
        - address: "0xToken"
          symbol: USDC
  - type: APPROVE_TIER_OVERRIDE
    enabled: false
    rules:
      tier: DELAY
"#
    }

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_valid_config() {
        let file = write_config(create_valid_yaml());
        let config = load_config(file.path()).unwrap();

        assert_eq!(config.approval.default_timeout_secs, 1800);
        assert_eq!(config.delay_sweep_interval(), Duration::from_secs(10));
        // Unset sections and fields keep their defaults.
        assert_eq!(config.approval_sweep_interval(), Duration::from_secs(30));
        assert_eq!(config.autostop.consecutive_failures_threshold, 3);
        assert_eq!(config.autostop.unusual_activity_threshold, 20);
        assert!(config.autostop.enabled);
        assert_eq!(config.kill_switch.max_recovery_attempts, 5);
        assert_eq!(config.notifications.cooldown_secs, 0);
        assert_eq!(config.logging.format, LogFormat::Json);

        assert_eq!(config.policies.len(), 3);
        let limits = config.policies[0].to_policy();
        assert_eq!(limits.policy_type(), PolicyType::SpendingLimit);
        match &limits.rules {
            PolicyRules::SpendingLimit(rules) => {
                assert_eq!(rules.instant_max, Amount::from(500_000_000u64));
                assert_eq!(rules.delay_seconds, 600);
            }
            other => panic!("unexpected rules: {:?}", other),
        }

        let tokens = config.policies[1].to_policy();
        assert!(tokens.wallet_id.is_some());
        assert_eq!(tokens.network.as_deref(), Some("polygon-mainnet"));
        assert_eq!(tokens.priority, 10);

        let override_policy = config.policies[2].to_policy();
        assert!(!override_policy.enabled);
        assert_eq!(
            override_policy.rules,
            PolicyRules::ApproveTierOverride(wg_core::ApproveTierOverrideRules {
                tier: Tier::Delay,
            })
        );
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.approval.default_timeout_secs, DEFAULT_APPROVAL_TIMEOUT_SECS);
        assert_eq!(config.delay_queue.sweep_interval_secs, 5);
        assert_eq!(config.kill_switch, KillSwitchConfig::default());
        assert_eq!(config.notifications.cooldown_secs, 300);
        assert!(config.policies.is_empty());
    }

    #[test]
    fn test_env_var_substitution() {
        env::set_var("WG_TEST_APPROVAL_TIMEOUT", "1200");
        let config =
            parse_config("approval:\n  default_timeout_secs: ${WG_TEST_APPROVAL_TIMEOUT}\n")
                .unwrap();
        assert_eq!(config.approval.default_timeout_secs, 1200);
        env::remove_var("WG_TEST_APPROVAL_TIMEOUT");
    }

    #[test]
    fn test_missing_env_var() {
        let result = parse_config("logging:\n  level: ${WG_TEST_DOES_NOT_EXIST_12345}\n");
        match result {
            Err(ConfigError::EnvVarNotFound(name)) => {
                assert_eq!(name, "WG_TEST_DOES_NOT_EXIST_12345")
            }
            other => panic!("expected missing variable error, got {:?}", other),
        }
    }

    #[test]
    fn test_rejects_out_of_range_kill_switch() {
        assert!(matches!(
            parse_config("kill_switch:\n  recovery_cooldown_secs: 60\n"),
            Err(ConfigError::InvalidValue(_))
        ));
        assert!(matches!(
            parse_config("kill_switch:\n  max_recovery_attempts: 11\n"),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_rejects_zero_thresholds() {
        assert!(matches!(
            parse_config("autostop:\n  consecutive_failures_threshold: 0\n"),
            Err(ConfigError::InvalidValue(_))
        ));
        assert!(matches!(
            parse_config("delay_queue:\n  sweep_interval_secs: 0\n"),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_rejects_inconsistent_spending_limits() {
        let yaml = r#"
policies:
  - type: SPENDING_LIMIT
    rules:
      instant_max: "1000"
      notify_max: "10"
      delay_max: "10000"
      delay_seconds: 60
"#;
        let result = parse_config(yaml);
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue(msg)) if msg.contains("policies[0]")
        ));
    }

    #[test]
    fn test_rejects_invalid_log_level() {
        assert!(matches!(
            parse_config("logging:\n  level: loud\n"),
            Err(ConfigError::Logging(_))
        ));
    }

    #[test]
    fn test_invalid_yaml() {
        let file = write_config("policies: [unclosed");
        assert!(matches!(load_config(file.path()), Err(ConfigError::ParseError(_))));
    }

    #[tokio::test]
    async fn test_seed_policies() {
        let config = parse_config(create_valid_yaml()).unwrap();
        let repo = InMemoryPolicyRepository::new();

        assert_eq!(config.seed_policies(&repo).await.unwrap(), 3);
        assert_eq!(repo.list().await.unwrap().len(), 3);
    }
}
