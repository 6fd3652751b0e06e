//! Configuration for Outreach

use crate::types::{AccountConfig, FollowUpRule, TransportMode};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable naming an explicit configuration file
pub const CONFIG_ENV_VAR: &str = "OUTREACH_CONFIG";

/// Longest wait a follow-up rule may declare
pub const MAX_FOLLOW_UP_DAYS: i64 = 3650;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Batch pacing configuration
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Account pool configuration
    #[serde(default)]
    pub pool: PoolConfig,

    /// Record store configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Outgoing mail accounts
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,

    /// Follow-up rules, in registration order
    #[serde(default)]
    pub rules: Vec<FollowUpRule>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

/// Pacing applied by the dispatcher
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Delay between two consecutive attempts
    #[serde(default = "default_global_delay")]
    pub global_delay_secs: f64,

    /// Attempts per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Extra delay after each full batch
    #[serde(default = "default_batch_delay")]
    pub batch_delay_secs: f64,

    /// Bound on session opening and message transmission
    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            global_delay_secs: default_global_delay(),
            batch_size: default_batch_size(),
            batch_delay_secs: default_batch_delay(),
            send_timeout_secs: default_send_timeout(),
        }
    }
}

impl DispatchConfig {
    /// Non-finite or negative values yield no delay; `Config::validate` rejects them
    pub fn global_delay(&self) -> Duration {
        secs_to_duration(self.global_delay_secs)
    }

    pub fn batch_delay(&self) -> Duration {
        secs_to_duration(self.batch_delay_secs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }
}

fn secs_to_duration(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or_default()
}

fn default_global_delay() -> f64 {
    2.0
}

fn default_batch_size() -> usize {
    10
}

fn default_batch_delay() -> f64 {
    60.0
}

fn default_send_timeout() -> u64 {
    30
}

/// Account pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Consecutive failures after which an account is deactivated
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,

    /// Name announced in EHLO
    #[serde(default = "default_hello_name")]
    pub hello_name: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_failures: default_max_failures(),
            hello_name: default_hello_name(),
        }
    }
}

fn default_max_failures() -> u32 {
    5
}

fn default_hello_name() -> String {
    "localhost".to_string()
}

/// Record store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the JSON records
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("./data")
}

impl Config {
    /// Load configuration from file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Load configuration from the environment override or default locations
    pub fn load() -> crate::Result<Self> {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            return Self::from_file(std::path::Path::new(&path));
        }

        let paths = [
            PathBuf::from("./outreach.toml"),
            PathBuf::from("./config.toml"),
            PathBuf::from("/etc/outreach/config.toml"),
        ];

        for path in paths {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        Err(crate::Error::Config(
            "No configuration file found".to_string(),
        ))
    }

    /// Fill in accounts from `SMTP_*` environment variables when the file declares none
    pub fn resolve_accounts(&mut self) -> crate::Result<()> {
        if self.accounts.is_empty() {
            self.accounts = Self::accounts_from_env(std::env::vars())?;
            if !self.accounts.is_empty() {
                tracing::info!(
                    count = self.accounts.len(),
                    "Loaded sending accounts from environment"
                );
            }
        }
        Ok(())
    }

    /// Build accounts from numbered variables (`SMTP_HOST_1`, `SMTP_PORT_1`, ...).
    ///
    /// Unnumbered `SMTP_*` variables provide shared fallbacks, and `SMTP_HOST`
    /// alone stands in for the first account.
    pub fn accounts_from_env<I>(vars: I) -> crate::Result<Vec<AccountConfig>>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: HashMap<String, String> = vars.into_iter().collect();
        let lookup = |key: &str, n: usize| -> Option<String> {
            vars.get(&format!("{}_{}", key, n))
                .or_else(|| vars.get(key))
                .filter(|v| !v.is_empty())
                .cloned()
        };

        let mut accounts = Vec::new();
        let mut n = 1;

        loop {
            let host = match vars.get(&format!("SMTP_HOST_{}", n)) {
                Some(host) => host.clone(),
                None if n == 1 => match vars.get("SMTP_HOST") {
                    Some(host) => host.clone(),
                    None => break,
                },
                None => break,
            };

            let username = lookup("SMTP_USERNAME", n).unwrap_or_default();
            let from_email = lookup("SMTP_FROM_EMAIL", n).unwrap_or_else(|| username.clone());

            let use_ssl = parse_flag(lookup("SMTP_USE_SSL", n), false);
            let use_tls = parse_flag(lookup("SMTP_USE_TLS", n), true);
            let transport = if use_ssl {
                TransportMode::Tls
            } else if use_tls {
                TransportMode::Starttls
            } else {
                TransportMode::Plaintext
            };

            let mut account = AccountConfig::new(format!("Account_{}", n), host, from_email);
            account.username = username;
            account.password = lookup("SMTP_PASSWORD", n).unwrap_or_default();
            account.from_name = lookup("SMTP_FROM_NAME", n).unwrap_or_default();
            account.transport = transport;
            if let Some(port) = lookup("SMTP_PORT", n) {
                account.port = parse_var("SMTP_PORT", &port)?;
            }
            if let Some(limit) = lookup("SMTP_DAILY_LIMIT", n) {
                account.daily_limit = parse_var("SMTP_DAILY_LIMIT", &limit)?;
            }
            if let Some(limit) = lookup("SMTP_HOURLY_LIMIT", n) {
                account.hourly_limit = parse_var("SMTP_HOURLY_LIMIT", &limit)?;
            }
            if let Some(delay) = lookup("SMTP_DELAY", n) {
                account.min_delay_secs = parse_var("SMTP_DELAY", &delay)?;
            }

            accounts.push(account);
            n += 1;
        }

        Ok(accounts)
    }

    /// Check cross-field constraints that serde cannot express
    pub fn validate(&self) -> crate::Result<()> {
        let mut names = HashSet::new();
        for account in &self.accounts {
            if !names.insert(account.name.as_str()) {
                return Err(crate::Error::Config(format!(
                    "Duplicate account name: {}",
                    account.name
                )));
            }
            if account.daily_limit == 0 || account.hourly_limit == 0 {
                return Err(crate::Error::Config(format!(
                    "Account {} must have non-zero daily and hourly limits",
                    account.name
                )));
            }
            if !account.min_delay_secs.is_finite() || account.min_delay_secs < 0.0 {
                return Err(crate::Error::Config(format!(
                    "Account {} needs a finite, non-negative min_delay_secs",
                    account.name
                )));
            }
        }

        for (key, secs) in [
            ("dispatch.global_delay_secs", self.dispatch.global_delay_secs),
            ("dispatch.batch_delay_secs", self.dispatch.batch_delay_secs),
        ] {
            if !secs.is_finite() || secs < 0.0 {
                return Err(crate::Error::Config(format!(
                    "{} must be a finite, non-negative number of seconds",
                    key
                )));
            }
        }

        if self.dispatch.batch_size == 0 {
            return Err(crate::Error::Config(
                "dispatch.batch_size must be at least 1".to_string(),
            ));
        }

        if self.pool.max_failures == 0 {
            return Err(crate::Error::Config(
                "pool.max_failures must be at least 1".to_string(),
            ));
        }

        let mut rule_names = HashSet::new();
        for rule in &self.rules {
            if !rule_names.insert(rule.name.as_str()) {
                return Err(crate::Error::Config(format!(
                    "Duplicate follow-up rule name: {}",
                    rule.name
                )));
            }
            if !(0..=MAX_FOLLOW_UP_DAYS).contains(&rule.days) {
                return Err(crate::Error::Config(format!(
                    "Follow-up rule {} must wait between 0 and {} days",
                    rule.name, MAX_FOLLOW_UP_DAYS
                )));
            }
        }

        Ok(())
    }
}

fn parse_flag(value: Option<String>, default: bool) -> bool {
    value
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> crate::Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| crate::Error::Config(format!("Invalid value for {}: {}", key, value)))
}
