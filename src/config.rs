// Runtime configuration loaded from the environment (and `.env` via dotenv)

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Largest seed reserve; keeps `k = L²` and the pool arithmetic inside Decimal range
pub const MAX_INITIAL_LIQUIDITY: i64 = 1_000_000_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}'")]
    InvalidValue { key: &'static str, value: String },

    #[error("inconsistent configuration: {0}")]
    Inconsistent(String),
}

/// Business rules for markets and bets.
#[derive(Debug, Clone)]
pub struct MarketSettings {
    /// Distinct voters one option needs before the market can resolve
    pub min_resolution_votes: usize,
    /// Starting reserve for every option; k = initial_liquidity²
    pub initial_liquidity: i64,
    pub min_bet: i64,
    pub max_bet: i64,
    pub max_options: usize,
    pub min_duration: chrono::Duration,
    pub max_duration: chrono::Duration,
    /// How long after `end_time` an unresolved market is refunded
    pub auto_refund_window: chrono::Duration,
    pub quote_cache_ttl: Duration,
}

impl Default for MarketSettings {
    fn default() -> Self {
        Self {
            min_resolution_votes: 2,
            initial_liquidity: 1000,
            min_bet: 1,
            max_bet: 1_000_000,
            max_options: 10,
            min_duration: chrono::Duration::minutes(5),
            max_duration: chrono::Duration::hours(720),
            auto_refund_window: chrono::Duration::hours(120),
            quote_cache_ttl: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub expiry_interval: Duration,
    pub refund_interval: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            expiry_interval: Duration::from_secs(300),
            refund_interval: Duration::from_secs(3600),
        }
    }
}

/// Backoff policy for balance-service calls.
#[derive(Debug, Clone)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: String,
    pub bind_addr: SocketAddr,
    pub log_level: String,
    /// Remote points API; `None` keeps balances in the ledger database
    pub points_api_url: Option<String>,
    pub starting_balance: i64,
    pub notify_webhook_url: Option<String>,
    pub market: MarketSettings,
    pub scheduler: SchedulerSettings,
    pub retry: RetrySettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: "data/ledger".to_string(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 1234)),
            log_level: "info".to_string(),
            points_api_url: None,
            starting_balance: 1000,
            notify_webhook_url: None,
            market: MarketSettings::default(),
            scheduler: SchedulerSettings::default(),
            retry: RetrySettings::default(),
        }
    }
}

impl Config {
    /// Load configuration from the process environment, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from any key lookup (the environment in production).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();
        let market_defaults = MarketSettings::default();
        let scheduler_defaults = SchedulerSettings::default();
        let retry_defaults = RetrySettings::default();

        let market = MarketSettings {
            min_resolution_votes: parse_or(&lookup, "MIN_RESOLUTION_VOTES", market_defaults.min_resolution_votes)?,
            initial_liquidity: parse_or(&lookup, "INITIAL_LIQUIDITY", market_defaults.initial_liquidity)?,
            min_bet: parse_or(&lookup, "MIN_BET", market_defaults.min_bet)?,
            max_bet: parse_or(&lookup, "MAX_BET", market_defaults.max_bet)?,
            max_options: parse_or(&lookup, "MAX_OPTIONS", market_defaults.max_options)?,
            min_duration: chrono::Duration::minutes(parse_or(&lookup, "MIN_DURATION_MINUTES", 5i64)?),
            max_duration: chrono::Duration::hours(parse_or(&lookup, "MAX_DURATION_HOURS", 720i64)?),
            auto_refund_window: chrono::Duration::hours(parse_or(&lookup, "AUTO_REFUND_HOURS", 120i64)?),
            quote_cache_ttl: Duration::from_secs(parse_or(&lookup, "QUOTE_CACHE_TTL_SECS", 5u64)?),
        };

        let scheduler = SchedulerSettings {
            expiry_interval: Duration::from_secs(parse_or(
                &lookup,
                "EXPIRY_INTERVAL_SECS",
                scheduler_defaults.expiry_interval.as_secs(),
            )?),
            refund_interval: Duration::from_secs(parse_or(
                &lookup,
                "REFUND_INTERVAL_SECS",
                scheduler_defaults.refund_interval.as_secs(),
            )?),
        };

        let retry = RetrySettings {
            max_attempts: parse_or(&lookup, "BALANCE_RETRY_ATTEMPTS", retry_defaults.max_attempts)?,
            base_backoff: Duration::from_millis(parse_or(&lookup, "BALANCE_RETRY_BASE_MS", 200u64)?),
            max_backoff: retry_defaults.max_backoff,
        };

        let config = Config {
            db_path: lookup("LEDGER_DB_PATH").unwrap_or(defaults.db_path),
            bind_addr: parse_or(&lookup, "BIND_ADDR", defaults.bind_addr)?,
            log_level: lookup("LOG_LEVEL").unwrap_or(defaults.log_level),
            points_api_url: lookup("POINTS_API_URL").filter(|url| !url.trim().is_empty()),
            starting_balance: parse_or(&lookup, "STARTING_BALANCE", defaults.starting_balance)?,
            notify_webhook_url: lookup("NOTIFY_WEBHOOK_URL").filter(|url| !url.trim().is_empty()),
            market,
            scheduler,
            retry,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let m = &self.market;
        if m.min_resolution_votes == 0 {
            return Err(ConfigError::Inconsistent("MIN_RESOLUTION_VOTES must be at least 1".into()));
        }
        if m.initial_liquidity <= 0 || m.initial_liquidity > MAX_INITIAL_LIQUIDITY {
            return Err(ConfigError::Inconsistent(format!(
                "INITIAL_LIQUIDITY must be between 1 and {}",
                MAX_INITIAL_LIQUIDITY
            )));
        }
        if m.min_bet <= 0 || m.min_bet > m.max_bet {
            return Err(ConfigError::Inconsistent(format!(
                "bet limits must satisfy 0 < MIN_BET <= MAX_BET (got {} and {})",
                m.min_bet, m.max_bet
            )));
        }
        if m.max_options < 2 {
            return Err(ConfigError::Inconsistent("MAX_OPTIONS must be at least 2".into()));
        }
        if m.min_duration > m.max_duration {
            return Err(ConfigError::Inconsistent("minimum duration exceeds maximum duration".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Inconsistent("BALANCE_RETRY_ATTEMPTS must be at least 1".into()));
        }
        Ok(())
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value: raw }),
        _ => Ok(default),
    }
}
