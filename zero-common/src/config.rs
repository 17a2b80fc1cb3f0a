//! Configuration management for Zero services.
//!
//! All Zero services share a unified configuration file at `~/.codecoder/config.json`.
//!
//! # Configuration Priority
//!
//! 1. Environment variables (ZERO_* prefix)
//! 2. Explicit config file values
//! 3. Default values
//!
//! # Environment Variable Mapping
//!
//! - `ZERO_LOG_LEVEL` → observability.log_level
//! - `ZERO_PORTFOLIO_DB` → portfolio.state_db
//! - `ZERO_PORTFOLIO_VENUE` → portfolio.venue
//!
//! # Example
//!
//! ```json
//! {
//!   "observability": { "log_level": "debug", "log_format": "json" },
//!   "portfolio": {
//!     "manager_name": "Default",
//!     "venue": "XNYS",
//!     "cancel_budget": 20,
//!     "confirm_poll_secs": 5
//!   }
//! }
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Error;

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".codecoder"),
        |dirs| dirs.home_dir().join(".codecoder"),
    )
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

/// Root configuration structure for the portfolio service.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// JSON Schema reference
    #[serde(rename = "$schema", default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Portfolio manager configuration
    #[serde(default)]
    pub portfolio: PortfolioServiceConfig,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            tracing::info!("Config file not found, using defaults");
            return Ok(Self::default());
        }

        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;

        config.portfolio.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable fallbacks.
    pub fn load_with_env() -> Result<Self> {
        let mut config = Self::load()?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("ZERO_LOG_LEVEL") {
            self.observability.log_level = level;
        }

        if let Ok(path) = std::env::var("ZERO_PORTFOLIO_DB") {
            self.portfolio.state_db = Some(PathBuf::from(path));
        }

        if let Ok(venue) = std::env::var("ZERO_PORTFOLIO_VENUE") {
            self.portfolio.venue = venue;
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    /// Aliases: "level" for backward compatibility with existing config files
    #[serde(default = "default_log_level", alias = "level")]
    pub log_level: String,

    /// Log format (json, pretty)
    /// Aliases: "format" for backward compatibility with existing config files
    #[serde(default = "default_log_format", alias = "format")]
    pub log_format: String,

    /// Additional module targets to exclude from logging.
    #[serde(default)]
    pub excluded_targets: Vec<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            excluded_targets: Vec::new(),
        }
    }
}

/// Portfolio manager configuration.
///
/// Every field has a default so a missing `portfolio` section yields a
/// working paper-trading setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioServiceConfig {
    /// Name of the manager (used in logs and as the store namespace)
    #[serde(default = "default_manager_name")]
    pub manager_name: String,

    /// Market venue passed to the broker's market-hours query
    #[serde(default = "default_venue")]
    pub venue: String,

    /// SQLite file for saved portfolios (defaults to `~/.codecoder/portfolio.db`)
    #[serde(default)]
    pub state_db: Option<PathBuf>,

    /// Headroom required on top of `price × quantity` before a buy is submitted
    #[serde(default = "default_buy_margin")]
    pub buy_margin: f64,

    /// Maximum share of account cash a new portfolio may start with
    #[serde(default = "default_initial_cash_cap")]
    pub initial_cash_cap: f64,

    /// Polls before an unfilled order is cancelled (unlimited when absent)
    #[serde(default)]
    pub cancel_budget: Option<u32>,

    /// Seconds between confirmation polls
    #[serde(default = "default_confirm_poll_secs")]
    pub confirm_poll_secs: u64,

    /// Minutes between market-hours checks
    #[serde(default = "default_market_poll_minutes")]
    pub market_poll_minutes: u64,

    /// Capacity of the symbol/instrument cache
    #[serde(default = "default_instrument_cache_capacity")]
    pub instrument_cache_capacity: usize,

    /// Prefix that marks a query as an instrument reference
    #[serde(default = "default_instrument_ref_prefix")]
    pub instrument_ref_prefix: String,

    /// Concurrent order-placement workers per portfolio
    #[serde(default = "default_max_order_workers")]
    pub max_order_workers: usize,

    /// Starting cash of the paper account
    #[serde(default = "default_paper_cash")]
    pub paper_cash: f64,
}

impl Default for PortfolioServiceConfig {
    fn default() -> Self {
        Self {
            manager_name: default_manager_name(),
            venue: default_venue(),
            state_db: None,
            buy_margin: default_buy_margin(),
            initial_cash_cap: default_initial_cash_cap(),
            cancel_budget: None,
            confirm_poll_secs: default_confirm_poll_secs(),
            market_poll_minutes: default_market_poll_minutes(),
            instrument_cache_capacity: default_instrument_cache_capacity(),
            instrument_ref_prefix: default_instrument_ref_prefix(),
            max_order_workers: default_max_order_workers(),
            paper_cash: default_paper_cash(),
        }
    }
}

impl PortfolioServiceConfig {
    /// Resolved path of the state database.
    pub fn state_db_path(&self) -> PathBuf {
        self.state_db
            .clone()
            .unwrap_or_else(|| config_dir().join("portfolio.db"))
    }

    /// Reject values the manager cannot operate with.
    pub fn validate(&self) -> crate::error::Result<()> {
        const SECTION: &str = "portfolio";
        if !(self.initial_cash_cap > 0.0 && self.initial_cash_cap <= 1.0) {
            return Err(Error::invalid(
                SECTION,
                "initial_cash_cap",
                format!("must be in (0, 1], got {}", self.initial_cash_cap),
            ));
        }
        if self.buy_margin < 0.0 {
            return Err(Error::invalid(
                SECTION,
                "buy_margin",
                format!("must not be negative, got {}", self.buy_margin),
            ));
        }
        if self.instrument_cache_capacity == 0 {
            return Err(Error::invalid(SECTION, "instrument_cache_capacity", "must be positive"));
        }
        if self.max_order_workers == 0 {
            return Err(Error::invalid(SECTION, "max_order_workers", "must be positive"));
        }
        Ok(())
    }
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "pretty".into()
}
fn default_manager_name() -> String {
    "Default".into()
}
fn default_venue() -> String {
    "XNYS".into()
}
fn default_buy_margin() -> f64 {
    0.005
}
fn default_initial_cash_cap() -> f64 {
    0.7
}
fn default_confirm_poll_secs() -> u64 {
    5
}
fn default_market_poll_minutes() -> u64 {
    15
}
fn default_instrument_cache_capacity() -> usize {
    500
}
fn default_instrument_ref_prefix() -> String {
    "https:".into()
}
fn default_max_order_workers() -> usize {
    8
}
fn default_paper_cash() -> f64 {
    100_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.observability.log_level, "info");
        assert_eq!(config.portfolio.venue, "XNYS");
        assert!((config.portfolio.buy_margin - 0.005).abs() < 1e-12);
        assert!((config.portfolio.initial_cash_cap - 0.7).abs() < 1e-12);
        assert_eq!(config.portfolio.cancel_budget, None);
        assert_eq!(config.portfolio.market_poll_minutes, 15);
        assert_eq!(config.portfolio.instrument_cache_capacity, 500);
    }

    #[test]
    fn test_partial_section_fills_defaults() {
        let config: Config = serde_json::from_str(
            r#"{"observability": {"level": "debug"}, "portfolio": {"cancel_budget": 3}}"#,
        )
        .unwrap();
        assert_eq!(config.observability.log_level, "debug");
        assert_eq!(config.observability.log_format, "pretty");
        assert_eq!(config.portfolio.cancel_budget, Some(3));
        assert_eq!(config.portfolio.confirm_poll_secs, 5);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"portfolio": {{"manager_name": "Desk", "venue": "XNAS", "state_db": "/tmp/p.db"}}}}"#
        )
        .unwrap();

        let config = Config::load_from(file.path()).unwrap();
        assert_eq!(config.portfolio.manager_name, "Desk");
        assert_eq!(config.portfolio.venue, "XNAS");
        assert_eq!(config.portfolio.state_db_path(), PathBuf::from("/tmp/p.db"));
    }

    #[test]
    fn test_load_rejects_invalid_cap() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"portfolio": {{"initial_cash_cap": 1.5}}}}"#).unwrap();

        let err = Config::load_from(file.path()).unwrap_err();
        assert!(err.to_string().contains("initial_cash_cap"));
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let config = PortfolioServiceConfig {
            instrument_cache_capacity: 0,
            ..Default::default()
        };
        assert_eq!(config.validate().unwrap_err().field(), "instrument_cache_capacity");
    }
}
