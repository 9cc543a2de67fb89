use ::config::{Config, Environment, File};
use anyhow::Context;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::exchange::RetryPolicy;
use crate::execution::coordinator::{CapitalMode, CoordinatorSettings, PairSpec};
use crate::models::KlineInterval;
use crate::strategy::{StrategyConfig, StrategyKind};

/// Environment variables look like `PAIRTRADER__STOP_LOSS_FRACTION`
const ENV_PREFIX: &str = "PAIRTRADER";
const ENV_SEPARATOR: &str = "__";

/// Config file picked up from the working directory when `--config` is absent
pub const DEFAULT_CONFIG_FILE: &str = "pairtrader.toml";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{name} must be within [0, 1), got {value}")]
    FractionOutOfRange { name: &'static str, value: Decimal },

    #[error("invalid strategy parameters: {0}")]
    Strategy(String),

    #[error("no active trading pairs (active_assets: {0:?})")]
    NoActivePairs(Vec<String>),

    #[error("{0} must be positive")]
    NotPositive(&'static str),
}

/// One tradeable base asset and its strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairSettings {
    pub base_asset: String,
    #[serde(default)]
    pub strategy: StrategyConfig,
    /// Starting price of the simulated market for this asset
    #[serde(default = "default_paper_price")]
    pub paper_price: f64,
}

fn default_paper_price() -> f64 {
    100.0
}

impl PairSettings {
    fn new(base_asset: &str, fast: usize, medium: usize, slow: usize, paper_price: f64) -> Self {
        Self {
            base_asset: base_asset.to_string(),
            strategy: StrategyConfig::new("", StrategyKind::FilteredCrossover)
                .with_periods(fast, medium, slow),
            paper_price,
        }
    }

    pub fn symbol(&self, quote_asset: &str) -> String {
        format!("{}{}", self.base_asset, quote_asset)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub quote_asset: String,
    pub pairs: Vec<PairSettings>,
    pub active_assets: Vec<String>,
    pub kline_interval: KlineInterval,
    pub poll_interval_secs: u64,
    pub pair_pause_ms: u64,
    pub stop_loss_fraction: Decimal,
    pub take_profit_fraction: Decimal,
    pub capital_mode: CapitalMode,
    pub fixed_amount: Decimal,
    pub telegram_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub checkpoint_path: Option<PathBuf>,
    pub redis_url: Option<String>,
    pub control_file: Option<PathBuf>,
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub requests_per_minute: u32,
    pub paper_starting_balance: Decimal,
    pub paper_seed: u64,
    pub paper_history_bars: usize,
    pub paper_volatility: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            quote_asset: "USDT".to_string(),
            pairs: vec![
                PairSettings::new("BTC", 7, 20, 40, 60_000.0),
                PairSettings::new("ETH", 10, 25, 50, 3_000.0),
                PairSettings::new("SOL", 5, 15, 30, 150.0),
            ],
            active_assets: vec!["BTC".to_string(), "ETH".to_string(), "SOL".to_string()],
            kline_interval: KlineInterval::Hours(2),
            poll_interval_secs: 300,
            pair_pause_ms: 500,
            stop_loss_fraction: Decimal::ZERO,
            take_profit_fraction: Decimal::ZERO,
            capital_mode: CapitalMode::PerPairPool,
            fixed_amount: Decimal::from(20),
            telegram_token: None,
            telegram_chat_id: None,
            checkpoint_path: None,
            redis_url: None,
            control_file: None,
            retry_attempts: 3,
            retry_base_delay_ms: 1000,
            requests_per_minute: 600,
            paper_starting_balance: Decimal::from(10_000),
            paper_seed: 42,
            paper_history_bars: 200,
            paper_volatility: 0.01,
        }
    }
}

impl Settings {
    /// Defaults, then the config file, then `PAIRTRADER__*` variables
    ///
    /// Without an explicit path, `pairtrader.toml` is used when it exists.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let defaults = Config::try_from(&Settings::default())
            .context("Failed to build default configuration")?;

        let mut builder = Config::builder().add_source(defaults);
        builder = match path {
            Some(path) => builder.add_source(File::from(path).required(true)),
            None => builder.add_source(File::with_name(DEFAULT_CONFIG_FILE).required(false)),
        };
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator(ENV_SEPARATOR)
                .separator(ENV_SEPARATOR)
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("active_assets"),
        );

        let settings: Settings = builder
            .build()
            .context("Failed to load configuration")?
            .try_deserialize()
            .context("Failed to parse configuration")?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("stop_loss_fraction", self.stop_loss_fraction),
            ("take_profit_fraction", self.take_profit_fraction),
        ] {
            if value < Decimal::ZERO || value >= Decimal::ONE {
                return Err(ConfigError::FractionOutOfRange { name, value });
            }
        }

        if self.poll_interval_secs == 0 {
            return Err(ConfigError::NotPositive("poll_interval_secs"));
        }
        if self.retry_attempts == 0 {
            return Err(ConfigError::NotPositive("retry_attempts"));
        }
        if self.requests_per_minute == 0 {
            return Err(ConfigError::NotPositive("requests_per_minute"));
        }
        if self.capital_mode == CapitalMode::FixedAmount && self.fixed_amount <= Decimal::ZERO {
            return Err(ConfigError::NotPositive("fixed_amount"));
        }

        let active = self.active_pairs();
        if active.is_empty() {
            return Err(ConfigError::NoActivePairs(self.active_assets.clone()));
        }
        for pair in &active {
            pair.strategy.validate().map_err(ConfigError::Strategy)?;
        }

        Ok(())
    }

    fn is_active(&self, base_asset: &str) -> bool {
        self.active_assets
            .iter()
            .any(|a| a.trim().eq_ignore_ascii_case(base_asset))
    }

    /// Pair settings whose base asset is listed in `active_assets`
    pub fn active_pair_settings(&self) -> Vec<&PairSettings> {
        self.pairs.iter().filter(|p| self.is_active(&p.base_asset)).collect()
    }

    /// Pairs to trade, in configuration order
    ///
    /// Active assets without pair settings are warned about and ignored.
    pub fn active_pairs(&self) -> Vec<PairSpec> {
        for asset in &self.active_assets {
            let asset = asset.trim();
            if !self.pairs.iter().any(|p| p.base_asset.eq_ignore_ascii_case(asset)) {
                warn!("Unsupported asset '{}' in active_assets, ignoring", asset);
            }
        }

        self.active_pair_settings()
            .into_iter()
            .map(|p| {
                let mut strategy = p.strategy.clone();
                strategy.symbol = p.symbol(&self.quote_asset);
                PairSpec {
                    base_asset: p.base_asset.clone(),
                    strategy,
                }
            })
            .collect()
    }

    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            quote_asset: self.quote_asset.clone(),
            kline_interval: self.kline_interval,
            pair_pause: Duration::from_millis(self.pair_pause_ms),
            capital_mode: self.capital_mode,
            fixed_amount: self.fixed_amount,
            stop_loss_fraction: self.stop_loss_fraction,
            take_profit_fraction: self.take_profit_fraction,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Both Telegram settings present and non-empty
    pub fn telegram(&self) -> Option<(&str, &str)> {
        match (self.telegram_token.as_deref(), self.telegram_chat_id.as_deref()) {
            (Some(token), Some(chat)) if !token.is_empty() && !chat.is_empty() => Some((token, chat)),
            _ => None,
        }
    }
}
