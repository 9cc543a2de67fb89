// Exchange collaborator: trait, error taxonomy and implementations
pub mod clock;
pub mod guarded;
pub mod paper;
pub mod synthetic;

pub use clock::ClockOffset;
pub use guarded::{GuardedExchange, RetryPolicy};
pub use paper::{PaperExchange, PaperOp};
pub use synthetic::SyntheticMarket;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use thiserror::Error;

use crate::models::{Candle, FillReport, KlineInterval, SymbolTradingRules};

/// Most klines a single request may return, as on Binance
pub const MAX_KLINES_PER_REQUEST: usize = 1000;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExchangeError {
    /// Network failure or timeout; safe to retry
    #[error("transient exchange error: {0}")]
    Transient(String),

    #[error("rate limited by exchange: {0}")]
    RateLimited(String),

    /// The exchange understood the request and refused it
    #[error("exchange rejected request ({code}): {message}")]
    Rejected { code: i64, message: String },

    #[error("exchange authentication failed: {0}")]
    Auth(String),

    #[error("order for {0} returned no fills")]
    NoFills(String),

    #[error("malformed exchange response: {0}")]
    Malformed(String),
}

impl ExchangeError {
    /// Only network faults are worth another attempt
    pub fn is_transient(&self) -> bool {
        matches!(self, ExchangeError::Transient(_))
    }
}

/// Spot exchange operations the trading loop relies on
///
/// Signed calls take a millisecond timestamp already corrected by the
/// startup [`ClockOffset`].
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Most recent `limit` klines, oldest first. The last one may still be forming.
    async fn get_klines(
        &self,
        symbol: &str,
        interval: KlineInterval,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError>;

    async fn get_symbol_info(&self, symbol: &str) -> Result<SymbolTradingRules, ExchangeError>;

    async fn get_ticker_price(&self, symbol: &str) -> Result<Decimal, ExchangeError>;

    /// Free balance per asset
    async fn get_account_balances(
        &self,
        timestamp_ms: i64,
    ) -> Result<HashMap<String, Decimal>, ExchangeError>;

    async fn market_buy(
        &self,
        symbol: &str,
        quantity: Decimal,
        timestamp_ms: i64,
    ) -> Result<FillReport, ExchangeError>;

    async fn market_sell(
        &self,
        symbol: &str,
        quantity: Decimal,
        timestamp_ms: i64,
    ) -> Result<FillReport, ExchangeError>;

    async fn server_time(&self) -> Result<DateTime<Utc>, ExchangeError>;
}
