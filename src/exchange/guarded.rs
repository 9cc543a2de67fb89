use async_trait::async_trait;
use chrono::{DateTime, Utc};
use governor::{Quota, RateLimiter};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use super::{Exchange, ExchangeError};
use crate::models::{Candle, FillReport, KlineInterval, SymbolTradingRules};

// Type alias for the rate limiter to simplify signatures
type ExchangeRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Backoff before attempt n+1 is `base_delay * 2^n`
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt)
    }
}

/// Rate-limited, retrying wrapper around any exchange
///
/// Reads are retried on network faults only. Orders are never retried: a
/// timed-out order may have executed. Rate limiting is a refusal by the
/// exchange and goes back to the caller like any other rejection.
#[derive(Clone)]
pub struct GuardedExchange {
    inner: Arc<dyn Exchange>,
    rate_limiter: Arc<ExchangeRateLimiter>,
    policy: RetryPolicy,
}

impl GuardedExchange {
    pub fn new(inner: Arc<dyn Exchange>, requests_per_minute: u32, policy: RetryPolicy) -> Self {
        let rpm = NonZeroU32::new(requests_per_minute).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::per_minute(rpm);
        Self {
            inner,
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
            policy,
        }
    }

    /// Make a rate-limited exchange call with retry logic
    async fn call<T, F, Fut>(
        &self,
        operation: &str,
        retry_transient: bool,
        mut request: F,
    ) -> Result<T, ExchangeError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, ExchangeError>> + Send,
        T: Send,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            // Wait for rate limiter
            self.rate_limiter.until_ready().await;

            let err = match request().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !(retry_transient && err.is_transient()) || attempt >= max_attempts {
                return Err(err);
            }

            let backoff = self.policy.backoff(attempt);
            tracing::warn!(
                "{} failed: {}, retrying in {:?} (attempt {}/{})",
                operation,
                err,
                backoff,
                attempt,
                max_attempts
            );
            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl Exchange for GuardedExchange {
    async fn get_klines(
        &self,
        symbol: &str,
        interval: KlineInterval,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError> {
        self.call("get_klines", true, || self.inner.get_klines(symbol, interval, limit))
            .await
    }

    async fn get_symbol_info(&self, symbol: &str) -> Result<SymbolTradingRules, ExchangeError> {
        self.call("get_symbol_info", true, || self.inner.get_symbol_info(symbol))
            .await
    }

    async fn get_ticker_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        self.call("get_ticker_price", true, || self.inner.get_ticker_price(symbol))
            .await
    }

    async fn get_account_balances(
        &self,
        timestamp_ms: i64,
    ) -> Result<HashMap<String, Decimal>, ExchangeError> {
        self.call("get_account_balances", true, || {
            self.inner.get_account_balances(timestamp_ms)
        })
        .await
    }

    async fn market_buy(
        &self,
        symbol: &str,
        quantity: Decimal,
        timestamp_ms: i64,
    ) -> Result<FillReport, ExchangeError> {
        self.call("market_buy", false, || {
            self.inner.market_buy(symbol, quantity, timestamp_ms)
        })
        .await
    }

    async fn market_sell(
        &self,
        symbol: &str,
        quantity: Decimal,
        timestamp_ms: i64,
    ) -> Result<FillReport, ExchangeError> {
        self.call("market_sell", false, || {
            self.inner.market_sell(symbol, quantity, timestamp_ms)
        })
        .await
    }

    async fn server_time(&self) -> Result<DateTime<Utc>, ExchangeError> {
        self.call("server_time", true, || self.inner.server_time()).await
    }
}
