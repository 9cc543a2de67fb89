use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::*;
use std::collections::{HashMap, VecDeque};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{Exchange, ExchangeError, MAX_KLINES_PER_REQUEST};
use crate::models::{Candle, Fill, FillReport, KlineInterval, OrderSide, SymbolTradingRules};

/// Filled orders kept for inspection; older ones are dropped
pub const ORDER_LOG_LIMIT: usize = 1000;

/// Exchange calls that can have failures injected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaperOp {
    Klines,
    SymbolInfo,
    Ticker,
    Balances,
    Buy,
    Sell,
    ServerTime,
}

struct PaperMarket {
    base_asset: String,
    rules: SymbolTradingRules,
    price: Decimal,
    candles: Vec<Candle>,
}

struct PaperState {
    quote_asset: String,
    markets: HashMap<String, PaperMarket>,
    balances: HashMap<String, Decimal>,
    failures: HashMap<PaperOp, VecDeque<ExchangeError>>,
    orders: Vec<FillReport>,
    server_offset_ms: i64,
}

impl PaperState {
    fn take_failure(&mut self, op: PaperOp) -> Result<(), ExchangeError> {
        match self.failures.get_mut(&op).and_then(|queue| queue.pop_front()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn market(&self, symbol: &str) -> Result<&PaperMarket, ExchangeError> {
        self.markets.get(symbol).ok_or_else(invalid_symbol)
    }

    fn balance(&self, asset: &str) -> Decimal {
        self.balances.get(asset).copied().unwrap_or_default()
    }
}

fn invalid_symbol() -> ExchangeError {
    ExchangeError::Rejected {
        code: -1121,
        message: "Invalid symbol.".to_string(),
    }
}

/// In-memory spot exchange filling market orders at the ticker price
///
/// Orders are checked against the symbol's LOT_SIZE and MIN_NOTIONAL rules
/// and the free balances, like a real venue would. Failures can be queued
/// per operation to exercise the error paths of callers.
pub struct PaperExchange {
    state: Mutex<PaperState>,
}

impl PaperExchange {
    pub fn new(quote_asset: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(PaperState {
                quote_asset: quote_asset.into(),
                markets: HashMap::new(),
                balances: HashMap::new(),
                failures: HashMap::new(),
                orders: Vec::new(),
                server_offset_ms: 0,
            }),
        }
    }

    pub async fn add_market(
        &self,
        symbol: &str,
        base_asset: &str,
        rules: SymbolTradingRules,
        price: Decimal,
    ) {
        let mut state = self.state.lock().await;
        state.markets.insert(
            symbol.to_string(),
            PaperMarket {
                base_asset: base_asset.to_string(),
                rules,
                price,
                candles: Vec::new(),
            },
        );
    }

    pub async fn set_balance(&self, asset: &str, amount: Decimal) {
        self.state
            .lock()
            .await
            .balances
            .insert(asset.to_string(), amount);
    }

    pub async fn balance(&self, asset: &str) -> Decimal {
        self.state.lock().await.balance(asset)
    }

    pub async fn set_price(&self, symbol: &str, price: Decimal) {
        if let Some(market) = self.state.lock().await.markets.get_mut(symbol) {
            market.price = price;
        }
    }

    /// Append candles to a symbol's feed; the ticker follows the last close
    pub async fn push_candles(&self, symbol: &str, candles: Vec<Candle>) {
        let mut state = self.state.lock().await;
        let Some(market) = state.markets.get_mut(symbol) else {
            tracing::warn!("Paper exchange has no market {}", symbol);
            return;
        };
        if let Some(price) = candles
            .last()
            .and_then(|c| Decimal::from_f64(c.close))
            .map(|p| p.round_dp(market.rules.price_decimal_places))
        {
            market.price = price;
        }
        market.candles.extend(candles);
        let excess = market.candles.len().saturating_sub(MAX_KLINES_PER_REQUEST);
        market.candles.drain(..excess);
    }

    /// Queue an error for the next call of `op`
    pub async fn fail_next(&self, op: PaperOp, error: ExchangeError) {
        self.state
            .lock()
            .await
            .failures
            .entry(op)
            .or_default()
            .push_back(error);
    }

    pub async fn set_server_offset_ms(&self, offset_ms: i64) {
        self.state.lock().await.server_offset_ms = offset_ms;
    }

    /// The most recent filled orders, at most `ORDER_LOG_LIMIT`
    pub async fn orders(&self) -> Vec<FillReport> {
        self.state.lock().await.orders.clone()
    }

    async fn execute(
        &self,
        op: PaperOp,
        side: OrderSide,
        symbol: &str,
        quantity: Decimal,
    ) -> Result<FillReport, ExchangeError> {
        let mut state = self.state.lock().await;
        state.take_failure(op)?;

        let market = state.market(symbol)?;
        let rules = &market.rules;
        let price = market.price;
        let base_asset = market.base_asset.clone();

        if quantity < rules.min_quantity
            || (rules.quantity_step_size > Decimal::ZERO
                && quantity % rules.quantity_step_size != Decimal::ZERO)
        {
            return Err(ExchangeError::Rejected {
                code: -1013,
                message: "Filter failure: LOT_SIZE".to_string(),
            });
        }

        let notional = quantity * price;
        if notional < rules.min_notional {
            return Err(ExchangeError::Rejected {
                code: -1013,
                message: "Filter failure: MIN_NOTIONAL".to_string(),
            });
        }

        let quote_asset = state.quote_asset.clone();
        let (debit_asset, debit, credit_asset, credit) = match side {
            OrderSide::Buy => (quote_asset, notional, base_asset, quantity),
            OrderSide::Sell => (base_asset, quantity, quote_asset, notional),
        };

        if state.balance(&debit_asset) < debit {
            return Err(ExchangeError::Rejected {
                code: -2010,
                message: "Account has insufficient balance for requested action.".to_string(),
            });
        }

        *state.balances.entry(debit_asset).or_default() -= debit;
        *state.balances.entry(credit_asset).or_default() += credit;

        let report = FillReport {
            order_id: Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            side,
            status: "FILLED".to_string(),
            fills: vec![Fill { price, quantity }],
        };
        state.orders.push(report.clone());
        let excess = state.orders.len().saturating_sub(ORDER_LOG_LIMIT);
        state.orders.drain(..excess);
        Ok(report)
    }
}

#[async_trait]
impl Exchange for PaperExchange {
    async fn get_klines(
        &self,
        symbol: &str,
        _interval: KlineInterval,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let mut state = self.state.lock().await;
        state.take_failure(PaperOp::Klines)?;
        let candles = &state.market(symbol)?.candles;
        let start = candles.len().saturating_sub(limit);
        Ok(candles[start..].to_vec())
    }

    async fn get_symbol_info(&self, symbol: &str) -> Result<SymbolTradingRules, ExchangeError> {
        let mut state = self.state.lock().await;
        state.take_failure(PaperOp::SymbolInfo)?;
        Ok(state.market(symbol)?.rules.clone())
    }

    async fn get_ticker_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        let mut state = self.state.lock().await;
        state.take_failure(PaperOp::Ticker)?;
        Ok(state.market(symbol)?.price)
    }

    async fn get_account_balances(
        &self,
        _timestamp_ms: i64,
    ) -> Result<HashMap<String, Decimal>, ExchangeError> {
        let mut state = self.state.lock().await;
        state.take_failure(PaperOp::Balances)?;
        Ok(state.balances.clone())
    }

    async fn market_buy(
        &self,
        symbol: &str,
        quantity: Decimal,
        _timestamp_ms: i64,
    ) -> Result<FillReport, ExchangeError> {
        self.execute(PaperOp::Buy, OrderSide::Buy, symbol, quantity)
            .await
    }

    async fn market_sell(
        &self,
        symbol: &str,
        quantity: Decimal,
        _timestamp_ms: i64,
    ) -> Result<FillReport, ExchangeError> {
        self.execute(PaperOp::Sell, OrderSide::Sell, symbol, quantity)
            .await
    }

    async fn server_time(&self) -> Result<DateTime<Utc>, ExchangeError> {
        let mut state = self.state.lock().await;
        state.take_failure(PaperOp::ServerTime)?;
        Ok(Utc::now() + Duration::milliseconds(state.server_offset_ms))
    }
}
