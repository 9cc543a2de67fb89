use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::execution::quantize::decimal_places;

/// OHLCV candlestick for one fixed-width timeframe
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// A candle is closed once its close time is not in the future
    pub fn is_closed_at(&self, now: DateTime<Utc>) -> bool {
        self.close_time <= now
    }
}

/// Decision emitted by a strategy for one evaluated bar
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Action {
    Buy,
    Sell,
    Hold,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Buy => write!(f, "BUY"),
            Action::Sell => write!(f, "SELL"),
            Action::Hold => write!(f, "HOLD"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderSide {
    Buy,
    Sell,
}

/// Kline timeframe, using exchange notation ("5m", "2h", "1d")
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum KlineInterval {
    Minutes(u32),
    Hours(u32),
    Days(u32),
}

impl KlineInterval {
    pub fn duration(&self) -> Duration {
        match *self {
            KlineInterval::Minutes(n) => Duration::minutes(n as i64),
            KlineInterval::Hours(n) => Duration::hours(n as i64),
            KlineInterval::Days(n) => Duration::days(n as i64),
        }
    }
}

impl fmt::Display for KlineInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KlineInterval::Minutes(n) => write!(f, "{}m", n),
            KlineInterval::Hours(n) => write!(f, "{}h", n),
            KlineInterval::Days(n) => write!(f, "{}d", n),
        }
    }
}

impl FromStr for KlineInterval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() < 2 {
            return Err(format!("invalid kline interval '{}'", s));
        }
        let (count, unit) = s.split_at(s.len() - 1);
        let count: u32 = count
            .parse()
            .map_err(|_| format!("invalid kline interval '{}'", s))?;
        if count == 0 {
            return Err(format!("kline interval must be positive, got '{}'", s));
        }
        match unit {
            "m" => Ok(KlineInterval::Minutes(count)),
            "h" => Ok(KlineInterval::Hours(count)),
            "d" => Ok(KlineInterval::Days(count)),
            _ => Err(format!("unknown kline interval unit in '{}'", s)),
        }
    }
}

impl TryFrom<String> for KlineInterval {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<KlineInterval> for String {
    fn from(value: KlineInterval) -> Self {
        value.to_string()
    }
}

/// Exchange filters for one symbol, fetched at startup
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SymbolTradingRules {
    pub symbol: String,
    pub quantity_step_size: Decimal,
    pub quantity_decimal_places: u32,
    pub price_tick_size: Decimal,
    pub price_decimal_places: u32,
    pub min_notional: Decimal,
    pub min_quantity: Decimal,
}

impl SymbolTradingRules {
    /// Build rules from step/tick sizes, deriving the decimal places from them
    pub fn new(
        symbol: impl Into<String>,
        quantity_step_size: Decimal,
        price_tick_size: Decimal,
        min_notional: Decimal,
        min_quantity: Decimal,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            quantity_decimal_places: decimal_places(quantity_step_size),
            quantity_step_size,
            price_decimal_places: decimal_places(price_tick_size),
            price_tick_size,
            min_notional,
            min_quantity,
        }
    }

    /// Balances strictly below the minimum order quantity cannot be traded
    pub fn is_dust(&self, quantity: Decimal) -> bool {
        quantity <= Decimal::ZERO || quantity < self.min_quantity
    }
}

/// One execution within a filled order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Fill {
    pub price: Decimal,
    pub quantity: Decimal,
}

/// Exchange response to a market order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FillReport {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub status: String,
    pub fills: Vec<Fill>,
}

impl FillReport {
    pub fn executed_quantity(&self) -> Decimal {
        self.fills.iter().map(|f| f.quantity).sum()
    }

    /// Quote amount spent (buy) or received (sell)
    pub fn quote_amount(&self) -> Decimal {
        self.fills.iter().map(|f| f.quantity * f.price).sum()
    }

    /// Volume-weighted fill price, or None when nothing executed
    pub fn average_price(&self) -> Option<Decimal> {
        let qty = self.executed_quantity();
        if qty > Decimal::ZERO {
            Some(self.quote_amount() / qty)
        } else {
            None
        }
    }
}

/// Validate that candles are strictly increasing in open time
///
/// Gaps are allowed (the exchange may skip a bar); duplicates and
/// out-of-order bars are not.
pub fn validate_candles(candles: &[Candle]) -> anyhow::Result<()> {
    for window in candles.windows(2) {
        if window[1].open_time <= window[0].open_time {
            anyhow::bail!(
                "Candles are not strictly increasing: {} followed by {}",
                window[0].open_time.format("%Y-%m-%d %H:%M:%S"),
                window[1].open_time.format("%Y-%m-%d %H:%M:%S")
            );
        }
    }
    Ok(())
}

/// Drop trailing candles that are still forming at `now`
pub fn closed_candles(candles: &[Candle], now: DateTime<Utc>) -> &[Candle] {
    let mut end = candles.len();
    while end > 0 && !candles[end - 1].is_closed_at(now) {
        end -= 1;
    }
    &candles[..end]
}
