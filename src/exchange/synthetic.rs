use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::models::{Candle, KlineInterval};

struct SyntheticSeries {
    symbol: String,
    price: f64,
    volatility: f64,
    base_volume: f64,
    next_open: DateTime<Utc>,
}

/// Seeded random-walk candle generator feeding the paper exchange
///
/// Each symbol walks independently with its own volatility; bars are only
/// produced once their close time has passed, so the feed never runs ahead
/// of the clock it is driven by.
pub struct SyntheticMarket {
    rng: StdRng,
    interval: Duration,
    series: Vec<SyntheticSeries>,
}

impl SyntheticMarket {
    /// Create a new market with a seed for reproducibility
    pub fn new(seed: u64, interval: KlineInterval) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            interval: interval.duration(),
            series: Vec::new(),
        }
    }

    /// Register a symbol whose first bar opens at `start`
    ///
    /// `volatility` is the per-bar standard move as a fraction of price.
    pub fn add_symbol(
        &mut self,
        symbol: impl Into<String>,
        start_price: f64,
        volatility: f64,
        start: DateTime<Utc>,
    ) {
        self.series.push(SyntheticSeries {
            symbol: symbol.into(),
            price: start_price,
            volatility,
            base_volume: 1_000.0,
            next_open: start,
        });
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.series.iter().map(|s| s.symbol.as_str())
    }

    /// Generate every bar per symbol that has closed by `now`
    pub fn advance_to(&mut self, now: DateTime<Utc>) -> Vec<(String, Vec<Candle>)> {
        let interval = self.interval;
        let mut out = Vec::with_capacity(self.series.len());

        for series in &mut self.series {
            let mut candles = Vec::new();
            while series.next_open + interval <= now {
                let open_time = series.next_open;
                let candle = Self::next_bar(&mut self.rng, series, open_time, interval);
                candles.push(candle);
                series.next_open = open_time + interval;
            }
            out.push((series.symbol.clone(), candles));
        }

        out
    }

    fn next_bar(
        rng: &mut StdRng,
        series: &mut SyntheticSeries,
        open_time: DateTime<Utc>,
        interval: Duration,
    ) -> Candle {
        let open = series.price;
        let change = rng.gen_range(-series.volatility..=series.volatility);
        let close = (open * (1.0 + change)).max(0.01);

        // Intrabar range around open/close
        let wick = series.volatility * 0.5;
        let high = open.max(close) * (1.0 + rng.gen_range(0.0..=wick));
        let low = open.min(close) * (1.0 - rng.gen_range(0.0..=wick));

        // Vary volume ±30%
        let volume = series.base_volume * rng.gen_range(0.7..1.3);

        series.price = close;

        Candle {
            open_time,
            close_time: open_time + interval - Duration::milliseconds(1),
            open,
            high,
            low,
            close,
            volume,
        }
    }
}
