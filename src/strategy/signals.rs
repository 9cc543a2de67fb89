use serde::{Deserialize, Serialize};

use super::config::StrategyConfig;
use crate::indicators::{calculate_adx, calculate_ema, calculate_rsi, volume_ratio};
use crate::models::Candle;

/// Indicator values for one evaluated bar
///
/// Filter fields are only populated for strategy kinds that use them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub fast: f64,
    pub medium: f64,
    pub slow: f64,
    pub rsi: Option<f64>,
    pub adx: Option<f64>,
    pub volume_ratio: Option<f64>,
}

impl IndicatorSnapshot {
    /// Compute every indicator the config needs over the full window
    ///
    /// Returns None if any of them is undefined or not finite.
    pub fn compute(candles: &[Candle], config: &StrategyConfig) -> Option<Self> {
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();

        let fast = finite(calculate_ema(&closes, config.fast_period)?)?;
        let medium = finite(calculate_ema(&closes, config.medium_period)?)?;
        let slow = finite(calculate_ema(&closes, config.slow_period)?)?;

        let (rsi, adx, volume) = if config.kind.uses_filters() {
            let volumes: Vec<f64> = candles.iter().map(|c| c.volume).collect();
            let rsi = finite(calculate_rsi(&closes, config.rsi_period)?)?;
            let adx = finite(calculate_adx(candles, config.adx_period)?.adx)?;
            let volume = finite(volume_ratio(&volumes, config.volume_short, config.volume_long)?)?;
            (Some(rsi), Some(adx), Some(volume))
        } else {
            (None, None, None)
        };

        Some(Self {
            fast,
            medium,
            slow,
            rsi,
            adx,
            volume_ratio: volume,
        })
    }

    /// Fast and medium both above slow
    pub fn above_slow(&self) -> bool {
        self.fast > self.slow && self.medium > self.slow
    }
}

fn finite(value: f64) -> Option<f64> {
    value.is_finite().then_some(value)
}

/// `a` moved from at-or-below `b` to strictly above it
pub fn crossed_above(prev_a: f64, prev_b: f64, cur_a: f64, cur_b: f64) -> bool {
    prev_a <= prev_b && cur_a > cur_b
}

/// `a` moved from at-or-above `b` to strictly below it
pub fn crossed_below(prev_a: f64, prev_b: f64, cur_a: f64, cur_b: f64) -> bool {
    prev_a >= prev_b && cur_a < cur_b
}

/// Crossover predicates between two consecutive snapshots
#[derive(Debug, Clone, Copy)]
pub struct Crosses<'a> {
    pub prev: &'a IndicatorSnapshot,
    pub cur: &'a IndicatorSnapshot,
}

impl<'a> Crosses<'a> {
    pub fn new(prev: &'a IndicatorSnapshot, cur: &'a IndicatorSnapshot) -> Self {
        Self { prev, cur }
    }

    pub fn fast_above_medium(&self) -> bool {
        crossed_above(self.prev.fast, self.prev.medium, self.cur.fast, self.cur.medium)
    }

    pub fn fast_below_medium(&self) -> bool {
        crossed_below(self.prev.fast, self.prev.medium, self.cur.fast, self.cur.medium)
    }

    pub fn fast_above_slow(&self) -> bool {
        crossed_above(self.prev.fast, self.prev.slow, self.cur.fast, self.cur.slow)
    }

    pub fn fast_below_slow(&self) -> bool {
        crossed_below(self.prev.fast, self.prev.slow, self.cur.fast, self.cur.slow)
    }

    pub fn medium_below_slow(&self) -> bool {
        crossed_below(self.prev.medium, self.prev.slow, self.cur.medium, self.cur.slow)
    }

    /// RSI moved into the overbought zone on this bar
    pub fn rsi_above(&self, level: f64) -> bool {
        match (self.prev.rsi, self.cur.rsi) {
            (Some(prev), Some(cur)) => prev <= level && cur > level,
            _ => false,
        }
    }
}
