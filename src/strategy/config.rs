use serde::{Deserialize, Serialize};
use std::fmt;

/// Rule set a pair strategy evaluates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Plain three-EMA crossover
    Crossover,
    /// Three-EMA crossover gated by ADX, RSI and volume
    FilteredCrossover,
    /// Fast/slow trend entry with a delayed fast/medium re-entry
    TrendReentry,
}

impl StrategyKind {
    pub fn uses_filters(&self) -> bool {
        !matches!(self, StrategyKind::Crossover)
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyKind::Crossover => write!(f, "Crossover"),
            StrategyKind::FilteredCrossover => write!(f, "FilteredCrossover"),
            StrategyKind::TrendReentry => write!(f, "TrendReentry"),
        }
    }
}

/// Immutable parameters of one pair's strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub symbol: String,
    pub kind: StrategyKind,
    pub fast_period: usize,
    pub medium_period: usize,
    pub slow_period: usize,
    pub rsi_period: usize,
    pub rsi_overbought: f64,
    pub adx_period: usize,
    pub adx_threshold: f64,
    pub volume_short: usize,
    pub volume_long: usize,
    pub volume_threshold: f64,
    /// Extra bars on top of the longest indicator window (filtered kinds)
    pub lookback_buffer: usize,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            symbol: String::new(),
            kind: StrategyKind::FilteredCrossover,
            fast_period: 10,
            medium_period: 25,
            slow_period: 50,
            rsi_period: 14,
            rsi_overbought: 70.0,
            adx_period: 14,
            adx_threshold: 20.0,
            volume_short: 14,
            volume_long: 50,
            volume_threshold: 1.0,
            lookback_buffer: 5,
        }
    }
}

impl StrategyConfig {
    pub fn new(symbol: impl Into<String>, kind: StrategyKind) -> Self {
        Self {
            symbol: symbol.into(),
            kind,
            ..Self::default()
        }
    }

    pub fn with_periods(mut self, fast: usize, medium: usize, slow: usize) -> Self {
        self.fast_period = fast;
        self.medium_period = medium;
        self.slow_period = slow;
        self
    }

    /// Minimum number of closed candles before any non-HOLD decision
    pub fn required_lookback(&self) -> usize {
        match self.kind {
            StrategyKind::Crossover => self.slow_period + 1,
            StrategyKind::FilteredCrossover | StrategyKind::TrendReentry => {
                self.slow_period
                    .max(self.rsi_period + 1)
                    .max(self.adx_period * 2)
                    .max(self.volume_long)
                    + self.lookback_buffer
            }
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        let periods = [
            ("fast_period", self.fast_period),
            ("medium_period", self.medium_period),
            ("slow_period", self.slow_period),
            ("rsi_period", self.rsi_period),
            ("adx_period", self.adx_period),
            ("volume_short", self.volume_short),
            ("volume_long", self.volume_long),
        ];
        for (name, value) in periods {
            if value == 0 {
                return Err(format!("{}: {} must be positive", self.symbol, name));
            }
        }

        if self.fast_period >= self.slow_period || self.medium_period >= self.slow_period {
            return Err(format!(
                "{}: fast ({}) and medium ({}) periods must be shorter than slow ({})",
                self.symbol, self.fast_period, self.medium_period, self.slow_period
            ));
        }

        if !(0.0..=100.0).contains(&self.rsi_overbought) {
            return Err(format!("{}: RSI overbought level must be within 0..=100", self.symbol));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crossover_lookback() {
        let config = StrategyConfig::new("BTCUSDT", StrategyKind::Crossover).with_periods(7, 20, 40);
        assert_eq!(config.required_lookback(), 41);
    }

    #[test]
    fn test_filtered_lookback_uses_longest_window() {
        let config = StrategyConfig::new("ETHUSDT", StrategyKind::FilteredCrossover).with_periods(10, 25, 50);
        // max(50, 15, 28, 50) + 5
        assert_eq!(config.required_lookback(), 55);

        let mut config = config;
        config.adx_period = 40;
        assert_eq!(config.required_lookback(), 85);
    }

    #[test]
    fn test_validate_rejects_bad_periods() {
        let config = StrategyConfig::new("SOLUSDT", StrategyKind::Crossover).with_periods(30, 15, 30);
        assert!(config.validate().is_err());

        let mut config = StrategyConfig::new("SOLUSDT", StrategyKind::Crossover).with_periods(5, 15, 30);
        assert!(config.validate().is_ok());
        config.rsi_period = 0;
        assert!(config.validate().unwrap_err().contains("rsi_period"));
    }

    #[test]
    fn test_validate_rejects_overbought_out_of_range() {
        let mut config = StrategyConfig::new("SOLUSDT", StrategyKind::FilteredCrossover);
        config.rsi_overbought = 120.0;
        assert!(config.validate().unwrap_err().contains("overbought"));
    }

    #[test]
    fn test_kind_serde_names() {
        let kind: StrategyKind = serde_json::from_str("\"trend_reentry\"").unwrap();
        assert_eq!(kind, StrategyKind::TrendReentry);
        assert!(!StrategyKind::Crossover.uses_filters());
        assert!(StrategyKind::FilteredCrossover.uses_filters());
    }
}
