use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::config::{StrategyConfig, StrategyKind};
use super::signals::{Crosses, IndicatorSnapshot};
use super::Strategy;
use crate::models::{Action, Candle};

/// Cross-cycle memory of a pair strategy, persisted in checkpoints
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StrategyState {
    pub previous: Option<IndicatorSnapshot>,
    pub waiting_for_secondary_buy: bool,
    pub last_evaluated_open_time: Option<DateTime<Utc>>,
}

/// Action plus the rule that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub action: Action,
    pub reason: String,
}

impl Decision {
    fn hold(reason: impl Into<String>) -> Self {
        Self {
            action: Action::Hold,
            reason: reason.into(),
        }
    }

    fn sell(reason: impl Into<String>) -> Self {
        Self {
            action: Action::Sell,
            reason: reason.into(),
        }
    }

    fn buy(reason: impl Into<String>) -> Self {
        Self {
            action: Action::Buy,
            reason: reason.into(),
        }
    }
}

/// Stateful decision unit for one trading pair
///
/// Crossovers are detected between the previous evaluation and the current
/// one, so the first evaluation with enough data only primes the state.
#[derive(Debug, Clone)]
pub struct PairStrategy {
    config: StrategyConfig,
    state: StrategyState,
}

impl PairStrategy {
    pub fn new(config: StrategyConfig) -> Self {
        Self {
            config,
            state: StrategyState::default(),
        }
    }

    pub fn config(&self) -> &StrategyConfig {
        &self.config
    }

    pub fn is_waiting_for_secondary_buy(&self) -> bool {
        self.state.waiting_for_secondary_buy
    }

    /// Evaluate a window and return the decision with its reason
    pub fn evaluate(&mut self, candles: &[Candle], is_holding: bool) -> Decision {
        let required = self.config.required_lookback();
        if candles.len() < required {
            return Decision::hold(format!(
                "Insufficient data: {} candles, need {}",
                candles.len(),
                required
            ));
        }

        let Some(last) = candles.last() else {
            return Decision::hold("No candles");
        };
        if self.state.last_evaluated_open_time == Some(last.open_time) {
            return Decision::hold("Bar already evaluated");
        }

        let Some(current) = IndicatorSnapshot::compute(candles, &self.config) else {
            return Decision::hold("Indicator undefined on this window");
        };

        debug!(
            symbol = %self.config.symbol,
            fast = current.fast,
            medium = current.medium,
            slow = current.slow,
            rsi = ?current.rsi,
            adx = ?current.adx,
            volume_ratio = ?current.volume_ratio,
            "Indicators"
        );

        self.state.last_evaluated_open_time = Some(last.open_time);

        let Some(previous) = self.state.previous.replace(current) else {
            info!(symbol = %self.config.symbol, "Strategy primed, waiting for next bar");
            return Decision::hold("Priming previous indicator values");
        };

        let crosses = Crosses::new(&previous, &current);
        match self.config.kind {
            StrategyKind::Crossover => self.decide_crossover(&crosses, is_holding),
            StrategyKind::FilteredCrossover => self.decide_filtered(&crosses, is_holding),
            StrategyKind::TrendReentry => self.decide_trend_reentry(&crosses, is_holding),
        }
    }

    fn decide_crossover(&self, crosses: &Crosses<'_>, is_holding: bool) -> Decision {
        let cur = crosses.cur;

        if crosses.fast_below_slow() {
            return Decision::sell("Fast EMA crossed below slow EMA");
        }
        if is_holding && cur.above_slow() && crosses.fast_below_medium() {
            return Decision::sell("Fast EMA crossed below medium EMA above slow");
        }
        if !is_holding && cur.above_slow() && crosses.fast_above_medium() {
            return Decision::buy("Fast EMA crossed above medium EMA above slow");
        }

        Decision::hold("No crossover")
    }

    fn decide_filtered(&self, crosses: &Crosses<'_>, is_holding: bool) -> Decision {
        let cur = crosses.cur;

        if crosses.fast_below_slow() {
            return Decision::sell("Fast EMA crossed below slow EMA");
        }
        if is_holding {
            if crosses.fast_below_medium() {
                return Decision::sell("Fast EMA crossed below medium EMA");
            }
            if crosses.rsi_above(self.config.rsi_overbought) {
                return Decision::sell(format!(
                    "RSI crossed above overbought ({})",
                    self.config.rsi_overbought
                ));
            }
            return Decision::hold("Holding, no exit signal");
        }

        if crosses.fast_above_medium() && cur.above_slow() {
            let adx_ok = cur.adx.is_some_and(|adx| adx >= self.config.adx_threshold);
            if adx_ok && self.rsi_and_volume_pass(cur) {
                return Decision::buy("Fast EMA crossed above medium EMA with filters");
            }
            return Decision::hold("Crossover rejected by filters");
        }

        Decision::hold("No crossover")
    }

    fn decide_trend_reentry(&mut self, crosses: &Crosses<'_>, is_holding: bool) -> Decision {
        let cur = crosses.cur;
        let waiting = self.state.waiting_for_secondary_buy;
        let filters = cur.adx.is_some_and(|adx| adx > self.config.adx_threshold)
            && self.rsi_and_volume_pass(cur);

        let secondary_buy =
            waiting && crosses.fast_above_medium() && cur.above_slow() && filters;

        if secondary_buy || crosses.fast_below_slow() {
            self.state.waiting_for_secondary_buy = false;
        } else if crosses.fast_below_medium() && cur.above_slow() {
            self.state.waiting_for_secondary_buy = true;
        }

        if crosses.fast_below_slow() {
            return Decision::sell("Fast EMA crossed below slow EMA");
        }
        if is_holding {
            if crosses.medium_below_slow() {
                return Decision::sell("Medium EMA crossed below slow EMA");
            }
            if crosses.fast_below_medium() && cur.fast >= cur.slow {
                return Decision::sell("Fast EMA crossed below medium EMA above slow");
            }
            return Decision::hold("Holding, no exit signal");
        }

        if crosses.fast_above_slow() && filters {
            return Decision::buy("Fast EMA crossed above slow EMA with filters");
        }
        if secondary_buy {
            return Decision::buy("Secondary re-entry: fast EMA re-crossed medium EMA");
        }

        Decision::hold("No entry signal")
    }

    fn rsi_and_volume_pass(&self, cur: &IndicatorSnapshot) -> bool {
        let rsi_ok = cur.rsi.is_some_and(|rsi| rsi < self.config.rsi_overbought);
        let volume_ok = cur
            .volume_ratio
            .is_some_and(|ratio| ratio > self.config.volume_threshold);
        rsi_ok && volume_ok
    }
}

impl Strategy for PairStrategy {
    fn decide(&mut self, candles: &[Candle], is_holding: bool) -> Action {
        let decision = self.evaluate(candles, is_holding);
        debug!(
            symbol = %self.config.symbol,
            action = %decision.action,
            reason = %decision.reason,
            "Strategy decision"
        );
        decision.action
    }

    fn name(&self) -> &str {
        match self.config.kind {
            StrategyKind::Crossover => "Crossover",
            StrategyKind::FilteredCrossover => "FilteredCrossover",
            StrategyKind::TrendReentry => "TrendReentry",
        }
    }

    fn symbol(&self) -> &str {
        &self.config.symbol
    }

    fn required_lookback(&self) -> usize {
        self.config.required_lookback()
    }

    fn state(&self) -> StrategyState {
        self.state.clone()
    }

    fn restore(&mut self, state: StrategyState) {
        self.state = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn candles(closes: &[f64]) -> Vec<Candle> {
        let start = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Candle {
                open_time: start + Duration::hours(i as i64),
                close_time: start + Duration::hours(i as i64 + 1) - Duration::milliseconds(1),
                open: close,
                high: close + 0.5,
                low: close - 0.5,
                close,
                volume: 100.0,
            })
            .collect()
    }

    fn crossover() -> PairStrategy {
        PairStrategy::new(
            StrategyConfig::new("BTCUSDT", StrategyKind::Crossover).with_periods(2, 3, 5),
        )
    }

    /// Feed growing windows of `closes` starting at `from` bars
    fn run(strategy: &mut PairStrategy, closes: &[f64], from: usize, holding: bool) -> Vec<Action> {
        let all = candles(closes);
        (from..=all.len())
            .map(|end| strategy.decide(&all[..end], holding))
            .collect()
    }

    #[test]
    fn test_insufficient_data_holds_without_state() {
        let mut strategy = crossover();
        let all = candles(&[10.0; 5]);
        assert_eq!(strategy.decide(&all, false), Action::Hold);
        assert_eq!(strategy.state(), StrategyState::default());
    }

    #[test]
    fn test_first_sufficient_bar_primes() {
        let mut strategy = crossover();
        let all = candles(&[10.0; 6]);
        let decision = strategy.evaluate(&all, false);
        assert_eq!(decision.action, Action::Hold);
        assert!(decision.reason.contains("Priming"));
        assert!(strategy.state().previous.is_some());
    }

    #[test]
    fn test_crossover_buy_after_priming() {
        let mut strategy = crossover();
        let closes = [10.0, 10.0, 10.0, 10.0, 10.0, 10.0, 10.0, 11.0, 12.0, 15.0];
        let actions = run(&mut strategy, &closes, 6, false);
        assert_eq!(actions[0], Action::Hold);
        assert_eq!(actions[1], Action::Hold);
        assert_eq!(actions[2], Action::Buy);
    }

    #[test]
    fn test_same_bar_twice_is_deduplicated() {
        let mut strategy = crossover();
        let closes = [10.0, 10.0, 10.0, 10.0, 10.0, 10.0, 10.0, 11.0];
        let all = candles(&closes);
        strategy.decide(&all[..7], false);

        assert_eq!(strategy.decide(&all, false), Action::Buy);
        let state = strategy.state();
        assert_eq!(strategy.decide(&all, false), Action::Hold);
        assert_eq!(strategy.state(), state);
    }

    #[test]
    fn test_never_buys_while_holding() {
        let mut strategy = crossover();
        let closes = [10.0, 10.0, 10.0, 10.0, 10.0, 10.0, 10.0, 11.0, 12.0, 15.0];
        let actions = run(&mut strategy, &closes, 6, true);
        assert!(actions.iter().all(|a| *a != Action::Buy));
    }

    #[test]
    fn test_emergency_sell_fires_when_flat() {
        let mut strategy = crossover();
        let closes = [10.0, 10.0, 10.0, 10.0, 10.0, 10.0, 10.0, 8.0];
        let actions = run(&mut strategy, &closes, 7, false);
        assert_eq!(actions, vec![Action::Hold, Action::Sell]);
    }

    #[test]
    fn test_nan_window_does_not_advance_state() {
        let mut strategy = crossover();
        let mut closes = vec![10.0; 7];
        strategy.decide(&candles(&closes)[..6], false);
        let state = strategy.state();

        closes[6] = f64::NAN;
        assert_eq!(strategy.decide(&candles(&closes), false), Action::Hold);
        assert_eq!(strategy.state(), state);
    }

    #[test]
    fn test_restore_round_trips_state() {
        let mut strategy = crossover();
        strategy.decide(&candles(&[10.0; 6]), false);
        let state = strategy.state();

        let mut restored = crossover();
        restored.restore(state.clone());
        assert_eq!(restored.state(), state);

        let closes = [10.0, 10.0, 10.0, 10.0, 10.0, 10.0, 11.0];
        assert_eq!(restored.decide(&candles(&closes), false), Action::Buy);
    }

    fn filtered(kind: StrategyKind) -> PairStrategy {
        let mut config = StrategyConfig::new("ETHUSDT", kind).with_periods(2, 3, 5);
        config.rsi_period = 3;
        config.adx_period = 2;
        config.adx_threshold = 0.0;
        config.volume_short = 1;
        config.volume_long = 3;
        config.volume_threshold = 0.5;
        config.lookback_buffer = 0;
        PairStrategy::new(config)
    }

    #[test]
    fn test_filtered_rejects_overbought_entry() {
        // Straight rally: RSI pinned at 100, so the crossover is filtered out
        let mut strategy = filtered(StrategyKind::FilteredCrossover);
        let closes = [10.0, 10.0, 10.0, 10.0, 10.0, 10.0, 11.0];
        let actions = run(&mut strategy, &closes, 6, false);
        assert_eq!(actions, vec![Action::Hold, Action::Hold]);
    }

    fn trending_snapshot(fast: f64) -> IndicatorSnapshot {
        IndicatorSnapshot {
            fast,
            medium: 10.0,
            slow: 9.0,
            rsi: Some(50.0),
            adx: Some(25.0),
            volume_ratio: Some(2.0),
        }
    }

    #[test]
    fn test_filtered_buys_when_filters_pass() {
        let strategy = filtered(StrategyKind::FilteredCrossover);
        let prev = trending_snapshot(10.0);
        let cur = trending_snapshot(10.5);

        let decision = strategy.decide_filtered(&Crosses::new(&prev, &cur), false);
        assert_eq!(decision.action, Action::Buy);

        let weak_volume = IndicatorSnapshot { volume_ratio: Some(0.1), ..cur };
        let decision = strategy.decide_filtered(&Crosses::new(&prev, &weak_volume), false);
        assert_eq!(decision.action, Action::Hold);
    }

    #[test]
    fn test_filtered_exits_on_rsi_overbought_cross() {
        let strategy = filtered(StrategyKind::FilteredCrossover);
        let prev = IndicatorSnapshot { rsi: Some(65.0), ..trending_snapshot(10.5) };
        let cur = IndicatorSnapshot { rsi: Some(72.0), ..trending_snapshot(10.8) };

        let decision = strategy.decide_filtered(&Crosses::new(&prev, &cur), true);
        assert_eq!(decision.action, Action::Sell);
        assert!(decision.reason.contains("RSI"));

        // flat pairs ignore the RSI exit
        let decision = strategy.decide_filtered(&Crosses::new(&prev, &cur), false);
        assert_eq!(decision.action, Action::Hold);
    }

    #[test]
    fn test_trend_reentry_arms_and_fires_secondary_buy() {
        let mut strategy = filtered(StrategyKind::TrendReentry);
        let fast = 12.0;
        let prev = IndicatorSnapshot {
            fast: 11.0,
            medium: 10.5,
            slow: 10.0,
            rsi: Some(50.0),
            adx: Some(30.0),
            volume_ratio: Some(2.0),
        };
        // fast dips under medium while both stay above slow
        let dip = IndicatorSnapshot { fast: 10.4, ..prev };
        let crosses = Crosses::new(&prev, &dip);
        assert_eq!(strategy.decide_trend_reentry(&crosses, false).action, Action::Hold);
        assert!(strategy.is_waiting_for_secondary_buy());

        // fast re-crosses medium above slow
        let recover = IndicatorSnapshot { fast, ..prev };
        let crosses = Crosses::new(&dip, &recover);
        let decision = strategy.decide_trend_reentry(&crosses, false);
        assert_eq!(decision.action, Action::Buy);
        assert!(decision.reason.contains("Secondary"));
        assert!(!strategy.is_waiting_for_secondary_buy());
    }

    #[test]
    fn test_trend_reentry_cleared_by_fast_below_slow() {
        let mut strategy = filtered(StrategyKind::TrendReentry);
        strategy.state.waiting_for_secondary_buy = true;

        let prev = IndicatorSnapshot {
            fast: 10.4,
            medium: 10.5,
            slow: 10.0,
            rsi: Some(50.0),
            adx: Some(30.0),
            volume_ratio: Some(2.0),
        };
        let breakdown = IndicatorSnapshot { fast: 9.5, ..prev };
        let decision = strategy.decide_trend_reentry(&Crosses::new(&prev, &breakdown), true);
        assert_eq!(decision.action, Action::Sell);
        assert!(!strategy.is_waiting_for_secondary_buy());
    }

    #[test]
    fn test_trend_reentry_holding_exits() {
        let mut strategy = filtered(StrategyKind::TrendReentry);
        let prev = IndicatorSnapshot {
            fast: 11.0,
            medium: 10.5,
            slow: 10.0,
            rsi: Some(50.0),
            adx: Some(30.0),
            volume_ratio: Some(2.0),
        };

        let medium_break = IndicatorSnapshot { medium: 9.9, ..prev };
        let decision = strategy.decide_trend_reentry(&Crosses::new(&prev, &medium_break), true);
        assert_eq!(decision.action, Action::Sell);
        assert!(decision.reason.contains("Medium"));

        let fast_dip = IndicatorSnapshot { fast: 10.4, ..prev };
        let decision = strategy.decide_trend_reentry(&Crosses::new(&prev, &fast_dip), true);
        assert_eq!(decision.action, Action::Sell);

        // not holding: same dip only arms the re-entry
        let mut flat = filtered(StrategyKind::TrendReentry);
        let decision = flat.decide_trend_reentry(&Crosses::new(&prev, &fast_dip), false);
        assert_eq!(decision.action, Action::Hold);
        assert!(flat.is_waiting_for_secondary_buy());
    }

    #[test]
    fn test_trend_reentry_primary_requires_adx() {
        let mut strategy = filtered(StrategyKind::TrendReentry);
        let prev = IndicatorSnapshot {
            fast: 9.9,
            medium: 9.8,
            slow: 10.0,
            rsi: Some(50.0),
            adx: Some(0.0),
            volume_ratio: Some(2.0),
        };
        let cross = IndicatorSnapshot { fast: 10.2, ..prev };
        // adx must be strictly above the threshold (0.0)
        let decision = strategy.decide_trend_reentry(&Crosses::new(&prev, &cross), false);
        assert_eq!(decision.action, Action::Hold);

        let strong = IndicatorSnapshot { adx: Some(25.0), ..cross };
        let decision = strategy.decide_trend_reentry(&Crosses::new(&prev, &strong), false);
        assert_eq!(decision.action, Action::Buy);
    }
}
