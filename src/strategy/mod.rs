// Trading strategy module
pub mod config;
pub mod engine;
pub mod signals;

pub use config::{StrategyConfig, StrategyKind};
pub use engine::{Decision, PairStrategy, StrategyState};
pub use signals::{crossed_above, crossed_below, IndicatorSnapshot};

use crate::models::{Action, Candle};

/// Base trait for per-pair decision units
///
/// Implementations keep their own cross-cycle memory, which is why `decide`
/// takes `&mut self`. Callers own one instance per trading pair.
pub trait Strategy: Send + Sync {
    /// Decide on the latest closed bar of `candles`
    fn decide(&mut self, candles: &[Candle], is_holding: bool) -> Action;

    /// Get strategy name
    fn name(&self) -> &str;

    fn symbol(&self) -> &str;

    /// Minimum candles before a non-HOLD action is possible
    fn required_lookback(&self) -> usize;

    /// Snapshot of the cross-cycle memory, for checkpoints
    fn state(&self) -> StrategyState;

    fn restore(&mut self, state: StrategyState);
}
