// Technical indicators module
// Implements EMA, RSI, ADX and volume ratio over a rolling candle window

pub mod adx;
pub mod moving_average;
pub mod rsi;
pub mod volume;

pub use adx::{calculate_adx, AdxReading};
pub use moving_average::{calculate_ema, calculate_sma};
pub use rsi::calculate_rsi;
pub use volume::volume_ratio;

/// Wilder's smoothing over a whole series
///
/// The first value is the simple mean of the first `period` inputs, every
/// following value is `(prev * (period - 1) + x) / period`. The returned
/// series has `values.len() - period + 1` entries.
pub fn wilder_smooth_series(values: &[f64], period: usize) -> Option<Vec<f64>> {
    if period == 0 || values.len() < period {
        return None;
    }

    let p = period as f64;
    let mut smoothed = values[..period].iter().sum::<f64>() / p;
    let mut series = Vec::with_capacity(values.len() - period + 1);
    series.push(smoothed);

    for value in &values[period..] {
        smoothed = (smoothed * (p - 1.0) + value) / p;
        series.push(smoothed);
    }

    Some(series)
}
