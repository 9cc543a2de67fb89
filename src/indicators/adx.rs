/// Average Directional Index (ADX) - Measures trend strength
///
/// ADX ranges from 0 to 100:
/// - ADX > 25: Strong trend (bull or bear)
/// - ADX 20-25: Moderate trend
/// - ADX < 20: Weak trend / choppy / ranging market
///
/// Also returns +DI and -DI to determine trend direction:
/// - +DI > -DI: Uptrend
/// - -DI > +DI: Downtrend
use crate::indicators::wilder_smooth_series;
use crate::models::Candle;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdxReading {
    pub adx: f64,
    pub plus_di: f64,
    pub minus_di: f64,
}

/// Calculate ADX, +DI and -DI for the latest bar
///
/// TR and directional movement start at the second candle; their Wilder
/// series feed a DX series, which is Wilder-smoothed again into ADX. That
/// needs at least `2 * period` candles, otherwise None.
pub fn calculate_adx(candles: &[Candle], period: usize) -> Option<AdxReading> {
    if period == 0 || candles.len() < period * 2 {
        return None;
    }

    // Step 1: True Range and Directional Movement per bar
    let mut true_ranges = Vec::with_capacity(candles.len() - 1);
    let mut plus_dms = Vec::with_capacity(candles.len() - 1);
    let mut minus_dms = Vec::with_capacity(candles.len() - 1);

    for pair in candles.windows(2) {
        let (prev, cur) = (&pair[0], &pair[1]);

        let tr = (cur.high - cur.low)
            .max((cur.high - prev.close).abs())
            .max((cur.low - prev.close).abs());
        true_ranges.push(tr);

        let up_move = cur.high - prev.high;
        let down_move = prev.low - cur.low;

        plus_dms.push(if up_move > down_move && up_move > 0.0 {
            up_move
        } else {
            0.0
        });
        minus_dms.push(if down_move > up_move && down_move > 0.0 {
            down_move
        } else {
            0.0
        });
    }

    // Step 2: Wilder smoothing
    let smoothed_tr = wilder_smooth_series(&true_ranges, period)?;
    let smoothed_plus = wilder_smooth_series(&plus_dms, period)?;
    let smoothed_minus = wilder_smooth_series(&minus_dms, period)?;

    // Step 3: +DI / -DI and DX for every smoothed point
    let mut dxs = Vec::with_capacity(smoothed_tr.len());
    let mut last_di = (0.0, 0.0);
    for i in 0..smoothed_tr.len() {
        let (plus_di, minus_di) = directional_indices(smoothed_tr[i], smoothed_plus[i], smoothed_minus[i]);
        let di_sum = plus_di + minus_di;
        dxs.push(if di_sum > 0.0 {
            (plus_di - minus_di).abs() / di_sum * 100.0
        } else {
            0.0
        });
        last_di = (plus_di, minus_di);
    }

    // Step 4: ADX is the smoothed DX
    let adx = *wilder_smooth_series(&dxs, period)?.last()?;

    Some(AdxReading {
        adx,
        plus_di: last_di.0,
        minus_di: last_di.1,
    })
}

fn directional_indices(tr: f64, plus_dm: f64, minus_dm: f64) -> (f64, f64) {
    if tr > 0.0 {
        (plus_dm / tr * 100.0, minus_dm / tr * 100.0)
    } else {
        (0.0, 0.0)
    }
}
