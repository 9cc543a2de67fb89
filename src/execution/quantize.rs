//! Exchange quantity/price quantization.
//!
//! Orders are always truncated toward zero onto the exchange grid, never
//! rounded, so an order can not exceed the balance it was sized from.

use rust_decimal::prelude::*;

/// Number of significant decimal places in a step or tick size
///
/// `0.00100000` -> 3, `1` -> 0
pub fn decimal_places(step: Decimal) -> u32 {
    step.normalize().scale()
}

/// Floor `quantity` to a multiple of `step` rendered with `decimals` places
///
/// A non-positive step only truncates to `decimals`. Negative inputs floor to 0.
pub fn floor_to_precision(quantity: Decimal, step: Decimal, decimals: u32) -> Decimal {
    if quantity <= Decimal::ZERO {
        return rescaled(Decimal::ZERO, decimals);
    }

    let stepped = if step > Decimal::ZERO {
        (quantity / step).floor() * step
    } else {
        quantity
    };

    let truncated = stepped.round_dp_with_strategy(decimals, RoundingStrategy::ToZero);
    rescaled(truncated, decimals)
}

/// Render a quantity for an order request, floored onto the exchange grid
pub fn format_quantity(quantity: Decimal, step: Decimal, decimals: u32) -> String {
    floor_to_precision(quantity, step, decimals).to_string()
}

fn rescaled(mut value: Decimal, decimals: u32) -> Decimal {
    value.rescale(decimals);
    value
}
