use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::models::SymbolTradingRules;

#[derive(Debug, Error, PartialEq)]
pub enum LedgerError {
    #[error("unknown pair {0}")]
    UnknownPair(String),

    #[error("{0} is already holding a position")]
    AlreadyHolding(String),

    #[error("{0} has no open position")]
    NotHolding(String),

    #[error("invalid fill for {pair}: quantity {quantity}, price {price}")]
    InvalidFill {
        pair: String,
        quantity: Decimal,
        price: Decimal,
    },
}

/// Holding state and capital pool of one trading pair
///
/// Entry, stop and take-profit prices of 0 mean "unknown / not set".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionRecord {
    pub holding: bool,
    pub quantity_held: Decimal,
    pub average_entry_price: Decimal,
    pub allocated_capital: Decimal,
    pub stop_loss_price: Decimal,
    pub take_profit_price: Decimal,
}

impl PositionRecord {
    pub fn with_capital(allocated_capital: Decimal) -> Self {
        Self {
            allocated_capital,
            ..Self::default()
        }
    }

    pub fn entry_known(&self) -> bool {
        self.average_entry_price > Decimal::ZERO
    }
}

/// Result of reconciling a record with the exchange balance
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// Ledger and exchange agree
    InSync,
    /// Holding flag agreed but the held quantity was refreshed
    QuantityRefreshed { previous: Decimal, current: Decimal },
    /// Holding flag was wrong and has been replaced by the exchange view
    Corrected {
        now_holding: bool,
        balance: Decimal,
        /// Estimated value returned to the pool when a position vanished
        released_capital: Decimal,
    },
}

/// Persistable part of the ledger
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub records: BTreeMap<String, PositionRecord>,
    pub realized_pnl: Decimal,
    pub trade_count: u64,
}

/// Per-pair position and capital bookkeeping
///
/// Owned by the coordinator and mutated only from the trading loop.
#[derive(Debug, Clone)]
pub struct PositionLedger {
    records: BTreeMap<String, PositionRecord>,
    stop_loss_fraction: Decimal,
    take_profit_fraction: Decimal,
    realized_pnl: Decimal,
    trade_count: u64,
}

impl PositionLedger {
    pub fn new(stop_loss_fraction: Decimal, take_profit_fraction: Decimal) -> Self {
        Self {
            records: BTreeMap::new(),
            stop_loss_fraction,
            take_profit_fraction,
            realized_pnl: Decimal::ZERO,
            trade_count: 0,
        }
    }

    /// Add a pair with an initial capital pool (replaces any existing record)
    pub fn register(&mut self, pair: impl Into<String>, allocated_capital: Decimal) {
        self.records
            .insert(pair.into(), PositionRecord::with_capital(allocated_capital));
    }

    pub fn contains(&self, pair: &str) -> bool {
        self.records.contains_key(pair)
    }

    pub fn get(&self, pair: &str) -> Option<&PositionRecord> {
        self.records.get(pair)
    }

    pub fn is_holding(&self, pair: &str) -> bool {
        self.records.get(pair).is_some_and(|r| r.holding)
    }

    pub fn records(&self) -> impl Iterator<Item = (&String, &PositionRecord)> {
        self.records.iter()
    }

    pub fn realized_pnl(&self) -> Decimal {
        self.realized_pnl
    }

    pub fn trade_count(&self) -> u64 {
        self.trade_count
    }

    fn record_mut(&mut self, pair: &str) -> Result<&mut PositionRecord, LedgerError> {
        self.records
            .get_mut(pair)
            .ok_or_else(|| LedgerError::UnknownPair(pair.to_string()))
    }

    /// Record a filled buy: capital moves from the pool into the position
    pub fn open(&mut self, pair: &str, quantity: Decimal, price: Decimal) -> Result<(), LedgerError> {
        if quantity <= Decimal::ZERO || price <= Decimal::ZERO {
            return Err(LedgerError::InvalidFill {
                pair: pair.to_string(),
                quantity,
                price,
            });
        }

        let stop_loss_fraction = self.stop_loss_fraction;
        let take_profit_fraction = self.take_profit_fraction;
        let record = self.record_mut(pair)?;
        if record.holding {
            return Err(LedgerError::AlreadyHolding(pair.to_string()));
        }

        record.holding = true;
        record.quantity_held = quantity;
        record.average_entry_price = price;
        record.allocated_capital = Decimal::ZERO;
        record.stop_loss_price = stop_price(price, stop_loss_fraction);
        record.take_profit_price = target_price(price, take_profit_fraction);

        tracing::info!(
            "📗 Opened {} qty {} @ {} (stop {}, target {})",
            pair,
            quantity,
            price,
            record.stop_loss_price,
            record.take_profit_price
        );
        Ok(())
    }

    /// Record a filled sell: revenue becomes the pool for the next buy
    ///
    /// Returns realized P/L, or None when the entry price is unknown.
    pub fn close(
        &mut self,
        pair: &str,
        quantity_sold: Decimal,
        revenue: Decimal,
    ) -> Result<Option<Decimal>, LedgerError> {
        let record = self.record_mut(pair)?;
        if !record.holding {
            return Err(LedgerError::NotHolding(pair.to_string()));
        }

        let pnl = record
            .entry_known()
            .then(|| revenue - quantity_sold * record.average_entry_price);

        record.holding = false;
        record.quantity_held = Decimal::ZERO;
        record.average_entry_price = Decimal::ZERO;
        record.allocated_capital += revenue;
        record.stop_loss_price = Decimal::ZERO;
        record.take_profit_price = Decimal::ZERO;

        self.trade_count += 1;
        if let Some(pnl) = pnl {
            self.realized_pnl += pnl;
        }

        Ok(pnl)
    }

    /// Reconcile a pair with its real on-exchange balance
    ///
    /// The exchange wins whenever the holding flag disagrees with it. A
    /// correction loses the original fill context, so entry, stop and target
    /// become unknown. When a position vanished, its estimated proceeds
    /// (`mark_price`, or the entry price if no mark is known) go back into
    /// the pool so the pair can buy again.
    pub fn sync_with_exchange(
        &mut self,
        pair: &str,
        real_balance: Decimal,
        rules: &SymbolTradingRules,
        mark_price: Decimal,
    ) -> Result<SyncOutcome, LedgerError> {
        let record = self.record_mut(pair)?;
        let exchange_holding = !rules.is_dust(real_balance);

        if record.holding != exchange_holding {
            let mut released_capital = Decimal::ZERO;
            if exchange_holding {
                record.quantity_held = real_balance;
                record.allocated_capital = Decimal::ZERO;
            } else {
                let price = if mark_price > Decimal::ZERO {
                    mark_price
                } else {
                    record.average_entry_price
                };
                released_capital = record.quantity_held * price;
                record.allocated_capital += released_capital;
                record.quantity_held = Decimal::ZERO;
            }
            record.holding = exchange_holding;
            record.average_entry_price = Decimal::ZERO;
            record.stop_loss_price = Decimal::ZERO;
            record.take_profit_price = Decimal::ZERO;
            return Ok(SyncOutcome::Corrected {
                now_holding: exchange_holding,
                balance: real_balance,
                released_capital,
            });
        }

        if record.holding && record.quantity_held != real_balance {
            let previous = record.quantity_held;
            record.quantity_held = real_balance;
            return Ok(SyncOutcome::QuantityRefreshed {
                previous,
                current: real_balance,
            });
        }

        Ok(SyncOutcome::InSync)
    }

    /// Price fell under the stop of a held position
    pub fn stop_loss_triggered(&self, pair: &str, price: Decimal) -> bool {
        if self.stop_loss_fraction <= Decimal::ZERO {
            return false;
        }
        self.records.get(pair).is_some_and(|r| {
            r.holding && r.stop_loss_price > Decimal::ZERO && price < r.stop_loss_price
        })
    }

    /// Price reached the take-profit target of a held position
    pub fn take_profit_triggered(&self, pair: &str, price: Decimal) -> bool {
        self.records.get(pair).is_some_and(|r| {
            r.holding && r.take_profit_price > Decimal::ZERO && price >= r.take_profit_price
        })
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            records: self.records.clone(),
            realized_pnl: self.realized_pnl,
            trade_count: self.trade_count,
        }
    }

    /// Restore records for pairs that are registered; unknown pairs are ignored
    ///
    /// Stops and targets are recomputed from the current fractions.
    pub fn restore(&mut self, snapshot: LedgerSnapshot) -> usize {
        let mut restored = 0;
        for (pair, mut record) in snapshot.records {
            if let Some(slot) = self.records.get_mut(&pair) {
                if record.holding && record.entry_known() {
                    record.stop_loss_price = stop_price(record.average_entry_price, self.stop_loss_fraction);
                    record.take_profit_price =
                        target_price(record.average_entry_price, self.take_profit_fraction);
                }
                *slot = record;
                restored += 1;
            }
        }
        self.realized_pnl = snapshot.realized_pnl;
        self.trade_count = snapshot.trade_count;
        restored
    }
}

fn stop_price(entry: Decimal, fraction: Decimal) -> Decimal {
    if fraction > Decimal::ZERO {
        entry * (Decimal::ONE - fraction)
    } else {
        Decimal::ZERO
    }
}

fn target_price(entry: Decimal, fraction: Decimal) -> Decimal {
    if fraction > Decimal::ZERO {
        entry * (Decimal::ONE + fraction)
    } else {
        Decimal::ZERO
    }
}
