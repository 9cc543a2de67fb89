use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::ledger::{LedgerError, PositionLedger, SyncOutcome};
use super::quantize::floor_to_precision;
use crate::exchange::{ClockOffset, Exchange, ExchangeError, MAX_KLINES_PER_REQUEST};
use crate::models::{closed_candles, validate_candles, Action, KlineInterval, SymbolTradingRules};
use crate::notify::Notifier;
use crate::persistence::Checkpoint;
use crate::strategy::{PairStrategy, Strategy, StrategyConfig};
use crate::control::Shutdown;

/// Klines requested per pair never go below this, so EMAs have room to settle
const MIN_KLINE_LIMIT: usize = 100;

/// Decimal places used when splitting quote capital
const QUOTE_DECIMALS: u32 = 8;

/// How the spend for a BUY is sized
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapitalMode {
    /// Always spend `fixed_amount` of the quote asset
    FixedAmount,
    /// Spend the pair's own pool (initial split plus sale proceeds)
    #[default]
    PerPairPool,
    /// Split the free quote balance evenly across this cycle's BUY signals
    EvenSplit,
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub quote_asset: String,
    pub kline_interval: KlineInterval,
    pub pair_pause: Duration,
    pub capital_mode: CapitalMode,
    pub fixed_amount: Decimal,
    pub stop_loss_fraction: Decimal,
    pub take_profit_fraction: Decimal,
}

/// A pair to trade: its base asset and strategy parameters
#[derive(Debug, Clone, PartialEq)]
pub struct PairSpec {
    pub base_asset: String,
    pub strategy: StrategyConfig,
}

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("exchange rejected credentials: {0}")]
    Auth(ExchangeError),

    #[error("could not read account balances: {0}")]
    Balances(ExchangeError),

    #[error("no valid trading pairs after initialization")]
    NoValidPairs,
}

/// Why a single trade attempt failed
#[derive(Debug, Error)]
pub enum TradeError {
    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("unknown pair {0}")]
    UnknownPair(String),
}

/// Outcome of an order attempt that did not fail
#[derive(Debug, Clone, PartialEq)]
pub enum TradeOutcome {
    Filled {
        quantity: Decimal,
        price: Decimal,
        quote_amount: Decimal,
        /// Realized P/L of a sell; None for buys or unknown entry
        pnl: Option<Decimal>,
    },
    /// Nothing was submitted
    Skipped(String),
}

/// Why a position is being exited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    StrategySell,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::StopLoss => write!(f, "stop-loss"),
            ExitReason::TakeProfit => write!(f, "take-profit"),
            ExitReason::StrategySell => write!(f, "strategy"),
        }
    }
}

/// Summary of one sweep over all pairs
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub evaluated: usize,
    pub skipped: usize,
    pub buys: Vec<String>,
    pub sells: Vec<String>,
    pub failures: Vec<(String, String)>,
    pub interrupted: bool,
}

/// Runtime state of one traded pair
pub struct PairState {
    pub symbol: String,
    pub base_asset: String,
    pub rules: SymbolTradingRules,
    pub strategy: Box<dyn Strategy>,
    pub kline_limit: usize,
}

/// Drives the decide-and-execute cycle over every pair
///
/// Pairs are processed one after another. SELLs execute as soon as they are
/// decided; BUYs are collected and executed once every pair has been looked
/// at, so capital freed by this cycle's exits can be used and an even split
/// knows how many pairs want in.
pub struct Coordinator {
    exchange: Arc<dyn Exchange>,
    notifier: Arc<dyn Notifier>,
    settings: CoordinatorSettings,
    clock: ClockOffset,
    ledger: PositionLedger,
    pairs: Vec<PairState>,
}

impl Coordinator {
    /// Measure clock skew, load trading rules, split capital and reconcile
    /// with the balances already on the exchange
    ///
    /// A checkpoint, when given, is restored before reconciliation so the
    /// exchange still has the final word on what is held.
    pub async fn initialize(
        exchange: Arc<dyn Exchange>,
        notifier: Arc<dyn Notifier>,
        settings: CoordinatorSettings,
        specs: Vec<PairSpec>,
        checkpoint: Option<Checkpoint>,
    ) -> Result<Self, StartupError> {
        let clock = match ClockOffset::measure(exchange.as_ref()).await {
            Ok(clock) => {
                if clock.is_significant() {
                    notifier
                        .notify(&format!(
                            "⚠️ Local clock is {} ms off the exchange, correcting",
                            clock.offset_ms()
                        ))
                        .await;
                }
                clock
            }
            Err(ExchangeError::Auth(msg)) => return Err(StartupError::Auth(ExchangeError::Auth(msg))),
            Err(e) => {
                warn!("Could not read exchange time ({}), assuming no clock offset", e);
                ClockOffset::default()
            }
        };

        let balances = match exchange.get_account_balances(clock.timestamp_ms()).await {
            Ok(balances) => balances,
            Err(ExchangeError::Auth(msg)) => return Err(StartupError::Auth(ExchangeError::Auth(msg))),
            Err(e) => return Err(StartupError::Balances(e)),
        };

        let mut pairs = Vec::with_capacity(specs.len());
        for spec in specs {
            let symbol = spec.strategy.symbol.clone();
            match exchange.get_symbol_info(&symbol).await {
                Ok(rules) => {
                    let strategy = PairStrategy::new(spec.strategy);
                    let kline_limit = (strategy.required_lookback() + 1)
                        .max(MIN_KLINE_LIMIT)
                        .min(MAX_KLINES_PER_REQUEST);
                    info!(
                        "✓ {} using {} (lookback {}, step {}, min notional {})",
                        symbol,
                        strategy.name(),
                        strategy.required_lookback(),
                        rules.quantity_step_size,
                        rules.min_notional
                    );
                    pairs.push(PairState {
                        symbol,
                        base_asset: spec.base_asset,
                        rules,
                        strategy: Box::new(strategy),
                        kline_limit,
                    });
                }
                Err(ExchangeError::Auth(msg)) => {
                    return Err(StartupError::Auth(ExchangeError::Auth(msg)))
                }
                Err(e) => {
                    warn!("✗ Skipping {}: could not load trading rules: {}", symbol, e);
                    notifier
                        .notify(&format!("⚠️ {} skipped: trading rules unavailable ({})", symbol, e))
                        .await;
                }
            }
        }

        if pairs.is_empty() {
            return Err(StartupError::NoValidPairs);
        }

        let quote_free = balances
            .get(&settings.quote_asset)
            .copied()
            .unwrap_or_default();
        let per_pair = (quote_free / Decimal::from(pairs.len()))
            .round_dp_with_strategy(QUOTE_DECIMALS, RoundingStrategy::ToZero);

        let mut ledger = PositionLedger::new(settings.stop_loss_fraction, settings.take_profit_fraction);
        for pair in &pairs {
            ledger.register(pair.symbol.clone(), per_pair);
        }
        info!(
            "💰 {} {} free, {} {} allocated per pair",
            quote_free, settings.quote_asset, per_pair, settings.quote_asset
        );

        let mut coordinator = Self {
            exchange,
            notifier,
            settings,
            clock,
            ledger,
            pairs,
        };

        if let Some(checkpoint) = checkpoint {
            coordinator.restore(checkpoint);
        }

        coordinator.reconcile(&balances).await;
        coordinator
            .notifier
            .notify(&format!(
                "🚀 Trading {} pair(s): {}",
                coordinator.pairs.len(),
                coordinator.symbols().join(", ")
            ))
            .await;

        Ok(coordinator)
    }

    pub fn ledger(&self) -> &PositionLedger {
        &self.ledger
    }

    pub fn clock(&self) -> ClockOffset {
        self.clock
    }

    pub fn symbols(&self) -> Vec<String> {
        self.pairs.iter().map(|p| p.symbol.clone()).collect()
    }

    fn pair_index(&self, symbol: &str) -> Option<usize> {
        self.pairs.iter().position(|p| p.symbol == symbol)
    }

    /// Snapshot of the ledger and every strategy's memory
    pub fn checkpoint(&self) -> Checkpoint {
        let strategies = self
            .pairs
            .iter()
            .map(|p| (p.symbol.clone(), p.strategy.state()))
            .collect::<BTreeMap<_, _>>();
        Checkpoint {
            saved_at: self.clock.now(),
            ledger: self.ledger.snapshot(),
            strategies,
        }
    }

    fn restore(&mut self, checkpoint: Checkpoint) {
        let restored = self.ledger.restore(checkpoint.ledger);
        let mut strategies = checkpoint.strategies;
        for pair in &mut self.pairs {
            if let Some(state) = strategies.remove(&pair.symbol) {
                pair.strategy.restore(state);
            }
        }
        info!(
            "♻️  Restored checkpoint from {} ({} pair record(s))",
            checkpoint.saved_at.format("%Y-%m-%d %H:%M:%S"),
            restored
        );
    }

    /// Let the exchange balances correct the ledger's holding flags
    async fn reconcile(&mut self, balances: &HashMap<String, Decimal>) {
        for i in 0..self.pairs.len() {
            let (symbol, base_asset, rules) = {
                let pair = &self.pairs[i];
                (pair.symbol.clone(), pair.base_asset.clone(), pair.rules.clone())
            };
            let balance = balances.get(&base_asset).copied().unwrap_or_default();

            // a vanished position is valued at the ticker; 0 falls back to entry
            let mark_price = if self.ledger.is_holding(&symbol) && rules.is_dust(balance) {
                match self.exchange.get_ticker_price(&symbol).await {
                    Ok(price) => price,
                    Err(e) => {
                        warn!(symbol = %symbol, "No ticker to value vanished position ({}), using entry price", e);
                        Decimal::ZERO
                    }
                }
            } else {
                Decimal::ZERO
            };

            match self.ledger.sync_with_exchange(&symbol, balance, &rules, mark_price) {
                Ok(SyncOutcome::Corrected { now_holding: true, balance, .. }) => {
                    warn!(
                        symbol = %symbol,
                        "Exchange holds {} {} not tracked by the ledger, treating as open position with unknown entry",
                        balance, base_asset
                    );
                    self.notifier
                        .notify(&format!(
                            "⚠️ {}: found {} {} on the exchange, tracking it as an open position (entry price unknown)",
                            symbol, balance, base_asset
                        ))
                        .await;
                }
                Ok(SyncOutcome::Corrected { now_holding: false, balance, released_capital }) => {
                    warn!(
                        symbol = %symbol,
                        "Ledger says holding but exchange balance is {} {}, marking position closed and returning ~{} {} to the pool",
                        balance, base_asset, released_capital, self.settings.quote_asset
                    );
                    self.notifier
                        .notify(&format!(
                            "⚠️ {}: position no longer on the exchange ({} {} left), marked as closed, pool refilled with ~{} {}",
                            symbol,
                            balance,
                            base_asset,
                            released_capital.round_dp(2),
                            self.settings.quote_asset
                        ))
                        .await;
                }
                Ok(SyncOutcome::QuantityRefreshed { previous, current }) => {
                    debug!(symbol = %symbol, "Held quantity refreshed {} -> {}", previous, current);
                }
                Ok(SyncOutcome::InSync) => {}
                Err(e) => error!(symbol = %symbol, "Reconciliation failed: {}", e),
            }
        }
    }

    /// One full sweep over every pair
    ///
    /// Errors never escape: each failing pair is reported and skipped. The
    /// shutdown signal is honored between pairs, never in the middle of one.
    pub async fn run_cycle(&mut self, shutdown: &Shutdown) -> CycleReport {
        let mut report = CycleReport::default();

        let balances = match self.exchange.get_account_balances(self.clock.timestamp_ms()).await {
            Ok(balances) => Some(balances),
            Err(e) => {
                error!("Failed to fetch balances, skipping reconciliation: {}", e);
                self.notifier
                    .notify(&format!("❌ Could not fetch account balances: {}", e))
                    .await;
                None
            }
        };
        if let Some(balances) = &balances {
            self.reconcile(balances).await;
        }

        // Phase 1: decide every pair, exit positions right away
        let mut buy_candidates: Vec<(usize, Decimal)> = Vec::new();
        for i in 0..self.pairs.len() {
            if shutdown.is_triggered() {
                report.interrupted = true;
                return report;
            }
            if i > 0 {
                self.pause().await;
            }

            let symbol = self.pairs[i].symbol.clone();
            match self.evaluate_pair(i).await {
                Ok(PairDecision::Skip(reason)) => {
                    debug!(symbol = %symbol, "Skipped: {}", reason);
                    report.skipped += 1;
                }
                Ok(PairDecision::Nothing) => report.evaluated += 1,
                Ok(PairDecision::Buy { price }) => {
                    report.evaluated += 1;
                    buy_candidates.push((i, price));
                }
                Ok(PairDecision::Sell { price, reason }) => {
                    report.evaluated += 1;
                    let base_balance = balances
                        .as_ref()
                        .and_then(|b| b.get(&self.pairs[i].base_asset).copied());
                    match self.sell_pair(i, price, base_balance, reason).await {
                        Ok(TradeOutcome::Filled { .. }) => report.sells.push(symbol),
                        Ok(TradeOutcome::Skipped(_)) => {}
                        Err(e) => self.report_failure(&mut report, &symbol, "SELL", &e).await,
                    }
                }
                Err(e) => self.report_failure(&mut report, &symbol, "evaluation", &e).await,
            }
        }

        if buy_candidates.is_empty() {
            return report;
        }

        // Phase 2: size and submit entries
        let spends = match self.size_buys(&buy_candidates).await {
            Ok(spends) => spends,
            Err(e) => {
                for (i, _) in &buy_candidates {
                    let symbol = self.pairs[*i].symbol.clone();
                    self.report_failure(&mut report, &symbol, "BUY sizing", &e).await;
                }
                return report;
            }
        };

        for (n, ((i, price), spend)) in buy_candidates.into_iter().zip(spends).enumerate() {
            if shutdown.is_triggered() {
                report.interrupted = true;
                return report;
            }
            if n > 0 {
                self.pause().await;
            }

            let symbol = self.pairs[i].symbol.clone();
            match self.execute_buy(&symbol, spend, price).await {
                Ok(TradeOutcome::Filled { .. }) => report.buys.push(symbol),
                Ok(TradeOutcome::Skipped(_)) => {}
                Err(e) => self.report_failure(&mut report, &symbol, "BUY", &e).await,
            }
        }

        report
    }

    async fn pause(&self) {
        if !self.settings.pair_pause.is_zero() {
            tokio::time::sleep(self.settings.pair_pause).await;
        }
    }

    async fn report_failure(
        &self,
        report: &mut CycleReport,
        symbol: &str,
        stage: &str,
        err: &dyn std::fmt::Display,
    ) {
        error!(symbol = %symbol, "✗ {} failed: {}", stage, err);
        self.notifier
            .notify(&format!("❌ {} {} failed: {}", symbol, stage, err))
            .await;
        report.failures.push((symbol.to_string(), err.to_string()));
    }

    /// Fetch data for one pair and turn it into a decision
    async fn evaluate_pair(&mut self, i: usize) -> Result<PairDecision, TradeError> {
        let now = self.clock.now();
        let pair = &self.pairs[i];
        let symbol = pair.symbol.clone();

        let klines = self
            .exchange
            .get_klines(&symbol, self.settings.kline_interval, pair.kline_limit)
            .await?;
        let candles = closed_candles(&klines, now);
        if let Err(e) = validate_candles(candles) {
            return Ok(PairDecision::Skip(e.to_string()));
        }
        let required = pair.strategy.required_lookback();
        if candles.len() < required {
            return Ok(PairDecision::Skip(format!(
                "{} closed candles, need {}",
                candles.len(),
                required
            )));
        }

        let price = self.exchange.get_ticker_price(&symbol).await?;
        let holding = self.ledger.is_holding(&symbol);

        let strategy_action = self.pairs[i].strategy.decide(candles, holding);

        let exit = if self.ledger.stop_loss_triggered(&symbol, price) {
            Some(ExitReason::StopLoss)
        } else if self.ledger.take_profit_triggered(&symbol, price) {
            Some(ExitReason::TakeProfit)
        } else if strategy_action == Action::Sell {
            Some(ExitReason::StrategySell)
        } else {
            None
        };

        if let Some(reason) = exit {
            if reason != ExitReason::StrategySell {
                info!(
                    symbol = %symbol,
                    "🛑 {} hit at {} (strategy said {})",
                    reason, price, strategy_action
                );
            }
            if holding {
                return Ok(PairDecision::Sell { price, reason });
            }
            debug!(symbol = %symbol, "SELL signal ignored, not holding");
            return Ok(PairDecision::Nothing);
        }

        if strategy_action == Action::Buy {
            if holding {
                debug!(symbol = %symbol, "BUY signal ignored, already holding");
                return Ok(PairDecision::Nothing);
            }
            return Ok(PairDecision::Buy { price });
        }

        Ok(PairDecision::Nothing)
    }

    /// Quote amount to spend for each BUY candidate, in order
    async fn size_buys(&self, candidates: &[(usize, Decimal)]) -> Result<Vec<Decimal>, ExchangeError> {
        match self.settings.capital_mode {
            CapitalMode::FixedAmount => Ok(vec![self.settings.fixed_amount; candidates.len()]),
            CapitalMode::PerPairPool => Ok(candidates
                .iter()
                .map(|(i, _)| {
                    self.ledger
                        .get(&self.pairs[*i].symbol)
                        .map(|r| r.allocated_capital)
                        .unwrap_or_default()
                })
                .collect()),
            CapitalMode::EvenSplit => {
                // balances again: this cycle's exits changed the free quote
                let balances = self
                    .exchange
                    .get_account_balances(self.clock.timestamp_ms())
                    .await?;
                let free = balances
                    .get(&self.settings.quote_asset)
                    .copied()
                    .unwrap_or_default();
                let share = (free / Decimal::from(candidates.len()))
                    .round_dp_with_strategy(QUOTE_DECIMALS, RoundingStrategy::ToZero);
                Ok(vec![share; candidates.len()])
            }
        }
    }

    /// Market-buy `spend` worth of quote asset at roughly `price`
    ///
    /// Returns `Skipped` without touching the exchange or the ledger when the
    /// order would break the symbol's notional or quantity filters.
    pub async fn execute_buy(
        &mut self,
        symbol: &str,
        spend: Decimal,
        price: Decimal,
    ) -> Result<TradeOutcome, TradeError> {
        let i = self
            .pair_index(symbol)
            .ok_or_else(|| TradeError::UnknownPair(symbol.to_string()))?;
        let rules = self.pairs[i].rules.clone();

        if self.ledger.is_holding(symbol) {
            return Ok(self.skip(symbol, "BUY", "already holding".to_string()));
        }
        if spend < rules.min_notional || spend <= Decimal::ZERO {
            return Ok(self.skip(
                symbol,
                "BUY",
                format!("spend {} below minimum notional {}", spend, rules.min_notional),
            ));
        }
        if price <= Decimal::ZERO {
            return Ok(self.skip(symbol, "BUY", format!("invalid price {}", price)));
        }

        let quantity = floor_to_precision(
            spend / price,
            rules.quantity_step_size,
            rules.quantity_decimal_places,
        );
        if quantity < rules.min_quantity || quantity <= Decimal::ZERO {
            return Ok(self.skip(
                symbol,
                "BUY",
                format!("quantity {} below minimum {}", quantity, rules.min_quantity),
            ));
        }
        if quantity * price < rules.min_notional {
            return Ok(self.skip(
                symbol,
                "BUY",
                format!("notional {} below minimum {}", quantity * price, rules.min_notional),
            ));
        }

        info!(symbol = %symbol, "🟢 BUY {} for ~{} {}", quantity, spend, self.settings.quote_asset);
        let fill = self
            .exchange
            .market_buy(symbol, quantity, self.clock.timestamp_ms())
            .await?;
        let executed = fill.executed_quantity();
        let Some(avg_price) = fill.average_price() else {
            return Err(ExchangeError::NoFills(symbol.to_string()).into());
        };
        let cost = fill.quote_amount();

        self.ledger.open(symbol, executed, avg_price)?;
        self.notifier
            .notify(&format!(
                "🟢 BUY {} {} @ {} ({} {})",
                executed, symbol, avg_price, cost, self.settings.quote_asset
            ))
            .await;

        Ok(TradeOutcome::Filled {
            quantity: executed,
            price: avg_price,
            quote_amount: cost,
            pnl: None,
        })
    }

    /// Market-sell the held position of `symbol`
    ///
    /// `real_balance`, when known, caps the quantity so a stale ledger can
    /// not oversell.
    pub async fn execute_sell(
        &mut self,
        symbol: &str,
        price: Decimal,
        real_balance: Option<Decimal>,
        reason: ExitReason,
    ) -> Result<TradeOutcome, TradeError> {
        let i = self
            .pair_index(symbol)
            .ok_or_else(|| TradeError::UnknownPair(symbol.to_string()))?;
        self.sell_pair(i, price, real_balance, reason).await
    }

    async fn sell_pair(
        &mut self,
        i: usize,
        price: Decimal,
        real_balance: Option<Decimal>,
        reason: ExitReason,
    ) -> Result<TradeOutcome, TradeError> {
        let symbol = self.pairs[i].symbol.clone();
        let rules = self.pairs[i].rules.clone();

        let Some(record) = self.ledger.get(&symbol).filter(|r| r.holding) else {
            return Ok(self.skip(&symbol, "SELL", "not holding".to_string()));
        };
        let held = match real_balance {
            Some(real) => record.quantity_held.min(real),
            None => record.quantity_held,
        };

        let quantity = floor_to_precision(held, rules.quantity_step_size, rules.quantity_decimal_places);
        if quantity < rules.min_quantity || quantity <= Decimal::ZERO {
            return Ok(self.skip(
                &symbol,
                "SELL",
                format!("quantity {} below minimum {}", quantity, rules.min_quantity),
            ));
        }
        if quantity * price < rules.min_notional {
            let message = format!(
                "estimated notional {} below minimum {}",
                quantity * price,
                rules.min_notional
            );
            self.notifier
                .notify(&format!("⚠️ {} SELL ({}) not possible: {}", symbol, reason, message))
                .await;
            return Ok(self.skip(&symbol, "SELL", message));
        }

        info!(symbol = %symbol, "🔴 SELL {} ({})", quantity, reason);
        let fill = self
            .exchange
            .market_sell(&symbol, quantity, self.clock.timestamp_ms())
            .await?;
        let sold = fill.executed_quantity();
        let Some(avg_price) = fill.average_price() else {
            return Err(ExchangeError::NoFills(symbol).into());
        };
        let revenue = fill.quote_amount();

        let pnl = self.ledger.close(&symbol, sold, revenue)?;
        let pnl_text = match pnl {
            Some(pnl) => format!("P/L {} {}", pnl.round_dp(2), self.settings.quote_asset),
            None => "P/L unknown (entry price not known)".to_string(),
        };
        info!(
            symbol = %symbol,
            "🔴 Sold {} @ {} for {} {}, {} (total {} over {} trade(s))",
            sold,
            avg_price,
            revenue,
            self.settings.quote_asset,
            pnl_text,
            self.ledger.realized_pnl().round_dp(2),
            self.ledger.trade_count()
        );
        self.notifier
            .notify(&format!(
                "🔴 SELL {} {} @ {} ({}): {}",
                sold, symbol, avg_price, reason, pnl_text
            ))
            .await;

        Ok(TradeOutcome::Filled {
            quantity: sold,
            price: avg_price,
            quote_amount: revenue,
            pnl,
        })
    }

    fn skip(&self, symbol: &str, side: &str, reason: String) -> TradeOutcome {
        info!(symbol = %symbol, "⏭️  {} skipped: {}", side, reason);
        TradeOutcome::Skipped(reason)
    }
}

enum PairDecision {
    Skip(String),
    Nothing,
    Buy { price: Decimal },
    Sell { price: Decimal, reason: ExitReason },
}
