use chrono::{DateTime, Duration as ChronoDuration, Utc};
use pairtrader::control::Shutdown;
use pairtrader::exchange::{Exchange, ExchangeError, GuardedExchange, PaperExchange, PaperOp, RetryPolicy};
use pairtrader::execution::{
    CapitalMode, Coordinator, CoordinatorSettings, PairSpec, TradeOutcome,
};
use pairtrader::models::{Candle, KlineInterval, SymbolTradingRules};
use pairtrader::notify::MemoryNotifier;
use pairtrader::persistence::{CheckpointStore, FileCheckpointStore};
use pairtrader::strategy::{StrategyConfig, StrategyKind};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

const START: i64 = 1_700_000_000;

/// Hourly closed candles; `offset` shifts the first bar so feeds can be extended
fn hourly(closes: &[f64], offset: usize) -> Vec<Candle> {
    let start = DateTime::<Utc>::from_timestamp(START, 0).unwrap();
    closes
        .iter()
        .enumerate()
        .map(|(i, &close)| {
            let n = (offset + i) as i64;
            Candle {
                open_time: start + ChronoDuration::hours(n),
                close_time: start + ChronoDuration::hours(n + 1) - ChronoDuration::milliseconds(1),
                open: close,
                high: close + 0.5,
                low: close - 0.5,
                close,
                volume: 100.0,
            }
        })
        .collect()
}

fn settings(stop_loss: Decimal) -> CoordinatorSettings {
    CoordinatorSettings {
        quote_asset: "USDT".to_string(),
        kline_interval: KlineInterval::Hours(1),
        pair_pause: Duration::ZERO,
        capital_mode: CapitalMode::PerPairPool,
        fixed_amount: dec!(20),
        stop_loss_fraction: stop_loss,
        take_profit_fraction: Decimal::ZERO,
    }
}

fn btc_pair() -> PairSpec {
    PairSpec {
        base_asset: "BTC".to_string(),
        strategy: StrategyConfig::new("BTCUSDT", StrategyKind::Crossover).with_periods(2, 3, 5),
    }
}

async fn paper_with_btc(usdt: Decimal) -> Arc<PaperExchange> {
    let exchange = Arc::new(PaperExchange::new("USDT"));
    let rules = SymbolTradingRules::new("BTCUSDT", dec!(0.001), dec!(0.01), dec!(10), dec!(0.001));
    exchange.add_market("BTCUSDT", "BTC", rules, dec!(100)).await;
    exchange.set_balance("USDT", usdt).await;
    exchange
}

async fn start(
    exchange: Arc<dyn Exchange>,
    stop_loss: Decimal,
) -> (Coordinator, Arc<MemoryNotifier>) {
    let notifier = Arc::new(MemoryNotifier::new());
    let coordinator = Coordinator::initialize(
        exchange,
        notifier.clone(),
        settings(stop_loss),
        vec![btc_pair()],
        None,
    )
    .await
    .unwrap();
    (coordinator, notifier)
}

#[tokio::test]
async fn test_crossover_primes_then_buys() {
    let exchange = paper_with_btc(dec!(1000)).await;
    let (mut coordinator, notifier) = start(exchange.clone(), Decimal::ZERO).await;
    let shutdown = Shutdown::new();

    // first sufficient window only primes the strategy
    exchange.push_candles("BTCUSDT", hourly(&[10.0; 6], 0)).await;
    let report = coordinator.run_cycle(&shutdown).await;
    assert_eq!(report.evaluated, 1);
    assert!(report.buys.is_empty());

    exchange.push_candles("BTCUSDT", hourly(&[10.0], 6)).await;
    let report = coordinator.run_cycle(&shutdown).await;
    assert!(report.buys.is_empty());

    // fast EMA crosses above on the 11 close
    exchange.push_candles("BTCUSDT", hourly(&[11.0], 7)).await;
    let report = coordinator.run_cycle(&shutdown).await;
    assert_eq!(report.buys, vec!["BTCUSDT".to_string()]);

    let record = coordinator.ledger().get("BTCUSDT").unwrap();
    assert!(record.holding);
    assert_eq!(record.average_entry_price, dec!(11));
    assert_eq!(record.quantity_held, dec!(90.909));
    assert_eq!(record.allocated_capital, Decimal::ZERO);
    assert_eq!(exchange.orders().await.len(), 1);
    assert!(notifier.contains("BUY 90.909 BTCUSDT").await);

    // same bars again: no second order for the same signal
    let report = coordinator.run_cycle(&shutdown).await;
    assert!(report.buys.is_empty());
    assert_eq!(exchange.orders().await.len(), 1);
}

#[tokio::test]
async fn test_stop_loss_overrides_strategy() {
    let exchange = paper_with_btc(dec!(1000)).await;
    let (mut coordinator, notifier) = start(exchange.clone(), dec!(0.05)).await;

    coordinator.execute_buy("BTCUSDT", dec!(100), dec!(100)).await.unwrap();
    assert_eq!(coordinator.ledger().get("BTCUSDT").unwrap().stop_loss_price, dec!(95));

    // flat history: the strategy alone would only hold
    exchange.push_candles("BTCUSDT", hourly(&[100.0; 8], 0)).await;
    exchange.set_price("BTCUSDT", dec!(94)).await;

    let report = coordinator.run_cycle(&Shutdown::new()).await;
    assert_eq!(report.sells, vec!["BTCUSDT".to_string()]);

    let record = coordinator.ledger().get("BTCUSDT").unwrap();
    assert!(!record.holding);
    assert_eq!(record.allocated_capital, dec!(94));
    assert_eq!(record.stop_loss_price, Decimal::ZERO);
    assert_eq!(coordinator.ledger().realized_pnl(), dec!(-6));
    assert!(notifier.contains("stop-loss").await);
}

#[tokio::test]
async fn test_buy_below_min_notional_submits_nothing() {
    let exchange = paper_with_btc(dec!(1000)).await;
    let (mut coordinator, _) = start(exchange.clone(), Decimal::ZERO).await;
    let before = coordinator.ledger().snapshot();

    let outcome = coordinator.execute_buy("BTCUSDT", dec!(5), dec!(100)).await.unwrap();

    assert!(matches!(outcome, TradeOutcome::Skipped(_)));
    assert!(exchange.orders().await.is_empty());
    assert_eq!(coordinator.ledger().snapshot(), before);
    assert_eq!(exchange.balance("USDT").await, dec!(1000));
}

#[tokio::test]
async fn test_untracked_balance_adopted_at_startup() {
    let exchange = paper_with_btc(dec!(1000)).await;
    exchange.set_balance("BTC", dec!(0.5)).await;
    let (mut coordinator, notifier) = start(exchange.clone(), dec!(0.05)).await;

    let record = coordinator.ledger().get("BTCUSDT").unwrap().clone();
    assert!(record.holding);
    assert_eq!(record.quantity_held, dec!(0.5));
    assert_eq!(record.average_entry_price, Decimal::ZERO);
    assert_eq!(record.stop_loss_price, Decimal::ZERO);
    assert_eq!(record.allocated_capital, Decimal::ZERO);
    assert!(notifier.contains("found 0.5 BTC").await);

    // unknown entry: no stop-loss, and the exit reports no P/L
    assert!(!coordinator.ledger().stop_loss_triggered("BTCUSDT", dec!(1)));
    let outcome = coordinator
        .execute_sell(
            "BTCUSDT",
            dec!(100),
            Some(dec!(0.5)),
            pairtrader::execution::ExitReason::StrategySell,
        )
        .await
        .unwrap();
    assert!(matches!(outcome, TradeOutcome::Filled { pnl: None, .. }));
    assert!(notifier.contains("P/L unknown").await);
}

#[tokio::test]
async fn test_transient_errors_retried_through_guard() {
    let paper = paper_with_btc(dec!(1000)).await;
    paper.push_candles("BTCUSDT", hourly(&[100.0; 8], 0)).await;
    let guarded: Arc<dyn Exchange> = Arc::new(GuardedExchange::new(
        paper.clone(),
        6000,
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
        },
    ));
    let (mut coordinator, _) = start(guarded, Decimal::ZERO).await;

    paper
        .fail_next(PaperOp::Klines, ExchangeError::Transient("connection reset".into()))
        .await;
    let report = coordinator.run_cycle(&Shutdown::new()).await;
    assert!(report.failures.is_empty());
    assert_eq!(report.evaluated, 1);
}

#[tokio::test]
async fn test_rejected_order_is_reported_not_raised() {
    let exchange = paper_with_btc(dec!(1000)).await;
    let (mut coordinator, notifier) = start(exchange.clone(), Decimal::ZERO).await;
    let shutdown = Shutdown::new();

    exchange.push_candles("BTCUSDT", hourly(&[10.0; 7], 0)).await;
    coordinator.run_cycle(&shutdown).await;

    exchange
        .fail_next(
            PaperOp::Buy,
            ExchangeError::Rejected {
                code: -2010,
                message: "Account has insufficient balance for requested action.".into(),
            },
        )
        .await;
    exchange.push_candles("BTCUSDT", hourly(&[11.0], 7)).await;
    let report = coordinator.run_cycle(&shutdown).await;

    assert!(report.buys.is_empty());
    assert_eq!(report.failures.len(), 1);
    assert!(!coordinator.ledger().is_holding("BTCUSDT"));
    assert!(notifier.contains("BTCUSDT BUY failed").await);
}

#[tokio::test]
async fn test_checkpoint_survives_restart() {
    let path = std::env::temp_dir().join(format!("pairtrader-{}.json", uuid::Uuid::new_v4()));
    let store = FileCheckpointStore::new(&path);

    let exchange = paper_with_btc(dec!(1000)).await;
    let (mut coordinator, _) = start(exchange.clone(), dec!(0.05)).await;
    coordinator.execute_buy("BTCUSDT", dec!(200), dec!(100)).await.unwrap();
    store.save(&coordinator.checkpoint()).await.unwrap();

    let checkpoint = store.load().await.unwrap();
    std::fs::remove_file(&path).ok();
    assert!(checkpoint.is_some());

    let restarted = Coordinator::initialize(
        exchange.clone(),
        Arc::new(MemoryNotifier::new()),
        settings(dec!(0.05)),
        vec![btc_pair()],
        checkpoint,
    )
    .await
    .unwrap();

    let record = restarted.ledger().get("BTCUSDT").unwrap();
    assert!(record.holding);
    assert_eq!(record.average_entry_price, dec!(100));
    assert_eq!(record.stop_loss_price, dec!(95));
}
