use anyhow::Context;
use chrono::{DateTime, DurationRound, Utc};
use clap::Parser;
use pairtrader::config::Settings;
use pairtrader::control::{spawn_control_listener, Shutdown, TradingSwitch};
use pairtrader::exchange::{Exchange, GuardedExchange, PaperExchange, SyntheticMarket};
use pairtrader::execution::Coordinator;
use pairtrader::models::SymbolTradingRules;
use pairtrader::notify::{LogNotifier, Notifier, TelegramNotifier};
use pairtrader::persistence::{CheckpointStore, FileCheckpointStore, RedisCheckpointStore};
use pairtrader::Result;
use rust_decimal::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::Duration;

const CONTROL_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "pairtrader", about = "Multi-pair EMA crossover spot trading bot")]
struct Args {
    /// Config file (defaults to ./pairtrader.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Stop after this many trading cycles
    #[arg(long)]
    cycles: Option<u64>,

    /// Seed of the simulated market (overrides the config)
    #[arg(long)]
    seed: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let args = Args::parse();
    let mut settings = Settings::load(args.config.as_deref())?;
    if let Some(seed) = args.seed {
        settings.paper_seed = seed;
    }

    tracing::info!("🚀 pairtrader starting");
    log_configuration(&settings);

    let notifier = build_notifier(&settings)?;
    let store = build_checkpoint_store(&settings).await;

    let (paper, mut market) = build_paper_market(&settings).await;
    let exchange: Arc<dyn Exchange> = Arc::new(GuardedExchange::new(
        paper.clone(),
        settings.requests_per_minute,
        settings.retry_policy(),
    ));

    let checkpoint = match &store {
        Some(store) => match store.load().await {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                tracing::warn!("Failed to load checkpoint ({}), starting fresh", e);
                None
            }
        },
        None => None,
    };

    let mut coordinator = match Coordinator::initialize(
        exchange,
        notifier.clone(),
        settings.coordinator_settings(),
        settings.active_pairs(),
        checkpoint,
    )
    .await
    {
        Ok(coordinator) => coordinator,
        Err(e) => {
            notifier.notify(&format!("❌ Startup failed: {}", e)).await;
            return Err(e).context("Failed to initialize trading");
        }
    };

    let shutdown = Shutdown::new();
    let switch = TradingSwitch::new(true);

    let control_handle = settings.control_file.clone().map(|path| {
        tracing::info!("🎛️  Watching control file {}", path.display());
        spawn_control_listener(path, switch.clone(), CONTROL_POLL_INTERVAL, shutdown.clone())
    });

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("\n👋 Interrupt received, finishing current pair...");
                    shutdown.trigger();
                }
                Err(e) => tracing::error!("Failed to listen for Ctrl+C: {}", e),
            }
        });
    }

    let poll_interval = settings.poll_interval();
    let mut cycles_run = 0u64;
    let mut waiter = shutdown.clone();

    loop {
        if shutdown.is_triggered() {
            break;
        }

        if switch.is_running() {
            for (symbol, candles) in market.advance_to(Utc::now()) {
                if !candles.is_empty() {
                    paper.push_candles(&symbol, candles).await;
                }
            }

            cycles_run += 1;
            tracing::info!("🔄 Cycle {} starting", cycles_run);
            let report = coordinator.run_cycle(&shutdown).await;
            tracing::info!(
                "📊 Cycle {} done: {} evaluated, {} skipped, {} buy(s), {} sell(s), {} failure(s) | realized P/L {} {}",
                cycles_run,
                report.evaluated,
                report.skipped,
                report.buys.len(),
                report.sells.len(),
                report.failures.len(),
                coordinator.ledger().realized_pnl().round_dp(2),
                settings.quote_asset
            );

            save_checkpoint(store.as_deref(), &coordinator).await;

            if args.cycles.is_some_and(|max| cycles_run >= max) {
                tracing::info!("Reached {} cycle(s), stopping", cycles_run);
                break;
            }
        } else {
            tracing::debug!("Trading paused, skipping cycle");
        }

        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            _ = waiter.wait() => break,
        }
    }

    shutdown.trigger();
    if let Some(handle) = control_handle {
        handle.await.ok();
    }

    save_checkpoint(store.as_deref(), &coordinator).await;
    log_summary(&coordinator, &settings.quote_asset);
    notifier
        .notify(&format!(
            "🛑 pairtrader stopped after {} cycle(s), realized P/L {} {}",
            cycles_run,
            coordinator.ledger().realized_pnl().round_dp(2),
            settings.quote_asset
        ))
        .await;

    Ok(())
}

fn setup_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "pairtrader=info,pairtrader::strategy=debug".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn log_configuration(settings: &Settings) {
    tracing::info!("\n📊 Configuration:");
    tracing::info!("  Quote asset: {}", settings.quote_asset);
    for pair in settings.active_pair_settings() {
        let s = &pair.strategy;
        tracing::info!(
            "  {}: {} EMA {}/{}/{}",
            pair.symbol(&settings.quote_asset),
            s.kind,
            s.fast_period,
            s.medium_period,
            s.slow_period
        );
    }
    tracing::info!("  Interval: {}, polling every {}s", settings.kline_interval, settings.poll_interval_secs);
    tracing::info!("  Capital mode: {:?}", settings.capital_mode);
    if settings.stop_loss_fraction > Decimal::ZERO {
        tracing::info!("  Stop-loss: {}%", settings.stop_loss_fraction * Decimal::ONE_HUNDRED);
    } else {
        tracing::info!("  Stop-loss: off");
    }
    if settings.take_profit_fraction > Decimal::ZERO {
        tracing::info!("  Take-profit: {}%", settings.take_profit_fraction * Decimal::ONE_HUNDRED);
    }
}

fn build_notifier(settings: &Settings) -> Result<Arc<dyn Notifier>> {
    match settings.telegram() {
        Some((token, chat_id)) => {
            tracing::info!("📨 Telegram notifications enabled");
            Ok(Arc::new(TelegramNotifier::new(token, chat_id)?))
        }
        None => {
            tracing::info!("Telegram not configured, notifications go to the log");
            Ok(Arc::new(LogNotifier))
        }
    }
}

/// Redis wins over a file path when both are configured
async fn build_checkpoint_store(settings: &Settings) -> Option<Arc<dyn CheckpointStore>> {
    if let Some(url) = &settings.redis_url {
        match RedisCheckpointStore::new(url).await {
            Ok(store) => {
                tracing::info!("Checkpoints stored in Redis at {}", url);
                return Some(Arc::new(store));
            }
            Err(e) => tracing::warn!(
                "Failed to connect to Redis ({}), continuing without Redis checkpoints",
                e
            ),
        }
    }

    settings.checkpoint_path.as_ref().map(|path| {
        tracing::info!("Checkpoints stored in {}", path.display());
        Arc::new(FileCheckpointStore::new(path)) as Arc<dyn CheckpointStore>
    })
}

async fn save_checkpoint(store: Option<&dyn CheckpointStore>, coordinator: &Coordinator) {
    if let Some(store) = store {
        if let Err(e) = store.save(&coordinator.checkpoint()).await {
            tracing::warn!("Failed to save checkpoint: {}", e);
        }
    }
}

/// Paper exchange seeded with a synthetic price history per active pair
async fn build_paper_market(settings: &Settings) -> (Arc<PaperExchange>, SyntheticMarket) {
    let interval = settings.kline_interval.duration();
    let now = Utc::now();
    let aligned = now.duration_trunc(interval).unwrap_or(now);
    let start: DateTime<Utc> = aligned - interval * settings.paper_history_bars as i32;

    let paper = Arc::new(PaperExchange::new(settings.quote_asset.clone()));
    let mut market = SyntheticMarket::new(settings.paper_seed, settings.kline_interval);

    for pair in settings.active_pair_settings() {
        let symbol = pair.symbol(&settings.quote_asset);
        let price = Decimal::from_f64(pair.paper_price)
            .unwrap_or(Decimal::ONE_HUNDRED)
            .round_dp(2);
        paper
            .add_market(&symbol, &pair.base_asset, paper_rules(&symbol, price), price)
            .await;
        market.add_symbol(symbol, pair.paper_price, settings.paper_volatility, start);
    }
    paper
        .set_balance(&settings.quote_asset, settings.paper_starting_balance)
        .await;

    for (symbol, candles) in market.advance_to(now) {
        tracing::info!("📈 {}: {} bars of simulated history", symbol, candles.len());
        paper.push_candles(&symbol, candles).await;
    }

    tracing::info!(
        "🧪 Paper trading with {} {} (seed {})",
        settings.paper_starting_balance,
        settings.quote_asset,
        settings.paper_seed
    );
    (paper, market)
}

/// Lot sizes roughly like a spot venue's: pricier assets trade in finer steps
fn paper_rules(symbol: &str, price: Decimal) -> SymbolTradingRules {
    let step = if price >= Decimal::from(1_000) {
        Decimal::new(1, 5)
    } else if price >= Decimal::TEN {
        Decimal::new(1, 3)
    } else {
        Decimal::new(1, 1)
    };
    SymbolTradingRules::new(symbol, step, Decimal::new(1, 2), Decimal::from(5), step)
}

fn log_summary(coordinator: &Coordinator, quote_asset: &str) {
    let ledger = coordinator.ledger();
    tracing::info!("\n📋 Final positions:");
    for (pair, record) in ledger.records() {
        if record.holding {
            let entry = if record.entry_known() {
                record.average_entry_price.to_string()
            } else {
                "unknown".to_string()
            };
            tracing::info!("  {}: holding {} (entry {})", pair, record.quantity_held, entry);
        } else {
            tracing::info!("  {}: flat, pool {} {}", pair, record.allocated_capital.round_dp(2), quote_asset);
        }
    }
    tracing::info!(
        "  Realized P/L {} {} over {} trade(s)",
        ledger.realized_pnl().round_dp(2),
        quote_asset,
        ledger.trade_count()
    );
}
