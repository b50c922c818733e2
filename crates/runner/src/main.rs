//! Trading runner.
//!
//! Wires the execution core together and drives it against the paper
//! venue with a simulated price feed:
//! - opens the store and runs migrations
//! - reconciles every pair before any trading
//! - submits demo entries on candle closes, ratchets stops on ticks
//! - reports health metrics periodically
//! - shuts down cleanly on Ctrl+C
//!
//! # Usage
//!
//! ```bash
//! ratchet-trader                         # BTC-USD and ETH-USD, ./trader.db
//! ratchet-trader --db /tmp/state.db BTC-USD
//! TRADER_CAPITAL=50000 ratchet-trader
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{error, info, warn};

use engine::{ExecutionEngine, StrategyParams};
use exchange_core::{ExchangeAdapter, PaperExchange};
use metrics::CoreMetrics;
use model::EntryIntent;
use orchestrator::{Orchestrator, DEFAULT_MAX_CONCURRENT_ENTRIES};
use portfolio::{PairConfig, PortfolioConfig, PortfolioManager};
use rate_limit::RateLimitPolicy;
use store::Store;

/// Interval between simulated trade ticks.
const TICK_INTERVAL: Duration = Duration::from_millis(500);
/// Ticks per simulated 5-minute candle.
const TICKS_PER_CANDLE: u64 = 60;
/// Interval for periodic health status logging.
const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(60);

fn print_usage() {
    eprintln!("Usage: ratchet-trader [OPTIONS] [PRODUCTS...]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --db <path>        Store file path (default: trader.db)");
    eprintln!("  --capital <usd>    Total portfolio capital (default: 100000)");
    eprintln!("  --help             Show this help message");
    eprintln!();
    eprintln!("Environment variables:");
    eprintln!("  TRADER_DB_PATH     Store file path");
    eprintln!("  TRADER_CAPITAL     Total portfolio capital");
    eprintln!("  RUST_LOG           Log filter (default: info)");
    eprintln!();
    eprintln!("Examples:");
    eprintln!("  ratchet-trader                        # BTC-USD and ETH-USD");
    eprintln!("  ratchet-trader SOL-USD                # one pair");
    eprintln!("  ratchet-trader --db /tmp/state.db     # custom store file");
}

struct RunnerConfig {
    db_path: String,
    total_capital: Decimal,
    products: Vec<String>,
}

fn parse_args() -> Option<RunnerConfig> {
    let mut db_path =
        std::env::var("TRADER_DB_PATH").unwrap_or_else(|_| "trader.db".to_string());
    let mut total_capital = std::env::var("TRADER_CAPITAL")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(dec!(100000));
    let mut products = Vec::new();

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--db" => match args.next() {
                Some(path) => db_path = path,
                None => {
                    eprintln!("--db requires a path");
                    return None;
                }
            },
            "--capital" => match args.next().and_then(|s| s.parse().ok()) {
                Some(capital) => total_capital = capital,
                None => {
                    eprintln!("--capital requires a decimal amount");
                    return None;
                }
            },
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            s if s.starts_with('-') => {
                eprintln!("Unknown option: {s}");
                print_usage();
                return None;
            }
            product => products.push(product.to_string()),
        }
    }

    if products.is_empty() {
        products = vec!["BTC-USD".to_string(), "ETH-USD".to_string()];
    }

    Some(RunnerConfig {
        db_path,
        total_capital,
        products,
    })
}

fn starting_price(product_id: &str) -> Decimal {
    match product_id {
        "BTC-USD" => dec!(50000),
        "ETH-USD" => dec!(3000),
        _ => dec!(100),
    }
}

/// One random-walk step of at most ±20 basis points, in exact decimals.
fn walk(price: Decimal) -> Decimal {
    let bps = rand::thread_rng().gen_range(-20i64..=20);
    (price * (Decimal::ONE + Decimal::from(bps) / dec!(10000))).round_dp(2)
}

#[tokio::main]
async fn main() {
    match dotenvy::dotenv() {
        Ok(path) => eprintln!("Loaded environment from: {}", path.display()),
        Err(dotenvy::Error::Io(_)) => {}
        Err(e) => eprintln!("Warning: failed to load .env file: {e}"),
    }

    common::init_logging();

    let Some(config) = parse_args() else {
        std::process::exit(1);
    };

    info!(
        db_path = %config.db_path,
        total_capital = %config.total_capital,
        products = ?config.products,
        "starting trader"
    );

    let store = match Store::open_file(&config.db_path).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(error = %e, "failed to open store");
            std::process::exit(1);
        }
    };

    let venue = Arc::new(PaperExchange::new());
    let rate_limit = RateLimitPolicy::shared();
    let metrics = CoreMetrics::shared();
    let portfolio = Arc::new(PortfolioManager::new(
        PortfolioConfig::new(config.total_capital),
    ));

    let mut orchestrator = Orchestrator::new(Arc::clone(&portfolio), Arc::clone(&metrics));
    for product in &config.products {
        let adapter: Arc<dyn ExchangeAdapter> = Arc::clone(&venue) as Arc<dyn ExchangeAdapter>;
        let engine = ExecutionEngine::new(
            product.clone(),
            StrategyParams::default(),
            adapter,
            Arc::clone(&store),
            Arc::clone(&rate_limit),
            Arc::clone(&metrics),
        );
        if let Err(e) = orchestrator.register_pair(PairConfig::new(product.clone()), engine) {
            error!(product_id = %product, error = %e, "failed to register pair");
            std::process::exit(1);
        }
    }

    // Reconciliation strictly precedes the processing loop.
    match orchestrator.reconcile_all().await {
        Ok(reports) => {
            for (product, report) in reports {
                info!(product_id = %product, report = ?report, "reconciled");
            }
        }
        Err(e) => {
            error!(error = %e, "reconciliation failed");
            std::process::exit(1);
        }
    }

    let mut prices: HashMap<String, Decimal> = config
        .products
        .iter()
        .map(|p| (p.clone(), starting_price(p)))
        .collect();
    for (product, price) in &prices {
        venue.set_last_price(product, *price);
    }

    let mut tick = tokio::time::interval(TICK_INTERVAL);
    let mut health = tokio::time::interval(HEALTH_LOG_INTERVAL);
    let mut tick_count: u64 = 0;
    let mut entry_seq: u64 = 0;

    info!("trader running, Ctrl+C to stop");

    loop {
        tokio::select! {
            biased;

            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }

            _ = health.tick() => {
                let snapshot = metrics.snapshot();
                let status = orchestrator.portfolio_status();
                info!(
                    uptime_secs = snapshot.uptime_secs,
                    entries = snapshot.entries_submitted,
                    fills = snapshot.fills_applied,
                    stops_placed = snapshot.stops_placed,
                    stops_replaced = snapshot.stops_replaced,
                    deployed = %status.metrics.deployed_capital,
                    total_pnl = %status.metrics.total_pnl,
                    win_rate_pct = %status.metrics.win_rate_pct,
                    "health"
                );
                for violation in status.risk_violations {
                    warn!(code = violation.code, detail = %violation.detail, "risk violation");
                }
            }

            _ = tick.tick() => {
                tick_count += 1;
                step_market(&orchestrator, &venue, &mut prices).await;

                if tick_count % TICKS_PER_CANDLE == 0 {
                    candle_close(&orchestrator, &prices, &mut entry_seq).await;
                }

                if orchestrator.portfolio().should_emergency_liquidate() {
                    warn!("portfolio loss threshold breached, liquidating");
                    let report = orchestrator.emergency_liquidate_portfolio(&prices).await;
                    for exit in report.exits {
                        warn!(
                            position_id = %exit.position_id,
                            realized_pnl = %exit.realized_pnl,
                            "emergency exit"
                        );
                    }
                }
            }
        }
    }

    let snapshot = metrics.snapshot();
    info!(
        entries = snapshot.entries_submitted,
        fills = snapshot.fills_applied,
        stops_placed = snapshot.stops_placed,
        stops_replaced = snapshot.stops_replaced,
        force_exits = snapshot.force_exits,
        "final metrics, trader stopped"
    );
}

/// Advance each product's price one step, feed the tick through the
/// orchestrator, and simulate stop executions the paper venue would
/// perform when price falls through a trigger.
async fn step_market(
    orchestrator: &Orchestrator,
    venue: &Arc<PaperExchange>,
    prices: &mut HashMap<String, Decimal>,
) {
    for product in orchestrator.products() {
        let Some(price) = prices.get_mut(&product) else { continue };
        *price = walk(*price);
        let last = *price;
        venue.set_last_price(&product, last);

        if let Err(e) = orchestrator.handle_price_update(&product, last).await {
            error!(product_id = %product, error = %e, "price update failed");
            continue;
        }

        // Simulated stop executions: price at or below the trigger sells
        // the remaining quantity at the stop limit.
        let positions = match orchestrator.open_positions(&product).await {
            Ok(positions) => positions,
            Err(_) => continue,
        };
        for position in positions {
            let (Some(trigger), Some(limit), Some(stop_id)) = (
                position.current_stop_trigger,
                position.current_stop_limit,
                position.stop_order_id.clone(),
            ) else {
                continue;
            };
            if last <= trigger {
                info!(
                    product_id = %product,
                    position_id = %position.position_id,
                    trigger = %trigger,
                    "stop triggered"
                );
                if let Err(e) = orchestrator
                    .handle_execution(&product, &stop_id, position.qty_filled, limit)
                    .await
                {
                    error!(position_id = %position.position_id, error = %e, "stop fill failed");
                }
            }
        }
    }
}

/// Candle close: emit a demo entry for every product without an open
/// position, then simulate the immediate fill.
async fn candle_close(
    orchestrator: &Orchestrator,
    prices: &HashMap<String, Decimal>,
    entry_seq: &mut u64,
) {
    let mut intents = Vec::new();
    for product in orchestrator.products() {
        if let Err(e) = orchestrator.handle_candle_close(&product).await {
            error!(product_id = %product, error = %e, "candle-close bookkeeping failed");
        }
        let Some(price) = prices.get(&product).copied() else { continue };
        let open = match orchestrator.open_positions(&product).await {
            Ok(positions) => positions,
            Err(_) => continue,
        };
        if !open.is_empty() {
            continue;
        }

        let notional = orchestrator.portfolio().target_notional(&product);
        let qty = (notional / price).round_dp(6);
        if qty <= Decimal::ZERO {
            continue;
        }
        *entry_seq += 1;
        intents.push(EntryIntent::new(
            format!("demo_{}_{}", product.to_lowercase().replace('-', "_"), entry_seq),
            product,
            price,
            qty,
        ));
    }
    if intents.is_empty() {
        return;
    }

    let outcomes = orchestrator
        .submit_coordinated_entries(intents.clone(), DEFAULT_MAX_CONCURRENT_ENTRIES)
        .await;

    for intent in intents {
        match outcomes.get(&intent.product_id) {
            Some(Ok(receipt)) => {
                // Paper venue: the resting limit fills at its price.
                if let Err(e) = orchestrator
                    .handle_execution(
                        &intent.product_id,
                        &receipt.order_id,
                        intent.qty,
                        intent.limit_price,
                    )
                    .await
                {
                    error!(order_id = %receipt.order_id, error = %e, "entry fill failed");
                }
            }
            Some(Err(e)) => info!(product_id = %intent.product_id, reason = %e, "entry skipped"),
            None => {}
        }
    }
}
