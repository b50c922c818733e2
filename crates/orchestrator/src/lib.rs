//! Multi-pair coordination.
//!
//! Owns one engine per registered product, each behind its own mutex:
//! per-pair processing is serialized, cross-pair work runs in parallel.
//! Every entry passes the portfolio admission check before it reaches an
//! engine, and entry submission is bounded by a semaphore.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::join_all;
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info, warn};

use common::ExponentialBackoff;
use engine::{EngineError, EntryReceipt, ExecutionEngine, PositionState, ReconcileReport};
use exchange_core::VenueError;
use metrics::CoreMetrics;
use model::{EntryIntent, EntrySignal};
use portfolio::{
    AdmissionReason, PairConfig, PortfolioError, PortfolioManager, PortfolioMetrics,
    RebalanceHint, RiskViolation,
};

/// Default bound on concurrent entry submissions.
pub const DEFAULT_MAX_CONCURRENT_ENTRIES: usize = 3;

/// Orchestrator-level errors.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Portfolio refused the entry; carries the reason code.
    #[error("admission rejected: {0}")]
    AdmissionRejected(#[from] AdmissionReason),

    #[error(transparent)]
    Portfolio(#[from] PortfolioError),

    #[error("no engine registered for {0}")]
    UnknownProduct(String),

    #[error("pair config {pair} does not match engine product {engine}")]
    ProductMismatch { pair: String, engine: String },
}

/// One force-exited position from an emergency liquidation.
#[derive(Debug, Clone)]
pub struct LiquidatedPosition {
    pub position_id: String,
    pub product_id: String,
    pub realized_pnl: Decimal,
}

/// Outcome of an emergency liquidation pass.
#[derive(Debug, Default, Clone)]
pub struct LiquidationReport {
    pub exits: Vec<LiquidatedPosition>,
    /// Products with open positions but no reference price supplied.
    pub missing_prices: Vec<String>,
}

/// Aggregated portfolio view.
#[derive(Debug, Clone)]
pub struct PortfolioStatus {
    pub metrics: PortfolioMetrics,
    pub risk_violations: Vec<RiskViolation>,
    pub rebalance_hints: Vec<RebalanceHint>,
    pub emergency_liquidation_advised: bool,
}

/// Coordinates per-pair engines under one portfolio.
pub struct Orchestrator {
    engines: HashMap<String, Arc<Mutex<ExecutionEngine>>>,
    portfolio: Arc<PortfolioManager>,
    metrics: Arc<CoreMetrics>,
    /// Ceiling on rate-limit-denial retries per entry.
    entry_retry_attempts: u32,
    entry_retry_backoff: ExponentialBackoff,
}

impl Orchestrator {
    pub fn new(portfolio: Arc<PortfolioManager>, metrics: Arc<CoreMetrics>) -> Self {
        Self {
            engines: HashMap::new(),
            portfolio,
            metrics,
            entry_retry_attempts: 3,
            entry_retry_backoff: ExponentialBackoff::default(),
        }
    }

    pub fn with_entry_retry(mut self, attempts: u32, backoff: ExponentialBackoff) -> Self {
        self.entry_retry_attempts = attempts.max(1);
        self.entry_retry_backoff = backoff;
        self
    }

    pub fn portfolio(&self) -> &Arc<PortfolioManager> {
        &self.portfolio
    }

    pub fn products(&self) -> Vec<String> {
        self.engines.keys().cloned().collect()
    }

    /// Register a pair and the engine that owns it.
    pub fn register_pair(
        &mut self,
        pair: PairConfig,
        engine: ExecutionEngine,
    ) -> Result<(), OrchestratorError> {
        if pair.product_id != engine.product_id() {
            return Err(OrchestratorError::ProductMismatch {
                pair: pair.product_id,
                engine: engine.product_id().to_string(),
            });
        }
        let product_id = pair.product_id.clone();
        self.portfolio.register_pair(pair)?;
        self.engines
            .insert(product_id, Arc::new(Mutex::new(engine)));
        Ok(())
    }

    /// Reconcile every engine, strictly before normal processing.
    pub async fn reconcile_all(
        &self,
    ) -> Result<HashMap<String, ReconcileReport>, OrchestratorError> {
        let mut reports = HashMap::new();
        for (product_id, engine) in &self.engines {
            let report = engine.lock().await.reconcile().await?;
            reports.insert(product_id.clone(), report);
        }
        Ok(reports)
    }

    /// Evaluate the signal generator across all pairs concurrently.
    pub async fn check_all_entries<F, Fut>(&self, signal_fn: F) -> HashMap<String, Option<EntrySignal>>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Option<EntrySignal>>,
    {
        let futures = self.engines.keys().map(|product_id| {
            let fut = signal_fn(product_id.clone());
            let product_id = product_id.clone();
            async move { (product_id, fut.await) }
        });
        join_all(futures).await.into_iter().collect()
    }

    /// Submit entries with bounded parallelism.
    ///
    /// Each entry passes the admission check first; a failed admission
    /// or a failed submit is reported per pair without aborting the
    /// rest. Rate-limit denials are retried with exponential backoff up
    /// to the configured ceiling.
    pub async fn submit_coordinated_entries(
        &self,
        entries: Vec<EntryIntent>,
        max_concurrent: usize,
    ) -> HashMap<String, Result<EntryReceipt, OrchestratorError>> {
        let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));

        let futures = entries.into_iter().map(|intent| {
            let semaphore = Arc::clone(&semaphore);
            async move {
                let product_id = intent.product_id.clone();
                let result = self.submit_one(intent, semaphore).await;
                (product_id, result)
            }
        });

        join_all(futures).await.into_iter().collect()
    }

    async fn submit_one(
        &self,
        intent: EntryIntent,
        semaphore: Arc<Semaphore>,
    ) -> Result<EntryReceipt, OrchestratorError> {
        if let Err(reason) = self.portfolio.check_admission(&intent) {
            self.metrics.inc_admission_rejections();
            info!(
                product_id = %intent.product_id,
                client_order_id = %intent.client_order_id,
                reason = %reason,
                "entry not admitted"
            );
            return Err(reason.into());
        }

        let engine = self
            .engines
            .get(&intent.product_id)
            .ok_or_else(|| OrchestratorError::UnknownProduct(intent.product_id.clone()))?;

        // Semaphore bounds concurrent submissions across pairs; the
        // permit spans the venue round trip.
        let _permit = semaphore.acquire_owned().await.ok();

        let mut backoff = self.entry_retry_backoff.clone();
        let mut attempt = 0;
        loop {
            let result = engine.lock().await.submit_entry(&intent).await;
            match result {
                Ok(receipt) => return Ok(receipt),
                Err(EngineError::Venue(VenueError::BudgetExhausted { .. }))
                    if attempt + 1 < self.entry_retry_attempts =>
                {
                    attempt += 1;
                    let delay = backoff.next_delay();
                    warn!(
                        product_id = %intent.product_id,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        "rate-limit denial, retrying entry"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Snapshot of the open positions for one product.
    pub async fn open_positions(
        &self,
        product_id: &str,
    ) -> Result<Vec<PositionState>, OrchestratorError> {
        let engine = self
            .engines
            .get(product_id)
            .ok_or_else(|| OrchestratorError::UnknownProduct(product_id.to_string()))?;
        let engine = engine.lock().await;
        Ok(engine.open_positions().into_iter().cloned().collect())
    }

    /// Route a last-trade price to the owning engine.
    pub async fn handle_price_update(
        &self,
        product_id: &str,
        last_price: Decimal,
    ) -> Result<(), OrchestratorError> {
        self.portfolio.update_price(product_id, last_price);
        let engine = self
            .engines
            .get(product_id)
            .ok_or_else(|| OrchestratorError::UnknownProduct(product_id.to_string()))?;
        engine.lock().await.on_trade(last_price).await?;
        Ok(())
    }

    /// Candle close for one product: ages pending entries in the owning
    /// engine, cancelling those past the configured wait.
    pub async fn handle_candle_close(&self, product_id: &str) -> Result<(), OrchestratorError> {
        let engine = self
            .engines
            .get(product_id)
            .ok_or_else(|| OrchestratorError::UnknownProduct(product_id.to_string()))?;
        engine.lock().await.handle_candle_close().await?;
        Ok(())
    }

    /// Route a fill event to the owning engine and keep the portfolio's
    /// capital accounting in step.
    pub async fn handle_execution(
        &self,
        product_id: &str,
        order_id: &str,
        filled_qty: Decimal,
        fill_price: Decimal,
    ) -> Result<(), OrchestratorError> {
        let engine = self
            .engines
            .get(product_id)
            .ok_or_else(|| OrchestratorError::UnknownProduct(product_id.to_string()))?;
        let mut engine = engine.lock().await;
        engine.handle_fill(order_id, filled_qty, fill_price).await?;

        let position = engine
            .lookup_order(order_id)
            .map(|o| o.position_id.clone())
            .and_then(|pid| engine.position(&pid).cloned());
        if let Some(position) = position {
            if position.is_open() {
                self.portfolio.record_fill(&position);
            } else if position.status.is_terminal() {
                self.portfolio
                    .record_close(&position.position_id, position.realized_pnl);
            }
        }
        Ok(())
    }

    /// Force-exit every open position at the supplied reference prices.
    ///
    /// Idempotent: positions already terminal are skipped, so a rerun
    /// after partial success completes only the remainder.
    pub async fn emergency_liquidate_portfolio(
        &self,
        prices_by_product: &HashMap<String, Decimal>,
    ) -> LiquidationReport {
        let futures = self.engines.iter().map(|(product_id, engine)| {
            let price = prices_by_product.get(product_id).copied();
            async move {
                let mut engine = engine.lock().await;
                let open_ids: Vec<String> = engine
                    .open_positions()
                    .iter()
                    .map(|p| p.position_id.clone())
                    .collect();

                let Some(price) = price else {
                    return if open_ids.is_empty() {
                        (Vec::new(), None)
                    } else {
                        (Vec::new(), Some(product_id.clone()))
                    };
                };

                let mut exits = Vec::new();
                for position_id in open_ids {
                    match engine.force_exit(&position_id, price).await {
                        Ok(()) => {
                            let realized_pnl = engine
                                .position(&position_id)
                                .map(|p| p.realized_pnl)
                                .unwrap_or(Decimal::ZERO);
                            self.portfolio.record_close(&position_id, realized_pnl);
                            exits.push(LiquidatedPosition {
                                position_id,
                                product_id: product_id.clone(),
                                realized_pnl,
                            });
                        }
                        Err(err) => {
                            warn!(
                                position_id = %position_id,
                                error = %err,
                                "emergency exit failed, will complete on rerun"
                            );
                        }
                    }
                }
                (exits, None)
            }
        });

        let mut report = LiquidationReport::default();
        for (exits, missing) in join_all(futures).await {
            report.exits.extend(exits);
            if let Some(product) = missing {
                report.missing_prices.push(product);
            }
        }
        if !report.exits.is_empty() {
            warn!(
                exited = report.exits.len(),
                "emergency liquidation pass complete"
            );
        }
        report
    }

    /// Aggregate portfolio metrics with current risk state.
    pub fn portfolio_status(&self) -> PortfolioStatus {
        PortfolioStatus {
            metrics: self.portfolio.metrics(),
            risk_violations: self.portfolio.risk_violations(),
            rebalance_hints: self.portfolio.rebalance_actions(),
            emergency_liquidation_advised: self.portfolio.should_emergency_liquidate(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use exchange_core::{ExchangeAdapter, PaperExchange, RetryConfig};
    use engine::StrategyParams;
    use portfolio::PortfolioConfig;
    use rate_limit::RateLimitPolicy;
    use rust_decimal_macros::dec;
    use std::time::Duration;
    use store::Store;

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 2,
            backoff: ExponentialBackoff::new(Duration::from_millis(1), Duration::from_millis(5)),
            max_rate_limit_wait: Duration::from_millis(50),
        }
    }

    async fn setup(config: PortfolioConfig) -> (Arc<PaperExchange>, Arc<Store>, Orchestrator) {
        let venue = Arc::new(PaperExchange::new());
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let portfolio = Arc::new(PortfolioManager::new(config));
        let metrics = CoreMetrics::shared();
        let rate_limit = RateLimitPolicy::shared();

        let mut orchestrator = Orchestrator::new(portfolio, Arc::clone(&metrics)).with_entry_retry(
            2,
            ExponentialBackoff::new(Duration::from_millis(1), Duration::from_millis(5)),
        );
        for product in ["BTC-USD", "ETH-USD"] {
            let adapter: Arc<dyn ExchangeAdapter> = Arc::clone(&venue) as Arc<dyn ExchangeAdapter>;
            let engine = ExecutionEngine::new(
                product,
                StrategyParams::default(),
                adapter,
                Arc::clone(&store),
                Arc::clone(&rate_limit),
                Arc::clone(&metrics),
            )
            .with_retry_config(fast_retry());
            orchestrator
                .register_pair(
                    PairConfig::new(product).with_position_size_pct(dec!(5)),
                    engine,
                )
                .unwrap();
        }
        orchestrator.reconcile_all().await.unwrap();
        (venue, store, orchestrator)
    }

    fn wide_open_config() -> PortfolioConfig {
        PortfolioConfig::new(dec!(1000000)).with_max_position_size_pct(dec!(50))
    }

    #[tokio::test]
    async fn test_admission_rejection_sends_nothing_to_venue() {
        // total 10000, 5% cap -> 500; notional 600 is refused.
        let config = PortfolioConfig::new(dec!(10000)).with_max_position_size_pct(dec!(5));
        let (venue, store, orchestrator) = setup(config).await;

        let outcomes = orchestrator
            .submit_coordinated_entries(
                vec![EntryIntent::new("c1", "BTC-USD", dec!(100), dec!(6))],
                DEFAULT_MAX_CONCURRENT_ENTRIES,
            )
            .await;

        match &outcomes["BTC-USD"] {
            Err(OrchestratorError::AdmissionRejected(reason)) => {
                assert_eq!(reason.to_string(), "position_size_exceeds_limit");
            }
            other => panic!("expected admission rejection, got {other:?}"),
        }

        // No order reached the adapter, no position row was persisted.
        assert_eq!(venue.order_count(), 0);
        assert!(store.list_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_coordinated_entries_fan_out() {
        let (venue, _store, orchestrator) = setup(wide_open_config()).await;

        let outcomes = orchestrator
            .submit_coordinated_entries(
                vec![
                    EntryIntent::new("c1", "BTC-USD", dec!(50000), dec!(1)),
                    EntryIntent::new("c2", "ETH-USD", dec!(3000), dec!(2)),
                ],
                2,
            )
            .await;

        assert!(outcomes["BTC-USD"].is_ok());
        assert!(outcomes["ETH-USD"].is_ok());
        assert_eq!(venue.order_count(), 2);
    }

    #[tokio::test]
    async fn test_one_failure_does_not_abort_others() {
        let (venue, _store, orchestrator) = setup(wide_open_config()).await;
        venue.fail_next_place(VenueError::InsufficientFunds("no USD".into()));

        let outcomes = orchestrator
            .submit_coordinated_entries(
                vec![
                    EntryIntent::new("c1", "BTC-USD", dec!(50000), dec!(1)),
                    EntryIntent::new("c2", "ETH-USD", dec!(3000), dec!(2)),
                ],
                1, // serialized: the injected failure hits the first submit
            )
            .await;

        let failures = outcomes.values().filter(|o| o.is_err()).count();
        assert_eq!(failures, 1);
        assert_eq!(outcomes.values().filter(|o| o.is_ok()).count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_product_is_reported() {
        let (_venue, _store, orchestrator) = setup(wide_open_config()).await;

        let err = orchestrator
            .handle_price_update("DOGE-USD", dec!(1))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownProduct(_)));
    }

    #[tokio::test]
    async fn test_price_updates_reach_the_owning_engine() {
        let (_venue, _store, orchestrator) = setup(wide_open_config()).await;

        let outcomes = orchestrator
            .submit_coordinated_entries(
                vec![EntryIntent::new("c1", "BTC-USD", dec!(50000), dec!(1))],
                1,
            )
            .await;
        let receipt = outcomes["BTC-USD"].as_ref().unwrap().clone();
        orchestrator
            .handle_execution("BTC-USD", &receipt.order_id, dec!(1), dec!(50000))
            .await
            .unwrap();

        orchestrator
            .handle_price_update("BTC-USD", dec!(51000))
            .await
            .unwrap();

        let engine = orchestrator.engines["BTC-USD"].lock().await;
        let position = engine.position(&receipt.position_id).unwrap();
        assert_eq!(position.current_stop_trigger, Some(dec!(49980)));

        // The portfolio values unrealized P&L off the cached price.
        drop(engine);
        assert_eq!(orchestrator.portfolio().metrics().unrealized_pnl, dec!(1000));
    }

    #[tokio::test]
    async fn test_execution_sync_flows_into_portfolio() {
        let (_venue, _store, orchestrator) = setup(wide_open_config()).await;

        let outcomes = orchestrator
            .submit_coordinated_entries(
                vec![EntryIntent::new("c1", "BTC-USD", dec!(50000), dec!(1))],
                1,
            )
            .await;
        let receipt = outcomes["BTC-USD"].as_ref().unwrap().clone();

        orchestrator
            .handle_execution("BTC-USD", &receipt.order_id, dec!(1), dec!(50000))
            .await
            .unwrap();
        assert_eq!(
            orchestrator.portfolio().metrics().deployed_capital,
            dec!(50000)
        );

        // Stop fills and the position closes out of the portfolio.
        let stop_id = {
            let engine = orchestrator.engines["BTC-USD"].lock().await;
            engine
                .position(&receipt.position_id)
                .unwrap()
                .stop_order_id
                .clone()
                .unwrap()
        };
        orchestrator
            .handle_execution("BTC-USD", &stop_id, dec!(1), dec!(51000))
            .await
            .unwrap();

        let metrics = orchestrator.portfolio().metrics();
        assert_eq!(metrics.deployed_capital, dec!(0));
        assert_eq!(metrics.realized_pnl, dec!(1000));
        assert_eq!(metrics.closed_positions, 1);
    }

    #[tokio::test]
    async fn test_emergency_liquidation_is_idempotent() {
        let (_venue, _store, orchestrator) = setup(wide_open_config()).await;

        let outcomes = orchestrator
            .submit_coordinated_entries(
                vec![
                    EntryIntent::new("c1", "BTC-USD", dec!(50000), dec!(1)),
                    EntryIntent::new("c2", "ETH-USD", dec!(3000), dec!(2)),
                ],
                2,
            )
            .await;
        for (product, outcome) in &outcomes {
            let receipt = outcome.as_ref().unwrap();
            let price = if product.as_str() == "BTC-USD" {
                dec!(50000)
            } else {
                dec!(3000)
            };
            orchestrator
                .handle_execution(product, &receipt.order_id, receipt_qty(product), price)
                .await
                .unwrap();
        }

        let prices: HashMap<String, Decimal> = [
            ("BTC-USD".to_string(), dec!(48000)),
            ("ETH-USD".to_string(), dec!(2900)),
        ]
        .into();

        let first = orchestrator.emergency_liquidate_portfolio(&prices).await;
        assert_eq!(first.exits.len(), 2);
        assert!(first.missing_prices.is_empty());

        // Re-invocation finds nothing open: the terminal set is stable.
        let second = orchestrator.emergency_liquidate_portfolio(&prices).await;
        assert!(second.exits.is_empty());

        let metrics = orchestrator.portfolio().metrics();
        assert_eq!(metrics.active_positions, 0);
        assert_eq!(metrics.closed_positions, 2);
        // (48000-50000)*1 + (2900-3000)*2
        assert_eq!(metrics.realized_pnl, dec!(-2200));
    }

    fn receipt_qty(product: &str) -> Decimal {
        if product == "BTC-USD" {
            dec!(1)
        } else {
            dec!(2)
        }
    }

    #[tokio::test]
    async fn test_missing_price_is_reported_and_completable() {
        let (_venue, _store, orchestrator) = setup(wide_open_config()).await;

        let outcomes = orchestrator
            .submit_coordinated_entries(
                vec![EntryIntent::new("c1", "BTC-USD", dec!(50000), dec!(1))],
                1,
            )
            .await;
        let receipt = outcomes["BTC-USD"].as_ref().unwrap();
        orchestrator
            .handle_execution("BTC-USD", &receipt.order_id, dec!(1), dec!(50000))
            .await
            .unwrap();

        let report = orchestrator
            .emergency_liquidate_portfolio(&HashMap::new())
            .await;
        assert!(report.exits.is_empty());
        assert_eq!(report.missing_prices, vec!["BTC-USD".to_string()]);

        // Supplying the price completes the remainder.
        let prices: HashMap<String, Decimal> =
            [("BTC-USD".to_string(), dec!(48000))].into();
        let report = orchestrator.emergency_liquidate_portfolio(&prices).await;
        assert_eq!(report.exits.len(), 1);
    }

    #[tokio::test]
    async fn test_check_all_entries_fans_out() {
        let (_venue, _store, orchestrator) = setup(wide_open_config()).await;

        let signals = orchestrator
            .check_all_entries(|product_id| async move {
                if product_id == "BTC-USD" {
                    Some(EntrySignal {
                        should_buy: true,
                        limit_price: dec!(50000),
                        qty: dec!(1),
                        client_order_id: "sig-1".to_string(),
                    })
                } else {
                    None
                }
            })
            .await;

        assert_eq!(signals.len(), 2);
        assert!(signals["BTC-USD"].is_some());
        assert!(signals["ETH-USD"].is_none());
    }

    #[tokio::test]
    async fn test_portfolio_status_aggregates() {
        let (_venue, _store, orchestrator) = setup(wide_open_config()).await;
        let status = orchestrator.portfolio_status();
        assert_eq!(status.metrics.active_positions, 0);
        assert!(status.risk_violations.is_empty());
        assert!(status.rebalance_hints.is_empty());
        assert!(!status.emergency_liquidation_advised);
    }

    #[tokio::test]
    async fn test_register_pair_rejects_product_mismatch() {
        let venue = Arc::new(PaperExchange::new());
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let portfolio = Arc::new(PortfolioManager::new(wide_open_config()));
        let mut orchestrator = Orchestrator::new(portfolio, CoreMetrics::shared());

        let adapter: Arc<dyn ExchangeAdapter> = Arc::clone(&venue) as Arc<dyn ExchangeAdapter>;
        let engine = ExecutionEngine::new(
            "ETH-USD",
            StrategyParams::default(),
            adapter,
            store,
            RateLimitPolicy::shared(),
            CoreMetrics::shared(),
        );
        let err = orchestrator
            .register_pair(PairConfig::new("BTC-USD"), engine)
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::ProductMismatch { .. }));
    }
}
