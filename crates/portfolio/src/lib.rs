//! Portfolio-level capital accounting and risk limits.
//!
//! The manager is the single cross-pair critical section: admission
//! decisions, capital flows and metrics all run under one lock. Engines
//! never talk to each other; everything cross-pair goes through here.

use std::collections::HashMap;

use execution_core::PositionState;
use model::EntryIntent;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use thiserror::Error;
use tracing::{debug, info};

const HUNDRED: Decimal = dec!(100);

/// Portfolio-wide configuration. Percentages are whole numbers
/// (5 = 5%).
#[derive(Debug, Clone)]
pub struct PortfolioConfig {
    pub total_capital: Decimal,
    /// Hard cap on notional per position as % of total capital.
    pub max_position_size_pct: Decimal,
    /// Hard cap on simultaneously open positions.
    pub max_positions: usize,
    /// Cap on summed notional within one correlation group as % of total.
    pub max_correlated_exposure_pct: Decimal,
    /// Allocation drift above which a rebalance hint is raised.
    pub rebalance_threshold_pct: Decimal,
    /// Unrealized portfolio loss (negative %) triggering emergency exit.
    pub emergency_liquidation_loss_pct: Decimal,
}

impl PortfolioConfig {
    pub fn new(total_capital: Decimal) -> Self {
        Self {
            total_capital,
            max_position_size_pct: dec!(5),
            max_positions: 10,
            max_correlated_exposure_pct: dec!(20),
            rebalance_threshold_pct: dec!(10),
            emergency_liquidation_loss_pct: dec!(-10),
        }
    }

    pub fn with_max_position_size_pct(mut self, pct: Decimal) -> Self {
        self.max_position_size_pct = pct;
        self
    }

    pub fn with_max_positions(mut self, max: usize) -> Self {
        self.max_positions = max;
        self
    }

    pub fn with_max_correlated_exposure_pct(mut self, pct: Decimal) -> Self {
        self.max_correlated_exposure_pct = pct;
        self
    }

    pub fn with_rebalance_threshold_pct(mut self, pct: Decimal) -> Self {
        self.rebalance_threshold_pct = pct;
        self
    }

    pub fn with_emergency_liquidation_loss_pct(mut self, pct: Decimal) -> Self {
        self.emergency_liquidation_loss_pct = pct;
        self
    }
}

/// Per-pair registration.
#[derive(Debug, Clone)]
pub struct PairConfig {
    pub product_id: String,
    pub enabled: bool,
    /// Target allocation as % of total capital.
    pub position_size_pct: Decimal,
    /// Concentration-limit label (e.g. "large_cap").
    pub correlation_group: Option<String>,
}

impl PairConfig {
    pub fn new(product_id: impl Into<String>) -> Self {
        Self {
            product_id: product_id.into(),
            enabled: true,
            position_size_pct: dec!(2),
            correlation_group: None,
        }
    }

    pub fn with_position_size_pct(mut self, pct: Decimal) -> Self {
        self.position_size_pct = pct;
        self
    }

    pub fn with_correlation_group(mut self, group: impl Into<String>) -> Self {
        self.correlation_group = Some(group.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Why the portfolio refused an entry. Codes are stable strings
/// surfaced to the signal layer; rejections are not errors in the log.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionReason {
    #[error("pair_not_registered")]
    PairNotRegistered,
    #[error("position_size_exceeds_limit")]
    PositionSizeExceedsLimit,
    #[error("max_positions_reached")]
    MaxPositionsReached,
    #[error("correlated_exposure_exceeds_limit")]
    CorrelatedExposureExceedsLimit,
    #[error("insufficient_capital")]
    InsufficientCapital,
}

/// Registration failure.
#[derive(Debug, Error)]
pub enum PortfolioError {
    #[error("pair {0} already registered")]
    PairAlreadyRegistered(String),
    #[error("pair capacity reached ({0})")]
    PairCapacityReached(usize),
}

/// One tracked open position.
#[derive(Debug, Clone)]
struct ActivePosition {
    product_id: String,
    entry_price: Decimal,
    qty: Decimal,
    target_pct: Decimal,
}

impl ActivePosition {
    fn notional(&self) -> Decimal {
        self.entry_price * self.qty
    }
}

#[derive(Debug, Clone)]
struct ClosedPosition {
    realized_pnl: Decimal,
}

#[derive(Default)]
struct Inner {
    pairs: HashMap<String, PairConfig>,
    active: HashMap<String, ActivePosition>,
    closed: Vec<ClosedPosition>,
    last_prices: HashMap<String, Decimal>,
}

/// Point-in-time portfolio metrics.
#[derive(Debug, Clone)]
pub struct PortfolioMetrics {
    pub total_capital: Decimal,
    pub available_capital: Decimal,
    pub deployed_capital: Decimal,
    pub active_positions: usize,
    pub closed_positions: usize,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub total_pnl: Decimal,
    pub total_return_pct: Decimal,
    pub win_rate_pct: Decimal,
    pub largest_position_pct: Decimal,
    /// Top-3 positions as % of total capital.
    pub concentration_pct: Decimal,
}

/// A current limit breach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RiskViolation {
    pub code: &'static str,
    pub detail: String,
}

/// Direction of a rebalance hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebalanceAction {
    Increase,
    Decrease,
}

/// Allocation drift beyond the configured threshold.
#[derive(Debug, Clone)]
pub struct RebalanceHint {
    pub position_id: String,
    pub product_id: String,
    pub current_pct: Decimal,
    pub target_pct: Decimal,
    pub drift_pct: Decimal,
    pub action: RebalanceAction,
}

/// Cross-pair capital accounting and risk limits.
pub struct PortfolioManager {
    config: PortfolioConfig,
    inner: Mutex<Inner>,
}

impl PortfolioManager {
    pub fn new(config: PortfolioConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn config(&self) -> &PortfolioConfig {
        &self.config
    }

    /// Register a tradeable pair. Disabled pairs are ignored.
    pub fn register_pair(&self, pair: PairConfig) -> Result<(), PortfolioError> {
        if !pair.enabled {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        if inner.pairs.contains_key(&pair.product_id) {
            return Err(PortfolioError::PairAlreadyRegistered(pair.product_id));
        }
        if inner.pairs.len() >= self.config.max_positions {
            return Err(PortfolioError::PairCapacityReached(self.config.max_positions));
        }
        info!(product_id = %pair.product_id, target_pct = %pair.position_size_pct, "pair registered");
        inner.pairs.insert(pair.product_id.clone(), pair);
        Ok(())
    }

    /// Capital allocated to one pair by its target percentage.
    pub fn target_notional(&self, product_id: &str) -> Decimal {
        let inner = self.inner.lock();
        inner
            .pairs
            .get(product_id)
            .map(|p| self.config.total_capital * p.position_size_pct / HUNDRED)
            .unwrap_or(Decimal::ZERO)
    }

    /// Pre-trade admission decision, consulted before any entry is
    /// submitted. Serialized on the portfolio lock.
    pub fn check_admission(&self, intent: &EntryIntent) -> Result<(), AdmissionReason> {
        let inner = self.inner.lock();

        let pair = inner
            .pairs
            .get(&intent.product_id)
            .filter(|p| p.enabled)
            .ok_or(AdmissionReason::PairNotRegistered)?;

        let notional = intent.notional();
        let position_cap = self.config.total_capital * self.config.max_position_size_pct / HUNDRED;
        if notional > position_cap {
            debug!(
                product_id = %intent.product_id,
                notional = %notional,
                cap = %position_cap,
                "admission rejected: position size"
            );
            return Err(AdmissionReason::PositionSizeExceedsLimit);
        }

        if inner.active.len() >= self.config.max_positions {
            return Err(AdmissionReason::MaxPositionsReached);
        }

        if let Some(group) = pair.correlation_group.as_deref() {
            let group_cap =
                self.config.total_capital * self.config.max_correlated_exposure_pct / HUNDRED;
            let group_exposure: Decimal = inner
                .active
                .values()
                .filter(|pos| {
                    inner
                        .pairs
                        .get(&pos.product_id)
                        .and_then(|p| p.correlation_group.as_deref())
                        == Some(group)
                })
                .map(ActivePosition::notional)
                .sum();
            if group_exposure + notional > group_cap {
                return Err(AdmissionReason::CorrelatedExposureExceedsLimit);
            }
        }

        let deployed: Decimal = inner.active.values().map(ActivePosition::notional).sum();
        if deployed + notional > self.config.total_capital {
            return Err(AdmissionReason::InsufficientCapital);
        }

        Ok(())
    }

    /// Record (or refresh) a position after an entry fill.
    pub fn record_fill(&self, position: &PositionState) {
        let mut inner = self.inner.lock();
        let target_pct = inner
            .pairs
            .get(&position.product_id)
            .map(|p| p.position_size_pct)
            .unwrap_or(Decimal::ZERO);
        inner.active.insert(
            position.position_id.clone(),
            ActivePosition {
                product_id: position.product_id.clone(),
                entry_price: position.entry_price,
                qty: position.qty_filled,
                target_pct,
            },
        );
    }

    /// Record a terminal close with its realized P&L.
    pub fn record_close(&self, position_id: &str, realized_pnl: Decimal) {
        let mut inner = self.inner.lock();
        if inner.active.remove(position_id).is_some() {
            inner.closed.push(ClosedPosition { realized_pnl });
            info!(
                position_id = %position_id,
                realized_pnl = %realized_pnl,
                "position closed in portfolio"
            );
        }
    }

    /// Cache a last-trade price for unrealized P&L valuation.
    pub fn update_price(&self, product_id: &str, price: Decimal) {
        self.inner
            .lock()
            .last_prices
            .insert(product_id.to_string(), price);
    }

    pub fn metrics(&self) -> PortfolioMetrics {
        let inner = self.inner.lock();
        let total = self.config.total_capital;

        let deployed: Decimal = inner.active.values().map(ActivePosition::notional).sum();
        let unrealized: Decimal = inner
            .active
            .values()
            .filter_map(|pos| {
                inner
                    .last_prices
                    .get(&pos.product_id)
                    .map(|price| (*price - pos.entry_price) * pos.qty)
            })
            .sum();
        let realized: Decimal = inner.closed.iter().map(|c| c.realized_pnl).sum();
        let total_pnl = realized + unrealized;

        let wins = inner.closed.iter().filter(|c| c.realized_pnl > Decimal::ZERO).count();
        let win_rate = if inner.closed.is_empty() {
            Decimal::ZERO
        } else {
            Decimal::from(wins as u64) / Decimal::from(inner.closed.len() as u64) * HUNDRED
        };

        let mut notionals: Vec<Decimal> =
            inner.active.values().map(ActivePosition::notional).collect();
        notionals.sort_unstable_by(|a, b| b.cmp(a));
        let pct_of_total = |v: Decimal| {
            if total > Decimal::ZERO {
                v / total * HUNDRED
            } else {
                Decimal::ZERO
            }
        };
        let largest = notionals.first().copied().unwrap_or(Decimal::ZERO);
        let top3: Decimal = notionals.iter().take(3).copied().sum();

        PortfolioMetrics {
            total_capital: total,
            available_capital: total - deployed,
            deployed_capital: deployed,
            active_positions: inner.active.len(),
            closed_positions: inner.closed.len(),
            realized_pnl: realized,
            unrealized_pnl: unrealized,
            total_pnl,
            total_return_pct: pct_of_total(total_pnl),
            win_rate_pct: win_rate,
            largest_position_pct: pct_of_total(largest),
            concentration_pct: pct_of_total(top3),
        }
    }

    /// Limits currently breached.
    pub fn risk_violations(&self) -> Vec<RiskViolation> {
        let metrics = self.metrics();
        let mut violations = Vec::new();

        if metrics.active_positions > self.config.max_positions {
            violations.push(RiskViolation {
                code: "max_positions",
                detail: format!(
                    "{} active positions over limit {}",
                    metrics.active_positions, self.config.max_positions
                ),
            });
        }
        if metrics.largest_position_pct > self.config.max_position_size_pct {
            violations.push(RiskViolation {
                code: "position_size",
                detail: format!(
                    "largest position {}% over limit {}%",
                    metrics.largest_position_pct, self.config.max_position_size_pct
                ),
            });
        }
        if metrics.concentration_pct > self.config.max_correlated_exposure_pct {
            violations.push(RiskViolation {
                code: "concentration",
                detail: format!(
                    "top-3 concentration {}% over limit {}%",
                    metrics.concentration_pct, self.config.max_correlated_exposure_pct
                ),
            });
        }
        violations
    }

    /// Positions whose allocation drifted past the rebalance threshold.
    pub fn rebalance_actions(&self) -> Vec<RebalanceHint> {
        let inner = self.inner.lock();
        let total = self.config.total_capital;
        if total <= Decimal::ZERO {
            return Vec::new();
        }

        inner
            .active
            .iter()
            .filter_map(|(position_id, pos)| {
                let current_pct = pos.notional() / total * HUNDRED;
                let drift = (current_pct - pos.target_pct).abs();
                if drift <= self.config.rebalance_threshold_pct {
                    return None;
                }
                Some(RebalanceHint {
                    position_id: position_id.clone(),
                    product_id: pos.product_id.clone(),
                    current_pct,
                    target_pct: pos.target_pct,
                    drift_pct: drift,
                    action: if current_pct < pos.target_pct {
                        RebalanceAction::Increase
                    } else {
                        RebalanceAction::Decrease
                    },
                })
            })
            .collect()
    }

    /// Whether unrealized portfolio loss has crossed the emergency
    /// threshold (a negative percentage of total capital).
    pub fn should_emergency_liquidate(&self) -> bool {
        let metrics = self.metrics();
        if self.config.total_capital <= Decimal::ZERO {
            return false;
        }
        let unrealized_pct = metrics.unrealized_pnl / self.config.total_capital * HUNDRED;
        unrealized_pct <= self.config.emergency_liquidation_loss_pct
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> PortfolioManager {
        let config = PortfolioConfig::new(dec!(10000)).with_max_positions(3);
        let manager = PortfolioManager::new(config);
        manager
            .register_pair(PairConfig::new("BTC-USD").with_correlation_group("large_cap"))
            .unwrap();
        manager
            .register_pair(PairConfig::new("ETH-USD").with_correlation_group("large_cap"))
            .unwrap();
        manager.register_pair(PairConfig::new("SOL-USD")).unwrap();
        manager
    }

    fn filled(position_id: &str, product: &str, price: Decimal, qty: Decimal) -> PositionState {
        let mut pos = PositionState::new(position_id, product);
        pos.register_fill(qty, price).unwrap();
        pos
    }

    fn intent(product: &str, price: Decimal, qty: Decimal) -> EntryIntent {
        EntryIntent::new(format!("c-{product}"), product, price, qty)
    }

    #[test]
    fn test_admission_within_limits() {
        let manager = manager();
        // Notional 400 against a 500 cap (5% of 10k).
        assert!(manager.check_admission(&intent("BTC-USD", dec!(100), dec!(4))).is_ok());
    }

    #[test]
    fn test_admission_rejects_oversized_position() {
        let manager = manager();
        // Notional 600 over the 500 cap.
        let err = manager
            .check_admission(&intent("BTC-USD", dec!(100), dec!(6)))
            .unwrap_err();
        assert_eq!(err, AdmissionReason::PositionSizeExceedsLimit);
        assert_eq!(err.to_string(), "position_size_exceeds_limit");
    }

    #[test]
    fn test_admission_rejects_unregistered_pair() {
        let manager = manager();
        let err = manager
            .check_admission(&intent("DOGE-USD", dec!(1), dec!(1)))
            .unwrap_err();
        assert_eq!(err, AdmissionReason::PairNotRegistered);
    }

    #[test]
    fn test_admission_rejects_at_position_cap() {
        let manager = manager();
        manager.record_fill(&filled("p1", "BTC-USD", dec!(100), dec!(1)));
        manager.record_fill(&filled("p2", "ETH-USD", dec!(100), dec!(1)));
        manager.record_fill(&filled("p3", "SOL-USD", dec!(100), dec!(1)));

        let err = manager
            .check_admission(&intent("BTC-USD", dec!(100), dec!(1)))
            .unwrap_err();
        assert_eq!(err, AdmissionReason::MaxPositionsReached);
    }

    #[test]
    fn test_admission_rejects_correlated_exposure() {
        let config = PortfolioConfig::new(dec!(10000))
            .with_max_position_size_pct(dec!(20))
            .with_max_correlated_exposure_pct(dec!(15));
        let manager = PortfolioManager::new(config);
        manager
            .register_pair(PairConfig::new("BTC-USD").with_correlation_group("large_cap"))
            .unwrap();
        manager
            .register_pair(PairConfig::new("ETH-USD").with_correlation_group("large_cap"))
            .unwrap();

        // 1000 of BTC already deployed in the group; cap is 1500.
        manager.record_fill(&filled("p1", "BTC-USD", dec!(1000), dec!(1)));

        assert!(manager.check_admission(&intent("ETH-USD", dec!(400), dec!(1))).is_ok());
        let err = manager
            .check_admission(&intent("ETH-USD", dec!(600), dec!(1)))
            .unwrap_err();
        assert_eq!(err, AdmissionReason::CorrelatedExposureExceedsLimit);
    }

    #[test]
    fn test_admission_rejects_insufficient_capital() {
        let config = PortfolioConfig::new(dec!(1000)).with_max_position_size_pct(dec!(80));
        let manager = PortfolioManager::new(config);
        manager.register_pair(PairConfig::new("BTC-USD")).unwrap();
        manager.register_pair(PairConfig::new("ETH-USD")).unwrap();

        manager.record_fill(&filled("p1", "BTC-USD", dec!(700), dec!(1)));
        let err = manager
            .check_admission(&intent("ETH-USD", dec!(400), dec!(1)))
            .unwrap_err();
        assert_eq!(err, AdmissionReason::InsufficientCapital);
    }

    #[test]
    fn test_capital_flows_through_fill_and_close() {
        let manager = manager();
        manager.record_fill(&filled("p1", "BTC-USD", dec!(100), dec!(2)));

        let metrics = manager.metrics();
        assert_eq!(metrics.deployed_capital, dec!(200));
        assert_eq!(metrics.available_capital, dec!(9800));
        assert_eq!(metrics.active_positions, 1);

        manager.record_close("p1", dec!(50));
        let metrics = manager.metrics();
        assert_eq!(metrics.deployed_capital, dec!(0));
        assert_eq!(metrics.realized_pnl, dec!(50));
        assert_eq!(metrics.closed_positions, 1);
        assert_eq!(metrics.win_rate_pct, dec!(100));
    }

    #[test]
    fn test_record_close_is_idempotent() {
        let manager = manager();
        manager.record_fill(&filled("p1", "BTC-USD", dec!(100), dec!(1)));
        manager.record_close("p1", dec!(10));
        manager.record_close("p1", dec!(10));

        let metrics = manager.metrics();
        assert_eq!(metrics.closed_positions, 1);
        assert_eq!(metrics.realized_pnl, dec!(10));
    }

    #[test]
    fn test_unrealized_pnl_uses_cached_prices() {
        let manager = manager();
        manager.record_fill(&filled("p1", "BTC-USD", dec!(100), dec!(2)));
        manager.update_price("BTC-USD", dec!(110));

        let metrics = manager.metrics();
        assert_eq!(metrics.unrealized_pnl, dec!(20));
        assert_eq!(metrics.total_pnl, dec!(20));
    }

    #[test]
    fn test_win_rate_counts_only_profitable_closes() {
        let manager = manager();
        manager.record_fill(&filled("p1", "BTC-USD", dec!(100), dec!(1)));
        manager.record_close("p1", dec!(10));
        manager.record_fill(&filled("p2", "ETH-USD", dec!(100), dec!(1)));
        manager.record_close("p2", dec!(-5));

        assert_eq!(manager.metrics().win_rate_pct, dec!(50));
    }

    #[test]
    fn test_rebalance_hint_on_drift() {
        let manager = manager();
        // Target 2% of 10k = 200; actual notional 1400 -> 14%, drift 12%.
        manager.record_fill(&filled("p1", "BTC-USD", dec!(700), dec!(2)));

        let hints = manager.rebalance_actions();
        assert_eq!(hints.len(), 1);
        assert_eq!(hints[0].product_id, "BTC-USD");
        assert_eq!(hints[0].action, RebalanceAction::Decrease);
        assert_eq!(hints[0].drift_pct, dec!(12));

        // Within threshold: no hints.
        let calm = self::manager();
        calm.record_fill(&filled("p2", "ETH-USD", dec!(100), dec!(2)));
        assert!(calm.rebalance_actions().is_empty());
    }

    #[test]
    fn test_risk_violations_report_breaches() {
        let config = PortfolioConfig::new(dec!(10000)).with_max_position_size_pct(dec!(5));
        let manager = PortfolioManager::new(config);
        manager.register_pair(PairConfig::new("BTC-USD")).unwrap();

        // Grown past the cap after admission (price appreciation).
        manager.record_fill(&filled("p1", "BTC-USD", dec!(800), dec!(1)));

        let violations = manager.risk_violations();
        assert!(violations.iter().any(|v| v.code == "position_size"));
    }

    #[test]
    fn test_emergency_liquidation_threshold() {
        let config =
            PortfolioConfig::new(dec!(10000)).with_emergency_liquidation_loss_pct(dec!(-10));
        let manager = PortfolioManager::new(config);
        manager.register_pair(PairConfig::new("BTC-USD")).unwrap();
        manager.record_fill(&filled("p1", "BTC-USD", dec!(2000), dec!(1)));

        manager.update_price("BTC-USD", dec!(1500));
        assert!(!manager.should_emergency_liquidate()); // -5%

        manager.update_price("BTC-USD", dec!(900));
        assert!(manager.should_emergency_liquidate()); // -11%
    }

    #[test]
    fn test_register_pair_limits() {
        let config = PortfolioConfig::new(dec!(10000)).with_max_positions(1);
        let manager = PortfolioManager::new(config);
        manager.register_pair(PairConfig::new("BTC-USD")).unwrap();

        assert!(matches!(
            manager.register_pair(PairConfig::new("BTC-USD")),
            Err(PortfolioError::PairAlreadyRegistered(_))
        ));
        assert!(matches!(
            manager.register_pair(PairConfig::new("ETH-USD")),
            Err(PortfolioError::PairCapacityReached(1))
        ));
        // Disabled pairs are skipped silently.
        manager
            .register_pair(PairConfig::new("XRP-USD").disabled())
            .unwrap();
    }
}
