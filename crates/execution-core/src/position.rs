//! Position state and trailing-stop ratchet math.
//!
//! The ratchet invariant is the heart of this module: once a stop
//! trigger is set it only ever moves up. `should_replace_stop` must never
//! return true for a trigger at or below the current one.

use crate::error::TransitionError;
use crate::now_ms;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Position lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    /// Entry submitted, no fill confirmed yet.
    PendingEntry,
    /// At least one entry fill confirmed.
    Open,
    /// Fully exited through stop fills.
    Closed,
    /// Closed by the admin force-exit path.
    ForceExited,
}

impl PositionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::ForceExited)
    }
}

/// One open position in one product.
///
/// Mutated only by the engine that owns the product; persisted after
/// every mutation. The store row is the source of truth, this struct is
/// the derived in-memory view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionState {
    pub position_id: String,
    pub product_id: String,
    /// Quantity-weighted average entry price; meaningful once filled.
    pub entry_price: Decimal,
    /// Cumulative entry quantity still held.
    pub qty_filled: Decimal,
    /// High-water mark since entry; `None` until the first fill.
    pub highest_price_since_entry: Option<Decimal>,
    pub current_stop_trigger: Option<Decimal>,
    pub current_stop_limit: Option<Decimal>,
    /// Order id of the live stop at the venue, if one is resting.
    pub stop_order_id: Option<String>,
    pub status: PositionStatus,
    /// Quarantine flag set on reconciliation conflicts; quarantined
    /// positions are not traded until cleared by an operator.
    pub inconsistent: bool,
    pub realized_pnl: Decimal,
    pub opened_at_ms: i64,
    pub updated_at_ms: i64,
}

impl PositionState {
    /// Create a position awaiting its first entry fill.
    pub fn new(position_id: impl Into<String>, product_id: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            position_id: position_id.into(),
            product_id: product_id.into(),
            entry_price: Decimal::ZERO,
            qty_filled: Decimal::ZERO,
            highest_price_since_entry: None,
            current_stop_trigger: None,
            current_stop_limit: None,
            stop_order_id: None,
            status: PositionStatus::PendingEntry,
            inconsistent: false,
            realized_pnl: Decimal::ZERO,
            opened_at_ms: now,
            updated_at_ms: now,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    /// Apply an entry fill.
    ///
    /// The first fill fixes the entry price and opens the position;
    /// later partial fills update the quantity-weighted average. The
    /// high-water mark is raised to the updated entry price so the
    /// `highest >= entry` invariant holds; fill prices are not market
    /// ticks and do not otherwise move it.
    pub fn register_fill(
        &mut self,
        filled_qty: Decimal,
        fill_price: Decimal,
    ) -> Result<(), TransitionError> {
        match self.status {
            PositionStatus::PendingEntry => {
                self.entry_price = fill_price;
                self.qty_filled = filled_qty;
                self.highest_price_since_entry = Some(fill_price);
                self.status = PositionStatus::Open;
            }
            PositionStatus::Open => {
                let total = self.qty_filled + filled_qty;
                self.entry_price =
                    (self.entry_price * self.qty_filled + fill_price * filled_qty) / total;
                self.qty_filled = total;
                let highest = self
                    .highest_price_since_entry
                    .unwrap_or(self.entry_price)
                    .max(self.entry_price);
                self.highest_price_since_entry = Some(highest);
            }
            status => {
                return Err(TransitionError::InvalidPositionTransition {
                    status,
                    action: "register fill",
                })
            }
        }
        self.touch();
        Ok(())
    }

    /// Raise the high-water mark from a last-trade price.
    ///
    /// No-op unless the position is open; ticks that arrive before the
    /// first fill are ignored for trailing purposes.
    pub fn observe_price(&mut self, last_trade_price: Decimal) {
        if !self.is_open() {
            return;
        }
        if let Some(highest) = self.highest_price_since_entry {
            if last_trade_price > highest {
                self.highest_price_since_entry = Some(last_trade_price);
                self.touch();
            }
        }
    }

    /// Compute the trailing stop for the current high-water mark.
    ///
    /// `trigger = highest * (1 - trail_pct)`,
    /// `limit = trigger * (1 - stop_limit_buffer_pct)`.
    pub fn compute_new_stop(
        &self,
        trail_pct: Decimal,
        stop_limit_buffer_pct: Decimal,
    ) -> Option<(Decimal, Decimal)> {
        let highest = self.highest_price_since_entry?;
        let trigger = highest * (Decimal::ONE - trail_pct);
        let limit = trigger * (Decimal::ONE - stop_limit_buffer_pct);
        Some((trigger, limit))
    }

    /// Whether a freshly computed trigger justifies replacing the stop.
    ///
    /// True iff there is no current trigger, or the new one improves on
    /// the current by more than `min_ratchet`. Never true for a trigger
    /// at or below the current one.
    pub fn should_replace_stop(&self, new_trigger: Decimal, min_ratchet: Decimal) -> bool {
        match self.current_stop_trigger {
            None => true,
            Some(current) => new_trigger > current * (Decimal::ONE + min_ratchet),
        }
    }

    /// Record a newly placed stop. Sets trigger, limit and order id as
    /// one unit so observers never see a half-applied stop.
    pub fn apply_new_stop(
        &mut self,
        trigger: Decimal,
        limit: Decimal,
        stop_order_id: impl Into<String>,
    ) {
        self.current_stop_trigger = Some(trigger);
        self.current_stop_limit = Some(limit);
        self.stop_order_id = Some(stop_order_id.into());
        self.touch();
    }

    /// Forget the live stop order (cancelled or vanished at the venue).
    /// The trigger and limit are kept: the ratchet still measures
    /// replacements against the last known trigger.
    pub fn clear_stop_order(&mut self) {
        self.stop_order_id = None;
        self.touch();
    }

    /// Apply an exit fill, accumulating realized P&L.
    ///
    /// Transitions to `Closed` when the full quantity is gone.
    pub fn close(&mut self, exit_price: Decimal, exit_qty: Decimal) -> Result<(), TransitionError> {
        self.reduce(exit_price, exit_qty, PositionStatus::Closed)
    }

    /// Bookkeeping close at an operator-supplied price.
    ///
    /// Same P&L arithmetic as [`close`](Self::close) but the terminal
    /// status is `ForceExited` so synthetic closes stay distinguishable.
    pub fn force_close(
        &mut self,
        exit_price: Decimal,
        exit_qty: Decimal,
    ) -> Result<(), TransitionError> {
        self.reduce(exit_price, exit_qty, PositionStatus::ForceExited)
    }

    fn reduce(
        &mut self,
        exit_price: Decimal,
        exit_qty: Decimal,
        terminal: PositionStatus,
    ) -> Result<(), TransitionError> {
        if self.status != PositionStatus::Open {
            return Err(TransitionError::InvalidPositionTransition {
                status: self.status,
                action: "close",
            });
        }
        if exit_qty > self.qty_filled {
            return Err(TransitionError::ExitExceedsPosition {
                exit_qty,
                qty_filled: self.qty_filled,
            });
        }

        self.realized_pnl += (exit_price - self.entry_price) * exit_qty;
        self.qty_filled -= exit_qty;

        if self.qty_filled == Decimal::ZERO {
            self.status = terminal;
            self.stop_order_id = None;
        }
        self.touch();
        Ok(())
    }

    /// Close a position whose entry never filled (venue reject, or
    /// entry cancelled with nothing executed).
    pub fn abandon(&mut self) -> Result<(), TransitionError> {
        if self.status != PositionStatus::PendingEntry {
            return Err(TransitionError::InvalidPositionTransition {
                status: self.status,
                action: "abandon",
            });
        }
        self.status = PositionStatus::Closed;
        self.touch();
        Ok(())
    }

    /// Unrealized P&L of the remaining quantity at a reference price.
    pub fn unrealized_pnl(&self, current_price: Decimal) -> Decimal {
        if self.qty_filled == Decimal::ZERO {
            Decimal::ZERO
        } else {
            (current_price - self.entry_price) * self.qty_filled
        }
    }

    /// Notional of the remaining quantity at entry price.
    pub fn entry_notional(&self) -> Decimal {
        self.entry_price * self.qty_filled
    }

    /// Quarantine after a reconciliation conflict.
    pub fn quarantine(&mut self) {
        self.inconsistent = true;
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at_ms = now_ms();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn open_position(entry: Decimal, qty: Decimal) -> PositionState {
        let mut pos = PositionState::new("p1", "BTC-USD");
        pos.register_fill(qty, entry).unwrap();
        pos
    }

    #[test]
    fn test_first_fill_opens_position() {
        let pos = open_position(dec!(50000), dec!(1));
        assert_eq!(pos.status, PositionStatus::Open);
        assert_eq!(pos.entry_price, dec!(50000));
        assert_eq!(pos.qty_filled, dec!(1));
        assert_eq!(pos.highest_price_since_entry, Some(dec!(50000)));
    }

    #[test]
    fn test_partial_fills_weight_entry_exactly() {
        let mut pos = PositionState::new("p1", "BTC-USD");
        pos.register_fill(dec!(0.4), dec!(50000)).unwrap();
        pos.register_fill(dec!(0.6), dec!(50100)).unwrap();

        // 0.4*50000 + 0.6*50100 over 1.0, exact, no rounding drift.
        assert_eq!(pos.entry_price, dec!(50060));
        assert_eq!(pos.qty_filled, dec!(1.0));
        // High-water mark keeps pace with the averaged entry.
        assert_eq!(pos.highest_price_since_entry, Some(dec!(50060)));
    }

    #[test]
    fn test_fill_on_terminal_position_fails() {
        let mut pos = open_position(dec!(100), dec!(1));
        pos.close(dec!(110), dec!(1)).unwrap();

        let err = pos.register_fill(dec!(1), dec!(100)).unwrap_err();
        assert!(matches!(
            err,
            TransitionError::InvalidPositionTransition { .. }
        ));
    }

    #[test]
    fn test_observe_price_only_moves_up() {
        let mut pos = open_position(dec!(100), dec!(1));
        pos.observe_price(dec!(110));
        assert_eq!(pos.highest_price_since_entry, Some(dec!(110)));

        pos.observe_price(dec!(105));
        assert_eq!(pos.highest_price_since_entry, Some(dec!(110)));
    }

    #[test]
    fn test_observe_price_ignored_before_fill() {
        let mut pos = PositionState::new("p1", "BTC-USD");
        pos.observe_price(dec!(55000));
        assert_eq!(pos.highest_price_since_entry, None);
        assert_eq!(pos.status, PositionStatus::PendingEntry);
    }

    #[test]
    fn test_compute_new_stop() {
        let mut pos = open_position(dec!(50000), dec!(1));
        pos.observe_price(dec!(50500));

        let (trigger, limit) = pos.compute_new_stop(dec!(0.02), dec!(0.005)).unwrap();
        assert_eq!(trigger, dec!(49490.00));
        assert_eq!(limit, trigger * dec!(0.995));
    }

    #[test]
    fn test_ratchet_walk_upward() {
        // Entry 50000, trail 2%, buffer 0.5%, min_ratchet 0.1%.
        let trail = dec!(0.02);
        let buffer = dec!(0.005);
        let min_ratchet = dec!(0.001);

        let mut pos = open_position(dec!(50000), dec!(1));
        let mut triggers = Vec::new();

        for tick in [dec!(50500), dec!(51000), dec!(50800), dec!(51500)] {
            pos.observe_price(tick);
            let (trigger, limit) = pos.compute_new_stop(trail, buffer).unwrap();
            if pos.should_replace_stop(trigger, min_ratchet) {
                pos.apply_new_stop(trigger, limit, "s");
            }
            triggers.push(pos.current_stop_trigger.unwrap());
        }

        assert_eq!(triggers[0], dec!(49490.00));
        assert_eq!(triggers[1], dec!(49980.00));
        // Pullback to 50800 leaves the trigger alone.
        assert_eq!(triggers[2], dec!(49980.00));
        assert_eq!(triggers[3], dec!(50470.00));
    }

    #[test]
    fn test_should_replace_false_on_pullback() {
        let mut pos = open_position(dec!(50000), dec!(1));
        pos.observe_price(dec!(51000));
        let (trigger, limit) = pos.compute_new_stop(dec!(0.02), dec!(0.005)).unwrap();
        pos.apply_new_stop(trigger, limit, "s1");

        // 50800 high-water is unchanged at 51000, so the candidate
        // trigger equals the current one.
        pos.observe_price(dec!(50800));
        let (candidate, _) = pos.compute_new_stop(dec!(0.02), dec!(0.005)).unwrap();
        assert!(!pos.should_replace_stop(candidate, dec!(0.001)));

        pos.observe_price(dec!(51500));
        let (candidate, _) = pos.compute_new_stop(dec!(0.02), dec!(0.005)).unwrap();
        assert!(pos.should_replace_stop(candidate, dec!(0.001)));
    }

    #[test]
    fn test_ratchet_never_accepts_lower_trigger() {
        let mut pos = open_position(dec!(100), dec!(1));
        pos.observe_price(dec!(110));
        pos.apply_new_stop(dec!(99), dec!(98.5), "s1");

        // Candidates at or below the current trigger are refused even
        // with a zero ratchet threshold.
        assert!(!pos.should_replace_stop(dec!(99), Decimal::ZERO));
        assert!(!pos.should_replace_stop(dec!(95), Decimal::ZERO));
        assert!(pos.should_replace_stop(dec!(99.01), Decimal::ZERO));
    }

    #[test]
    fn test_trigger_frozen_under_pullback() {
        // Entry 100, trail 10%; ticks 110, 105, 95.
        let mut pos = open_position(dec!(100), dec!(1));

        for tick in [dec!(110), dec!(105), dec!(95)] {
            pos.observe_price(tick);
            let (trigger, limit) = pos.compute_new_stop(dec!(0.10), Decimal::ZERO).unwrap();
            if pos.should_replace_stop(trigger, Decimal::ZERO) {
                pos.apply_new_stop(trigger, limit, "s");
            }
        }

        assert_eq!(pos.current_stop_trigger, Some(dec!(99.00)));
        assert_eq!(pos.highest_price_since_entry, Some(dec!(110)));
    }

    #[test]
    fn test_min_ratchet_suppresses_small_improvements() {
        let mut pos = open_position(dec!(100), dec!(1));
        pos.apply_new_stop(dec!(99), dec!(98.5), "s1");

        // 0.05% improvement with a 0.1% threshold: hold.
        assert!(!pos.should_replace_stop(dec!(99.0495), dec!(0.001)));
        // 0.2% improvement: replace.
        assert!(pos.should_replace_stop(dec!(99.198), dec!(0.001)));
    }

    #[test]
    fn test_partial_close_accumulates_pnl() {
        let mut pos = open_position(dec!(50000), dec!(2));
        pos.close(dec!(52000), dec!(1)).unwrap();

        assert_eq!(pos.status, PositionStatus::Open);
        assert_eq!(pos.qty_filled, dec!(1));
        assert_eq!(pos.realized_pnl, dec!(2000));

        pos.close(dec!(51000), dec!(1)).unwrap();
        assert_eq!(pos.status, PositionStatus::Closed);
        assert_eq!(pos.qty_filled, dec!(0));
        assert_eq!(pos.realized_pnl, dec!(3000));
        assert_eq!(pos.stop_order_id, None);
    }

    #[test]
    fn test_close_more_than_held_fails() {
        let mut pos = open_position(dec!(100), dec!(1));
        let err = pos.close(dec!(110), dec!(2)).unwrap_err();
        assert!(matches!(err, TransitionError::ExitExceedsPosition { .. }));
        assert_eq!(pos.qty_filled, dec!(1));
    }

    #[test]
    fn test_force_close_is_distinguishable() {
        let mut pos = open_position(dec!(100), dec!(1));
        pos.force_close(dec!(90), dec!(1)).unwrap();

        assert_eq!(pos.status, PositionStatus::ForceExited);
        assert_eq!(pos.realized_pnl, dec!(-10));
    }

    #[test]
    fn test_abandon_requires_pending_entry() {
        let mut pos = PositionState::new("p1", "BTC-USD");
        pos.abandon().unwrap();
        assert_eq!(pos.status, PositionStatus::Closed);
        assert_eq!(pos.qty_filled, dec!(0));

        let mut open = open_position(dec!(100), dec!(1));
        assert!(open.abandon().is_err());
    }

    #[test]
    fn test_unrealized_pnl() {
        let pos = open_position(dec!(50000), dec!(1));
        assert_eq!(pos.unrealized_pnl(dec!(51000)), dec!(1000));
        assert_eq!(pos.unrealized_pnl(dec!(49000)), dec!(-1000));
    }

    #[test]
    fn test_quarantine_flag() {
        let mut pos = open_position(dec!(100), dec!(1));
        assert!(!pos.inconsistent);
        pos.quarantine();
        assert!(pos.inconsistent);
        // Status untouched; only the subflag changes.
        assert_eq!(pos.status, PositionStatus::Open);
    }

    #[test]
    fn test_round_trips_through_json_exactly() {
        let mut pos = open_position(dec!(50060), dec!(1));
        pos.apply_new_stop(dec!(49058.8), dec!(48813.506), "s1");

        let json = serde_json::to_string(&pos).unwrap();
        let back: PositionState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.current_stop_trigger, Some(dec!(49058.8)));
        assert_eq!(back.current_stop_limit, Some(dec!(48813.506)));
        assert_eq!(back.entry_price, dec!(50060));
    }
}
