//! Order lifecycle state machine.

use crate::error::TransitionError;
use crate::now_ms;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Order side (buy or sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

/// What role an order plays in a position's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    /// Limit buy opening a position.
    Entry,
    /// Stop-limit sell protecting an open position.
    Stop,
    /// Admin-driven bookkeeping exit.
    ForceExit,
}

impl OrderKind {
    /// Entry orders buy; everything else sells.
    pub fn side(&self) -> OrderSide {
        match self {
            Self::Entry => OrderSide::Buy,
            Self::Stop | Self::ForceExit => OrderSide::Sell,
        }
    }
}

/// Order lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    /// Created locally, not yet acknowledged by the venue.
    PendingSubmit,
    /// Acknowledged and resting at the venue.
    Open,
    /// Some quantity executed.
    PartiallyFilled,
    /// Fully executed.
    Filled,
    /// Cancelled at the venue or by reconciliation.
    Cancelled,
    /// Rejected by the venue.
    Rejected,
}

impl OrderState {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Filled | Self::Cancelled | Self::Rejected)
    }

    /// Whether `self -> to` is a legal transition.
    ///
    /// `PartiallyFilled -> PartiallyFilled` is legal (a further partial
    /// fill); every other self-transition is handled as an idempotent
    /// duplicate by [`Order`], not here.
    pub fn can_transition(&self, to: OrderState) -> bool {
        use OrderState::*;
        matches!(
            (self, to),
            (PendingSubmit, Open)
                | (PendingSubmit, Rejected)
                | (Open, PartiallyFilled)
                | (Open, Filled)
                | (Open, Cancelled)
                | (PartiallyFilled, PartiallyFilled)
                | (PartiallyFilled, Filled)
                | (PartiallyFilled, Cancelled)
        )
    }

    /// Stable string form, used for the indexed `state` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingSubmit => "PENDING_SUBMIT",
            Self::Open => "OPEN",
            Self::PartiallyFilled => "PARTIALLY_FILLED",
            Self::Filled => "FILLED",
            Self::Cancelled => "CANCELLED",
            Self::Rejected => "REJECTED",
        }
    }
}

/// Result of applying a fill to an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillOutcome {
    Partial,
    Full,
}

/// An order tracked by the system, one row per venue submission.
///
/// `order_id` is the locally generated client order id; it is the durable
/// primary key and the idempotency key sent to the venue.
/// `venue_order_id` is the venue's identifier, known after the ack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub venue_order_id: Option<String>,
    pub position_id: String,
    pub kind: OrderKind,
    pub side: OrderSide,
    pub price: Decimal,
    /// Stop trigger price (stop orders only).
    pub stop_trigger: Option<Decimal>,
    pub qty: Decimal,
    pub state: OrderState,
    pub filled_qty: Decimal,
    /// Quantity-weighted average fill price.
    pub fill_price: Option<Decimal>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl Order {
    /// Create a new order in `PendingSubmit`.
    pub fn new(
        order_id: impl Into<String>,
        position_id: impl Into<String>,
        kind: OrderKind,
        price: Decimal,
        qty: Decimal,
    ) -> Self {
        let now = now_ms();
        Self {
            order_id: order_id.into(),
            venue_order_id: None,
            position_id: position_id.into(),
            kind,
            side: kind.side(),
            price,
            stop_trigger: None,
            qty,
            state: OrderState::PendingSubmit,
            filled_qty: Decimal::ZERO,
            fill_price: None,
            created_at_ms: now,
            updated_at_ms: now,
        }
    }

    /// Create a stop-limit order in `PendingSubmit`.
    pub fn new_stop(
        order_id: impl Into<String>,
        position_id: impl Into<String>,
        trigger: Decimal,
        limit: Decimal,
        qty: Decimal,
    ) -> Self {
        let mut order = Self::new(order_id, position_id, OrderKind::Stop, limit, qty);
        order.stop_trigger = Some(trigger);
        order
    }

    /// Create the synthetic record of an admin force-exit.
    ///
    /// Nothing is sent to the venue for this order; it is born `Filled`
    /// at the operator-supplied price so the audit trail shows how the
    /// position was closed.
    pub fn new_force_exit(
        order_id: impl Into<String>,
        position_id: impl Into<String>,
        price: Decimal,
        qty: Decimal,
    ) -> Self {
        let mut order = Self::new(order_id, position_id, OrderKind::ForceExit, price, qty);
        order.state = OrderState::Filled;
        order.filled_qty = qty;
        order.fill_price = Some(price);
        order
    }

    /// Remaining quantity to be filled.
    pub fn remaining_qty(&self) -> Decimal {
        self.qty - self.filled_qty
    }

    /// Venue acknowledged the submission.
    ///
    /// A duplicate ack for an already-open order is a no-op.
    pub fn ack(&mut self, venue_order_id: impl Into<String>) -> Result<(), TransitionError> {
        if self.state == OrderState::Open {
            return Ok(());
        }
        self.transition(OrderState::Open)?;
        self.venue_order_id = Some(venue_order_id.into());
        Ok(())
    }

    /// Venue rejected the submission.
    pub fn reject(&mut self) -> Result<(), TransitionError> {
        if self.state == OrderState::Rejected {
            return Ok(());
        }
        self.transition(OrderState::Rejected)
    }

    /// Cancel ack from the venue or a reconciliation verdict.
    pub fn cancel(&mut self) -> Result<(), TransitionError> {
        if self.state == OrderState::Cancelled {
            return Ok(());
        }
        self.transition(OrderState::Cancelled)
    }

    /// Apply an execution of `fill_qty` at `fill_price`.
    ///
    /// Maintains `filled_qty <= qty` and the quantity-weighted average
    /// fill price. A fill notification for an already-filled order is an
    /// idempotent no-op.
    pub fn record_fill(
        &mut self,
        fill_qty: Decimal,
        fill_price: Decimal,
    ) -> Result<FillOutcome, TransitionError> {
        if self.state == OrderState::Filled {
            return Ok(FillOutcome::Full);
        }

        let remaining = self.remaining_qty();
        if fill_qty > remaining {
            return Err(TransitionError::FillExceedsOrderQty { fill_qty, remaining });
        }

        let new_filled = self.filled_qty + fill_qty;
        let to = if new_filled == self.qty {
            OrderState::Filled
        } else {
            OrderState::PartiallyFilled
        };
        self.transition(to)?;

        // Weighted average across all executions on this order.
        let prior_notional = self.fill_price.unwrap_or(Decimal::ZERO) * self.filled_qty;
        self.fill_price = Some((prior_notional + fill_price * fill_qty) / new_filled);
        self.filled_qty = new_filled;

        Ok(if to == OrderState::Filled {
            FillOutcome::Full
        } else {
            FillOutcome::Partial
        })
    }

    fn transition(&mut self, to: OrderState) -> Result<(), TransitionError> {
        if !self.state.can_transition(to) {
            return Err(TransitionError::InvalidOrderTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        self.updated_at_ms = now_ms();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn entry() -> Order {
        Order::new("c1", "p1", OrderKind::Entry, dec!(50000), dec!(1))
    }

    #[test]
    fn test_kind_determines_side() {
        assert_eq!(OrderKind::Entry.side(), OrderSide::Buy);
        assert_eq!(OrderKind::Stop.side(), OrderSide::Sell);
        assert_eq!(OrderKind::ForceExit.side(), OrderSide::Sell);
    }

    #[test]
    fn test_ack_then_fill() {
        let mut order = entry();
        order.ack("v1").unwrap();
        assert_eq!(order.state, OrderState::Open);
        assert_eq!(order.venue_order_id.as_deref(), Some("v1"));

        let outcome = order.record_fill(dec!(1), dec!(50000)).unwrap();
        assert_eq!(outcome, FillOutcome::Full);
        assert_eq!(order.state, OrderState::Filled);
        assert_eq!(order.fill_price, Some(dec!(50000)));
    }

    #[test]
    fn test_partial_fills_accumulate_weighted_price() {
        let mut order = entry();
        order.ack("v1").unwrap();

        assert_eq!(
            order.record_fill(dec!(0.4), dec!(50000)).unwrap(),
            FillOutcome::Partial
        );
        assert_eq!(order.state, OrderState::PartiallyFilled);

        assert_eq!(
            order.record_fill(dec!(0.6), dec!(50100)).unwrap(),
            FillOutcome::Full
        );
        assert_eq!(order.state, OrderState::Filled);
        assert_eq!(order.filled_qty, dec!(1));
        // 0.4 * 50000 + 0.6 * 50100 = 50060
        assert_eq!(order.fill_price, Some(dec!(50060)));
    }

    #[test]
    fn test_fill_before_ack_is_invalid() {
        let mut order = entry();
        let err = order.record_fill(dec!(1), dec!(50000)).unwrap_err();
        assert!(matches!(
            err,
            TransitionError::InvalidOrderTransition {
                from: OrderState::PendingSubmit,
                ..
            }
        ));
    }

    #[test]
    fn test_overfill_is_rejected() {
        let mut order = entry();
        order.ack("v1").unwrap();
        order.record_fill(dec!(0.9), dec!(50000)).unwrap();

        let err = order.record_fill(dec!(0.2), dec!(50000)).unwrap_err();
        assert!(matches!(err, TransitionError::FillExceedsOrderQty { .. }));
        assert_eq!(order.filled_qty, dec!(0.9));
    }

    #[test]
    fn test_duplicate_notifications_are_noops() {
        let mut order = entry();
        order.ack("v1").unwrap();
        order.ack("v1").unwrap(); // duplicate ack

        order.record_fill(dec!(1), dec!(50000)).unwrap();
        // Duplicate full-fill notification.
        assert_eq!(
            order.record_fill(dec!(1), dec!(50000)).unwrap(),
            FillOutcome::Full
        );
        assert_eq!(order.filled_qty, dec!(1));

        let mut cancelled = entry();
        cancelled.ack("v2").unwrap();
        cancelled.cancel().unwrap();
        cancelled.cancel().unwrap(); // duplicate cancel ack
        assert_eq!(cancelled.state, OrderState::Cancelled);
    }

    #[test]
    fn test_terminal_states_reject_further_transitions() {
        let mut order = entry();
        order.ack("v1").unwrap();
        order.cancel().unwrap();

        assert!(order.record_fill(dec!(1), dec!(50000)).is_err());
        assert!(order.ack("v1").is_err());

        let mut rejected = entry();
        rejected.reject().unwrap();
        assert!(rejected.ack("v1").is_err());
        assert!(rejected.cancel().is_err());
    }

    #[test]
    fn test_cancel_after_partial_fill() {
        let mut order = entry();
        order.ack("v1").unwrap();
        order.record_fill(dec!(0.3), dec!(50000)).unwrap();
        order.cancel().unwrap();

        assert_eq!(order.state, OrderState::Cancelled);
        assert_eq!(order.filled_qty, dec!(0.3));
    }

    #[test]
    fn test_force_exit_record_is_born_filled() {
        let order = Order::new_force_exit("f1", "p1", dec!(48000), dec!(0.5));
        assert_eq!(order.state, OrderState::Filled);
        assert_eq!(order.kind, OrderKind::ForceExit);
        assert_eq!(order.side, OrderSide::Sell);
        assert_eq!(order.filled_qty, dec!(0.5));
        assert_eq!(order.fill_price, Some(dec!(48000)));
    }

    #[test]
    fn test_state_round_trips_through_json() {
        let order = entry();
        let json = serde_json::to_string(&order).unwrap();
        let back: Order = serde_json::from_str(&json).unwrap();
        assert_eq!(back.state, OrderState::PendingSubmit);
        assert_eq!(back.qty, dec!(1));
    }
}
