//! Transition errors for order and position state.

use crate::order::OrderState;
use crate::position::PositionStatus;
use rust_decimal::Decimal;
use thiserror::Error;

/// A state mutation that violates the order or position lifecycle.
///
/// Always a bug or a venue/local disagreement; fatal to the operation
/// but never to the process.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransitionError {
    /// Illegal order state transition.
    #[error("invalid order transition: {from:?} -> {to:?}")]
    InvalidOrderTransition { from: OrderState, to: OrderState },

    /// Operation not allowed in the position's current status.
    #[error("position is {status:?}, cannot {action}")]
    InvalidPositionTransition {
        status: PositionStatus,
        action: &'static str,
    },

    /// A fill would push cumulative filled quantity past the order quantity.
    #[error("fill of {fill_qty} exceeds remaining order quantity {remaining}")]
    FillExceedsOrderQty { fill_qty: Decimal, remaining: Decimal },

    /// An exit would sell more than the position holds.
    #[error("exit of {exit_qty} exceeds position quantity {qty_filled}")]
    ExitExceedsPosition { exit_qty: Decimal, qty_filled: Decimal },
}
