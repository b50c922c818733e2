//! Core execution state: order lifecycle and position ratchet math.
//!
//! This crate is pure state: no I/O, no suspension points. The engine
//! couples these types to the exchange adapter and the store.

mod error;
mod ids;
mod order;
mod position;

pub use error::TransitionError;
pub use ids::generate_client_order_id;
pub use order::{FillOutcome, Order, OrderKind, OrderSide, OrderState};
pub use position::{PositionState, PositionStatus};

/// Current wall-clock time in milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
