//! Engine error composition.

use exchange_core::VenueError;
use execution_core::TransitionError;
use store::StoreError;
use thiserror::Error;

/// Errors surfaced by engine operations.
///
/// Tick loops absorb `Transition` (log and skip) and retriable venue
/// failures (already retried below); `Store` and
/// `ReconciliationConflict` propagate.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Venue(#[from] VenueError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Entry intent reuses a client order id that already has a position.
    #[error("client order id already used: {0}")]
    DuplicateClientOrderId(String),

    /// Order id with no local record.
    #[error("unknown order: {0}")]
    UnknownOrder(String),

    /// Position id with no local record.
    #[error("unknown position: {0}")]
    UnknownPosition(String),

    /// Local and venue state disagree beyond the repairable mappings.
    /// The position is quarantined until an operator intervenes.
    #[error("reconciliation conflict on position {position_id}: {detail}")]
    ReconciliationConflict { position_id: String, detail: String },

    /// Operation attempted before startup reconciliation finished.
    #[error("engine for {0} has not reconciled yet")]
    NotReconciled(String),
}
