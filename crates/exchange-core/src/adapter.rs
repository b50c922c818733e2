//! The venue capability trait consumed by the engine.

use crate::error::VenueError;
use async_trait::async_trait;
use rust_decimal::Decimal;

/// Acknowledgment of an accepted submission.
#[derive(Debug, Clone)]
pub struct OrderAck {
    /// Venue-assigned order id.
    pub venue_order_id: String,
}

/// Venue-side view of one order's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VenueOrderStatus {
    Open,
    PartiallyFilled {
        filled_qty: Decimal,
        fill_price: Decimal,
    },
    Filled {
        filled_qty: Decimal,
        fill_price: Decimal,
    },
    Cancelled,
    /// The venue has no record of the order.
    Unknown,
}

/// A venue-open order as reported by open-order enumeration.
#[derive(Debug, Clone)]
pub struct VenueOpenOrder {
    pub venue_order_id: String,
    /// Client order id the submission carried, if the venue kept it.
    pub client_order_id: Option<String>,
    pub product_id: String,
}

/// Abstract venue operations.
///
/// Submissions are idempotent on `client_order_id`: re-submitting after
/// a retry returns the existing venue order id instead of creating a
/// duplicate. Callers are expected to dispatch through
/// [`with_retry`](crate::with_retry) so rate limiting and backoff apply
/// uniformly.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    /// Place a limit buy. Entry orders only.
    async fn place_limit_buy(
        &self,
        product_id: &str,
        client_order_id: &str,
        price: Decimal,
        qty: Decimal,
    ) -> Result<OrderAck, VenueError>;

    /// Place a stop-limit sell: triggers at `trigger`, rests at `limit`.
    async fn place_stop_limit(
        &self,
        product_id: &str,
        client_order_id: &str,
        trigger: Decimal,
        limit: Decimal,
        qty: Decimal,
    ) -> Result<OrderAck, VenueError>;

    /// Cancel a resting order by venue order id.
    async fn cancel_order(&self, venue_order_id: &str) -> Result<(), VenueError>;

    /// Query one order's venue-side state.
    async fn get_order_status(&self, venue_order_id: &str) -> Result<VenueOrderStatus, VenueError>;

    /// Last trade price for a product.
    async fn get_last_trade_price(&self, product_id: &str) -> Result<Decimal, VenueError>;

    /// Enumerate venue-open orders for a product (orphan cleanup).
    async fn list_open_orders(&self, product_id: &str) -> Result<Vec<VenueOpenOrder>, VenueError>;
}
