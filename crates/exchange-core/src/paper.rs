//! A simulated venue.
//!
//! Orders rest in memory; tests and the demo runner drive fills and
//! failures explicitly. Honors client-order-id idempotency the same way
//! a production venue does, so engine-level idempotency tests run
//! against realistic semantics.

use crate::adapter::{ExchangeAdapter, OrderAck, VenueOpenOrder, VenueOrderStatus};
use crate::error::VenueError;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BookState {
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
}

#[derive(Debug, Clone)]
struct BookOrder {
    venue_order_id: String,
    client_order_id: Option<String>,
    product_id: String,
    qty: Decimal,
    filled_qty: Decimal,
    fill_price: Option<Decimal>,
    state: BookState,
}

/// In-memory venue for tests and paper trading.
pub struct PaperExchange {
    orders: DashMap<String, BookOrder>,
    by_client_id: DashMap<String, String>,
    last_prices: DashMap<String, Decimal>,
    next_id: AtomicU64,
    /// Errors to return from upcoming placement calls, in order.
    place_failures: Mutex<VecDeque<VenueError>>,
    /// Errors to return from upcoming cancel calls, in order.
    cancel_failures: Mutex<VecDeque<VenueError>>,
}

impl Default for PaperExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl PaperExchange {
    pub fn new() -> Self {
        Self {
            orders: DashMap::new(),
            by_client_id: DashMap::new(),
            last_prices: DashMap::new(),
            next_id: AtomicU64::new(1),
            place_failures: Mutex::new(VecDeque::new()),
            cancel_failures: Mutex::new(VecDeque::new()),
        }
    }

    fn gen_id(&self) -> String {
        format!("ven_{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn insert_order(
        &self,
        client_order_id: Option<&str>,
        product_id: &str,
        qty: Decimal,
    ) -> OrderAck {
        let venue_order_id = self.gen_id();
        self.orders.insert(
            venue_order_id.clone(),
            BookOrder {
                venue_order_id: venue_order_id.clone(),
                client_order_id: client_order_id.map(str::to_string),
                product_id: product_id.to_string(),
                qty,
                filled_qty: Decimal::ZERO,
                fill_price: None,
                state: BookState::Open,
            },
        );
        if let Some(cid) = client_order_id {
            self.by_client_id.insert(cid.to_string(), venue_order_id.clone());
        }
        OrderAck { venue_order_id }
    }

    fn place(
        &self,
        product_id: &str,
        client_order_id: &str,
        qty: Decimal,
    ) -> Result<OrderAck, VenueError> {
        if let Some(err) = self.place_failures.lock().pop_front() {
            return Err(err);
        }
        // Idempotent resubmission returns the existing order.
        if let Some(existing) = self.by_client_id.get(client_order_id) {
            return Ok(OrderAck {
                venue_order_id: existing.clone(),
            });
        }
        Ok(self.insert_order(Some(client_order_id), product_id, qty))
    }

    // --- test/demo drive surface ---

    /// Queue an error for the next placement call.
    pub fn fail_next_place(&self, err: VenueError) {
        self.place_failures.lock().push_back(err);
    }

    /// Queue an error for the next cancel call.
    pub fn fail_next_cancel(&self, err: VenueError) {
        self.cancel_failures.lock().push_back(err);
    }

    /// Publish a last-trade price.
    pub fn set_last_price(&self, product_id: &str, price: Decimal) {
        self.last_prices.insert(product_id.to_string(), price);
    }

    /// Execute (part of) a resting order.
    ///
    /// Panics on unknown ids; the test authors the scenario.
    pub fn execute(&self, venue_order_id: &str, qty: Decimal, price: Decimal) {
        let mut order = self
            .orders
            .get_mut(venue_order_id)
            .unwrap_or_else(|| panic!("no such paper order: {venue_order_id}"));

        let new_filled = order.filled_qty + qty;
        assert!(new_filled <= order.qty, "paper fill exceeds order qty");

        let prior = order.fill_price.unwrap_or(Decimal::ZERO) * order.filled_qty;
        order.fill_price = Some((prior + price * qty) / new_filled);
        order.filled_qty = new_filled;
        order.state = if new_filled == order.qty {
            BookState::Filled
        } else {
            BookState::PartiallyFilled
        };
    }

    /// Seed a venue-open order the local store knows nothing about
    /// (reconciliation orphan scenarios).
    pub fn seed_unknown_order(&self, product_id: &str, qty: Decimal) -> String {
        self.insert_order(None, product_id, qty).venue_order_id
    }

    /// Mark an order cancelled directly (venue-side cancellation).
    pub fn cancel_directly(&self, venue_order_id: &str) {
        if let Some(mut order) = self.orders.get_mut(venue_order_id) {
            order.state = BookState::Cancelled;
        }
    }

    /// Whether the order is still resting.
    pub fn is_open(&self, venue_order_id: &str) -> bool {
        self.orders
            .get(venue_order_id)
            .map(|o| matches!(o.state, BookState::Open | BookState::PartiallyFilled))
            .unwrap_or(false)
    }

    /// Number of orders ever accepted.
    pub fn order_count(&self) -> usize {
        self.orders.len()
    }
}

#[async_trait]
impl ExchangeAdapter for PaperExchange {
    async fn place_limit_buy(
        &self,
        product_id: &str,
        client_order_id: &str,
        _price: Decimal,
        qty: Decimal,
    ) -> Result<OrderAck, VenueError> {
        let ack = self.place(product_id, client_order_id, qty)?;
        tracing::debug!(
            product_id = %product_id,
            client_order_id = %client_order_id,
            venue_order_id = %ack.venue_order_id,
            "paper venue accepted limit buy"
        );
        Ok(ack)
    }

    async fn place_stop_limit(
        &self,
        product_id: &str,
        client_order_id: &str,
        trigger: Decimal,
        limit: Decimal,
        qty: Decimal,
    ) -> Result<OrderAck, VenueError> {
        if limit >= trigger {
            return Err(VenueError::InvalidParams(format!(
                "stop limit {limit} must be below trigger {trigger}"
            )));
        }
        let ack = self.place(product_id, client_order_id, qty)?;
        tracing::debug!(
            product_id = %product_id,
            client_order_id = %client_order_id,
            venue_order_id = %ack.venue_order_id,
            trigger = %trigger,
            limit = %limit,
            "paper venue accepted stop limit"
        );
        Ok(ack)
    }

    async fn cancel_order(&self, venue_order_id: &str) -> Result<(), VenueError> {
        if let Some(err) = self.cancel_failures.lock().pop_front() {
            return Err(err);
        }
        let mut order =
            self.orders
                .get_mut(venue_order_id)
                .ok_or_else(|| VenueError::UnknownOrder {
                    order_id: venue_order_id.to_string(),
                })?;
        match order.state {
            BookState::Filled => Err(VenueError::InvalidParams(format!(
                "order {venue_order_id} already filled"
            ))),
            _ => {
                order.state = BookState::Cancelled;
                Ok(())
            }
        }
    }

    async fn get_order_status(&self, venue_order_id: &str) -> Result<VenueOrderStatus, VenueError> {
        let Some(order) = self.orders.get(venue_order_id) else {
            return Ok(VenueOrderStatus::Unknown);
        };
        Ok(match order.state {
            BookState::Open => VenueOrderStatus::Open,
            BookState::PartiallyFilled => VenueOrderStatus::PartiallyFilled {
                filled_qty: order.filled_qty,
                fill_price: order.fill_price.unwrap_or(Decimal::ZERO),
            },
            BookState::Filled => VenueOrderStatus::Filled {
                filled_qty: order.filled_qty,
                fill_price: order.fill_price.unwrap_or(Decimal::ZERO),
            },
            BookState::Cancelled => VenueOrderStatus::Cancelled,
        })
    }

    async fn get_last_trade_price(&self, product_id: &str) -> Result<Decimal, VenueError> {
        self.last_prices
            .get(product_id)
            .map(|p| *p)
            .ok_or_else(|| VenueError::InvalidParams(format!("no trades for {product_id}")))
    }

    async fn list_open_orders(&self, product_id: &str) -> Result<Vec<VenueOpenOrder>, VenueError> {
        Ok(self
            .orders
            .iter()
            .filter(|o| {
                o.product_id == product_id
                    && matches!(o.state, BookState::Open | BookState::PartiallyFilled)
            })
            .map(|o| VenueOpenOrder {
                venue_order_id: o.venue_order_id.clone(),
                client_order_id: o.client_order_id.clone(),
                product_id: o.product_id.clone(),
            })
            .collect())
    }
}
