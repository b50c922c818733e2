//! Startup reconciliation: re-align local state with the venue.
//!
//! Runs once per engine, strictly before any intent or tick is
//! processed. Local order state is advanced to match the venue, open
//! positions get their protective stops back, and venue orders nobody
//! remembers are cancelled.

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{error, info, warn};

use exchange_core::{with_retry, VenueError, VenueOrderStatus};
use execution_core::{Order, OrderKind, PositionStatus};
use rate_limit::ORDERS_ENDPOINT;

use crate::engine::ExecutionEngine;
use crate::error::EngineError;

/// Endpoint key for venue order queries.
const STATUS_ENDPOINT: &str = "/orders/status";

/// What reconciliation did, for the startup log.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Missed fills applied through the normal handlers.
    pub fills_applied: u32,
    /// Orders the venue no longer knows, marked cancelled locally.
    pub orders_cancelled: u32,
    /// Submissions that crashed pre-ack and were re-dispatched.
    pub resubmitted: u32,
    /// Protective stops recreated for open positions.
    pub stops_replaced: u32,
    /// Venue orders with no local record, cancelled at the venue.
    pub orphans_cancelled: u32,
    /// Positions quarantined on an unrepairable disagreement.
    pub quarantined: u32,
}

impl ExecutionEngine {
    /// Run startup reconciliation and open the engine for trading.
    pub async fn reconcile(&mut self) -> Result<ReconcileReport, EngineError> {
        let mut report = ReconcileReport::default();
        let product = self.product_id.clone();

        // Rebuild the in-memory view from the store.
        for position in self.store.load_all_positions().await? {
            if position.product_id == product {
                self.positions
                    .insert(position.position_id.clone(), position);
            }
        }
        let open_orders: Vec<Order> = self
            .store
            .list_open_orders()
            .await?
            .into_iter()
            .filter(|o| self.positions.contains_key(&o.position_id))
            .collect();
        for order in &open_orders {
            if let Some(venue_id) = order.venue_order_id.clone() {
                self.venue_to_local.insert(venue_id, order.order_id.clone());
            }
            self.orders.insert(order.order_id.clone(), order.clone());
        }

        // Align each persisted open order with the venue's view.
        for order in open_orders {
            self.reconcile_order(order, &mut report).await?;
        }

        // Every open position must sit under a stop again.
        let unprotected: Vec<String> = self
            .positions
            .values()
            .filter(|p| p.is_open() && !p.inconsistent && p.stop_order_id.is_none())
            .map(|p| p.position_id.clone())
            .collect();
        for position_id in unprotected {
            self.restore_stop(&position_id, &mut report).await?;
        }

        // Orphan cleanup: venue-open orders we have no record of.
        let adapter = Arc::clone(&self.adapter);
        let venue_open = with_retry(&self.rate_limit, STATUS_ENDPOINT, &self.retry, || {
            adapter.list_open_orders(&product)
        })
        .await?;
        for venue_order in venue_open {
            let known = match venue_order.client_order_id.as_deref() {
                Some(client_id) => self.store.load_order(client_id).await?.is_some(),
                None => false,
            };
            if known {
                continue;
            }
            let adapter = Arc::clone(&self.adapter);
            let venue_id = venue_order.venue_order_id.clone();
            match with_retry(&self.rate_limit, ORDERS_ENDPOINT, &self.retry, || {
                adapter.cancel_order(&venue_id)
            })
            .await
            {
                Ok(()) => {
                    report.orphans_cancelled += 1;
                    self.metrics.inc_orphans_cancelled();
                    warn!(
                        product_id = %product,
                        venue_order_id = %venue_order.venue_order_id,
                        "cancelled orphaned venue order"
                    );
                }
                Err(err) => {
                    warn!(
                        venue_order_id = %venue_order.venue_order_id,
                        error = %err,
                        "orphan cancel failed"
                    );
                }
            }
        }

        self.ready = true;
        info!(
            product_id = %product,
            fills_applied = report.fills_applied,
            orders_cancelled = report.orders_cancelled,
            resubmitted = report.resubmitted,
            stops_replaced = report.stops_replaced,
            orphans_cancelled = report.orphans_cancelled,
            quarantined = report.quarantined,
            "reconciliation complete"
        );
        Ok(report)
    }

    async fn reconcile_order(
        &mut self,
        order: Order,
        report: &mut ReconcileReport,
    ) -> Result<(), EngineError> {
        let Some(venue_id) = order.venue_order_id.clone() else {
            // Crashed between persist and dispatch: re-place under the
            // same client id; the venue dedupes.
            return self.resubmit_order(order, report).await;
        };

        let adapter = Arc::clone(&self.adapter);
        let status = with_retry(&self.rate_limit, STATUS_ENDPOINT, &self.retry, || {
            adapter.get_order_status(&venue_id)
        })
        .await?;

        match status {
            VenueOrderStatus::Open => Ok(()),
            VenueOrderStatus::PartiallyFilled {
                filled_qty,
                fill_price,
            }
            | VenueOrderStatus::Filled {
                filled_qty,
                fill_price,
            } => {
                if filled_qty > order.qty || filled_qty < order.filled_qty {
                    self.quarantine_position(
                        &order.position_id,
                        format!(
                            "venue reports {filled_qty} filled on order {} with qty {} ({} locally)",
                            order.order_id, order.qty, order.filled_qty
                        ),
                    )
                    .await?;
                    report.quarantined += 1;
                    return Ok(());
                }
                let missed = filled_qty - order.filled_qty;
                if missed > Decimal::ZERO {
                    self.handle_fill(&order.order_id, missed, fill_price).await?;
                    report.fills_applied += 1;
                    self.metrics.inc_reconcile_repairs();
                }
                Ok(())
            }
            VenueOrderStatus::Cancelled | VenueOrderStatus::Unknown => {
                let mut cancelled = order.clone();
                cancelled.cancel()?;

                let mut position = self.positions.get(&order.position_id).cloned();
                if let Some(pos) = position.as_mut() {
                    if pos.stop_order_id.as_deref() == Some(order.order_id.as_str()) {
                        pos.clear_stop_order();
                    } else if order.kind == OrderKind::Entry
                        && pos.status == PositionStatus::PendingEntry
                    {
                        pos.abandon()?;
                    }
                }

                let mut tx = self.store.begin().await?;
                tx.save_order(&cancelled).await?;
                if let Some(ref pos) = position {
                    tx.save_position(pos).await?;
                }
                tx.commit().await?;

                self.orders
                    .insert(cancelled.order_id.clone(), cancelled.clone());
                if let Some(pos) = position {
                    self.positions.insert(pos.position_id.clone(), pos);
                }
                report.orders_cancelled += 1;
                self.metrics.inc_reconcile_repairs();
                info!(
                    order_id = %cancelled.order_id,
                    "order gone at venue, marked cancelled locally"
                );
                Ok(())
            }
        }
    }

    async fn resubmit_order(
        &mut self,
        mut order: Order,
        report: &mut ReconcileReport,
    ) -> Result<(), EngineError> {
        // Do not resurrect work for a position that already ended.
        let position_terminal = self
            .positions
            .get(&order.position_id)
            .map(|p| p.status.is_terminal())
            .unwrap_or(true);
        if position_terminal {
            order.reject()?;
            self.store.save_order(&order).await?;
            self.orders.insert(order.order_id.clone(), order);
            return Ok(());
        }

        let adapter = Arc::clone(&self.adapter);
        let product = self.product_id.clone();
        let client_id = order.order_id.clone();
        let qty = order.remaining_qty();

        let placed = match order.kind {
            OrderKind::Entry => {
                let price = order.price;
                with_retry(&self.rate_limit, ORDERS_ENDPOINT, &self.retry, || {
                    adapter.place_limit_buy(&product, &client_id, price, qty)
                })
                .await
            }
            OrderKind::Stop => {
                let trigger = order.stop_trigger.unwrap_or(order.price);
                let limit = order.price;
                with_retry(&self.rate_limit, ORDERS_ENDPOINT, &self.retry, || {
                    adapter.place_stop_limit(&product, &client_id, trigger, limit, qty)
                })
                .await
            }
            OrderKind::ForceExit => return Ok(()),
        };

        match placed {
            Ok(ack) => {
                order.ack(&ack.venue_order_id)?;
                self.store.save_order(&order).await?;
                self.venue_to_local
                    .insert(ack.venue_order_id.clone(), order.order_id.clone());
                self.orders.insert(order.order_id.clone(), order);
                report.resubmitted += 1;
                self.metrics.inc_reconcile_repairs();
                Ok(())
            }
            Err(err) => {
                warn!(
                    order_id = %order.order_id,
                    error = %err,
                    "resubmission failed during reconciliation"
                );
                if !matches!(
                    err,
                    VenueError::RetriesExhausted { .. } | VenueError::BudgetExhausted { .. }
                ) {
                    // Hard reject: close out the pending entry.
                    order.reject()?;
                    let mut position = self.positions.get(&order.position_id).cloned();
                    if let Some(pos) = position.as_mut() {
                        if pos.status == PositionStatus::PendingEntry {
                            pos.abandon()?;
                        }
                    }
                    let mut tx = self.store.begin().await?;
                    tx.save_order(&order).await?;
                    if let Some(ref pos) = position {
                        tx.save_position(pos).await?;
                    }
                    tx.commit().await?;
                    self.orders.insert(order.order_id.clone(), order);
                    if let Some(pos) = position {
                        self.positions.insert(pos.position_id.clone(), pos);
                    }
                }
                Ok(())
            }
        }
    }

    /// Recreate the protective stop for an open position, ratcheting
    /// against the last known trigger.
    async fn restore_stop(
        &mut self,
        position_id: &str,
        report: &mut ReconcileReport,
    ) -> Result<(), EngineError> {
        let mut position = self
            .positions
            .get(position_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownPosition(position_id.to_string()))?;

        // The high-water mark can only be absent on rows written before
        // the first fill; fall back to the live market.
        if position.highest_price_since_entry.is_none() {
            let adapter = Arc::clone(&self.adapter);
            let product = self.product_id.clone();
            let last = with_retry(&self.rate_limit, STATUS_ENDPOINT, &self.retry, || {
                adapter.get_last_trade_price(&product)
            })
            .await?;
            position.highest_price_since_entry = Some(last.max(position.entry_price));
        }

        let Some((trigger, limit)) = position
            .compute_new_stop(self.params.trail_pct, self.params.stop_limit_buffer_pct)
        else {
            return Ok(());
        };

        match self.replace_stop(position, trigger, limit).await {
            Ok(()) => {
                report.stops_replaced += 1;
                Ok(())
            }
            Err(EngineError::Venue(err)) => {
                // Flagged as needs-stop inside replace_stop; the first
                // tick retries.
                warn!(
                    position_id = %position_id,
                    error = %err,
                    "stop restore failed, flagged for retry"
                );
                Ok(())
            }
            Err(other) => Err(other),
        }
    }

    async fn quarantine_position(
        &mut self,
        position_id: &str,
        detail: String,
    ) -> Result<(), EngineError> {
        let mut position = self
            .positions
            .get(position_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownPosition(position_id.to_string()))?;
        position.quarantine();
        self.store.save_position(&position).await?;
        self.positions.insert(position_id.to_string(), position);

        error!(
            position_id = %position_id,
            detail = %detail,
            "reconciliation conflict, position quarantined"
        );
        Ok(())
    }
}
