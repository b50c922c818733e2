//! The per-pair execution engine.

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{error, info, warn};

use exchange_core::{with_retry, ExchangeAdapter, RetryConfig, VenueError};
use execution_core::{
    generate_client_order_id, Order, OrderKind, OrderState, PositionState, PositionStatus,
};
use metrics::CoreMetrics;
use model::EntryIntent;
use rate_limit::{RateLimitPolicy, ORDERS_ENDPOINT};
use store::Store;

use crate::error::EngineError;
use crate::params::StrategyParams;

/// Ids handed back from a successful entry submission.
#[derive(Debug, Clone)]
pub struct EntryReceipt {
    pub position_id: String,
    pub order_id: String,
}

/// Owns every position of one product.
///
/// In-memory maps are derived views over the store, rebuilt by
/// [`reconcile`](Self::reconcile) at startup; the store row is always
/// written before an operation reports success.
pub struct ExecutionEngine {
    pub(crate) product_id: String,
    pub(crate) params: StrategyParams,
    pub(crate) adapter: Arc<dyn ExchangeAdapter>,
    pub(crate) store: Arc<Store>,
    pub(crate) rate_limit: Arc<RateLimitPolicy>,
    pub(crate) retry: RetryConfig,
    pub(crate) metrics: Arc<CoreMetrics>,

    pub(crate) positions: HashMap<String, PositionState>,
    pub(crate) orders: HashMap<String, Order>,
    pub(crate) venue_to_local: HashMap<String, String>,
    /// position_id -> consecutive stop-placement failures.
    pub(crate) needs_stop: HashMap<String, u32>,
    /// entry order_id -> candle closes survived without filling.
    pub(crate) entry_candles: HashMap<String, u32>,
    /// position_id -> when its stop trigger was first crossed.
    pub(crate) stop_triggered_at: HashMap<String, i64>,
    pub(crate) ready: bool,
}

impl ExecutionEngine {
    pub fn new(
        product_id: impl Into<String>,
        params: StrategyParams,
        adapter: Arc<dyn ExchangeAdapter>,
        store: Arc<Store>,
        rate_limit: Arc<RateLimitPolicy>,
        metrics: Arc<CoreMetrics>,
    ) -> Self {
        Self {
            product_id: product_id.into(),
            params,
            adapter,
            store,
            rate_limit,
            retry: RetryConfig::default(),
            metrics,
            positions: HashMap::new(),
            orders: HashMap::new(),
            venue_to_local: HashMap::new(),
            needs_stop: HashMap::new(),
            entry_candles: HashMap::new(),
            stop_triggered_at: HashMap::new(),
            ready: false,
        }
    }

    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn product_id(&self) -> &str {
        &self.product_id
    }

    pub fn params(&self) -> &StrategyParams {
        &self.params
    }

    pub fn position(&self, position_id: &str) -> Option<&PositionState> {
        self.positions.get(position_id)
    }

    pub fn order(&self, order_id: &str) -> Option<&Order> {
        self.orders.get(order_id)
    }

    /// Look up an order by local id or venue id.
    pub fn lookup_order(&self, order_id: &str) -> Option<&Order> {
        let local = self.resolve_order_id(order_id)?;
        self.orders.get(&local)
    }

    /// Open, tradeable positions (quarantined ones excluded).
    pub fn open_positions(&self) -> Vec<&PositionState> {
        self.positions
            .values()
            .filter(|p| p.is_open() && !p.inconsistent)
            .collect()
    }

    pub(crate) fn ensure_ready(&self) -> Result<(), EngineError> {
        if self.ready {
            Ok(())
        } else {
            Err(EngineError::NotReconciled(self.product_id.clone()))
        }
    }

    fn resolve_order_id(&self, order_id: &str) -> Option<String> {
        if self.orders.contains_key(order_id) {
            Some(order_id.to_string())
        } else {
            self.venue_to_local.get(order_id).cloned()
        }
    }

    // ------------------------------------------------------------------
    // Entry
    // ------------------------------------------------------------------

    /// Submit a limit buy entry.
    ///
    /// Persists the position (`PendingEntry`) and order
    /// (`PendingSubmit`) before dispatch, so a crash mid-call is healed
    /// by reconciliation via the idempotent client order id.
    pub async fn submit_entry(&mut self, intent: &EntryIntent) -> Result<EntryReceipt, EngineError> {
        self.ensure_ready()?;

        let existing = match self.orders.get(&intent.client_order_id) {
            Some(order) => Some(order.clone()),
            None => self.store.load_order(&intent.client_order_id).await?,
        };
        let position_id = format!("pos-{}", intent.client_order_id);

        let (mut position, mut order) = match existing {
            // A prior call left the dispatch unresolved (rate-limit
            // denial, retries exhausted): resume it under the same
            // client id instead of minting a duplicate.
            Some(order)
                if order.kind == OrderKind::Entry
                    && order.state == OrderState::PendingSubmit
                    && order.venue_order_id.is_none() =>
            {
                let position = match self.positions.get(&order.position_id) {
                    Some(pos) => pos.clone(),
                    None => self
                        .store
                        .load_position(&order.position_id)
                        .await?
                        .ok_or_else(|| EngineError::UnknownPosition(order.position_id.clone()))?,
                };
                (position, order)
            }
            Some(_) => {
                return Err(EngineError::DuplicateClientOrderId(
                    intent.client_order_id.clone(),
                ));
            }
            None => {
                let position = PositionState::new(&position_id, &self.product_id);
                let order = Order::new(
                    &intent.client_order_id,
                    &position_id,
                    OrderKind::Entry,
                    intent.limit_price,
                    intent.qty,
                );
                let mut tx = self.store.begin().await?;
                tx.save_position(&position).await?;
                tx.save_order(&order).await?;
                tx.commit().await?;
                self.metrics.inc_entries_submitted();
                (position, order)
            }
        };

        let adapter = Arc::clone(&self.adapter);
        let product = self.product_id.clone();
        let client_id = intent.client_order_id.clone();
        let (price, qty) = (intent.limit_price, intent.qty);

        let placed = with_retry(&self.rate_limit, ORDERS_ENDPOINT, &self.retry, || {
            adapter.place_limit_buy(&product, &client_id, price, qty)
        })
        .await;

        match placed {
            Ok(ack) => {
                order.ack(&ack.venue_order_id)?;
                self.store.save_order(&order).await?;
                self.venue_to_local
                    .insert(ack.venue_order_id.clone(), order.order_id.clone());
                info!(
                    product_id = %self.product_id,
                    position_id = %position_id,
                    order_id = %order.order_id,
                    venue_order_id = %ack.venue_order_id,
                    price = %price,
                    qty = %qty,
                    "entry order placed"
                );
            }
            Err(err @ (VenueError::RetriesExhausted { .. } | VenueError::BudgetExhausted { .. })) => {
                // Outcome unknown: leave the order pending and let the
                // idempotent client id resolve it on the next attempt or
                // at restart.
                warn!(
                    order_id = %order.order_id,
                    error = %err,
                    "entry dispatch unresolved, left pending"
                );
                self.orders.insert(order.order_id.clone(), order);
                self.positions.insert(position_id, position);
                return Err(err.into());
            }
            Err(err) => {
                order.reject()?;
                position.abandon()?;
                let mut tx = self.store.begin().await?;
                tx.save_order(&order).await?;
                tx.save_position(&position).await?;
                tx.commit().await?;
                self.metrics.inc_entries_rejected();
                warn!(
                    order_id = %order.order_id,
                    error = %err,
                    "entry rejected by venue"
                );
                self.orders.insert(order.order_id.clone(), order);
                self.positions.insert(position_id, position);
                return Err(err.into());
            }
        }

        self.orders.insert(order.order_id.clone(), order);
        self.positions.insert(position_id.clone(), position);

        Ok(EntryReceipt {
            position_id,
            order_id: intent.client_order_id.clone(),
        })
    }

    // ------------------------------------------------------------------
    // Fills
    // ------------------------------------------------------------------

    /// Apply a fill event for an order of this pair.
    ///
    /// Entry fills open or grow the position; the first confirmed fill
    /// is the only place the initial stop is created. Stop fills are
    /// routed to [`handle_stop_fill`](Self::handle_stop_fill).
    pub async fn handle_fill(
        &mut self,
        order_id: &str,
        filled_qty: Decimal,
        fill_price: Decimal,
    ) -> Result<(), EngineError> {
        let local_id = self
            .resolve_order_id(order_id)
            .ok_or_else(|| EngineError::UnknownOrder(order_id.to_string()))?;
        let mut order = self
            .orders
            .get(&local_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownOrder(local_id.clone()))?;
        if order.kind == OrderKind::Stop {
            return self.handle_stop_fill(&local_id, filled_qty, fill_price).await;
        }
        order.record_fill(filled_qty, fill_price)?;

        let mut position = self
            .positions
            .get(&order.position_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownPosition(order.position_id.clone()))?;
        if position.inconsistent {
            return Err(EngineError::ReconciliationConflict {
                position_id: position.position_id,
                detail: "position is quarantined, not trading".to_string(),
            });
        }
        let first_fill = position.status == PositionStatus::PendingEntry;
        position.register_fill(filled_qty, fill_price)?;
        self.metrics.inc_fills_applied();

        // The one and only initial stop placement, and only after a
        // confirmed BUY fill.
        let mut stop_order = None;
        if first_fill {
            if let Some((trigger, limit)) = position
                .compute_new_stop(self.params.trail_pct, self.params.stop_limit_buffer_pct)
            {
                match self
                    .place_stop_venue(&position.position_id, trigger, limit, position.qty_filled)
                    .await
                {
                    Ok(stop) => {
                        position.apply_new_stop(trigger, limit, stop.order_id.clone());
                        self.metrics.inc_stops_placed();
                        info!(
                            position_id = %position.position_id,
                            stop_order_id = %stop.order_id,
                            trigger = %trigger,
                            limit = %limit,
                            qty = %position.qty_filled,
                            "initial stop placed"
                        );
                        stop_order = Some(stop);
                    }
                    Err(EngineError::Venue(err)) => {
                        self.needs_stop.insert(position.position_id.clone(), 1);
                        self.metrics.inc_stop_place_failures();
                        warn!(
                            position_id = %position.position_id,
                            error = %err,
                            "initial stop placement failed, position needs stop"
                        );
                    }
                    Err(other) => return Err(other),
                }
            }
        }

        let mut tx = self.store.begin().await?;
        tx.save_order(&order).await?;
        tx.save_position(&position).await?;
        if let Some(ref stop) = stop_order {
            tx.save_order(stop).await?;
        }
        tx.commit().await?;

        info!(
            order_id = %order.order_id,
            filled_qty = %filled_qty,
            fill_price = %fill_price,
            position_qty = %position.qty_filled,
            entry_price = %position.entry_price,
            "entry fill applied"
        );

        self.orders.insert(order.order_id.clone(), order.clone());
        self.positions
            .insert(position.position_id.clone(), position.clone());
        if let Some(stop) = stop_order {
            if let Some(vid) = stop.venue_order_id.clone() {
                self.venue_to_local.insert(vid, stop.order_id.clone());
            }
            self.orders.insert(stop.order_id.clone(), stop);
        }

        // A later partial fill grows the position past the resting
        // stop's quantity: replace the stop so the whole position is
        // covered. The ratchet still applies, so the trigger never drops.
        if !first_fill && self.stop_undercovers(&position) {
            if let Some((trigger, limit)) = position
                .compute_new_stop(self.params.trail_pct, self.params.stop_limit_buffer_pct)
            {
                match self.replace_stop(position, trigger, limit).await {
                    Ok(()) | Err(EngineError::Venue(_)) => {}
                    Err(other) => return Err(other),
                }
            }
        }
        Ok(())
    }

    /// Whether the live stop no longer covers the position quantity.
    fn stop_undercovers(&self, position: &PositionState) -> bool {
        match position.stop_order_id.as_ref() {
            None => position.is_open(),
            Some(stop_id) => self
                .orders
                .get(stop_id)
                .map(|stop| stop.remaining_qty() < position.qty_filled)
                .unwrap_or(true),
        }
    }

    #[cfg(test)]
    pub(crate) fn needs_stop_failures(&self, position_id: &str) -> u32 {
        self.needs_stop.get(position_id).copied().unwrap_or(0)
    }

    /// Apply a fill on a stop order: reduce the position, close it when
    /// the quantity reaches zero.
    pub async fn handle_stop_fill(
        &mut self,
        order_id: &str,
        filled_qty: Decimal,
        fill_price: Decimal,
    ) -> Result<(), EngineError> {
        let local_id = self
            .resolve_order_id(order_id)
            .ok_or_else(|| EngineError::UnknownOrder(order_id.to_string()))?;
        let mut order = self
            .orders
            .get(&local_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownOrder(local_id.clone()))?;
        order.record_fill(filled_qty, fill_price)?;

        let mut position = self
            .positions
            .get(&order.position_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownPosition(order.position_id.clone()))?;
        if position.inconsistent {
            return Err(EngineError::ReconciliationConflict {
                position_id: position.position_id,
                detail: "position is quarantined, not trading".to_string(),
            });
        }
        position.close(fill_price, filled_qty)?;
        self.metrics.inc_fills_applied();

        let mut tx = self.store.begin().await?;
        tx.save_order(&order).await?;
        tx.save_position(&position).await?;
        tx.commit().await?;

        if position.status == PositionStatus::Closed {
            self.needs_stop.remove(&position.position_id);
            self.stop_triggered_at.remove(&position.position_id);
            info!(
                position_id = %position.position_id,
                realized_pnl = %position.realized_pnl,
                exit_price = %fill_price,
                "position closed by stop"
            );
        }

        self.orders.insert(order.order_id.clone(), order);
        self.positions
            .insert(position.position_id.clone(), position);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Trailing
    // ------------------------------------------------------------------

    /// Process a last-trade price for this pair.
    ///
    /// Ratchets every open position's stop; venue and transition
    /// failures on one position are absorbed (retried next tick) so a
    /// single bad position cannot stall the pair.
    pub async fn on_trade(&mut self, last_trade_price: Decimal) -> Result<(), EngineError> {
        self.ensure_ready()?;

        let open_ids: Vec<String> = self
            .positions
            .values()
            .filter(|p| p.is_open() && !p.inconsistent)
            .map(|p| p.position_id.clone())
            .collect();

        for position_id in open_ids {
            match self.ratchet_position(&position_id, last_trade_price).await {
                Ok(()) => {}
                Err(EngineError::Transition(err)) => {
                    error!(
                        position_id = %position_id,
                        error = %err,
                        "invalid transition while ratcheting, skipped"
                    );
                }
                Err(EngineError::Venue(err)) => {
                    warn!(
                        position_id = %position_id,
                        error = %err,
                        "venue failure while ratcheting, will retry next tick"
                    );
                }
                Err(other) => return Err(other),
            }
        }
        Ok(())
    }

    async fn ratchet_position(
        &mut self,
        position_id: &str,
        last_trade_price: Decimal,
    ) -> Result<(), EngineError> {
        let mut position = self
            .positions
            .get(position_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownPosition(position_id.to_string()))?;

        // A stop that triggered but has not filled within the timeout is
        // replaced with a tighter limit; the trigger stays put.
        if let Some(trigger) = position.current_stop_trigger {
            if position.stop_order_id.is_some() && last_trade_price <= trigger {
                let now = execution_core::now_ms();
                let since = *self
                    .stop_triggered_at
                    .entry(position_id.to_string())
                    .or_insert(now);
                let timeout_ms = (self.params.stop_timeout_seconds as i64).saturating_mul(1000);
                if now - since >= timeout_ms {
                    self.stop_triggered_at.insert(position_id.to_string(), now);
                    let tighter = self.params.stop_limit_buffer_pct / dec!(2);
                    let limit = trigger * (Decimal::ONE - tighter);
                    warn!(
                        position_id = %position_id,
                        trigger = %trigger,
                        limit = %limit,
                        "stop triggered but unfilled past timeout, tightening limit"
                    );
                    return self.replace_stop(position, trigger, limit).await;
                }
            } else {
                self.stop_triggered_at.remove(position_id);
            }
        }

        let before_high = position.highest_price_since_entry;
        position.observe_price(last_trade_price);

        let failures = self.needs_stop.get(position_id).copied().unwrap_or(0);
        let trail = if failures >= self.params.stop_escalation_threshold {
            // Placement keeps failing: tighten toward the market, never
            // downward.
            self.params
                .escalated_trail(failures - self.params.stop_escalation_threshold + 1)
        } else {
            self.params.trail_pct
        };

        let Some((trigger, limit)) =
            position.compute_new_stop(trail, self.params.stop_limit_buffer_pct)
        else {
            return Ok(());
        };

        let missing_stop = position.stop_order_id.is_none();
        let ratchet = position.should_replace_stop(trigger, self.params.min_ratchet);

        if !missing_stop && !ratchet {
            if position.highest_price_since_entry != before_high {
                self.store.save_position(&position).await?;
                self.positions.insert(position_id.to_string(), position);
            }
            return Ok(());
        }

        self.replace_stop(position, trigger, limit).await
    }

    /// Cancel the live stop (if any) and place a replacement, honoring
    /// the ratchet: the written trigger is never below the last known
    /// one. Used by the tick path, the stop-timeout path, and
    /// reconciliation.
    pub(crate) async fn replace_stop(
        &mut self,
        mut position: PositionState,
        trigger: Decimal,
        limit: Decimal,
    ) -> Result<(), EngineError> {
        let position_id = position.position_id.clone();

        // Never loosen: a candidate below the last known trigger is
        // lifted back to it.
        let (trigger, limit) = match position.current_stop_trigger {
            Some(current) if trigger < current => {
                let buffer_limit =
                    current * (Decimal::ONE - self.params.stop_limit_buffer_pct);
                (current, position.current_stop_limit.unwrap_or(buffer_limit))
            }
            _ => (trigger, limit),
        };

        // Cancel the old stop first. If the cancel cannot be confirmed
        // the old stop keeps standing and we retry on a later tick.
        let mut old_stop = None;
        if let Some(stop_id) = position.stop_order_id.clone() {
            let venue_id = self
                .orders
                .get(&stop_id)
                .and_then(|o| o.venue_order_id.clone());
            if let Some(venue_id) = venue_id {
                let adapter = Arc::clone(&self.adapter);
                let cancel = with_retry(&self.rate_limit, ORDERS_ENDPOINT, &self.retry, || {
                    adapter.cancel_order(&venue_id)
                })
                .await;

                match cancel {
                    Ok(()) => {}
                    Err(VenueError::UnknownOrder { .. }) => {
                        // Already gone at the venue; reconciliation of the
                        // status will have marked it, proceed.
                    }
                    Err(err) => {
                        warn!(
                            position_id = %position_id,
                            stop_order_id = %stop_id,
                            error = %err,
                            "stop cancel unconfirmed, keeping old stop"
                        );
                        return Err(err.into());
                    }
                }
            }
            if let Some(mut order) = self.orders.get(&stop_id).cloned() {
                order.cancel()?;
                old_stop = Some(order);
            }
            position.clear_stop_order();
        }

        match self
            .place_stop_venue(&position_id, trigger, limit, position.qty_filled)
            .await
        {
            Ok(stop) => {
                position.apply_new_stop(trigger, limit, stop.order_id.clone());

                let mut tx = self.store.begin().await?;
                if let Some(ref old) = old_stop {
                    tx.save_order(old).await?;
                }
                tx.save_order(&stop).await?;
                tx.save_position(&position).await?;
                tx.commit().await?;

                self.needs_stop.remove(&position_id);
                self.metrics.inc_stops_replaced();
                info!(
                    position_id = %position_id,
                    stop_order_id = %stop.order_id,
                    trigger = %trigger,
                    limit = %limit,
                    "stop replaced"
                );

                if let Some(old) = old_stop {
                    self.orders.insert(old.order_id.clone(), old);
                }
                if let Some(vid) = stop.venue_order_id.clone() {
                    self.venue_to_local.insert(vid, stop.order_id.clone());
                }
                self.orders.insert(stop.order_id.clone(), stop);
                self.positions.insert(position_id, position);
                Ok(())
            }
            Err(EngineError::Venue(err)) => {
                // Old stop is gone, new one is pending: flag the position
                // and retry next tick with unchanged-or-tighter levels.
                let failures = self.needs_stop.get(&position_id).copied().unwrap_or(0) + 1;
                self.needs_stop.insert(position_id.clone(), failures);
                self.metrics.inc_stop_place_failures();

                let mut tx = self.store.begin().await?;
                if let Some(ref old) = old_stop {
                    tx.save_order(old).await?;
                }
                tx.save_position(&position).await?;
                tx.commit().await?;

                warn!(
                    position_id = %position_id,
                    consecutive_failures = failures,
                    error = %err,
                    "stop placement failed, position needs stop"
                );

                if let Some(old) = old_stop {
                    self.orders.insert(old.order_id.clone(), old);
                }
                self.positions.insert(position_id, position);
                Err(EngineError::Venue(err))
            }
            Err(other) => Err(other),
        }
    }

    async fn place_stop_venue(
        &self,
        position_id: &str,
        trigger: Decimal,
        limit: Decimal,
        qty: Decimal,
    ) -> Result<Order, EngineError> {
        let client_id = generate_client_order_id("stop");
        let adapter = Arc::clone(&self.adapter);
        let product = self.product_id.clone();
        let cid = client_id.clone();

        let ack = with_retry(&self.rate_limit, ORDERS_ENDPOINT, &self.retry, || {
            adapter.place_stop_limit(&product, &cid, trigger, limit, qty)
        })
        .await
        .map_err(EngineError::Venue)?;

        let mut stop = Order::new_stop(client_id, position_id, trigger, limit, qty);
        stop.ack(&ack.venue_order_id)?;
        Ok(stop)
    }

    // ------------------------------------------------------------------
    // Timeouts and admin
    // ------------------------------------------------------------------

    /// Cancel an entry that outlived `max_entry_wait_candles`.
    ///
    /// A partially filled entry keeps its filled portion; the position
    /// stays open under its stop.
    pub async fn handle_entry_timeout(&mut self, order_id: &str) -> Result<(), EngineError> {
        self.ensure_ready()?;
        let local_id = self
            .resolve_order_id(order_id)
            .ok_or_else(|| EngineError::UnknownOrder(order_id.to_string()))?;
        let mut order = self
            .orders
            .get(&local_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownOrder(local_id.clone()))?;
        if order.state.is_terminal() {
            return Ok(());
        }
        // An unresolved dispatch has nothing to cancel at the venue;
        // reconciliation or a resumed submit settles it.
        let Some(venue_id) = order.venue_order_id.clone() else {
            return Ok(());
        };

        let adapter = Arc::clone(&self.adapter);
        let cancel = with_retry(&self.rate_limit, ORDERS_ENDPOINT, &self.retry, || {
            adapter.cancel_order(&venue_id)
        })
        .await;
        match cancel {
            Ok(()) | Err(VenueError::UnknownOrder { .. }) => {}
            Err(err) => {
                warn!(order_id = %order.order_id, error = %err, "entry-timeout cancel failed");
                return Err(err.into());
            }
        }
        order.cancel()?;

        let mut position = self
            .positions
            .get(&order.position_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownPosition(order.position_id.clone()))?;
        if position.status == PositionStatus::PendingEntry {
            position.abandon()?;
        }

        let mut tx = self.store.begin().await?;
        tx.save_order(&order).await?;
        tx.save_position(&position).await?;
        tx.commit().await?;

        info!(
            order_id = %order.order_id,
            position_id = %position.position_id,
            filled_qty = %order.filled_qty,
            "entry cancelled after wait limit"
        );

        self.orders.insert(order.order_id.clone(), order);
        self.positions
            .insert(position.position_id.clone(), position);
        Ok(())
    }

    /// Candle-close bookkeeping: age every non-terminal entry order and
    /// cancel those that waited longer than `max_entry_wait_candles`.
    pub async fn handle_candle_close(&mut self) -> Result<(), EngineError> {
        self.ensure_ready()?;

        let pending: Vec<String> = self
            .orders
            .values()
            .filter(|o| o.kind == OrderKind::Entry && !o.state.is_terminal())
            .map(|o| o.order_id.clone())
            .collect();
        self.entry_candles.retain(|order_id, _| pending.contains(order_id));

        let mut expired = Vec::new();
        for order_id in pending {
            let age = self.entry_candles.entry(order_id.clone()).or_insert(0);
            *age += 1;
            if *age > self.params.max_entry_wait_candles {
                expired.push(order_id);
            }
        }

        for order_id in expired {
            match self.handle_entry_timeout(&order_id).await {
                Ok(()) => {
                    self.entry_candles.remove(&order_id);
                }
                Err(EngineError::Venue(err)) => {
                    // Cancel unconfirmed: the age stays over the limit,
                    // the next candle retries.
                    warn!(order_id = %order_id, error = %err, "entry-timeout cancel pending retry");
                }
                Err(other) => return Err(other),
            }
        }
        Ok(())
    }

    /// Escalate a stop that triggered but has not filled within
    /// `stop_timeout_seconds`: replace it with a tighter limit buffer.
    /// The trigger never moves down.
    pub async fn handle_stop_timeout(&mut self, position_id: &str) -> Result<(), EngineError> {
        self.ensure_ready()?;
        let position = self
            .positions
            .get(position_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownPosition(position_id.to_string()))?;
        if !position.is_open() {
            return Ok(());
        }

        let Some(trigger) = position.current_stop_trigger else {
            return Ok(());
        };
        let tighter_buffer = self.params.stop_limit_buffer_pct / dec!(2);
        let limit = trigger * (Decimal::ONE - tighter_buffer);

        warn!(
            position_id = %position_id,
            trigger = %trigger,
            limit = %limit,
            "stop timed out, replacing with tighter limit"
        );
        self.replace_stop(position, trigger, limit).await
    }

    /// Admin bookkeeping close at a supplied reference price.
    ///
    /// Cancels the live stop, records a synthetic force-exit order, and
    /// closes the position as `ForceExited`. No sell is dispatched; a
    /// real exit remains the operator's job.
    pub async fn force_exit(
        &mut self,
        position_id: &str,
        price: Decimal,
    ) -> Result<(), EngineError> {
        let mut position = self
            .positions
            .get(position_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownPosition(position_id.to_string()))?;
        if position.status.is_terminal() {
            return Ok(());
        }

        let mut old_stop = None;
        if let Some(stop_id) = position.stop_order_id.clone() {
            let venue_id = self
                .orders
                .get(&stop_id)
                .and_then(|o| o.venue_order_id.clone());
            if let Some(venue_id) = venue_id {
                let adapter = Arc::clone(&self.adapter);
                let cancel = with_retry(&self.rate_limit, ORDERS_ENDPOINT, &self.retry, || {
                    adapter.cancel_order(&venue_id)
                })
                .await;
                if let Err(err) = cancel {
                    warn!(
                        position_id = %position_id,
                        error = %err,
                        "force-exit stop cancel failed, continuing"
                    );
                }
            }
            if let Some(mut order) = self.orders.get(&stop_id).cloned() {
                if order.cancel().is_ok() {
                    old_stop = Some(order);
                }
            }
            position.clear_stop_order();
        }

        // A pending position may still have its entry resting; pull it.
        let mut cancelled_entry = None;
        if position.status == PositionStatus::PendingEntry {
            let entry = self
                .orders
                .values()
                .find(|o| {
                    o.position_id == position_id
                        && o.kind == OrderKind::Entry
                        && !o.state.is_terminal()
                })
                .cloned();
            if let Some(mut entry) = entry {
                if let Some(venue_id) = entry.venue_order_id.clone() {
                    let adapter = Arc::clone(&self.adapter);
                    let cancel = with_retry(&self.rate_limit, ORDERS_ENDPOINT, &self.retry, || {
                        adapter.cancel_order(&venue_id)
                    })
                    .await;
                    if let Err(err) = cancel {
                        warn!(
                            order_id = %entry.order_id,
                            error = %err,
                            "force-exit entry cancel failed, continuing"
                        );
                    }
                    entry.cancel()?;
                    cancelled_entry = Some(entry);
                }
            }
        }

        let exit = if position.status == PositionStatus::PendingEntry {
            position.abandon()?;
            None
        } else {
            let qty = position.qty_filled;
            let record =
                Order::new_force_exit(generate_client_order_id("fexit"), position_id, price, qty);
            position.force_close(price, qty)?;
            Some(record)
        };

        let mut tx = self.store.begin().await?;
        if let Some(ref old) = old_stop {
            tx.save_order(old).await?;
        }
        if let Some(ref entry) = cancelled_entry {
            tx.save_order(entry).await?;
        }
        if let Some(ref record) = exit {
            tx.save_order(record).await?;
        }
        tx.save_position(&position).await?;
        tx.commit().await?;

        self.needs_stop.remove(position_id);
        self.stop_triggered_at.remove(position_id);
        self.metrics.inc_force_exits();
        info!(
            position_id = %position_id,
            price = %price,
            realized_pnl = %position.realized_pnl,
            "position force-exited"
        );

        if let Some(old) = old_stop {
            self.orders.insert(old.order_id.clone(), old);
        }
        if let Some(entry) = cancelled_entry {
            self.orders.insert(entry.order_id.clone(), entry);
        }
        if let Some(record) = exit {
            self.orders.insert(record.order_id.clone(), record);
        }
        self.positions
            .insert(position_id.to_string(), position);
        Ok(())
    }
}
