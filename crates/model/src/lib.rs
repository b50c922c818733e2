//! Shared market and intent types used across the trading core.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A last-trade price observation for one product.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeTick {
    /// Venue product (e.g. "BTC-USD").
    pub product_id: String,
    /// Last traded price.
    pub price: Decimal,
    /// Observation timestamp in milliseconds.
    pub timestamp_ms: i64,
}

/// Market events consumed by the execution layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MarketEvent {
    Trade(TradeTick),
    /// Close of a 5-minute candle; entry signals are only evaluated here.
    CandleClose {
        product_id: String,
        close: Decimal,
        timestamp_ms: i64,
    },
}

impl MarketEvent {
    /// Product the event refers to.
    pub fn product_id(&self) -> &str {
        match self {
            Self::Trade(t) => &t.product_id,
            Self::CandleClose { product_id, .. } => product_id,
        }
    }
}

/// A request to open a position with a limit buy.
///
/// The `client_order_id` is the idempotency key: submitting the same
/// intent twice must not create a second position or order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryIntent {
    pub client_order_id: String,
    pub product_id: String,
    pub limit_price: Decimal,
    pub qty: Decimal,
}

impl EntryIntent {
    pub fn new(
        client_order_id: impl Into<String>,
        product_id: impl Into<String>,
        limit_price: Decimal,
        qty: Decimal,
    ) -> Self {
        Self {
            client_order_id: client_order_id.into(),
            product_id: product_id.into(),
            limit_price,
            qty,
        }
    }

    /// Notional value of the intent.
    pub fn notional(&self) -> Decimal {
        self.limit_price * self.qty
    }
}

/// Output of the signal generator for one candle close.
///
/// The core never inspects indicator internals; it only sees whether to
/// buy and at what price/size.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntrySignal {
    pub should_buy: bool,
    pub limit_price: Decimal,
    pub qty: Decimal,
    pub client_order_id: String,
}

impl EntrySignal {
    /// Convert a buy signal into an entry intent for the given product.
    pub fn into_intent(self, product_id: &str) -> Option<EntryIntent> {
        if !self.should_buy {
            return None;
        }
        Some(EntryIntent {
            client_order_id: self.client_order_id,
            product_id: product_id.to_string(),
            limit_price: self.limit_price,
            qty: self.qty,
        })
    }
}
