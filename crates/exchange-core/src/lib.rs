//! Venue abstraction: the adapter capability trait, typed errors, the
//! retry/rate-limit wrapper, and a simulated venue for tests and demos.

mod adapter;
mod error;
mod paper;
mod retry;

pub use adapter::{ExchangeAdapter, OrderAck, VenueOpenOrder, VenueOrderStatus};
pub use error::VenueError;
pub use paper::PaperExchange;
pub use retry::{with_retry, RetryConfig};
