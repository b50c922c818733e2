//! Shared utilities: backoff and logging setup.

mod backoff;
mod logging;

pub use backoff::ExponentialBackoff;
pub use logging::init_logging;
