//! Trailing-stop strategy parameters.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Per-pair trailing stop configuration.
#[derive(Debug, Clone)]
pub struct StrategyParams {
    /// Trailing distance below the high-water mark (fraction, 0–1).
    pub trail_pct: Decimal,
    /// Gap between stop trigger and stop limit (fraction).
    pub stop_limit_buffer_pct: Decimal,
    /// Minimum relative trigger improvement before a stop is replaced.
    pub min_ratchet: Decimal,
    /// Cancel an unfilled entry after this many candle closes.
    pub max_entry_wait_candles: u32,
    /// Escalate a triggered-but-unfilled stop after this many seconds.
    pub stop_timeout_seconds: u64,
    /// Consecutive stop-placement failures before pricing escalates.
    pub stop_escalation_threshold: u32,
    /// Trail tightening applied per escalation (fraction).
    pub stop_escalation_step_pct: Decimal,
}

impl Default for StrategyParams {
    fn default() -> Self {
        Self {
            trail_pct: dec!(0.02),
            stop_limit_buffer_pct: dec!(0.005),
            min_ratchet: dec!(0.001),
            max_entry_wait_candles: 5,
            stop_timeout_seconds: 60,
            stop_escalation_threshold: 3,
            stop_escalation_step_pct: dec!(0.005),
        }
    }
}

impl StrategyParams {
    pub fn with_trail_pct(mut self, trail_pct: Decimal) -> Self {
        self.trail_pct = trail_pct;
        self
    }

    pub fn with_stop_limit_buffer_pct(mut self, buffer: Decimal) -> Self {
        self.stop_limit_buffer_pct = buffer;
        self
    }

    pub fn with_min_ratchet(mut self, min_ratchet: Decimal) -> Self {
        self.min_ratchet = min_ratchet;
        self
    }

    /// Effective trail after `escalations` tightening steps, floored at
    /// one step above zero so the trigger stays below the market.
    pub fn escalated_trail(&self, escalations: u32) -> Decimal {
        let step = self.stop_escalation_step_pct * Decimal::from(escalations);
        (self.trail_pct - step).max(self.stop_escalation_step_pct)
    }
}
