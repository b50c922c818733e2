//! Process-wide request quotas, one sliding window per venue endpoint.
//!
//! Every adapter call acquires a slot for its endpoint before dispatch.
//! The policy is shared across all engines in the process and is never
//! persisted; restart resets the windows.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Quota for one endpoint: at most `limit` requests per `window`.
#[derive(Debug, Clone, Copy)]
pub struct Quota {
    pub limit: usize,
    pub window: Duration,
}

impl Quota {
    pub fn per_second(limit: usize) -> Self {
        Self {
            limit,
            window: Duration::from_secs(1),
        }
    }
}

/// Usage snapshot for observability.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitUsage {
    /// Requests currently counted in the window.
    pub current: usize,
    /// Window capacity.
    pub limit: usize,
    /// When the oldest counted request falls out of the window.
    pub reset_after: Duration,
}

struct Window {
    quota: Quota,
    stamps: Vec<Instant>,
}

impl Window {
    fn new(quota: Quota) -> Self {
        Self {
            quota,
            stamps: Vec::new(),
        }
    }

    fn prune(&mut self, now: Instant) {
        let window = self.quota.window;
        self.stamps.retain(|t| now.duration_since(*t) < window);
    }

    fn try_acquire(&mut self, now: Instant) -> bool {
        self.prune(now);
        if self.stamps.len() < self.quota.limit {
            self.stamps.push(now);
            true
        } else {
            false
        }
    }

    /// Time until a slot frees, zero when one is free now.
    fn time_until_slot(&mut self, now: Instant) -> Duration {
        self.prune(now);
        if self.stamps.len() < self.quota.limit {
            return Duration::ZERO;
        }
        let oldest = *self.stamps.iter().min().unwrap_or(&now);
        (oldest + self.quota.window).saturating_duration_since(now)
    }
}

/// Per-endpoint sliding-window rate limiter.
///
/// Endpoints without an explicit quota fall back to the default quota.
pub struct RateLimitPolicy {
    quotas: HashMap<String, Quota>,
    default_quota: Quota,
    windows: Mutex<HashMap<String, Window>>,
}

/// Endpoint key for order placement and cancellation.
pub const ORDERS_ENDPOINT: &str = "/orders";

impl Default for RateLimitPolicy {
    fn default() -> Self {
        // Venue profile: 15 req/s on the orders endpoint, 10 req/s elsewhere.
        let mut quotas = HashMap::new();
        quotas.insert(ORDERS_ENDPOINT.to_string(), Quota::per_second(15));
        Self::new(quotas, Quota::per_second(10))
    }
}

impl RateLimitPolicy {
    pub fn new(quotas: HashMap<String, Quota>, default_quota: Quota) -> Self {
        Self {
            quotas,
            default_quota,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Shared handle used by every engine in the process.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn quota_for(&self, endpoint: &str) -> Quota {
        self.quotas.get(endpoint).copied().unwrap_or(self.default_quota)
    }

    /// Non-blocking acquire. Records the request on success.
    pub fn try_acquire(&self, endpoint: &str) -> bool {
        let quota = self.quota_for(endpoint);
        let mut windows = self.windows.lock();
        let window = windows
            .entry(endpoint.to_string())
            .or_insert_with(|| Window::new(quota));
        window.try_acquire(Instant::now())
    }

    /// Suspend until a slot is available or `max_wait` elapses.
    ///
    /// Returns `true` once a slot was acquired (the request is recorded),
    /// `false` if the budget could not be acquired within `max_wait`.
    pub async fn wait_if_needed(&self, endpoint: &str, max_wait: Duration) -> bool {
        let deadline = Instant::now() + max_wait;

        loop {
            let wait = {
                let quota = self.quota_for(endpoint);
                let mut windows = self.windows.lock();
                let window = windows
                    .entry(endpoint.to_string())
                    .or_insert_with(|| Window::new(quota));
                let now = Instant::now();
                if window.try_acquire(now) {
                    return true;
                }
                window.time_until_slot(now)
            };

            let now = Instant::now();
            if now + wait > deadline {
                tracing::debug!(endpoint = %endpoint, "rate-limit budget not available within max_wait");
                return false;
            }
            tokio::time::sleep(wait).await;
        }
    }

    /// Current usage for an endpoint.
    pub fn usage(&self, endpoint: &str) -> RateLimitUsage {
        let quota = self.quota_for(endpoint);
        let mut windows = self.windows.lock();
        let window = windows
            .entry(endpoint.to_string())
            .or_insert_with(|| Window::new(quota));
        let now = Instant::now();
        window.prune(now);

        let reset_after = window
            .stamps
            .iter()
            .min()
            .map(|oldest| (*oldest + quota.window).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO);

        RateLimitUsage {
            current: window.stamps.len(),
            limit: quota.limit,
            reset_after,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_policy(limit: usize, window_ms: u64) -> RateLimitPolicy {
        let quota = Quota {
            limit,
            window: Duration::from_millis(window_ms),
        };
        RateLimitPolicy::new(HashMap::new(), quota)
    }

    #[test]
    fn test_try_acquire_exhausts_budget() {
        let policy = tiny_policy(2, 10_000);

        assert!(policy.try_acquire("/orders"));
        assert!(policy.try_acquire("/orders"));
        assert!(!policy.try_acquire("/orders"));

        // Separate endpoint, separate window.
        assert!(policy.try_acquire("/products"));
    }

    #[test]
    fn test_usage_reports_window_state() {
        let policy = tiny_policy(5, 10_000);
        assert!(policy.try_acquire("/orders"));
        assert!(policy.try_acquire("/orders"));

        let usage = policy.usage("/orders");
        assert_eq!(usage.current, 2);
        assert_eq!(usage.limit, 5);
        assert!(usage.reset_after > Duration::ZERO);
    }

    #[test]
    fn test_window_frees_after_expiry() {
        let policy = tiny_policy(1, 30);
        assert!(policy.try_acquire("/orders"));
        assert!(!policy.try_acquire("/orders"));

        std::thread::sleep(Duration::from_millis(40));
        assert!(policy.try_acquire("/orders"));
    }

    #[tokio::test]
    async fn test_wait_if_needed_acquires_after_expiry() {
        let policy = tiny_policy(1, 50);
        assert!(policy.try_acquire("/orders"));

        let ok = policy
            .wait_if_needed("/orders", Duration::from_millis(500))
            .await;
        assert!(ok);
    }

    #[tokio::test]
    async fn test_wait_if_needed_times_out() {
        let policy = tiny_policy(1, 60_000);
        assert!(policy.try_acquire("/orders"));

        let ok = policy
            .wait_if_needed("/orders", Duration::from_millis(20))
            .await;
        assert!(!ok);
    }

    #[test]
    fn test_configured_quota_beats_default() {
        let mut quotas = HashMap::new();
        quotas.insert(ORDERS_ENDPOINT.to_string(), Quota::per_second(1));
        let policy = RateLimitPolicy::new(quotas, Quota::per_second(100));

        assert!(policy.try_acquire(ORDERS_ENDPOINT));
        assert!(!policy.try_acquire(ORDERS_ENDPOINT));
    }
}
