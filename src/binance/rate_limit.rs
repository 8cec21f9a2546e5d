// =============================================================================
// Rate-Limit Tracker — monitors Binance futures API usage to avoid 429s
// =============================================================================
//
// USDⓈ-M futures limits:
//   - Request weight: 2400 per minute (we hard-cap ourselves at 2000).
//   - Order rate:     300 per 10 seconds and 1200 per minute.
//
// The tracker reads the `X-MBX-USED-WEIGHT-1M` and `X-MBX-ORDER-COUNT-*`
// headers after every response and keeps atomic counters any task may query
// lock-free. A 429/418 with `Retry-After` pauses all requests until it passes.
// =============================================================================

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use reqwest::header::HeaderMap;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::ExchangeError;

/// Hard ceiling at which we refuse to send additional requests.
const WEIGHT_HARD_LIMIT: u32 = 2000;
/// Soft warning threshold.
const WEIGHT_WARN_THRESHOLD: u32 = 1600;

/// Maximum orders per 10-second window.
const ORDER_10S_LIMIT: u32 = 300;
/// Maximum orders per minute.
const ORDER_1M_LIMIT: u32 = 1200;

/// Back-off applied to a 429 that carries no `Retry-After`.
const DEFAULT_BACKOFF: Duration = Duration::from_secs(5);

pub struct RateLimitTracker {
    used_weight_1m: AtomicU32,
    order_count_10s: AtomicU32,
    order_count_1m: AtomicU32,
    paused_until: Mutex<Option<Instant>>,
}

/// Serialisable view of the current counters.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitSnapshot {
    pub used_weight_1m: u32,
    pub order_count_10s: u32,
    pub order_count_1m: u32,
    pub paused: bool,
}

fn header_u32(headers: &HeaderMap, name: &str) -> Option<u32> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

impl RateLimitTracker {
    pub fn new() -> Self {
        Self {
            used_weight_1m: AtomicU32::new(0),
            order_count_10s: AtomicU32::new(0),
            order_count_1m: AtomicU32::new(0),
            paused_until: Mutex::new(None),
        }
    }

    // -------------------------------------------------------------------------
    // Header-based updates
    // -------------------------------------------------------------------------

    pub fn update_from_headers(&self, headers: &HeaderMap) {
        if let Some(w) = header_u32(headers, "X-MBX-USED-WEIGHT-1M") {
            let prev = self.used_weight_1m.swap(w, Ordering::Relaxed);
            if w >= WEIGHT_WARN_THRESHOLD && prev < WEIGHT_WARN_THRESHOLD {
                warn!(
                    used_weight = w,
                    hard_limit = WEIGHT_HARD_LIMIT,
                    "rate-limit weight crossed warning threshold"
                );
            }
            debug!(used_weight_1m = w, "rate-limit weight updated from header");
        }
        if let Some(c) = header_u32(headers, "X-MBX-ORDER-COUNT-10S") {
            self.order_count_10s.store(c, Ordering::Relaxed);
        }
        if let Some(c) = header_u32(headers, "X-MBX-ORDER-COUNT-1M") {
            self.order_count_1m.store(c, Ordering::Relaxed);
        }
    }

    /// Record a 429/418 from the exchange. Requests are refused until the
    /// `Retry-After` interval (seconds) has passed.
    pub fn record_throttle(&self, headers: &HeaderMap) {
        let wait = header_u32(headers, "Retry-After")
            .map(|s| Duration::from_secs(u64::from(s)))
            .unwrap_or(DEFAULT_BACKOFF);
        *self.paused_until.lock() = Some(Instant::now() + wait);
        warn!(wait_secs = wait.as_secs(), "exchange throttled us; pausing requests");
    }

    // -------------------------------------------------------------------------
    // Pre-flight checks
    // -------------------------------------------------------------------------

    /// Refuse a request of `weight` while paused or above the weight ceiling.
    pub fn check_request(&self, weight: u32) -> Result<(), ExchangeError> {
        {
            let mut paused = self.paused_until.lock();
            match *paused {
                Some(until) if Instant::now() < until => {
                    return Err(ExchangeError::RateLimited(format!(
                        "paused for another {}ms",
                        until.saturating_duration_since(Instant::now()).as_millis()
                    )));
                }
                Some(_) => *paused = None,
                None => {}
            }
        }
        let current = self.used_weight_1m.load(Ordering::Relaxed);
        if current + weight > WEIGHT_HARD_LIMIT {
            warn!(
                current_weight = current,
                requested_weight = weight,
                hard_limit = WEIGHT_HARD_LIMIT,
                "request blocked; would exceed rate-limit"
            );
            return Err(ExchangeError::RateLimited(format!(
                "request weight {current}+{weight} above {WEIGHT_HARD_LIMIT}"
            )));
        }
        Ok(())
    }

    /// Refuse a new order when either order-count window is full.
    pub fn check_order(&self) -> Result<(), ExchangeError> {
        self.check_request(1)?;
        let count_10s = self.order_count_10s.load(Ordering::Relaxed);
        if count_10s >= ORDER_10S_LIMIT {
            warn!(count_10s, limit = ORDER_10S_LIMIT, "order blocked; 10s order limit reached");
            return Err(ExchangeError::RateLimited(format!("{count_10s} orders in 10s")));
        }
        let count_1m = self.order_count_1m.load(Ordering::Relaxed);
        if count_1m >= ORDER_1M_LIMIT {
            warn!(count_1m, limit = ORDER_1M_LIMIT, "order blocked; 1m order limit reached");
            return Err(ExchangeError::RateLimited(format!("{count_1m} orders in 1m")));
        }
        Ok(())
    }

    pub fn snapshot(&self) -> RateLimitSnapshot {
        RateLimitSnapshot {
            used_weight_1m: self.used_weight_1m.load(Ordering::Relaxed),
            order_count_10s: self.order_count_10s.load(Ordering::Relaxed),
            order_count_1m: self.order_count_1m.load(Ordering::Relaxed),
            paused: self.paused_until.lock().is_some_and(|u| Instant::now() < u),
        }
    }
}

impl Default for RateLimitTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RateLimitTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snap = self.snapshot();
        f.debug_struct("RateLimitTracker")
            .field("used_weight_1m", &snap.used_weight_1m)
            .field("order_count_10s", &snap.order_count_10s)
            .field("order_count_1m", &snap.order_count_1m)
            .field("paused", &snap.paused)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (k, v) in pairs {
            h.insert(*k, HeaderValue::from_str(v).unwrap());
        }
        h
    }

    #[test]
    fn order_count_header_blocks_orders() {
        let rl = RateLimitTracker::new();
        assert!(rl.check_order().is_ok());
        rl.update_from_headers(&headers(&[("X-MBX-ORDER-COUNT-10S", "300")]));
        assert!(matches!(rl.check_order(), Err(ExchangeError::RateLimited(_))));
        // reads are still allowed
        assert!(rl.check_request(5).is_ok());
    }

    #[test]
    fn weight_ceiling_blocks_requests() {
        let rl = RateLimitTracker::new();
        rl.update_from_headers(&headers(&[("X-MBX-USED-WEIGHT-1M", "1999")]));
        assert!(rl.check_request(1).is_ok());
        assert!(rl.check_request(5).is_err());
        assert_eq!(rl.snapshot().used_weight_1m, 1999);
    }

    #[test]
    fn throttle_pauses_until_retry_after() {
        let rl = RateLimitTracker::new();
        rl.record_throttle(&headers(&[("Retry-After", "30")]));
        assert!(rl.snapshot().paused);
        assert!(rl.check_request(1).is_err());
    }

    #[test]
    fn garbage_headers_are_ignored() {
        let rl = RateLimitTracker::new();
        rl.update_from_headers(&headers(&[("X-MBX-USED-WEIGHT-1M", "lots")]));
        assert_eq!(rl.snapshot().used_weight_1m, 0);
    }
}
