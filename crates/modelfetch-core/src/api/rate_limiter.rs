//! Interval rate limiter for catalog API calls
//!
//! Enforces a minimum spacing between outbound API requests. One limiter is
//! built per `ApiClient` and shared by every clone of that client, so all
//! concurrent API calls are serialized through the same timestamp. File
//! transfers never go through this limiter.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Upper bound for the throttle penalty added after 429 responses
const MAX_PENALTY: Duration = Duration::from_secs(60);

/// Spacing limiter shared across all API calls of one client
#[derive(Clone, Debug)]
pub struct RateLimiter {
    state: Arc<Mutex<RateLimiterState>>,
}

#[derive(Debug)]
struct RateLimiterState {
    /// When the last call was let through
    last_call: Option<Instant>,
    /// Configured spacing, already clamped to the floor
    min_interval: Duration,
    /// Extra spacing added while the server is signalling throttling
    penalty: Duration,
}

impl RateLimiter {
    /// Create a limiter; `min_interval` is raised to `floor` if it is lower
    pub fn new(min_interval: Duration, floor: Duration) -> Self {
        let effective = min_interval.max(floor);
        if effective > min_interval {
            debug!(
                "Requested API interval {:?} is below floor {:?}, using floor",
                min_interval, floor
            );
        }

        Self {
            state: Arc::new(Mutex::new(RateLimiterState {
                last_call: None,
                min_interval: effective,
                penalty: Duration::ZERO,
            })),
        }
    }

    /// Wait until the next call is allowed, then record it
    ///
    /// The lock is held while waiting, so concurrent callers queue up and
    /// each one is spaced from the previous one.
    pub async fn acquire(&self) {
        let mut state = self.state.lock().await;
        let interval = state.min_interval + state.penalty;

        if let Some(last) = state.last_call {
            let ready_at = last + interval;
            let now = Instant::now();
            if ready_at > now {
                let wait = ready_at - now;
                debug!("Rate limiter waiting {:?}", wait);
                tokio::time::sleep(wait).await;
            }
        }

        state.last_call = Some(Instant::now());
    }

    /// Widen the spacing after the server answered 429
    pub async fn widen(&self, retry_after: Option<Duration>) {
        let mut state = self.state.lock().await;
        let doubled = if state.penalty.is_zero() {
            state.min_interval
        } else {
            state.penalty * 2
        };
        let penalty = doubled.max(retry_after.unwrap_or_default()).min(MAX_PENALTY);
        state.penalty = penalty;
        warn!(
            "API throttled by server, spacing calls {:?} apart",
            state.min_interval + penalty
        );
    }

    /// Shrink the throttle penalty after a successful call
    pub async fn relax(&self) {
        let mut state = self.state.lock().await;
        if !state.penalty.is_zero() {
            state.penalty /= 2;
            if state.penalty < Duration::from_millis(10) {
                state.penalty = Duration::ZERO;
            }
        }
    }

    /// Configured spacing (never below the floor)
    pub async fn min_interval(&self) -> Duration {
        self.state.lock().await.min_interval
    }

    /// Spacing currently applied, including any throttle penalty
    pub async fn effective_interval(&self) -> Duration {
        let state = self.state.lock().await;
        state.min_interval + state.penalty
    }
}
