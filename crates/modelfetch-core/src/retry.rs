//! Retry with backoff, shared by the API client and the download engine
//!
//! An operation is attempted until it succeeds, fails with an error the
//! classifier deems fatal, or runs out of attempts. Delays between attempts
//! come from a [`BackoffStrategy`]; every attempt is recorded in
//! [`RetryStats`].

use crate::config::{BackoffKind, RetrySettings};
use crate::error::FetchError;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Computes the wait before the next attempt
///
/// `attempt` is the 1-based number of the attempt that just failed.
pub trait BackoffStrategy: Send + Sync + fmt::Debug {
    fn compute_delay(&self, attempt: u32) -> Duration;

    /// Feedback hook for strategies that adapt to observed outcomes
    fn record_outcome(&self, _success: bool) {}
}

fn exponential(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
}

/// `base * 2^(n-1)`
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub max: Duration,
}

impl BackoffStrategy for ExponentialBackoff {
    fn compute_delay(&self, attempt: u32) -> Duration {
        exponential(self.base, attempt).min(self.max)
    }
}

/// `base * n`
#[derive(Debug, Clone)]
pub struct LinearBackoff {
    pub base: Duration,
    pub max: Duration,
}

impl BackoffStrategy for LinearBackoff {
    fn compute_delay(&self, attempt: u32) -> Duration {
        self.base.saturating_mul(attempt.max(1)).min(self.max)
    }
}

/// `base * fib(n)` with fib(1) = fib(2) = 1
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    pub base: Duration,
    pub max: Duration,
}

impl BackoffStrategy for FibonacciBackoff {
    fn compute_delay(&self, attempt: u32) -> Duration {
        let (mut a, mut b) = (1u32, 1u32);
        for _ in 2..attempt.max(1) {
            let next = a.saturating_add(b);
            a = b;
            b = next;
        }
        self.base.saturating_mul(b).min(self.max)
    }
}

/// Exponential backoff plus uniform jitter in `[0, base]`
#[derive(Debug, Clone)]
pub struct JitteredBackoff {
    pub base: Duration,
    pub max: Duration,
}

impl BackoffStrategy for JitteredBackoff {
    fn compute_delay(&self, attempt: u32) -> Duration {
        let jitter_ms = rand::thread_rng().gen_range(0..=self.base.as_millis() as u64);
        (exponential(self.base, attempt) + Duration::from_millis(jitter_ms)).min(self.max)
    }
}

/// Exponential backoff scaled by the recent success rate
///
/// Outcomes of the last `window` attempts are kept. A healthy success rate
/// halves the delay; a poor one doubles it.
#[derive(Debug)]
pub struct AdaptiveBackoff {
    pub base: Duration,
    pub max: Duration,
    window: usize,
    outcomes: Mutex<VecDeque<bool>>,
}

impl AdaptiveBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self::with_window(base, max, 20)
    }

    pub fn with_window(base: Duration, max: Duration, window: usize) -> Self {
        Self {
            base,
            max,
            window: window.max(1),
            outcomes: Mutex::new(VecDeque::new()),
        }
    }

    /// Fraction of recent attempts that succeeded; 1.0 with no history
    pub fn success_rate(&self) -> f64 {
        let outcomes = self.outcomes.lock();
        if outcomes.is_empty() {
            return 1.0;
        }
        outcomes.iter().filter(|ok| **ok).count() as f64 / outcomes.len() as f64
    }
}

impl BackoffStrategy for AdaptiveBackoff {
    fn compute_delay(&self, attempt: u32) -> Duration {
        let rate = self.success_rate();
        let delay = exponential(self.base, attempt);
        let scaled = if rate >= 0.9 {
            delay / 2
        } else if rate >= 0.5 {
            delay
        } else {
            delay.saturating_mul(2)
        };
        scaled.min(self.max)
    }

    fn record_outcome(&self, success: bool) {
        let mut outcomes = self.outcomes.lock();
        outcomes.push_back(success);
        while outcomes.len() > self.window {
            outcomes.pop_front();
        }
    }
}

/// Build the strategy named by the configuration
pub fn backoff_from_settings(settings: &RetrySettings) -> Arc<dyn BackoffStrategy> {
    let base = settings.base_delay();
    let max = settings.max_delay();
    match settings.strategy {
        BackoffKind::Exponential => Arc::new(ExponentialBackoff { base, max }),
        BackoffKind::Linear => Arc::new(LinearBackoff { base, max }),
        BackoffKind::Fibonacci => Arc::new(FibonacciBackoff { base, max }),
        BackoffKind::JitteredExponential => Arc::new(JitteredBackoff { base, max }),
        BackoffKind::Adaptive => Arc::new(AdaptiveBackoff::new(base, max)),
    }
}

/// Whether an error is worth another attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    Fatal,
}

/// Classifier based on [`FetchError::is_retryable`]
pub fn classify_default(error: &FetchError) -> ErrorClass {
    if error.is_retryable() {
        ErrorClass::Retryable
    } else {
        ErrorClass::Fatal
    }
}

/// Attempt budget plus backoff strategy
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Arc<dyn BackoffStrategy>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Arc<dyn BackoffStrategy>) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self::new(settings.max_attempts, backoff_from_settings(settings))
    }
}

/// One attempt of an operation
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub duration: Duration,
    pub error: Option<String>,
    /// Delay scheduled before the next attempt, if there is one
    pub next_delay: Option<Duration>,
}

/// Everything that happened while executing an operation
#[derive(Debug, Clone, Default)]
pub struct RetryStats {
    pub attempts: Vec<AttemptRecord>,
}

impl RetryStats {
    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }

    pub fn total_duration(&self) -> Duration {
        self.attempts.iter().map(|a| a.duration).sum()
    }
}

/// Final result plus the per-attempt record
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, FetchError>,
    pub stats: RetryStats,
}

type RetryHook<'a> = Box<dyn FnMut(&AttemptRecord) + Send + 'a>;

/// Runs an operation under a backoff strategy and attempt budget
pub struct RetryExecutor<'a> {
    backoff: &'a dyn BackoffStrategy,
    max_attempts: u32,
    interrupt: Option<&'a CancellationToken>,
    on_retry: Option<RetryHook<'a>>,
}

impl<'a> RetryExecutor<'a> {
    pub fn new(policy: &'a RetryPolicy) -> Self {
        Self::with_backoff(policy.backoff.as_ref(), policy.max_attempts)
    }

    pub fn with_backoff(backoff: &'a dyn BackoffStrategy, max_attempts: u32) -> Self {
        Self {
            backoff,
            max_attempts: max_attempts.max(1),
            interrupt: None,
            on_retry: None,
        }
    }

    /// Abort the backoff wait with `FetchError::Cancelled` once `token` fires
    pub fn interruptible(mut self, token: &'a CancellationToken) -> Self {
        self.interrupt = Some(token);
        self
    }

    /// Called before each backoff wait
    pub fn on_retry(mut self, hook: impl FnMut(&AttemptRecord) + Send + 'a) -> Self {
        self.on_retry = Some(Box::new(hook));
        self
    }

    /// Execute `operation`, passing it the 1-based attempt number
    pub async fn execute<T, F, Fut, C>(mut self, mut operation: F, classify: C) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
        C: Fn(&FetchError) -> ErrorClass,
    {
        let mut stats = RetryStats::default();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let started = Instant::now();
            let result = operation(attempt).await;
            let duration = started.elapsed();

            let error = match result {
                Ok(value) => {
                    self.backoff.record_outcome(true);
                    stats.attempts.push(AttemptRecord {
                        attempt,
                        duration,
                        error: None,
                        next_delay: None,
                    });
                    if attempt > 1 {
                        debug!("Operation succeeded on attempt {}", attempt);
                    }
                    return RetryOutcome {
                        result: Ok(value),
                        stats,
                    };
                }
                Err(e) => e,
            };

            let mut record = AttemptRecord {
                attempt,
                duration,
                error: Some(error.to_string()),
                next_delay: None,
            };

            if classify(&error) == ErrorClass::Fatal {
                stats.attempts.push(record);
                return RetryOutcome {
                    result: Err(error),
                    stats,
                };
            }

            self.backoff.record_outcome(false);

            if attempt >= self.max_attempts {
                warn!(
                    "Giving up after {} attempts, last error: {}",
                    attempt, error
                );
                stats.attempts.push(record);
                return RetryOutcome {
                    result: Err(FetchError::MaxAttemptsExceeded {
                        attempts: attempt,
                        last: Box::new(error),
                    }),
                    stats,
                };
            }

            let mut delay = self.backoff.compute_delay(attempt);
            if let FetchError::RateLimited {
                retry_after: Some(retry_after),
            } = &error
            {
                delay = delay.max(*retry_after);
            }
            record.next_delay = Some(delay);

            warn!(
                "Attempt {}/{} failed: {} - retrying in {:?}",
                attempt, self.max_attempts, error, delay
            );

            if let Some(hook) = self.on_retry.as_mut() {
                hook(&record);
            }
            stats.attempts.push(record);

            match self.interrupt {
                Some(token) => {
                    tokio::select! {
                        _ = token.cancelled() => {
                            return RetryOutcome {
                                result: Err(FetchError::Cancelled),
                                stats,
                            };
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => tokio::time::sleep(delay).await,
            }
        }
    }
}

/// Execute `operation` with retries, returning only the final result
pub async fn execute_with_retry<T, F, Fut, C>(
    operation: F,
    classify_error: C,
    backoff_strategy: &dyn BackoffStrategy,
    max_attempts: u32,
) -> Result<T, FetchError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
    C: Fn(&FetchError) -> ErrorClass,
{
    RetryExecutor::with_backoff(backoff_strategy, max_attempts)
        .execute(operation, classify_error)
        .await
        .result
}
