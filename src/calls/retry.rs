//! Retry policy for failed Kubernetes calls
//!
//! One strategy instance lives in the packet for the duration of a request/response
//! exchange. It is installed by the first request step that finds none and cleared by the
//! response step once the exchange stops retrying.

use super::failure::{HTTP_CONFLICT, HTTP_TOO_MANY_REQUESTS};
use crate::work::Packet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// What the response step should do with a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-run the request step after the delay
    Retry(Duration),
    /// Reroute to the conflict step
    Conflict,
    GiveUp,
}

pub trait RetryStrategy: Send + Sync {
    /// Decide for a failure with the given HTTP status (`None` for timeouts)
    fn decide(&self, status_code: Option<u16>, has_conflict_step: bool) -> RetryDecision;

    /// Forget earlier attempts, used when a list moves on to its next page
    fn reset(&self);
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryTuning {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryTuning {
    fn default() -> Self {
        RetryTuning {
            max_retries: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Exponential backoff with separate budgets for retries and conflict reroutes
#[derive(Debug)]
pub struct DefaultRetryStrategy {
    tuning: RetryTuning,
    retries: AtomicU32,
    conflicts: AtomicU32,
}

impl DefaultRetryStrategy {
    pub fn new(tuning: RetryTuning) -> Self {
        DefaultRetryStrategy {
            tuning,
            retries: AtomicU32::new(0),
            conflicts: AtomicU32::new(0),
        }
    }

    /// Delay before attempt `n` (1-based): initial * 2^(n-1), capped
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        self.tuning
            .initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.tuning.max_backoff)
    }
}

/// Timeouts, throttling and transient server errors are worth repeating
pub fn is_retryable(status_code: Option<u16>) -> bool {
    match status_code {
        None => true,
        Some(code) => code == HTTP_TOO_MANY_REQUESTS || matches!(code, 500 | 502 | 503 | 504),
    }
}

impl RetryStrategy for DefaultRetryStrategy {
    fn decide(&self, status_code: Option<u16>, has_conflict_step: bool) -> RetryDecision {
        if status_code == Some(HTTP_CONFLICT) && has_conflict_step {
            let conflicts = self.conflicts.fetch_add(1, Ordering::SeqCst) + 1;
            return if conflicts <= self.tuning.max_retries {
                RetryDecision::Conflict
            } else {
                RetryDecision::GiveUp
            };
        }

        if !is_retryable(status_code) {
            return RetryDecision::GiveUp;
        }

        let attempt = self.retries.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.tuning.max_retries {
            RetryDecision::Retry(self.backoff(attempt))
        } else {
            RetryDecision::GiveUp
        }
    }

    fn reset(&self) {
        self.retries.store(0, Ordering::SeqCst);
        self.conflicts.store(0, Ordering::SeqCst);
    }
}

/// Packet component wrapping the strategy of the current exchange
struct InstalledStrategy(Arc<dyn RetryStrategy>);

pub fn strategy(packet: &Packet) -> Option<Arc<dyn RetryStrategy>> {
    packet.spi::<InstalledStrategy>().map(|s| s.0.clone())
}

pub fn install(packet: &mut Packet, strategy: Arc<dyn RetryStrategy>) {
    packet.put_spi(Arc::new(InstalledStrategy(strategy)));
}

pub fn clear(packet: &mut Packet) {
    packet.remove_spi::<InstalledStrategy>();
}
