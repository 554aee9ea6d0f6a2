//! Retrying of transient failures.
//!
//! A policy wraps an operation and re-invokes it while the failure is
//! retryable: exponential back-off with full jitter, capped per-delay and
//! in total. The default policy performs no retries at all.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::error::{FractalError, Result};

pub type RetryPredicate = Arc<dyn Fn(&FractalError) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first. `1` means no retries.
    pub max_attempts: u32,
    /// Multiplier applied to the delay after every failed attempt.
    pub factor: f64,
    pub min_delay: Duration,
    pub max_delay: Duration,
    /// Full jitter: each delay is drawn uniformly from `[0, computed]`.
    pub randomize: bool,
    /// Ceiling on elapsed time across all attempts.
    pub max_total: Option<Duration>,
    pub predicate: RetryPredicate,
    pub cancel: Option<CancellationToken>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("factor", &self.factor)
            .field("min_delay", &self.min_delay)
            .field("max_delay", &self.max_delay)
            .field("randomize", &self.randomize)
            .field("max_total", &self.max_total)
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

impl RetryPolicy {
    /// No retries; every error propagates on the first attempt.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            factor: 2.0,
            min_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            randomize: true,
            max_total: None,
            predicate: Arc::new(default_predicate),
            cancel: None,
        }
    }

    pub fn with_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::none()
        }
    }

    pub fn predicate<F>(mut self, f: F) -> Self
    where
        F: Fn(&FractalError) -> bool + Send + Sync + 'static,
    {
        self.predicate = Arc::new(f);
        self
    }

    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn is_noop(&self) -> bool {
        self.max_attempts <= 1
    }

    /// Runs `op`, retrying while the policy allows. The operation closure
    /// is re-invoked from scratch on every attempt.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if attempt >= self.max_attempts || !(self.predicate)(&err) {
                return Err(err);
            }
            if let Some(token) = &self.cancel {
                if token.is_cancelled() {
                    return Err(FractalError::aborted("cancelled while retrying"));
                }
            }
            let delay = self.delay_for(attempt);
            if let Some(max_total) = self.max_total {
                if started.elapsed() + delay > max_total {
                    return Err(err);
                }
            }
            log::debug!(
                "retrying after {:?} (attempt {}/{}): {}",
                delay,
                attempt,
                self.max_attempts,
                err
            );
            tokio::time::sleep(delay).await;
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.factor.max(1.0).powi(attempt.saturating_sub(1) as i32);
        let backoff = self.min_delay.as_secs_f64() * factor;
        let capped = backoff.min(self.max_delay.as_secs_f64());
        let seconds = if self.randomize {
            rand::thread_rng().gen_range(0.0..=capped)
        } else {
            capped
        };
        Duration::from_secs_f64(seconds)
    }
}

/// Connection failures and lock contention are worth retrying; everything
/// else is assumed deterministic.
fn default_predicate(err: &FractalError) -> bool {
    match err {
        FractalError::Connection { .. } => true,
        FractalError::Query { message, .. } => {
            let message = message.to_ascii_lowercase();
            message.contains("locked") || message.contains("busy")
        }
        _ => false,
    }
}

/// Resolution order for the effective policy: operation > collection >
/// database.
pub(crate) fn resolve<'a>(
    collection: Option<&'a RetryPolicy>,
    database: &'a RetryPolicy,
) -> &'a RetryPolicy {
    collection.unwrap_or(database)
}
