use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::sleep;
use tracing::warn;

/// Exponent is capped so the shift can never overflow; the delay cap applies first anyway.
const MAX_EXPONENT: u32 = 16;

/// Bounded exponential backoff with additive jitter.
///
/// Delay before retry `n` (1-based) is `min(base * 2^(n-1), max_delay)` plus a
/// uniform jitter in `[0, jitter)`.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: Duration,
    rng: Arc<Mutex<StdRng>>,
}

#[derive(Debug)]
pub enum RetryError<E> {
    /// Every attempt failed with a retryable error.
    Exhausted { attempts: u32, last: E },
    /// The error was not retryable; no further attempts were made.
    Rejected { attempts: u32, error: E },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } | RetryError::Rejected { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Rejected { error, .. } => error,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration, jitter: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            jitter,
            rng: Arc::new(Mutex::new(StdRng::from_entropy())),
        }
    }

    /// No waiting between attempts; used where timing is driven elsewhere.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO, Duration::ZERO, Duration::ZERO)
    }

    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = Arc::new(Mutex::new(rng));
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(MAX_EXPONENT);
        let base = self
            .base_delay
            .saturating_mul(1 << exponent)
            .min(self.max_delay);
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return base;
        }
        let jitter = {
            let mut rng = self.rng.lock();
            Duration::from_millis(rng.gen_range(0..jitter_ms))
        };
        base + jitter
    }

    /// Runs `operation` until it succeeds, returns a non-retryable error, or
    /// the attempt budget is spent. The closure receives the 1-based attempt.
    pub async fn run<T, E, F, Fut, P>(
        &self,
        mut operation: F,
        is_retryable: P,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: Display,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) if !is_retryable(&error) => {
                    return Err(RetryError::Rejected {
                        attempts: attempt,
                        error,
                    })
                }
                Err(last) if attempt >= self.max_attempts => {
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last,
                    })
                }
                Err(err) => {
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        target: "retry",
                        error = %err,
                        attempt,
                        max_attempts = self.max_attempts,
                        "attempt failed; retrying after {:?}",
                        delay
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}
