//! Token bucket implementation.
//!
//! Tokens refill continuously at a fixed rate up to the bucket capacity. An
//! admission of `n` debits `n` tokens. Waiting callers are suspended on the
//! tokio timer rather than polled, and a cancelled wait leaves no trace on
//! the bucket.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::trace;

use crate::error::RatelimError;

/// Used in place of deadlines that would overflow `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);
/// Slack for floating point error when comparing token levels.
const EPSILON: f64 = 1e-9;
/// Shortest retry delay handed out, so a waiter always lets the clock move.
const MIN_RETRY: Duration = Duration::from_nanos(1);

/// Refill rate of a token bucket, in tokens per second.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Rate(f64);

impl Rate {
    /// A rate that admits everything without waiting.
    pub const UNLIMITED: Rate = Rate(f64::INFINITY);

    /// A rate of `tokens` per second. Negative or NaN values become zero;
    /// use `Rate::try_from` to reject them instead.
    pub fn per_second(tokens: f64) -> Self {
        if tokens.is_nan() || tokens < 0.0 {
            Rate(0.0)
        } else {
            Rate(tokens)
        }
    }

    /// One token every `interval`. A zero interval is unlimited.
    pub fn every(interval: Duration) -> Self {
        if interval.is_zero() {
            return Rate::UNLIMITED;
        }
        Rate(1.0 / interval.as_secs_f64())
    }

    /// Tokens per second.
    pub fn as_f64(&self) -> f64 {
        self.0
    }

    /// Whether this is the unlimited sentinel.
    pub fn is_unlimited(&self) -> bool {
        self.0.is_infinite()
    }
}

/// Checked conversion used when reading a rate from configuration.
impl TryFrom<f64> for Rate {
    type Error = RatelimError;

    fn try_from(tokens: f64) -> Result<Self, Self::Error> {
        if tokens.is_nan() || tokens < 0.0 {
            return Err(RatelimError::Config(format!(
                "rate must be a non-negative number of tokens per second, got {}",
                tokens
            )));
        }
        Ok(Rate(tokens))
    }
}

impl From<Rate> for f64 {
    fn from(rate: Rate) -> Self {
        rate.0
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unlimited() {
            write!(f, "unlimited")
        } else {
            write!(f, "{}/s", self.0)
        }
    }
}

/// Outcome of a non-blocking admission attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    /// The tokens were debited.
    Admitted,
    /// Not enough tokens. `retry_after` is the time until they would be
    /// available, or `None` if the bucket will never hold them.
    Denied { retry_after: Option<Duration> },
}

impl Admission {
    /// Whether the tokens were granted.
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }
}

/// Returned by [`TokenBucket::wait`] when the cancellation signal fires first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("rate limiter wait cancelled")]
pub struct Cancelled;

#[derive(Debug)]
struct State {
    /// Current level, always within `[0, capacity]`
    tokens: f64,
    /// Instant the level was last accounted for. While the bucket is full
    /// this is the instant it became full.
    last_refill: Instant,
}

impl State {
    /// Bring the level up to date and return the level the bucket would have
    /// without its capacity ceiling.
    fn refill(&mut self, now: Instant, capacity: f64, rate: f64) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        let accrued = self.tokens + elapsed * rate;

        if accrued < capacity {
            self.tokens = accrued;
            self.last_refill = now;
        } else if self.tokens < capacity {
            let to_full = secs((capacity - self.tokens) / rate);
            self.last_refill = self
                .last_refill
                .checked_add(to_full)
                .map_or(now, |full_at| full_at.min(now));
            self.tokens = capacity;
        }

        accrued
    }
}

/// A token bucket guarding admission for one key.
///
/// The bucket starts full. It is safe to share between tasks; every
/// admission check runs under a short internal lock and never across an
/// await point.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    rate: Rate,
    state: Mutex<State>,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(capacity: u32, rate: Rate) -> Self {
        Self {
            capacity,
            rate,
            state: Mutex::new(State {
                tokens: capacity as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Maximum burst.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Refill rate.
    pub fn rate(&self) -> Rate {
        self.rate
    }

    /// Current level after refill accounting. Nothing is debited.
    pub fn tokens(&self) -> f64 {
        if self.rate.is_unlimited() {
            return self.capacity as f64;
        }
        let mut state = self.state.lock();
        state.refill(Instant::now(), self.capacity as f64, self.rate.as_f64());
        state.tokens
    }

    /// Try to take `n` tokens without waiting.
    ///
    /// A request larger than the capacity is never admitted here; it has to
    /// go through [`wait`](Self::wait).
    pub fn try_admit(&self, n: u32) -> Admission {
        let now = Instant::now();
        self.admit(n, now, deadline(now, self.min_wait(n)))
    }

    /// Wait until `n` tokens are available and take them, or until `cancel`
    /// completes.
    ///
    /// Returns how long the caller was held. On cancellation nothing is
    /// debited, so the bucket behaves as though this call never happened.
    /// Dropping the returned future has the same effect.
    pub async fn wait<F>(&self, n: u32, cancel: F) -> Result<Duration, Cancelled>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(cancel);
        if futures::poll!(cancel.as_mut()).is_ready() {
            return Err(Cancelled);
        }

        let start = Instant::now();
        let not_before = deadline(start, self.min_wait(n));

        loop {
            let retry_after = match self.admit(n, Instant::now(), not_before) {
                Admission::Admitted => return Ok(start.elapsed()),
                Admission::Denied { retry_after } => retry_after,
            };

            trace!(tokens = n, retry_after = ?retry_after, "Waiting for tokens");

            match retry_after {
                Some(delay) => {
                    tokio::select! {
                        biased;
                        _ = cancel.as_mut() => return Err(Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => {
                    cancel.as_mut().await;
                    return Err(Cancelled);
                }
            }
        }
    }

    /// Shortest time a request for `n` tokens is held when `n` exceeds the
    /// capacity: it has to see the surplus refill happen.
    fn min_wait(&self, n: u32) -> Duration {
        let rate = self.rate.as_f64();
        if n <= self.capacity || rate <= 0.0 || self.rate.is_unlimited() {
            return Duration::ZERO;
        }
        secs((n - self.capacity) as f64 / rate)
    }

    fn admit(&self, n: u32, now: Instant, not_before: Instant) -> Admission {
        if self.rate.is_unlimited() {
            return Admission::Admitted;
        }

        let need = n as f64;
        let rate = self.rate.as_f64();
        let mut state = self.state.lock();
        let accrued = state.refill(now, self.capacity as f64, rate);

        if now >= not_before && accrued + EPSILON >= need {
            state.tokens = (state.tokens - need).max(0.0);
            state.last_refill = now;
            return Admission::Admitted;
        }

        if rate <= 0.0 {
            return Admission::Denied { retry_after: None };
        }

        let refill_delay = secs((need - accrued).max(0.0) / rate);
        let retry_after = refill_delay
            .max(not_before.saturating_duration_since(now))
            .max(MIN_RETRY);
        Admission::Denied {
            retry_after: Some(retry_after),
        }
    }
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::MAX)
}

fn deadline(start: Instant, after: Duration) -> Instant {
    start
        .checked_add(after)
        .unwrap_or_else(|| start + FAR_FUTURE)
}
