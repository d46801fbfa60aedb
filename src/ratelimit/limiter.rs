//! Shared limiter handles and the defaults used to build them.

use std::ops::Deref;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::bucket::{Rate, TokenBucket};
use crate::registry::KeyedRegistry;

/// Default burst when no specific capacity is configured.
const DEFAULT_CAPACITY: u32 = 1;
/// Default refill rate, in tokens per second, when none is configured.
const DEFAULT_RATE: f64 = 1.0;

/// Registry of limiters, one per key.
pub type LimiterMap<K> = KeyedRegistry<K, Limiter>;

/// Parameters for buckets created for keys seen for the first time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LimiterDefaults {
    /// Maximum burst
    #[serde(default = "default_capacity")]
    pub capacity: u32,

    /// Refill rate in tokens per second
    #[serde(default = "default_rate")]
    pub rate: Rate,
}

impl LimiterDefaults {
    /// Defaults with the given capacity and rate.
    pub fn new(capacity: u32, rate: Rate) -> Self {
        Self { capacity, rate }
    }

    /// Defaults that never hold a request back.
    pub fn unlimited() -> Self {
        Self {
            capacity: 0,
            rate: Rate::UNLIMITED,
        }
    }

    /// Build a fresh, full limiter from these parameters.
    pub fn build(&self) -> Limiter {
        Limiter::new(self.capacity, self.rate)
    }
}

impl Default for LimiterDefaults {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            rate: default_rate(),
        }
    }
}

fn default_capacity() -> u32 {
    DEFAULT_CAPACITY
}

fn default_rate() -> Rate {
    Rate::per_second(DEFAULT_RATE)
}

/// A cheaply cloneable handle to a [`TokenBucket`].
///
/// Two handles are equal only when they point at the same bucket. Buckets
/// with identical settings but separate state are different limiters, so
/// the registry's compare operations work by identity for this type.
#[derive(Debug, Clone)]
pub struct Limiter(Arc<TokenBucket>);

impl Limiter {
    /// Create a handle to a new, full bucket.
    pub fn new(capacity: u32, rate: Rate) -> Self {
        Self(Arc::new(TokenBucket::new(capacity, rate)))
    }

    /// Whether both handles refer to the same bucket.
    pub fn same_bucket(&self, other: &Limiter) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Deref for Limiter {
    type Target = TokenBucket;

    fn deref(&self) -> &TokenBucket {
        &self.0
    }
}

impl From<TokenBucket> for Limiter {
    fn from(bucket: TokenBucket) -> Self {
        Self(Arc::new(bucket))
    }
}

impl PartialEq for Limiter {
    fn eq(&self, other: &Self) -> bool {
        self.same_bucket(other)
    }
}

impl Eq for Limiter {}
