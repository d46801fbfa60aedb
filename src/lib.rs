//! Ratelim - per-key rate limiting for outbound requests
//!
//! This crate throttles outgoing HTTP requests with one token bucket per
//! derived key, typically the target origin, so that many destinations can
//! be limited at once without one destination holding up another. All state
//! lives in process memory.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod ratelimit;
pub mod registry;

pub use dispatch::{KeyedDispatcher, Transport};
pub use error::{RatelimError, Result};
pub use ratelimit::{Limiter, LimiterDefaults, Rate, TokenBucket};
pub use registry::KeyedRegistry;
