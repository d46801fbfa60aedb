//! Token bucket rate limiting and per-key limiter handles.

mod bucket;
mod limiter;
mod origin;

pub use bucket::{Admission, Cancelled, Rate, TokenBucket};
pub use limiter::{Limiter, LimiterDefaults, LimiterMap};
pub use origin::{origin, target_origin};
