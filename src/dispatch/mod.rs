//! Keyed dispatch of outbound HTTP requests.
//!
//! A [`KeyedDispatcher`] derives a key from every request, waits on that
//! key's token bucket and then hands the request to a [`Transport`].

mod dispatcher;
mod trace;
mod transport;

pub use dispatcher::KeyedDispatcher;
pub use trace::{ChannelSink, DispatchRecord, TraceSink, TracingSink};
pub use transport::{build_client, Transport};
