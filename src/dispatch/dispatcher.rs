//! Keyed request dispatcher.

use std::fmt;
use std::future::{pending, Future};
use std::hash::Hash;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use reqwest::{Client, Request, Response};
use tokio::time::Instant;
use tracing::{debug, instrument, trace, warn};

use super::trace::{DispatchRecord, TraceQueue, TraceSink};
use super::transport::{build_client, Transport};
use crate::config::TransportConfig;
use crate::error::{RatelimError, Result};
use crate::ratelimit::{target_origin, Limiter, LimiterDefaults, LimiterMap};

type KeyFn<K> = dyn Fn(&Request) -> K + Send + Sync;

/// Records buffered for the trace sink before new ones are dropped.
const TRACE_QUEUE_CAPACITY: usize = 1024;

/// Sends requests through a per-key token bucket before handing them to a
/// transport.
///
/// Each request is mapped to a key by the key function. The first request
/// for a key creates its limiter from the current defaults; later requests
/// for the same key share it. Requests for different keys never wait on
/// each other.
pub struct KeyedDispatcher<K, T = Client> {
    /// Parameters for limiters created from now on
    defaults: RwLock<LimiterDefaults>,
    /// Maps a request to its limiter key
    key_fn: Box<KeyFn<K>>,
    /// One limiter per key seen so far
    limiters: LimiterMap<K>,
    /// Where admitted requests go
    transport: T,
    /// Deadline for requests that do not carry their own timeout
    request_timeout: Option<Duration>,
    /// Queue in front of the optional trace sink
    sink: Option<TraceQueue<K>>,
}

impl<K, T> KeyedDispatcher<K, T>
where
    K: Eq + Hash + Clone + fmt::Display + Send + Sync + 'static,
    T: Transport,
{
    /// Create a dispatcher.
    pub fn new<F>(defaults: LimiterDefaults, key_fn: F, transport: T) -> Self
    where
        F: Fn(&Request) -> K + Send + Sync + 'static,
    {
        Self {
            defaults: RwLock::new(defaults),
            key_fn: Box::new(key_fn),
            limiters: LimiterMap::new(),
            transport,
            request_timeout: None,
            sink: None,
        }
    }

    /// Attach a sink that receives one record per forwarded request.
    ///
    /// The sink runs on its own thread behind a bounded queue, so it never
    /// delays a dispatch. If that thread cannot be started, tracing stays
    /// off.
    pub fn with_trace_sink<S>(mut self, sink: S) -> Self
    where
        S: TraceSink<K> + 'static,
    {
        match TraceQueue::spawn(Box::new(sink), TRACE_QUEUE_CAPACITY) {
            Ok(queue) => self.sink = Some(queue),
            Err(err) => warn!(error = %err, "Failed to start trace sink thread, tracing disabled"),
        }
        self
    }

    /// Deadline applied to requests that have no timeout of their own.
    ///
    /// Like a per-request timeout, it covers the admission wait and the
    /// transport together.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Deadline applied to requests without their own timeout, if any.
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }

    /// Defaults used for keys seen for the first time.
    pub fn defaults(&self) -> LimiterDefaults {
        *self.defaults.read()
    }

    /// Change the defaults for keys seen from now on. Existing limiters keep
    /// their settings.
    pub fn set_defaults(&self, defaults: LimiterDefaults) {
        let mut current = self.defaults.write();
        *current = defaults;
    }

    /// Key the request is limited under.
    pub fn key(&self, request: &Request) -> K {
        (self.key_fn)(request)
    }

    /// Limiter for the request's key, created from the defaults if needed.
    pub fn limiter(&self, request: &Request) -> Limiter {
        self.limiter_for_key(self.key(request))
    }

    /// All limiters created so far, by key.
    pub fn limiters(&self) -> &LimiterMap<K> {
        &self.limiters
    }

    /// The underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn limiter_for_key(&self, key: K) -> Limiter {
        let defaults = self.defaults();
        let (limiter, existed) = self.limiters.load_or_store(key.clone(), defaults.build());
        if !existed {
            debug!(
                key = %key,
                capacity = defaults.capacity,
                rate = %defaults.rate,
                "Creating new limiter"
            );
        }
        limiter
    }

    /// Wait for admission, then forward the request.
    ///
    /// The request's timeout, or the dispatcher's request timeout when the
    /// request has none, bounds the admission wait. Whatever is left of it
    /// after admission is passed on to the transport.
    pub async fn dispatch(&self, request: Request) -> Result<Response> {
        self.dispatch_with_cancel(request, pending()).await
    }

    /// Like [`dispatch`](Self::dispatch), but the admission wait is also
    /// abandoned as soon as `cancel` completes.
    ///
    /// A cancelled request is never forwarded and leaves its limiter as it
    /// was. Once forwarded, a request can no longer be cancelled here.
    #[instrument(
        skip(self, request, cancel),
        fields(method = %request.method(), url = %request.url())
    )]
    pub async fn dispatch_with_cancel<F>(&self, mut request: Request, cancel: F) -> Result<Response>
    where
        F: Future<Output = ()> + Send,
    {
        let key = self.key(&request);
        let limiter = self.limiter_for_key(key.clone());

        let started_at = Utc::now();
        let start = Instant::now();
        let timeout = request.timeout().copied().or(self.request_timeout);

        let cancelled = async move {
            let deadline = async {
                match timeout {
                    Some(timeout) => tokio::time::sleep(timeout).await,
                    None => pending().await,
                }
            };
            tokio::select! {
                _ = cancel => {}
                _ = deadline => {}
            }
        };

        let wait = match limiter.wait(1, cancelled).await {
            Ok(wait) => wait,
            Err(_) => {
                debug!(key = %key, "Admission cancelled");
                return Err(RatelimError::Cancelled {
                    key: key.to_string(),
                });
            }
        };

        trace!(key = %key, wait_ms = wait.as_millis() as u64, "Request admitted");

        if let Some(timeout) = timeout {
            *request.timeout_mut() = Some(timeout.saturating_sub(wait));
        }

        let method = request.method().clone();
        let url = request.url().clone();
        let result = self.transport.send(request).await;

        if let Some(sink) = &self.sink {
            let total = start.elapsed();
            sink.push(DispatchRecord {
                key,
                started_at,
                wait,
                response: total.saturating_sub(wait),
                total,
                method,
                url,
                status: result.as_ref().ok().map(|response| response.status()),
            });
        }

        result
    }
}

impl<T: Transport> KeyedDispatcher<String, T> {
    /// A dispatcher that limits each target origin separately.
    pub fn per_origin(defaults: LimiterDefaults, transport: T) -> Self {
        Self::new(defaults, target_origin, transport)
    }
}

impl<K> KeyedDispatcher<K, Client>
where
    K: Eq + Hash + Clone + fmt::Display + Send + Sync + 'static,
{
    /// Create a dispatcher over a freshly built default HTTP client.
    pub fn with_default_transport<F>(
        defaults: LimiterDefaults,
        key_fn: F,
        config: &TransportConfig,
    ) -> Result<Self>
    where
        F: Fn(&Request) -> K + Send + Sync + 'static,
    {
        let dispatcher = Self::new(defaults, key_fn, build_client(config)?);
        Ok(match config.request_timeout_secs {
            Some(secs) => dispatcher.with_request_timeout(Duration::from_secs(secs)),
            None => dispatcher,
        })
    }
}

#[async_trait]
impl<K, T> Transport for KeyedDispatcher<K, T>
where
    K: Eq + Hash + Clone + fmt::Display + Send + Sync + 'static,
    T: Transport,
{
    async fn send(&self, request: Request) -> Result<Response> {
        self.dispatch(request).await
    }
}

impl<K, T> fmt::Debug for KeyedDispatcher<K, T>
where
    K: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedDispatcher")
            .field("defaults", &*self.defaults.read())
            .field("limiters", &self.limiters)
            .field("request_timeout", &self.request_timeout)
            .field("trace_sink", &self.sink.is_some())
            .finish()
    }
}
