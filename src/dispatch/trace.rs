//! Per-request dispatch records and the sinks that receive them.

use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{Method, StatusCode};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{info, trace, warn};
use url::Url;

/// Timing of one request that made it through admission.
#[derive(Debug, Clone)]
pub struct DispatchRecord<K> {
    /// Key the request was limited under
    pub key: K,
    /// Wall-clock time the dispatch started
    pub started_at: DateTime<Utc>,
    /// Time spent waiting for admission
    pub wait: Duration,
    /// Time spent in the transport
    pub response: Duration,
    /// Wait plus transport time
    pub total: Duration,
    /// Request method
    pub method: Method,
    /// Request target
    pub url: Url,
    /// Response status, absent when the transport returned an error
    pub status: Option<StatusCode>,
}

/// Receives one record per request that reached the transport.
///
/// The dispatcher calls sinks from a dedicated thread, one record at a time,
/// so a sink may block. A sink that panics loses only the record it was
/// handling.
pub trait TraceSink<K>: Send + Sync {
    /// Accept a record. Failures are the sink's to swallow.
    fn record(&self, record: DispatchRecord<K>);
}

/// Writes each record as a `tracing` event on the `ratelim::trace` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl<K: fmt::Display> TraceSink<K> for TracingSink {
    fn record(&self, record: DispatchRecord<K>) {
        info!(
            target: "ratelim::trace",
            key = %record.key,
            wait_ms = record.wait.as_millis() as u64,
            resp_ms = record.response.as_millis() as u64,
            total_ms = record.total.as_millis() as u64,
            method = %record.method,
            url = %record.url,
            status = record.status.map(|s| s.as_u16()),
            "Request dispatched"
        );
    }
}

/// Hands records to a bounded channel, dropping them when it is full.
#[derive(Debug, Clone)]
pub struct ChannelSink<K> {
    sender: mpsc::Sender<DispatchRecord<K>>,
}

impl<K> ChannelSink<K> {
    /// Wrap an existing sender.
    pub fn new(sender: mpsc::Sender<DispatchRecord<K>>) -> Self {
        Self { sender }
    }

    /// Create a sink together with the receiving end of its channel.
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<DispatchRecord<K>>) {
        let (sender, receiver) = mpsc::channel(buffer);
        (Self::new(sender), receiver)
    }
}

impl<K: Send> TraceSink<K> for ChannelSink<K> {
    fn record(&self, record: DispatchRecord<K>) {
        match self.sender.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(record)) => {
                warn!(url = %record.url, "Trace channel full, dropping dispatch record");
            }
            Err(TrySendError::Closed(_)) => {
                trace!("Trace channel closed");
            }
        }
    }
}

/// Feeds a sink from a bounded queue on its own thread.
///
/// Pushing never blocks: when the queue is full the record is dropped.
/// The thread exits once every handle to the queue is gone and the
/// backlog is drained.
pub(crate) struct TraceQueue<K> {
    queue: ChannelSink<K>,
}

impl<K: Send + 'static> TraceQueue<K> {
    pub(crate) fn spawn(sink: Box<dyn TraceSink<K>>, capacity: usize) -> io::Result<Self> {
        let (queue, mut receiver) = ChannelSink::channel(capacity);

        thread::Builder::new()
            .name("ratelim-trace".to_string())
            .spawn(move || {
                while let Some(record) = receiver.blocking_recv() {
                    if panic::catch_unwind(AssertUnwindSafe(|| sink.record(record))).is_err() {
                        warn!("Trace sink panicked, dispatch record lost");
                    }
                }
                trace!("Trace queue closed");
            })?;

        Ok(Self { queue })
    }

    pub(crate) fn push(&self, record: DispatchRecord<K>) {
        self.queue.record(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn record(key: &str) -> DispatchRecord<String> {
        DispatchRecord {
            key: key.to_string(),
            started_at: Utc::now(),
            wait: Duration::from_millis(200),
            response: Duration::from_millis(50),
            total: Duration::from_millis(250),
            method: Method::GET,
            url: Url::parse("https://example.com/a").unwrap(),
            status: Some(StatusCode::OK),
        }
    }

    #[test]
    fn test_tracing_sink_accepts_records() {
        let sink = TracingSink;
        sink.record(record("https://example.com"));
        sink.record(DispatchRecord {
            status: None,
            ..record("https://example.com")
        });
    }

    #[tokio::test]
    async fn test_channel_sink_delivers() {
        let (sink, mut receiver) = ChannelSink::channel(4);
        sink.record(record("a"));

        let received = receiver.recv().await.unwrap();
        assert_eq!(received.key, "a");
        assert_eq!(received.total, Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_channel_sink_drops_when_full() {
        let (sink, mut receiver) = ChannelSink::channel(1);
        sink.record(record("first"));
        sink.record(record("second"));

        assert_eq!(receiver.recv().await.unwrap().key, "first");
        assert!(receiver.try_recv().is_err());
    }

    struct PanicOnce {
        panicked: AtomicBool,
        inner: ChannelSink<String>,
    }

    impl TraceSink<String> for PanicOnce {
        fn record(&self, record: DispatchRecord<String>) {
            if !self.panicked.swap(true, Ordering::SeqCst) {
                panic!("sink failure");
            }
            self.inner.record(record);
        }
    }

    #[tokio::test]
    async fn test_trace_queue_survives_panicking_sink() {
        let (inner, mut receiver) = ChannelSink::channel(4);
        let queue = TraceQueue::spawn(
            Box::new(PanicOnce {
                panicked: AtomicBool::new(false),
                inner,
            }),
            4,
        )
        .unwrap();

        queue.push(record("lost"));
        queue.push(record("kept"));
        drop(queue);

        assert_eq!(receiver.recv().await.unwrap().key, "kept");
        assert!(receiver.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_channel_sink_survives_closed_channel() {
        let (sink, receiver) = ChannelSink::channel(1);
        drop(receiver);
        sink.record(record("orphan"));
    }
}
