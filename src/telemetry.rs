//! Admission telemetry.
//!
//! The controller reports each step of a request's admission as an
//! [`AdmissionEvent`]. Events flow into a sink, which is any
//! `tower::Service<AdmissionEvent, Response = ()>`: the built-ins log them
//! ([`LogSink`]), keep them in memory for tests ([`MemorySink`]) or drop them
//! ([`NullSink`]). Emission is best-effort. A sink that is not ready or fails
//! loses the event and never affects the request.
//!
//! ```rust
//! use inflight::telemetry::{AdmissionEvent, MemorySink};
//! use inflight::PriorityBand;
//! use tower::Service;
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let mut sink = MemorySink::new();
//! sink.call(AdmissionEvent::Admitted {
//!     bucket: "system".into(),
//!     band: PriorityBand::Top,
//!     waited: Duration::from_millis(3),
//! })
//! .await
//! .unwrap();
//! assert_eq!(sink.len(), 1);
//! # }
//! ```

use crate::bucket::PriorityBand;
use crate::lock;
use std::convert::Infallible;
use std::fmt;
use std::future::{ready, Ready};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tower::util::BoxCloneService;
use tower::{BoxError, Service, ServiceExt};

/// A telemetry sink that consumes admission events.
pub trait TelemetrySink:
    Service<AdmissionEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + Sync + 'static;
}

/// Type-erased sink held by the controller.
pub type BoxSink = BoxCloneService<AdmissionEvent, (), BoxError>;

/// Erase a sink's type.
pub fn boxed<S>(sink: S) -> BoxSink
where
    S: TelemetrySink,
    S::Future: Send + 'static,
{
    BoxCloneService::new(sink.map_err(|e| Box::new(e) as BoxError))
}

/// Best-effort emit helper that honors `poll_ready` and swallows errors.
pub async fn emit_best_effort<S>(sink: S, event: AdmissionEvent)
where
    S: Service<AdmissionEvent, Response = ()>,
{
    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}

/// One step in the admission of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionEvent {
    /// The request joined its bucket's queue.
    Enqueued { bucket: String, band: PriorityBand, waiting: usize },
    /// Quota arrived and the request may proceed.
    Admitted { bucket: String, band: PriorityBand, waited: Duration },
    /// The waitlist was full; the request was shed immediately.
    Rejected { bucket: String, band: PriorityBand, waiting: usize, max: usize },
    /// No quota arrived within the admission timeout.
    TimedOut { bucket: String, band: PriorityBand, waited: Duration },
    /// An admitted request finished and its quota was released.
    Completed { bucket: String, band: PriorityBand, held: Duration },
}

impl AdmissionEvent {
    /// Bucket the request was classified into.
    pub fn bucket(&self) -> &str {
        match self {
            Self::Enqueued { bucket, .. }
            | Self::Admitted { bucket, .. }
            | Self::Rejected { bucket, .. }
            | Self::TimedOut { bucket, .. }
            | Self::Completed { bucket, .. } => bucket,
        }
    }

    pub fn band(&self) -> PriorityBand {
        match self {
            Self::Enqueued { band, .. }
            | Self::Admitted { band, .. }
            | Self::Rejected { band, .. }
            | Self::TimedOut { band, .. }
            | Self::Completed { band, .. } => *band,
        }
    }

    /// Stable lowercase name, used as a metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Enqueued { .. } => "enqueued",
            Self::Admitted { .. } => "admitted",
            Self::Rejected { .. } => "rejected",
            Self::TimedOut { .. } => "timed_out",
            Self::Completed { .. } => "completed",
        }
    }
}

impl fmt::Display for AdmissionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Enqueued { bucket, band, waiting } => {
                write!(f, "Enqueued({}@{}, waiting={})", bucket, band, waiting)
            }
            Self::Admitted { bucket, band, waited } => {
                write!(f, "Admitted({}@{}, waited={:?})", bucket, band, waited)
            }
            Self::Rejected { bucket, band, waiting, max } => {
                write!(f, "Rejected({}@{}, {}/{})", bucket, band, waiting, max)
            }
            Self::TimedOut { bucket, band, waited } => {
                write!(f, "TimedOut({}@{}, waited={:?})", bucket, band, waited)
            }
            Self::Completed { bucket, band, held } => {
                write!(f, "Completed({}@{}, held={:?})", bucket, band, held)
            }
        }
    }
}

/// A no-op telemetry sink that discards all events.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<AdmissionEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: AdmissionEvent) -> Self::Future {
        ready(Ok(()))
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// A telemetry sink that logs events using the `tracing` crate.
///
/// Rejections and timeouts log at DEBUG, everything else at TRACE.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<AdmissionEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: AdmissionEvent) -> Self::Future {
        match event {
            AdmissionEvent::Rejected { .. } | AdmissionEvent::TimedOut { .. } => {
                tracing::debug!(bucket = event.bucket(), event = %event, "admission_event");
            }
            _ => tracing::trace!(bucket = event.bucket(), event = %event, "admission_event"),
        }
        ready(Ok(()))
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// A telemetry sink that stores events in memory.
///
/// Bounded: once full, the oldest event is evicted for each new one.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<AdmissionEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    /// Creates a bounded memory sink (default cap: 10,000).
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    /// Creates a bounded memory sink with explicit capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Returns a snapshot of all events received so far.
    pub fn events(&self) -> Vec<AdmissionEvent> {
        lock(&self.events).clone()
    }

    /// Number of stored events of one kind, e.g. `"rejected"`.
    pub fn count(&self, kind: &str) -> usize {
        lock(&self.events).iter().filter(|event| event.kind() == kind).count()
    }

    /// Clears all stored events.
    pub fn clear(&self) {
        lock(&self.events).clear();
    }

    pub fn len(&self) -> usize {
        lock(&self.events).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.events).is_empty()
    }

    /// Returns the number of evicted events.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<AdmissionEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: AdmissionEvent) -> Self::Future {
        let mut guard = lock(&self.events);
        if guard.len() >= self.capacity {
            guard.remove(0);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push(event);
        ready(Ok(()))
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}
