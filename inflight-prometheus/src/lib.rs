//! Prometheus metrics sink for `inflight`.
//! Bring your own `prometheus::Registry`; counters are registered and incremented.

use inflight::telemetry::{AdmissionEvent, TelemetrySink};
use prometheus::{IntCounterVec, Registry};
use std::convert::Infallible;
use std::future::{ready, Ready};
use std::sync::Arc;
use std::task::{Context, Poll};

/// Name of the counter family.
pub const METRIC_NAME: &str = "inflight_admission_events_total";

#[derive(Clone, Debug)]
pub struct PrometheusSink {
    registry: Arc<Registry>,
    counter: IntCounterVec,
}

impl PrometheusSink {
    /// Create a sink and register counters into the provided registry.
    ///
    /// # Errors
    /// Returns an error if the metric cannot be registered (e.g. name conflict).
    pub fn new<R: Into<Arc<Registry>>>(registry: R) -> Result<Self, prometheus::Error> {
        let registry = registry.into();
        let counter = IntCounterVec::new(
            prometheus::Opts::new(METRIC_NAME, "Admission events by bucket"),
            &["bucket", "event"],
        )?;
        registry.register(Box::new(counter.clone()))?;
        tracing::debug!(metric = METRIC_NAME, "registered admission event counter");
        Ok(Self { registry, counter })
    }

    /// Expose the registry for HTTP scraping.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Current count for one bucket and event kind.
    pub fn count(&self, bucket: &str, event: &str) -> u64 {
        self.counter.with_label_values(&[bucket, event]).get()
    }
}

impl tower_service::Service<AdmissionEvent> for PrometheusSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: AdmissionEvent) -> Self::Future {
        self.counter.with_label_values(&[event.bucket(), event.kind()]).inc();
        ready(Ok(()))
    }
}

impl TelemetrySink for PrometheusSink {
    type SinkError = Infallible;
}
