//! The admission filter: controller, admission guard and tower middleware.
//!
//! Per request the controller classifies the subject into a bucket, queues it
//! with the drainer and waits for a unit of quota, bounded by the admission
//! timeout. The unit travels with the request as an [`Admission`] and returns to
//! its pool when the admission is dropped, on every exit path of the wrapped
//! work. A request that times out, or whose future is dropped while queued,
//! withdraws its slot; a grant that raced in is released with the receiver.
//!
//! ```rust
//! use inflight::{AdmissionController, Bucket, FilterConfig, PriorityBand, Subject};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let config = FilterConfig::new(vec![Bucket::new("system", PriorityBand::Top).reserved(2)], vec![]);
//! let controller = AdmissionController::new(config).unwrap();
//!
//! let subject = Subject::new("alice", "default", "GET");
//! let answer = controller.call(&subject, async { Ok::<_, std::io::Error>(42) }).await.unwrap();
//! assert_eq!(answer, 42);
//! controller.shutdown().await;
//! # }
//! ```

use crate::bucket::Bucket;
use crate::classifier::{BindingClassifier, Classifier, Subject, SubjectExtractor};
use crate::config::{ConfigError, FilterConfig};
use crate::drainer::{DrainerStats, EnqueueError, QueueDrainer, Waiter};
use crate::error::AdmissionError;
use crate::lock;
use crate::manager::{ReservedQuotaManager, SharedQuotaManager};
use crate::producer::QuotaPermit;
use crate::telemetry::{boxed, emit_best_effort, AdmissionEvent, BoxSink, NullSink, TelemetrySink};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tower_layer::Layer;
use tower_service::Service;
use tracing::{debug, info, warn};

/// Builder for [`AdmissionController`].
pub struct AdmissionControllerBuilder {
    config: FilterConfig,
    classifier: Option<Arc<dyn Classifier>>,
    sink: BoxSink,
}

impl fmt::Debug for AdmissionControllerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionControllerBuilder")
            .field("config", &self.config)
            .field("classifier", &self.classifier)
            .finish_non_exhaustive()
    }
}

impl AdmissionControllerBuilder {
    /// Replace the binding-based classifier.
    pub fn classifier<C: Classifier + 'static>(mut self, classifier: C) -> Self {
        self.classifier = Some(Arc::new(classifier));
        self
    }

    /// Send admission events to `sink`.
    pub fn sink<S>(mut self, sink: S) -> Self
    where
        S: TelemetrySink,
        S::Future: Send + 'static,
    {
        self.sink = boxed(sink);
        self
    }

    /// Validate the configuration and assemble the controller. Background
    /// tasks start on first use or on [`AdmissionController::start`].
    pub fn build(self) -> Result<AdmissionController, ConfigError> {
        self.config.validate()?;
        let config = self.config;

        let buckets: Vec<Arc<Bucket>> = config.all_buckets().into_iter().map(Arc::new).collect();
        let classifier = match self.classifier {
            Some(classifier) => classifier,
            None => Arc::new(BindingClassifier::from_config(&config)) as Arc<dyn Classifier>,
        };
        let reserved = ReservedQuotaManager::new(&buckets);
        let shared = SharedQuotaManager::new(&buckets);
        let drainer = Arc::new(QueueDrainer::new(
            &buckets,
            config.max_waiting(),
            config.idle_backoff(),
            reserved.key_count() + shared.key_count(),
        ));

        Ok(AdmissionController {
            inner: Arc::new(Inner {
                classifier,
                drainer,
                reserved,
                shared,
                admission_timeout: config.admission_timeout(),
                idle_backoff: config.idle_backoff(),
                notification_buffer: config.notification_buffer(),
                started: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
                sink: Mutex::new(self.sink),
            }),
        })
    }
}

struct Inner {
    classifier: Arc<dyn Classifier>,
    drainer: Arc<QueueDrainer>,
    reserved: ReservedQuotaManager,
    shared: SharedQuotaManager,
    admission_timeout: Duration,
    idle_backoff: Duration,
    notification_buffer: usize,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    sink: Mutex<BoxSink>,
}

/// Admission control engine. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct AdmissionController {
    inner: Arc<Inner>,
}

impl fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionController")
            .field("classifier", &self.inner.classifier)
            .field("admission_timeout", &self.inner.admission_timeout)
            .field("stats", &self.stats())
            .finish()
    }
}

impl AdmissionController {
    /// Controller with the binding classifier and no telemetry.
    pub fn new(config: FilterConfig) -> Result<Self, ConfigError> {
        Self::builder(config).build()
    }

    pub fn builder(config: FilterConfig) -> AdmissionControllerBuilder {
        AdmissionControllerBuilder { config, classifier: None, sink: boxed(NullSink) }
    }

    /// Spawn the quota producers and the drainer on the current tokio runtime.
    ///
    /// Idempotent. Does nothing after [`AdmissionController::shutdown`].
    ///
    /// # Panics
    /// Panics when called outside a tokio runtime.
    pub fn start(&self) {
        let inner = &self.inner;
        if inner.drainer.is_closed() || inner.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let (tx, rx) = mpsc::channel(inner.notification_buffer);
        let mut tasks = Vec::new();
        tasks.extend(inner.reserved.spawn(tx.clone(), inner.idle_backoff));
        tasks.extend(inner.shared.spawn(tx, inner.idle_backoff));
        tasks.push(tokio::spawn(Arc::clone(&inner.drainer).run(rx)));
        info!(
            producers = tasks.len() - 1,
            max_waiting = inner.drainer.max_waiting(),
            timeout = ?inner.admission_timeout,
            "admission controller started"
        );
        lock(&inner.tasks).extend(tasks);
    }

    /// Fail queued requests, refuse new ones and stop background tasks. Quota
    /// held by admitted requests is released as they finish.
    pub async fn shutdown(&self) {
        self.inner.drainer.close();
        let tasks: Vec<JoinHandle<()>> = lock(&self.inner.tasks).drain(..).collect();
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            if let Err(err) = task.await {
                if !err.is_cancelled() {
                    warn!(error = %err, "admission task failed");
                }
            }
        }
        info!("admission controller shut down");
    }

    /// Bucket a subject would be admitted under.
    pub fn classify(&self, subject: &Subject) -> Arc<Bucket> {
        self.inner.classifier.classify(subject)
    }

    pub fn stats(&self) -> DrainerStats {
        self.inner.drainer.stats()
    }

    /// Wait for quota on behalf of `subject`.
    ///
    /// Resolves to an [`Admission`] holding one unit of quota, or to a rejection:
    /// [`AdmissionError::CapacityExceeded`] immediately when the waitlist is full,
    /// [`AdmissionError::Timeout`] when no quota arrives in time,
    /// [`AdmissionError::Closed`] after shutdown.
    pub async fn admit(&self, subject: &Subject) -> Result<Admission, AdmissionError> {
        self.start();
        let bucket = self.classify(subject);

        let waiter = match self.inner.drainer.enqueue(&bucket) {
            Ok(waiter) => waiter,
            Err(EnqueueError::CapacityExceeded { waiting, max }) => {
                debug!(bucket = bucket.name(), waiting, max, "request rejected: waitlist full");
                self.emit(AdmissionEvent::Rejected {
                    bucket: bucket.name().to_string(),
                    band: bucket.priority(),
                    waiting,
                    max,
                })
                .await;
                return Err(AdmissionError::CapacityExceeded {
                    bucket: bucket.name().to_string(),
                    waiting,
                    max,
                });
            }
            Err(EnqueueError::Closed) => return Err(AdmissionError::Closed),
        };
        let enqueued_at = Instant::now();
        let mut pending = PendingRetractGuard::new(&self.inner.drainer, waiter);
        self.emit(AdmissionEvent::Enqueued {
            bucket: bucket.name().to_string(),
            band: bucket.priority(),
            waiting: self.inner.drainer.waiting(),
        })
        .await;

        let timeout = self.inner.admission_timeout;
        let granted = tokio::select! {
            biased;
            granted = pending.receiver() => Some(granted),
            _ = tokio::time::sleep_until(enqueued_at + timeout) => None,
        };
        let waited = enqueued_at.elapsed();

        match granted {
            Some(Ok(permit)) => {
                pending.disarm();
                self.emit(AdmissionEvent::Admitted {
                    bucket: bucket.name().to_string(),
                    band: bucket.priority(),
                    waited,
                })
                .await;
                Ok(Admission { permit, bucket, waited, admitted_at: Instant::now() })
            }
            Some(Err(_)) => {
                pending.disarm();
                Err(AdmissionError::Closed)
            }
            None => {
                drop(pending);
                debug!(bucket = bucket.name(), waited = ?waited, "request timed out waiting for quota");
                self.emit(AdmissionEvent::TimedOut {
                    bucket: bucket.name().to_string(),
                    band: bucket.priority(),
                    waited,
                })
                .await;
                Err(AdmissionError::Timeout { bucket: bucket.name().to_string(), waited, timeout })
            }
        }
    }

    /// Admit `subject`, then run `work` while holding its quota.
    pub async fn call<T, E, F>(&self, subject: &Subject, work: F) -> Result<T, AdmissionError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        let admission = self.admit(subject).await.map_err(AdmissionError::widen::<E>)?;
        let result = work.await;
        self.complete(admission).await;
        result.map_err(AdmissionError::Inner)
    }

    /// Release an admission and report its completion.
    pub async fn complete(&self, admission: Admission) {
        let event = AdmissionEvent::Completed {
            bucket: admission.bucket.name().to_string(),
            band: admission.bucket.priority(),
            held: admission.admitted_at.elapsed(),
        };
        admission.release();
        self.emit(event).await;
    }

    async fn emit(&self, event: AdmissionEvent) {
        let sink = lock(&self.inner.sink).clone();
        emit_best_effort(sink, event).await;
    }
}

/// Withdraws a queued request when dropped unless disarmed.
struct PendingRetractGuard<'a> {
    drainer: &'a QueueDrainer,
    waiter: Waiter,
    armed: bool,
}

impl<'a> PendingRetractGuard<'a> {
    fn new(drainer: &'a QueueDrainer, waiter: Waiter) -> Self {
        Self { drainer, waiter, armed: true }
    }

    fn receiver(&mut self) -> &mut tokio::sync::oneshot::Receiver<QuotaPermit> {
        &mut self.waiter.rx
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingRetractGuard<'_> {
    fn drop(&mut self) {
        if self.armed && !self.drainer.retract(&self.waiter) {
            // Lost the race with a delivery: the unit is dropped with the receiver.
            debug!(id = self.waiter.id(), bucket = self.waiter.bucket().name(), "grant raced retraction; releasing");
        }
    }
}

/// Permission to run one request, holding one unit of quota.
///
/// Dropping it releases the unit.
#[must_use = "dropping an admission releases its quota immediately"]
#[derive(Debug)]
pub struct Admission {
    permit: QuotaPermit,
    bucket: Arc<Bucket>,
    waited: Duration,
    admitted_at: Instant,
}

impl Admission {
    /// Bucket the request was classified into.
    pub fn bucket(&self) -> &Arc<Bucket> {
        &self.bucket
    }

    /// Time spent queued.
    pub fn waited(&self) -> Duration {
        self.waited
    }

    /// Pool the unit came from, `reserved` or `shared:<band>`.
    pub fn pool(&self) -> &str {
        self.permit.pool_label()
    }

    /// Release the unit now.
    pub fn release(self) {
        drop(self);
    }
}

/// Tower layer that admits each request through an [`AdmissionController`].
#[derive(Clone, Debug)]
pub struct AdmissionLayer<X> {
    controller: AdmissionController,
    extractor: X,
}

impl<X> AdmissionLayer<X> {
    /// `extractor` turns each request into the [`Subject`] it is classified by.
    pub fn new(controller: AdmissionController, extractor: X) -> Self {
        Self { controller, extractor }
    }
}

impl<S, X: Clone> Layer<S> for AdmissionLayer<X> {
    type Service = AdmissionService<S, X>;

    fn layer(&self, service: S) -> Self::Service {
        AdmissionService {
            inner: service,
            controller: self.controller.clone(),
            extractor: self.extractor.clone(),
        }
    }
}

/// Middleware service produced by [`AdmissionLayer`].
#[derive(Clone, Debug)]
pub struct AdmissionService<S, X> {
    inner: S,
    controller: AdmissionController,
    extractor: X,
}

impl<S, X> AdmissionService<S, X> {
    pub fn controller(&self) -> &AdmissionController {
        &self.controller
    }
}

impl<S, X, Req> Service<Req> for AdmissionService<S, X>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    S::Error: Send + 'static,
    X: SubjectExtractor<Req>,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = AdmissionError<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(AdmissionError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let subject = self.extractor.extract(&req);
        let controller = self.controller.clone();
        // Keep the service that was polled ready; leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let admission =
                controller.admit(&subject).await.map_err(AdmissionError::widen::<S::Error>)?;
            let result = inner.call(req).await;
            controller.complete(admission).await;
            result.map_err(AdmissionError::Inner)
        })
    }
}

/// Turn admission rejections into HTTP responses: 429 for shed requests, 503
/// after shutdown. Errors of the wrapped service pass through.
///
/// Meant for `ServiceBuilder::map_result` in front of an [`AdmissionLayer`]:
///
/// ```rust
/// use inflight::{respond_to_rejections, AdmissionController, AdmissionLayer, FilterConfig, HeaderSubject};
/// use tower::{service_fn, ServiceBuilder};
///
/// let controller = AdmissionController::new(FilterConfig::default()).unwrap();
/// let svc = ServiceBuilder::new()
///     .map_result(respond_to_rejections::<String, std::io::Error>)
///     .layer(AdmissionLayer::new(controller, HeaderSubject::default()))
///     .service(service_fn(|_: http::Request<()>| async {
///         Ok::<_, std::io::Error>(http::Response::new(String::from("ok")))
///     }));
/// # drop(svc);
/// ```
#[cfg(feature = "http")]
pub fn respond_to_rejections<B, E>(
    result: Result<http::Response<B>, AdmissionError<E>>,
) -> Result<http::Response<B>, E>
where
    B: From<String>,
    E: fmt::Display,
{
    result.or_else(AdmissionError::into_response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::{BucketBinding, PriorityBand, RuleField};
    use crate::telemetry::MemorySink;

    fn config() -> FilterConfig {
        FilterConfig::new(
            vec![Bucket::new("ops", PriorityBand::Top).reserved(1)],
            vec![BucketBinding::to("ops").rule(RuleField::User, ["admin"])],
        )
        .with_extra_shared_quota(1)
        .with_idle_backoff(Duration::from_millis(2))
    }

    /// Only the reserved unit of `ops` exists, so nothing can borrow it away.
    fn reserved_only() -> FilterConfig {
        config().with_extra_shared_quota(0).with_max_waiting(2)
    }

    #[tokio::test]
    async fn admits_and_releases_through_call() {
        let sink = MemorySink::new();
        let controller = AdmissionController::builder(config()).sink(sink.clone()).build().unwrap();
        let admin = Subject::new("admin", "", "GET");

        let value = controller.call(&admin, async { Ok::<_, std::io::Error>("done") }).await.unwrap();
        assert_eq!(value, "done");
        assert_eq!(sink.count("admitted"), 1);
        assert_eq!(sink.count("completed"), 1);
        assert_eq!(controller.stats().granted, 1);
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn admission_reports_its_origin() {
        let controller = AdmissionController::new(reserved_only()).unwrap();
        let admission = controller.admit(&Subject::new("admin", "", "GET")).await.unwrap();
        assert_eq!(admission.bucket().name(), "ops");
        assert_eq!(admission.pool(), "reserved");
        controller.shutdown().await;

        // Reserved quota cannot serve the extra bucket; only shared quota can.
        let controller = AdmissionController::new(config()).unwrap();
        let admission = controller.admit(&Subject::new("guest", "", "GET")).await.unwrap();
        assert!(admission.bucket().is_extra());
        assert_eq!(admission.pool(), "shared:lowest");
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn inner_errors_pass_through() {
        let controller = AdmissionController::new(config()).unwrap();
        let err = controller
            .call(&Subject::default(), async { Err::<(), _>(std::io::Error::new(std::io::ErrorKind::Other, "inner")) })
            .await
            .unwrap_err();
        assert!(err.is_inner());
        assert_eq!(err.to_string(), "inner");
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_refuses_new_requests() {
        let controller = AdmissionController::new(config()).unwrap();
        controller.start();
        controller.shutdown().await;
        let err = controller.admit(&Subject::default()).await.unwrap_err();
        assert!(err.is_closed());
    }

    #[tokio::test]
    async fn dropping_a_queued_request_withdraws_it() {
        let controller = AdmissionController::new(reserved_only()).unwrap();
        let admin = Subject::new("admin", "", "GET");
        let held = controller.admit(&admin).await.unwrap();

        let queued = {
            let controller = controller.clone();
            let admin = admin.clone();
            tokio::spawn(async move { controller.admit(&admin).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(controller.stats().waiting, 1);

        queued.abort();
        let _ = queued.await;
        assert_eq!(controller.stats().waiting, 0);
        assert_eq!(controller.stats().retracted, 1);

        drop(held);
        controller.shutdown().await;
    }
}
