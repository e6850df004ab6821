#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # inflight
//!
//! Priority-banded admission control for async services: each request waits for
//! a unit of quota before it runs, and quota is handed out by urgency and weight.
//!
//! ## Model
//!
//! - **Buckets** own two allotments. *Reserved* quota serves only the bucket's own
//!   requests; *shared* quota is pooled within the bucket's priority band and may
//!   be borrowed by any more urgent band.
//! - **Bindings** classify a request (user, namespace, verb) into a bucket.
//!   Requests no binding matches fall into the built-in extra bucket in the
//!   lowest band.
//! - Waiting requests queue per band; within a band, buckets are picked at random
//!   in proportion to their weight.
//! - The number of waiting requests is capped. Beyond the cap, or after the
//!   admission timeout, requests are shed with an overload error (HTTP 429).
//!
//! ## Quick Start
//!
//! ```rust
//! use inflight::{
//!     AdmissionController, Bucket, BucketBinding, FilterConfig, PriorityBand, RuleField, Subject,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = FilterConfig::new(
//!         vec![
//!             Bucket::new("system", PriorityBand::Top).reserved(2).shared(4),
//!             Bucket::new("batch", PriorityBand::Low).shared(8).weight(0.5),
//!         ],
//!         vec![
//!             BucketBinding::to("system").rule(RuleField::User, ["admin"]),
//!             BucketBinding::to("batch").rule(RuleField::Namespace, ["jobs"]),
//!         ],
//!     );
//!     let controller = AdmissionController::new(config).expect("valid config");
//!
//!     let admin = Subject::new("admin", "kube-system", "GET");
//!     let result = controller
//!         .call(&admin, async { Ok::<_, std::io::Error>("handled") })
//!         .await;
//!     assert_eq!(result.unwrap(), "handled");
//!
//!     controller.shutdown().await;
//! }
//! ```
//!
//! As tower middleware, wrap a service in [`AdmissionLayer`] with a
//! [`SubjectExtractor`]; any `Fn(&Request) -> Subject` closure qualifies, and
//! [`HeaderSubject`] reads `http::Request` headers.

pub mod bucket;
pub mod classifier;
pub mod config;
pub mod drainer;
pub mod error;
pub mod filter;
pub mod manager;
pub mod producer;
pub mod queue;
pub mod telemetry;

use std::sync::{Mutex, MutexGuard, PoisonError};

// Re-exports
pub use bucket::{
    Bucket, BucketBinding, BucketReference, BindingRule, PriorityBand, RuleField,
    EXTRA_BUCKET_NAME,
};
#[cfg(feature = "http")]
pub use classifier::HeaderSubject;
pub use classifier::{BindingClassifier, Classifier, Subject, SubjectExtractor};
pub use config::{ConfigError, FilterConfig};
pub use drainer::{DrainerStats, QueueDrainer};
pub use error::AdmissionError;
pub use filter::{
    Admission, AdmissionController, AdmissionControllerBuilder, AdmissionLayer, AdmissionService,
};
#[cfg(feature = "http")]
pub use filter::respond_to_rejections;
pub use manager::{QuotaKind, QuotaNotification};
pub use producer::{QuotaPermit, QuotaPool};
pub use queue::WeightedQueue;
pub use telemetry::{AdmissionEvent, LogSink, MemorySink, NullSink, TelemetrySink};

/// Lock a mutex, recovering the data if a holder panicked. Every critical
/// section in this crate leaves its data consistent before it can panic.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
