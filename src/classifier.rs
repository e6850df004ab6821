//! Request classification: subject extraction and binding lookup.
//!
//! Classification is a plain, lock-free lookup over immutable data. Bindings are
//! grouped by the priority band of the bucket they target and scanned from the
//! most urgent band down; within a band, configured order decides. The first
//! binding with a matching rule wins, and requests matching nothing land in the
//! extra bucket.

use crate::bucket::{Bucket, BucketBinding, PriorityBand, RuleField};
use crate::config::FilterConfig;
use std::collections::HashMap;
use std::sync::Arc;

/// Request attributes bindings are evaluated against.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Subject {
    pub user: String,
    pub namespace: String,
    pub verb: String,
}

impl Subject {
    pub fn new(
        user: impl Into<String>,
        namespace: impl Into<String>,
        verb: impl Into<String>,
    ) -> Self {
        Self { user: user.into(), namespace: namespace.into(), verb: verb.into() }
    }

    /// Value of one attribute.
    pub fn field(&self, field: RuleField) -> &str {
        match field {
            RuleField::User => &self.user,
            RuleField::Namespace => &self.namespace,
            RuleField::Verb => &self.verb,
        }
    }
}

impl BucketBinding {
    /// True when any rule matches the subject. A binding without rules never matches.
    pub fn matches(&self, subject: &Subject) -> bool {
        self.rules
            .iter()
            .any(|rule| rule.values.iter().any(|value| value == subject.field(rule.field)))
    }
}

/// Extracts a [`Subject`] from a request.
pub trait SubjectExtractor<Request>: Clone {
    fn extract(&self, req: &Request) -> Subject;
}

impl<F, Request> SubjectExtractor<Request> for F
where
    F: Fn(&Request) -> Subject + Clone,
{
    fn extract(&self, req: &Request) -> Subject {
        (self)(req)
    }
}

/// Maps a subject to the bucket it is admitted under.
pub trait Classifier: Send + Sync + std::fmt::Debug {
    fn classify(&self, subject: &Subject) -> Arc<Bucket>;
}

/// Classifier backed by ordered [`BucketBinding`]s.
#[derive(Debug, Clone)]
pub struct BindingClassifier {
    bindings: Vec<(BucketBinding, Arc<Bucket>)>,
    extra: Arc<Bucket>,
}

impl BindingClassifier {
    /// Build from bindings and the full bucket set. Bindings pointing at unknown
    /// buckets are skipped; validated configuration never contains them.
    pub fn new(buckets: &[Arc<Bucket>], bindings: &[BucketBinding], extra: Arc<Bucket>) -> Self {
        let by_name: HashMap<&str, &Arc<Bucket>> =
            buckets.iter().map(|bucket| (bucket.name(), bucket)).collect();

        let mut resolved: Vec<(BucketBinding, Arc<Bucket>)> = bindings
            .iter()
            .filter_map(|binding| {
                by_name
                    .get(binding.bucket_name())
                    .map(|bucket| (binding.clone(), Arc::clone(bucket)))
            })
            .collect();
        // Stable: configured order survives within a band.
        resolved.sort_by_key(|(_, bucket)| bucket.priority());

        Self { bindings: resolved, extra }
    }

    /// Build from configuration alone.
    pub fn from_config(config: &FilterConfig) -> Self {
        let buckets: Vec<Arc<Bucket>> = config.all_buckets().into_iter().map(Arc::new).collect();
        let extra = buckets
            .iter()
            .find(|bucket| bucket.is_extra())
            .cloned()
            .unwrap_or_else(|| Arc::new(Bucket::extra(config.extra_shared_quota())));
        Self::new(&buckets, config.bindings(), extra)
    }

    /// The fallback bucket.
    pub fn extra(&self) -> &Arc<Bucket> {
        &self.extra
    }

    /// Bindings in evaluation order with the band each one routes to.
    pub fn evaluation_order(&self) -> impl Iterator<Item = (&BucketBinding, PriorityBand)> {
        self.bindings.iter().map(|(binding, bucket)| (binding, bucket.priority()))
    }
}

impl Classifier for BindingClassifier {
    fn classify(&self, subject: &Subject) -> Arc<Bucket> {
        self.bindings
            .iter()
            .find(|(binding, _)| binding.matches(subject))
            .map(|(_, bucket)| Arc::clone(bucket))
            .unwrap_or_else(|| Arc::clone(&self.extra))
    }
}

#[cfg(feature = "http")]
pub use self::http_subject::HeaderSubject;

#[cfg(feature = "http")]
mod http_subject {
    use super::{Subject, SubjectExtractor};

    /// Reads the user and namespace from request headers and the verb from the method.
    ///
    /// Defaults to the `USER` and `NAMESPACE` headers. Missing or non-UTF-8 headers
    /// yield empty strings, which only match rules listing `""`.
    #[derive(Debug, Clone)]
    pub struct HeaderSubject {
        user_header: http::HeaderName,
        namespace_header: http::HeaderName,
    }

    impl Default for HeaderSubject {
        fn default() -> Self {
            Self {
                user_header: http::HeaderName::from_static("user"),
                namespace_header: http::HeaderName::from_static("namespace"),
            }
        }
    }

    impl HeaderSubject {
        pub fn new(user_header: http::HeaderName, namespace_header: http::HeaderName) -> Self {
            Self { user_header, namespace_header }
        }

        fn header<B>(req: &http::Request<B>, name: &http::HeaderName) -> String {
            req.headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default()
                .to_string()
        }
    }

    impl<B> SubjectExtractor<http::Request<B>> for HeaderSubject {
        fn extract(&self, req: &http::Request<B>) -> Subject {
            Subject {
                user: Self::header(req, &self.user_header),
                namespace: Self::header(req, &self.namespace_header),
                verb: req.method().as_str().to_string(),
            }
        }
    }

}
