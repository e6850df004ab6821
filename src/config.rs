//! Filter configuration: buckets, bindings and engine tuning.
//!
//! Configuration is plain serde data. The field names match the bucket and binding
//! documents used by operators (`reservedQuota`, `sharedQuota`, `bucketRef`, ...), so
//! a single YAML or JSON document can carry everything:
//!
//! ```yaml
//! buckets:
//!   - name: system
//!     reservedQuota: 2
//!     sharedQuota: 8
//!     weight: 2
//!     priority: 0
//! bindings:
//!   - rules:
//!       - field: user.name
//!         values: ["admin"]
//!     bucketRef:
//!       name: system
//! admissionTimeoutMs: 60000
//! ```
//!
//! Every loader validates before returning; a [`FilterConfig`] obtained from
//! [`FilterConfig::from_yaml_str`], [`FilterConfig::from_json_str`],
//! [`FilterConfig::from_path`] or [`FilterConfig::from_dir`] is ready to use.

use crate::bucket::{Bucket, BucketBinding, DEFAULT_EXTRA_SHARED_QUOTA, EXTRA_BUCKET_NAME};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

const DEFAULT_ADMISSION_TIMEOUT_MS: u64 = 10 * 60 * 1000;
const DEFAULT_IDLE_BACKOFF_MS: u64 = 20;
const DEFAULT_NOTIFICATION_BUFFER: usize = 64;

/// Errors produced while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("bucket name must not be empty")]
    EmptyBucketName,
    #[error("duplicate bucket '{0}'")]
    DuplicateBucket(String),
    #[error("bucket name '{0}' is reserved for unmatched traffic")]
    ReservedBucketName(String),
    #[error("bucket '{name}' has invalid weight {weight} (must be finite and > 0)")]
    InvalidWeight { name: String, weight: f64 },
    #[error("bucket '{0}' cannot be assigned to the lowest priority band")]
    LowestBandAssigned(String),
    #[error("binding #{index} references unknown bucket '{name}'")]
    UnknownBucket { index: usize, name: String },
    #[error("{0} must be greater than zero")]
    ZeroSetting(&'static str),
    #[error("admission ceiling is zero: configure shared quota or maxWaiting")]
    ZeroCeiling,
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid YAML configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid JSON configuration: {0}")]
    Json(#[from] serde_json::Error),
}

fn default_extra_shared_quota() -> usize {
    DEFAULT_EXTRA_SHARED_QUOTA
}

fn default_admission_timeout_ms() -> u64 {
    DEFAULT_ADMISSION_TIMEOUT_MS
}

fn default_idle_backoff_ms() -> u64 {
    DEFAULT_IDLE_BACKOFF_MS
}

fn default_notification_buffer() -> usize {
    DEFAULT_NOTIFICATION_BUFFER
}

/// Complete configuration of an admission filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterConfig {
    #[serde(default)]
    buckets: Vec<Bucket>,
    #[serde(default)]
    bindings: Vec<BucketBinding>,
    /// Shared quota of the synthetic bucket for unmatched traffic.
    #[serde(default = "default_extra_shared_quota")]
    extra_shared_quota: usize,
    /// Longest a request may wait for quota.
    #[serde(default = "default_admission_timeout_ms")]
    admission_timeout_ms: u64,
    /// Pause taken by idle producers and by the drainer after a streak of misses.
    #[serde(default = "default_idle_backoff_ms")]
    idle_backoff_ms: u64,
    /// Overrides the admission ceiling (defaults to the total shared quota).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_waiting: Option<usize>,
    /// Capacity of the notification channel between producers and the drainer.
    #[serde(default = "default_notification_buffer")]
    notification_buffer: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self::new(Vec::new(), Vec::new())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BucketsDocument {
    List(Vec<Bucket>),
    Wrapped { buckets: Vec<Bucket> },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BindingsDocument {
    List(Vec<BucketBinding>),
    Wrapped { bindings: Vec<BucketBinding> },
}

impl FilterConfig {
    /// Build a configuration with default tuning. Call [`FilterConfig::validate`]
    /// (or let [`crate::AdmissionController::new`] do it) before use.
    pub fn new(buckets: Vec<Bucket>, bindings: Vec<BucketBinding>) -> Self {
        Self {
            buckets,
            bindings,
            extra_shared_quota: DEFAULT_EXTRA_SHARED_QUOTA,
            admission_timeout_ms: DEFAULT_ADMISSION_TIMEOUT_MS,
            idle_backoff_ms: DEFAULT_IDLE_BACKOFF_MS,
            max_waiting: None,
            notification_buffer: DEFAULT_NOTIFICATION_BUFFER,
        }
    }

    pub fn with_extra_shared_quota(mut self, quota: usize) -> Self {
        self.extra_shared_quota = quota;
        self
    }

    pub fn with_admission_timeout(mut self, timeout: Duration) -> Self {
        self.admission_timeout_ms = duration_millis(timeout);
        self
    }

    pub fn with_idle_backoff(mut self, backoff: Duration) -> Self {
        self.idle_backoff_ms = duration_millis(backoff);
        self
    }

    pub fn with_max_waiting(mut self, max_waiting: usize) -> Self {
        self.max_waiting = Some(max_waiting);
        self
    }

    pub fn with_notification_buffer(mut self, capacity: usize) -> Self {
        self.notification_buffer = capacity;
        self
    }

    /// Configured buckets, without the extra bucket.
    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    /// Bindings in configured order.
    pub fn bindings(&self) -> &[BucketBinding] {
        &self.bindings
    }

    /// Configured buckets followed by the extra bucket.
    pub fn all_buckets(&self) -> Vec<Bucket> {
        let mut all = self.buckets.clone();
        all.push(Bucket::extra(self.extra_shared_quota));
        all
    }

    pub fn extra_shared_quota(&self) -> usize {
        self.extra_shared_quota
    }

    pub fn admission_timeout(&self) -> Duration {
        Duration::from_millis(self.admission_timeout_ms)
    }

    pub fn idle_backoff(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_ms)
    }

    pub fn notification_buffer(&self) -> usize {
        self.notification_buffer
    }

    /// Sum of shared quota across all buckets, extra bucket included.
    pub fn total_shared_quota(&self) -> usize {
        self.buckets.iter().map(Bucket::shared_quota).sum::<usize>() + self.extra_shared_quota
    }

    /// Most requests allowed to wait at once.
    pub fn max_waiting(&self) -> usize {
        self.max_waiting.unwrap_or_else(|| self.total_shared_quota())
    }

    /// Check structural invariants of buckets, bindings and tuning values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::with_capacity(self.buckets.len());
        for bucket in &self.buckets {
            let name = bucket.name();
            if name.is_empty() {
                return Err(ConfigError::EmptyBucketName);
            }
            if name == EXTRA_BUCKET_NAME {
                return Err(ConfigError::ReservedBucketName(name.to_string()));
            }
            if !seen.insert(name) {
                return Err(ConfigError::DuplicateBucket(name.to_string()));
            }
            let weight = bucket.weight_value();
            if !(weight.is_finite() && weight > 0.0) {
                return Err(ConfigError::InvalidWeight { name: name.to_string(), weight });
            }
            if !bucket.priority().is_assignable() {
                return Err(ConfigError::LowestBandAssigned(name.to_string()));
            }
        }

        for (index, binding) in self.bindings.iter().enumerate() {
            if !seen.contains(binding.bucket_name()) {
                return Err(ConfigError::UnknownBucket {
                    index,
                    name: binding.bucket_name().to_string(),
                });
            }
        }

        if self.admission_timeout_ms == 0 {
            return Err(ConfigError::ZeroSetting("admissionTimeoutMs"));
        }
        if self.idle_backoff_ms == 0 {
            return Err(ConfigError::ZeroSetting("idleBackoffMs"));
        }
        if self.notification_buffer == 0 {
            return Err(ConfigError::ZeroSetting("notificationBuffer"));
        }
        if self.max_waiting() == 0 {
            return Err(ConfigError::ZeroCeiling);
        }
        Ok(())
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(source)?;
        config.validated()
    }

    /// Parse and validate a JSON document.
    pub fn from_json_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(source)?;
        config.validated()
    }

    /// Load a single configuration file. `.json` files are parsed as JSON,
    /// anything else as YAML.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading admission filter configuration");
        let contents = read(path)?;
        let is_json = path.extension().and_then(|ext| ext.to_str()) == Some("json");
        if is_json {
            Self::from_json_str(&contents)
        } else {
            Self::from_yaml_str(&contents)
        }
    }

    /// Load `buckets.yaml` and `bindings.yaml` from a directory. A missing
    /// `bindings.yaml` means no bindings: all traffic lands in the extra bucket.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let dir = dir.as_ref();
        info!(dir = %dir.display(), "loading bucket and binding documents");

        let buckets = match serde_yaml::from_str::<BucketsDocument>(&read(&dir.join("buckets.yaml"))?)? {
            BucketsDocument::List(list) | BucketsDocument::Wrapped { buckets: list } => list,
        };

        let bindings_path = dir.join("bindings.yaml");
        let bindings = if bindings_path.exists() {
            match serde_yaml::from_str::<BindingsDocument>(&read(&bindings_path)?)? {
                BindingsDocument::List(list) | BindingsDocument::Wrapped { bindings: list } => list,
            }
        } else {
            debug!(path = %bindings_path.display(), "no bindings document; routing everything to the extra bucket");
            Vec::new()
        };

        Self::new(buckets, bindings).validated()
    }

    fn validated(self) -> Result<Self, ConfigError> {
        self.validate()?;
        info!(
            buckets = self.buckets.len(),
            bindings = self.bindings.len(),
            total_shared_quota = self.total_shared_quota(),
            max_waiting = self.max_waiting(),
            "admission filter configuration validated"
        );
        Ok(self)
    }
}

fn read(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path)
        .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::{PriorityBand, RuleField};

    fn sample() -> FilterConfig {
        FilterConfig::new(
            vec![
                Bucket::new("system", PriorityBand::Top).reserved(2).shared(3),
                Bucket::new("users", PriorityBand::Normal).shared(5).weight(2.0),
            ],
            vec![BucketBinding::to("system").rule(RuleField::User, ["admin"])],
        )
    }

    #[test]
    fn defaults_follow_documented_values() {
        let config = sample();
        assert_eq!(config.extra_shared_quota(), DEFAULT_EXTRA_SHARED_QUOTA);
        assert_eq!(config.admission_timeout(), Duration::from_secs(600));
        assert_eq!(config.idle_backoff(), Duration::from_millis(20));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn ceiling_defaults_to_total_shared_quota() {
        let config = sample();
        assert_eq!(config.total_shared_quota(), 3 + 5 + DEFAULT_EXTRA_SHARED_QUOTA);
        assert_eq!(config.max_waiting(), config.total_shared_quota());
        assert_eq!(config.with_max_waiting(4).max_waiting(), 4);
    }

    #[test]
    fn all_buckets_appends_extra_last() {
        let all = sample().with_extra_shared_quota(7).all_buckets();
        assert_eq!(all.len(), 3);
        let extra = all.last().unwrap();
        assert!(extra.is_extra());
        assert_eq!(extra.shared_quota(), 7);
    }

    #[test]
    fn rejects_duplicate_bucket() {
        let config = FilterConfig::new(
            vec![Bucket::new("a", PriorityBand::Top), Bucket::new("a", PriorityBand::High)],
            vec![],
        );
        assert!(matches!(config.validate(), Err(ConfigError::DuplicateBucket(name)) if name == "a"));
    }

    #[test]
    fn rejects_lowest_band_assignment() {
        let config = FilterConfig::new(vec![Bucket::new("bg", PriorityBand::Lowest).shared(1)], vec![]);
        assert!(matches!(config.validate(), Err(ConfigError::LowestBandAssigned(_))));
    }

    #[test]
    fn rejects_reserved_name_and_bad_weight() {
        let reserved = FilterConfig::new(vec![Bucket::new(EXTRA_BUCKET_NAME, PriorityBand::Top)], vec![]);
        assert!(matches!(reserved.validate(), Err(ConfigError::ReservedBucketName(_))));

        let zero = FilterConfig::new(vec![Bucket::new("a", PriorityBand::Top).weight(0.0)], vec![]);
        assert!(matches!(zero.validate(), Err(ConfigError::InvalidWeight { .. })));

        let nan = FilterConfig::new(vec![Bucket::new("a", PriorityBand::Top).weight(f64::NAN)], vec![]);
        assert!(matches!(nan.validate(), Err(ConfigError::InvalidWeight { .. })));
    }

    #[test]
    fn rejects_unknown_binding_target() {
        let config = FilterConfig::new(
            vec![Bucket::new("a", PriorityBand::Top)],
            vec![BucketBinding::to("a"), BucketBinding::to("missing")],
        );
        match config.validate() {
            Err(ConfigError::UnknownBucket { index, name }) => {
                assert_eq!(index, 1);
                assert_eq!(name, "missing");
            }
            other => panic!("expected UnknownBucket, got {:?}", other),
        }
    }

    #[test]
    fn rejects_zero_ceiling_and_zero_durations() {
        let no_shared = FilterConfig::new(vec![Bucket::new("a", PriorityBand::Top).reserved(1)], vec![])
            .with_extra_shared_quota(0);
        assert!(matches!(no_shared.validate(), Err(ConfigError::ZeroCeiling)));
        assert!(no_shared.clone().with_max_waiting(2).validate().is_ok());

        let zero_timeout = sample().with_admission_timeout(Duration::ZERO);
        assert!(matches!(zero_timeout.validate(), Err(ConfigError::ZeroSetting(_))));
    }

    #[test]
    fn parses_yaml_document() {
        let yaml = r#"
buckets:
  - name: system
    reservedQuota: 1
    sharedQuota: 2
    priority: 0
  - name: batch
    sharedQuota: 4
    weight: 0.5
    priority: 4
bindings:
  - rules:
      - field: namespace
        values: ["kube-system"]
    bucketRef:
      name: system
extraSharedQuota: 3
admissionTimeoutMs: 1500
maxWaiting: 12
"#;
        let config = FilterConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.buckets().len(), 2);
        assert_eq!(config.buckets()[1].weight_value(), 0.5);
        assert_eq!(config.bindings()[0].bucket_name(), "system");
        assert_eq!(config.extra_shared_quota(), 3);
        assert_eq!(config.admission_timeout(), Duration::from_millis(1500));
        assert_eq!(config.max_waiting(), 12);
    }

    #[test]
    fn parses_json_and_reports_parse_errors() {
        let json = r#"{"buckets":[{"name":"a","sharedQuota":1,"priority":2}]}"#;
        let config = FilterConfig::from_json_str(json).unwrap();
        assert_eq!(config.buckets()[0].priority(), PriorityBand::Medium);

        let bad_band = r#"{"buckets":[{"name":"a","priority":9}]}"#;
        assert!(matches!(FilterConfig::from_json_str(bad_band), Err(ConfigError::Json(_))));
    }

    #[test]
    fn serializes_back_to_the_same_config() {
        let config = sample().with_max_waiting(9);
        let text = serde_json::to_string(&config).unwrap();
        let parsed = FilterConfig::from_json_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
