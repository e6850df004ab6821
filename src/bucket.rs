//! Quota buckets, priority bands and the bindings that route requests to them.
//!
//! A [`Bucket`] carries two allotments:
//! - **reserved** quota, usable only by requests classified into that bucket;
//! - **shared** quota, pooled with every other bucket of the same [`PriorityBand`].
//!
//! Buckets are immutable once loaded. Only the remaining counters held by the
//! quota producers change at runtime.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Name of the synthetic bucket that receives unmatched traffic.
pub const EXTRA_BUCKET_NAME: &str = "__extra";

/// Shared quota given to the extra bucket when configuration does not say otherwise.
pub const DEFAULT_EXTRA_SHARED_QUOTA: usize = 10;

/// Urgency class of a bucket. Lower ordinal means more urgent.
///
/// [`PriorityBand::Lowest`] is reserved for unmatched traffic and cannot be
/// assigned through configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum PriorityBand {
    /// Most urgent band.
    Top = 0,
    /// High urgency.
    High = 1,
    /// Medium urgency.
    Medium = 2,
    /// Default urgency for ordinary traffic.
    Normal = 3,
    /// Background traffic.
    Low = 4,
    /// Implicit system band for the extra bucket.
    Lowest = 5,
}

/// Returned when an ordinal does not name a band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("priority band {0} is out of range (expected 0..=5)")]
pub struct InvalidPriorityBand(pub u8);

impl PriorityBand {
    /// Number of bands, `Lowest` included.
    pub const COUNT: usize = 6;

    /// Every band, most urgent first.
    pub const ALL: [PriorityBand; Self::COUNT] = [
        PriorityBand::Top,
        PriorityBand::High,
        PriorityBand::Medium,
        PriorityBand::Normal,
        PriorityBand::Low,
        PriorityBand::Lowest,
    ];

    /// Position of the band, `Top` is 0.
    pub fn ordinal(self) -> usize {
        self as usize
    }

    /// Look a band up by ordinal.
    pub fn from_ordinal(ordinal: usize) -> Option<Self> {
        Self::ALL.get(ordinal).copied()
    }

    /// Whether configuration may place a bucket in this band.
    pub fn is_assignable(self) -> bool {
        self != PriorityBand::Lowest
    }

    /// Bands from `Top` down to and including `self`, most urgent first.
    ///
    /// This is the scan order used when shared quota produced in `self` looks
    /// for a waiter.
    pub fn up_to(self) -> impl Iterator<Item = PriorityBand> {
        Self::ALL.into_iter().take(self.ordinal() + 1)
    }

    /// Stable lowercase label, used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            PriorityBand::Top => "top",
            PriorityBand::High => "high",
            PriorityBand::Medium => "medium",
            PriorityBand::Normal => "normal",
            PriorityBand::Low => "low",
            PriorityBand::Lowest => "lowest",
        }
    }
}

impl TryFrom<u8> for PriorityBand {
    type Error = InvalidPriorityBand;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::from_ordinal(value as usize).ok_or(InvalidPriorityBand(value))
    }
}

impl From<PriorityBand> for u8 {
    fn from(band: PriorityBand) -> Self {
        band as u8
    }
}

impl fmt::Display for PriorityBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_weight() -> f64 {
    1.0
}

/// A named quota pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bucket {
    name: String,
    #[serde(default)]
    reserved_quota: usize,
    #[serde(default)]
    shared_quota: usize,
    #[serde(default = "default_weight")]
    weight: f64,
    priority: PriorityBand,
}

impl Bucket {
    /// Create a bucket with no quota and weight 1.
    ///
    /// # Examples
    /// ```
    /// use inflight::{Bucket, PriorityBand};
    /// let bucket = Bucket::new("system", PriorityBand::Top).reserved(2).shared(8).weight(3.0);
    /// assert_eq!(bucket.reserved_quota(), 2);
    /// assert_eq!(bucket.shared_quota(), 8);
    /// ```
    pub fn new(name: impl Into<String>, priority: PriorityBand) -> Self {
        Self {
            name: name.into(),
            reserved_quota: 0,
            shared_quota: 0,
            weight: default_weight(),
            priority,
        }
    }

    /// The synthetic bucket for requests no binding matches.
    pub fn extra(shared_quota: usize) -> Self {
        Self::new(EXTRA_BUCKET_NAME, PriorityBand::Lowest).shared(shared_quota)
    }

    /// Set the reserved allotment.
    pub fn reserved(mut self, quota: usize) -> Self {
        self.reserved_quota = quota;
        self
    }

    /// Set the shared allotment.
    pub fn shared(mut self, quota: usize) -> Self {
        self.shared_quota = quota;
        self
    }

    /// Set the weighted-selection weight.
    pub fn weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn reserved_quota(&self) -> usize {
        self.reserved_quota
    }

    pub fn shared_quota(&self) -> usize {
        self.shared_quota
    }

    pub fn weight_value(&self) -> f64 {
        self.weight
    }

    pub fn priority(&self) -> PriorityBand {
        self.priority
    }

    /// True for the synthetic bucket that catches unmatched traffic.
    pub fn is_extra(&self) -> bool {
        self.name == EXTRA_BUCKET_NAME
    }
}

/// Request attribute a binding rule inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleField {
    /// Requesting user identity.
    #[serde(rename = "user.name")]
    User,
    /// Target namespace.
    #[serde(rename = "namespace")]
    Namespace,
    /// HTTP verb.
    #[serde(rename = "verb")]
    Verb,
}

/// One `(field, values)` predicate. Matches when the field equals any value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingRule {
    pub field: RuleField,
    #[serde(default)]
    pub values: Vec<String>,
}

impl BindingRule {
    pub fn new<I, S>(field: RuleField, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { field, values: values.into_iter().map(Into::into).collect() }
    }
}

/// Reference to a bucket by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketReference {
    pub name: String,
}

/// Routes requests whose attributes satisfy any of `rules` to `bucket_ref`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketBinding {
    #[serde(default)]
    pub rules: Vec<BindingRule>,
    pub bucket_ref: BucketReference,
}

impl BucketBinding {
    /// Bind to the named bucket with no rules yet.
    pub fn to(bucket: impl Into<String>) -> Self {
        Self { rules: Vec::new(), bucket_ref: BucketReference { name: bucket.into() } }
    }

    /// Add a rule.
    pub fn rule<I, S>(mut self, field: RuleField, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rules.push(BindingRule::new(field, values));
        self
    }

    /// Name of the target bucket.
    pub fn bucket_name(&self) -> &str {
        &self.bucket_ref.name
    }
}
