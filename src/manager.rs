//! Reserved and shared quota managers.
//!
//! Both managers own [`QuotaProducer`]s and hold nothing but the sending half of
//! the notification channel; the drainer holds the receiving half. Messages flow
//! one way, from managers to drainer.
//!
//! - [`ReservedQuotaManager`]: one producer, one counter per bucket with reserved
//!   quota. Its notifications name the bucket and may only serve that bucket.
//! - [`SharedQuotaManager`]: one producer per priority band, counters seeded from
//!   the shared quota of every bucket in the band. Its notifications carry only
//!   the band; shared quota is fungible inside a band.

use crate::bucket::{Bucket, PriorityBand};
use crate::producer::{QuotaPermit, QuotaPool, QuotaProducer};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

/// Which tier a unit of quota came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuotaKind {
    Reserved,
    Shared,
}

impl QuotaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            QuotaKind::Reserved => "reserved",
            QuotaKind::Shared => "shared",
        }
    }
}

/// "One unit of quota is available" message consumed by the drainer.
#[derive(Debug)]
pub enum QuotaNotification {
    /// Reserved unit of one bucket; the permit key is the bucket name.
    Reserved { band: PriorityBand, permit: QuotaPermit },
    /// Shared unit of a band.
    Shared { band: PriorityBand, permit: QuotaPermit },
}

impl QuotaNotification {
    /// Band the unit was produced in.
    pub fn band(&self) -> PriorityBand {
        match self {
            Self::Reserved { band, .. } | Self::Shared { band, .. } => *band,
        }
    }

    pub fn kind(&self) -> QuotaKind {
        match self {
            Self::Reserved { .. } => QuotaKind::Reserved,
            Self::Shared { .. } => QuotaKind::Shared,
        }
    }

    /// Bucket a reserved unit belongs to; `None` for shared units.
    pub fn bucket(&self) -> Option<&str> {
        match self {
            Self::Reserved { permit, .. } => Some(permit.key()),
            Self::Shared { .. } => None,
        }
    }

    /// Take the release handle out of the message.
    pub fn into_permit(self) -> QuotaPermit {
        match self {
            Self::Reserved { permit, .. } | Self::Shared { permit, .. } => permit,
        }
    }
}

/// Owns the reserved-quota producer.
#[derive(Debug)]
pub struct ReservedQuotaManager {
    pool: Arc<QuotaPool>,
    buckets: Vec<Arc<Bucket>>,
}

impl ReservedQuotaManager {
    /// Track every bucket with a non-zero reserved allotment.
    pub fn new(buckets: &[Arc<Bucket>]) -> Self {
        let buckets: Vec<Arc<Bucket>> =
            buckets.iter().filter(|bucket| bucket.reserved_quota() > 0).cloned().collect();
        let pool = QuotaPool::new(
            "reserved",
            buckets.iter().map(|bucket| (bucket.name(), bucket.reserved_quota())),
        );
        Self { pool, buckets }
    }

    pub fn pool(&self) -> &Arc<QuotaPool> {
        &self.pool
    }

    /// Number of counters the producer cycles through.
    pub fn key_count(&self) -> usize {
        self.buckets.len()
    }

    /// Spawn the producer. Returns `None` when no bucket has reserved quota.
    pub fn spawn(
        &self,
        tx: mpsc::Sender<QuotaNotification>,
        idle_backoff: Duration,
    ) -> Option<JoinHandle<()>> {
        if self.buckets.is_empty() {
            return None;
        }
        info!(
            buckets = self.buckets.len(),
            total = self.buckets.iter().map(|bucket| bucket.reserved_quota()).sum::<usize>(),
            "starting reserved quota producer"
        );
        let producer = QuotaProducer::new(
            Arc::clone(&self.pool),
            self.buckets.clone(),
            |bucket: &Bucket, permit| QuotaNotification::Reserved { band: bucket.priority(), permit },
            tx,
            idle_backoff,
        );
        Some(tokio::spawn(producer.run()))
    }
}

#[derive(Debug)]
struct BandPool {
    band: PriorityBand,
    pool: Arc<QuotaPool>,
    buckets: Vec<Arc<Bucket>>,
}

/// Owns one shared-quota producer per priority band.
#[derive(Debug)]
pub struct SharedQuotaManager {
    bands: Vec<BandPool>,
}

impl SharedQuotaManager {
    /// Group buckets with shared quota by band; bands without any get no producer.
    pub fn new(buckets: &[Arc<Bucket>]) -> Self {
        let bands = PriorityBand::ALL
            .into_iter()
            .filter_map(|band| {
                let members: Vec<Arc<Bucket>> = buckets
                    .iter()
                    .filter(|bucket| bucket.priority() == band && bucket.shared_quota() > 0)
                    .cloned()
                    .collect();
                if members.is_empty() {
                    return None;
                }
                let pool = QuotaPool::new(
                    format!("shared:{band}"),
                    members.iter().map(|bucket| (bucket.name(), bucket.shared_quota())),
                );
                Some(BandPool { band, pool, buckets: members })
            })
            .collect();
        Self { bands }
    }

    /// Pool of one band, if it has shared quota.
    pub fn pool(&self, band: PriorityBand) -> Option<&Arc<QuotaPool>> {
        self.bands.iter().find(|entry| entry.band == band).map(|entry| &entry.pool)
    }

    /// Total shared units configured for a band.
    pub fn band_capacity(&self, band: PriorityBand) -> usize {
        self.bands
            .iter()
            .find(|entry| entry.band == band)
            .map_or(0, |entry| entry.buckets.iter().map(|bucket| bucket.shared_quota()).sum())
    }

    /// Number of counters across all band producers.
    pub fn key_count(&self) -> usize {
        self.bands.iter().map(|entry| entry.buckets.len()).sum()
    }

    /// Spawn one producer per band with shared quota.
    pub fn spawn(
        &self,
        tx: mpsc::Sender<QuotaNotification>,
        idle_backoff: Duration,
    ) -> Vec<JoinHandle<()>> {
        self.bands
            .iter()
            .map(|entry| {
                let band = entry.band;
                info!(
                    band = %band,
                    buckets = entry.buckets.len(),
                    total = self.band_capacity(band),
                    "starting shared quota producer"
                );
                let producer = QuotaProducer::new(
                    Arc::clone(&entry.pool),
                    entry.buckets.clone(),
                    move |_: &Bucket, permit| QuotaNotification::Shared { band, permit },
                    tx.clone(),
                    idle_backoff,
                );
                tokio::spawn(producer.run())
            })
            .collect()
    }
}
