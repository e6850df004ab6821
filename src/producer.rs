//! Quota pools and the producer loop that offers their units to the drainer.
//!
//! A [`QuotaPool`] holds one remaining-quota counter per key behind a single
//! mutex. [`QuotaPool::try_acquire`] is the only way to take a unit, and the
//! returned [`QuotaPermit`] gives it back exactly once when released or dropped.
//! For every key, `remaining + outstanding permits == capacity` at all times.
//!
//! A [`QuotaProducer`] walks its buckets round-robin, takes at most one unit per
//! bucket per pass and sends each one, tagged by its owner, down the notification
//! channel. When a full pass finds nothing available it sleeps for the idle
//! backoff instead of spinning.

use crate::bucket::Bucket;
use crate::lock;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy)]
struct Counter {
    remaining: usize,
    capacity: usize,
}

/// Remaining-quota counters for a set of keys, owned by one producer.
#[derive(Debug)]
pub struct QuotaPool {
    label: String,
    counters: Mutex<HashMap<Arc<str>, Counter>>,
}

impl QuotaPool {
    /// Create a pool with every counter full.
    pub fn new<I, K>(label: impl Into<String>, capacities: I) -> Arc<Self>
    where
        I: IntoIterator<Item = (K, usize)>,
        K: AsRef<str>,
    {
        let counters = capacities
            .into_iter()
            .map(|(key, capacity)| (Arc::<str>::from(key.as_ref()), Counter { remaining: capacity, capacity }))
            .collect();
        Arc::new(Self { label: label.into(), counters: Mutex::new(counters) })
    }

    /// Take one unit for `key` if any remain. Check and decrement happen in one
    /// critical section.
    pub fn try_acquire(self: &Arc<Self>, key: &str) -> Option<QuotaPermit> {
        let mut counters = lock(&self.counters);
        let (key, counter) = counters.get_key_value(key).map(|(k, c)| (Arc::clone(k), *c))?;
        if counter.remaining == 0 {
            return None;
        }
        if let Some(counter) = counters.get_mut(&key) {
            counter.remaining -= 1;
        }
        drop(counters);
        Some(QuotaPermit { pool: Arc::clone(self), key })
    }

    fn release(&self, key: &str) {
        let mut counters = lock(&self.counters);
        match counters.get_mut(key) {
            Some(counter) if counter.remaining < counter.capacity => counter.remaining += 1,
            Some(counter) => {
                warn!(pool = %self.label, key, capacity = counter.capacity, "quota released above capacity; ignoring");
            }
            None => warn!(pool = %self.label, key, "quota released for unknown key"),
        }
    }

    /// Units currently available for `key`.
    pub fn remaining(&self, key: &str) -> Option<usize> {
        lock(&self.counters).get(key).map(|counter| counter.remaining)
    }

    /// Configured units for `key`.
    pub fn capacity(&self, key: &str) -> Option<usize> {
        lock(&self.counters).get(key).map(|counter| counter.capacity)
    }

    /// Units handed out and not yet released.
    pub fn outstanding(&self, key: &str) -> Option<usize> {
        lock(&self.counters).get(key).map(|counter| counter.capacity - counter.remaining)
    }

    /// Name used in logs, e.g. `reserved` or `shared:top`.
    pub fn label(&self) -> &str {
        &self.label
    }
}

/// One unit of quota taken from a [`QuotaPool`].
///
/// Releasing it, explicitly with [`QuotaPermit::release`] or by dropping it,
/// returns the unit to its pool. Ownership makes a second release impossible.
#[must_use = "dropping a permit releases its quota immediately"]
pub struct QuotaPermit {
    pool: Arc<QuotaPool>,
    key: Arc<str>,
}

impl QuotaPermit {
    /// Counter key the unit was taken from.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Label of the owning pool.
    pub fn pool_label(&self) -> &str {
        self.pool.label()
    }

    /// Give the unit back now.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for QuotaPermit {
    fn drop(&mut self) {
        trace!(pool = %self.pool.label, key = %self.key, "quota released");
        self.pool.release(&self.key);
    }
}

impl fmt::Debug for QuotaPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuotaPermit")
            .field("pool", &self.pool.label)
            .field("key", &self.key)
            .finish()
    }
}

/// Loop offering a pool's units, one at a time, to a notification channel.
pub struct QuotaProducer<N, F> {
    pool: Arc<QuotaPool>,
    buckets: Vec<Arc<Bucket>>,
    tag: F,
    tx: mpsc::Sender<N>,
    idle_backoff: Duration,
}

impl<N, F> fmt::Debug for QuotaProducer<N, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuotaProducer")
            .field("pool", &self.pool.label)
            .field("buckets", &self.buckets.len())
            .field("idle_backoff", &self.idle_backoff)
            .finish()
    }
}

impl<N, F> QuotaProducer<N, F>
where
    N: Send + 'static,
    F: Fn(&Bucket, QuotaPermit) -> N + Send + Sync + 'static,
{
    /// `tag` turns a bucket and one of its units into the message the drainer sees.
    pub fn new(
        pool: Arc<QuotaPool>,
        buckets: Vec<Arc<Bucket>>,
        tag: F,
        tx: mpsc::Sender<N>,
        idle_backoff: Duration,
    ) -> Self {
        Self { pool, buckets, tag, tx, idle_backoff }
    }

    pub fn pool(&self) -> &Arc<QuotaPool> {
        &self.pool
    }

    /// Run until the notification channel closes. A unit that could not be sent
    /// goes back to the pool with the dropped message.
    pub async fn run(self) {
        debug!(pool = %self.pool.label, buckets = self.buckets.len(), "quota producer started");
        loop {
            let mut emitted = false;
            for bucket in &self.buckets {
                let Some(permit) = self.pool.try_acquire(bucket.name()) else {
                    continue;
                };
                emitted = true;
                if self.tx.send((self.tag)(bucket, permit)).await.is_err() {
                    debug!(pool = %self.pool.label, "notification channel closed; quota producer stopping");
                    return;
                }
            }
            if !emitted {
                tokio::time::sleep(self.idle_backoff).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::PriorityBand;

    #[test]
    fn acquire_and_release_conserve_quota() {
        let pool = QuotaPool::new("test", [("a", 2)]);
        let first = pool.try_acquire("a").unwrap();
        let second = pool.try_acquire("a").unwrap();
        assert!(pool.try_acquire("a").is_none());
        assert_eq!(pool.remaining("a"), Some(0));
        assert_eq!(pool.outstanding("a"), Some(2));

        first.release();
        assert_eq!(pool.remaining("a"), Some(1));
        drop(second);
        assert_eq!(pool.remaining("a"), Some(2));
        assert_eq!(pool.outstanding("a"), Some(0));
    }

    #[test]
    fn unknown_and_empty_keys_yield_nothing() {
        let pool = QuotaPool::new("test", [("zero", 0)]);
        assert!(pool.try_acquire("zero").is_none());
        assert!(pool.try_acquire("missing").is_none());
        assert_eq!(pool.capacity("zero"), Some(0));
        assert_eq!(pool.remaining("missing"), None);
    }

    #[test]
    fn permit_reports_origin() {
        let pool = QuotaPool::new("shared:top", [("top", 1)]);
        let permit = pool.try_acquire("top").unwrap();
        assert_eq!(permit.key(), "top");
        assert_eq!(permit.pool_label(), "shared:top");
    }

    #[tokio::test]
    async fn producer_emits_each_unit_then_idles() {
        let pool = QuotaPool::new("test", [("a", 2), ("b", 1)]);
        let buckets = vec![
            Arc::new(Bucket::new("a", PriorityBand::Top)),
            Arc::new(Bucket::new("b", PriorityBand::Top)),
        ];
        let (tx, mut rx) = mpsc::channel(8);
        let producer = QuotaProducer::new(
            Arc::clone(&pool),
            buckets,
            |bucket: &Bucket, permit| (bucket.name().to_string(), permit),
            tx,
            Duration::from_millis(5),
        );
        let handle = tokio::spawn(producer.run());

        let mut received = Vec::new();
        for _ in 0..3 {
            received.push(rx.recv().await.unwrap());
        }
        let names: Vec<_> = received.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "a"]);
        assert_eq!(pool.remaining("a"), Some(0));

        // Nothing left: the producer must be idle, not emitting.
        let idle = tokio::time::timeout(Duration::from_millis(30), rx.recv()).await;
        assert!(idle.is_err());

        // Returning a unit lets the producer offer it again.
        received.pop();
        let (name, _permit) = rx.recv().await.unwrap();
        assert_eq!(name, "a");

        handle.abort();
    }

    #[tokio::test]
    async fn producer_stops_and_returns_quota_when_channel_closes() {
        let pool = QuotaPool::new("test", [("a", 3)]);
        let (tx, rx) = mpsc::channel::<QuotaPermit>(1);
        let producer = QuotaProducer::new(
            Arc::clone(&pool),
            vec![Arc::new(Bucket::new("a", PriorityBand::Top))],
            |_: &Bucket, permit| permit,
            tx,
            Duration::from_millis(5),
        );
        let handle = tokio::spawn(producer.run());
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(rx);

        handle.await.unwrap();
        assert_eq!(pool.remaining("a"), Some(3));
    }
}
