//! The queue drainer: the single consumer of quota notifications.
//!
//! Waiting requests sit in one [`WeightedQueue`] per priority band. The drainer
//! matches each incoming [`QuotaNotification`] against those queues:
//!
//! - a reserved unit of bucket `b` in band `p` can only go to the head of `b`'s lane;
//! - a shared unit of band `p` goes to a weighted pick from the first non-empty
//!   band, scanning from `Top` down to `p`. Shared quota therefore flows toward
//!   more urgent bands, never away from them.
//!
//! A unit nobody can use is released on the spot. Delivery is a `oneshot` send
//! that never blocks; if the waiter has already gone the unit is offered to the
//! next waiter under the same rule.
//!
//! All band queues, the waiting counter and slot ids share one mutex, so an
//! enqueue, a delivery and a retraction never observe each other half done.

use crate::bucket::{Bucket, PriorityBand};
use crate::lock;
use crate::manager::{QuotaKind, QuotaNotification};
use crate::producer::QuotaPermit;
use crate::queue::WeightedQueue;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, trace};

/// Why a request could not join the waitlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EnqueueError {
    #[error("waitlist full ({waiting} waiting, max {max})")]
    CapacityExceeded { waiting: usize, max: usize },
    #[error("drainer is closed")]
    Closed,
}

struct WaitSlot {
    id: u64,
    tx: oneshot::Sender<QuotaPermit>,
}

impl fmt::Debug for WaitSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitSlot").field("id", &self.id).finish()
    }
}

#[derive(Debug)]
struct Waitlist {
    bands: Vec<WeightedQueue<WaitSlot>>,
    waiting: usize,
    next_id: u64,
    closed: bool,
}

impl Waitlist {
    fn band(&mut self, band: PriorityBand) -> &mut WeightedQueue<WaitSlot> {
        &mut self.bands[band.ordinal()]
    }
}

/// Handle of one queued request. The grant arrives on its private channel.
#[derive(Debug)]
pub struct Waiter {
    id: u64,
    bucket: Arc<Bucket>,
    pub(crate) rx: oneshot::Receiver<QuotaPermit>,
}

impl Waiter {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn bucket(&self) -> &Arc<Bucket> {
        &self.bucket
    }

    /// Take the grant if it has already been delivered.
    pub fn try_take(&mut self) -> Option<QuotaPermit> {
        self.rx.try_recv().ok()
    }
}

/// Point-in-time counters of a [`QueueDrainer`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainerStats {
    /// Requests currently queued.
    pub waiting: usize,
    /// Admission ceiling.
    pub max_waiting: usize,
    /// Units delivered to a waiter.
    pub granted: u64,
    /// Units released because no eligible waiter existed.
    pub returned: u64,
    /// Slots withdrawn by their waiter before a grant.
    pub retracted: u64,
    /// Deliveries that found the receiver gone.
    pub abandoned: u64,
    /// Enqueues refused at the ceiling.
    pub rejected: u64,
}

#[derive(Debug, Default)]
struct Counters {
    granted: AtomicU64,
    returned: AtomicU64,
    retracted: AtomicU64,
    abandoned: AtomicU64,
    rejected: AtomicU64,
}

/// Matches quota notifications to waiting requests.
#[derive(Debug)]
pub struct QueueDrainer {
    waitlist: Mutex<Waitlist>,
    wake: Notify,
    max_waiting: usize,
    idle_backoff: Duration,
    miss_limit: usize,
    counters: Counters,
}

impl QueueDrainer {
    /// Build band queues with one lane per bucket.
    ///
    /// `miss_limit` is the number of consecutive unusable notifications after
    /// which [`QueueDrainer::run`] pauses for `idle_backoff`; pass the number of
    /// distinct quota counters so a full producer cycle can go by first.
    pub fn new(
        buckets: &[Arc<Bucket>],
        max_waiting: usize,
        idle_backoff: Duration,
        miss_limit: usize,
    ) -> Self {
        let bands = PriorityBand::ALL
            .into_iter()
            .map(|band| {
                WeightedQueue::with_buckets(
                    buckets.iter().filter(|bucket| bucket.priority() == band).map(|bucket| &**bucket),
                )
            })
            .collect();
        Self {
            waitlist: Mutex::new(Waitlist { bands, waiting: 0, next_id: 0, closed: false }),
            wake: Notify::new(),
            max_waiting,
            idle_backoff,
            miss_limit: miss_limit.max(1),
            counters: Counters::default(),
        }
    }

    pub fn max_waiting(&self) -> usize {
        self.max_waiting
    }

    /// Requests currently queued.
    pub fn waiting(&self) -> usize {
        lock(&self.waitlist).waiting
    }

    /// Queue a request for `bucket`.
    pub fn enqueue(&self, bucket: &Arc<Bucket>) -> Result<Waiter, EnqueueError> {
        let (id, rx) = {
            let mut list = lock(&self.waitlist);
            if list.closed {
                return Err(EnqueueError::Closed);
            }
            if list.waiting >= self.max_waiting {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(EnqueueError::CapacityExceeded {
                    waiting: list.waiting,
                    max: self.max_waiting,
                });
            }
            list.waiting += 1;
            let id = list.next_id;
            list.next_id += 1;
            let (tx, rx) = oneshot::channel();
            list.band(bucket.priority()).enqueue(bucket.name(), WaitSlot { id, tx });
            (id, rx)
        };
        self.wake.notify_one();
        trace!(bucket = bucket.name(), id, "request queued");
        Ok(Waiter { id, bucket: Arc::clone(bucket), rx })
    }

    /// Withdraw a queued request. Returns `false` if the slot was already taken
    /// by a delivery.
    pub fn retract(&self, waiter: &Waiter) -> bool {
        let mut list = lock(&self.waitlist);
        let removed = list
            .band(waiter.bucket.priority())
            .retract_where(waiter.bucket.name(), |slot| slot.id == waiter.id)
            .is_some();
        if removed {
            list.waiting -= 1;
            self.counters.retracted.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Route one notification. Returns `true` when a waiter received the unit.
    pub fn process(&self, notification: QuotaNotification) -> bool {
        let kind = notification.kind();
        let band = notification.band();
        let mut permit = notification.into_permit();

        loop {
            let slot = {
                let mut list = lock(&self.waitlist);
                let slot = match kind {
                    QuotaKind::Reserved => list.band(band).dequeue_direct(permit.key()),
                    QuotaKind::Shared => band
                        .up_to()
                        .find_map(|eligible| list.band(eligible).dequeue_weighted()),
                };
                if slot.is_some() {
                    list.waiting -= 1;
                }
                slot
            };

            let Some(slot) = slot else {
                self.counters.returned.fetch_add(1, Ordering::Relaxed);
                trace!(kind = kind.as_str(), band = %band, key = permit.key(), "no eligible waiter; releasing");
                return false;
            };

            match slot.tx.send(permit) {
                Ok(()) => {
                    self.counters.granted.fetch_add(1, Ordering::Relaxed);
                    trace!(kind = kind.as_str(), band = %band, id = slot.id, "quota granted");
                    return true;
                }
                Err(unclaimed) => {
                    self.counters.abandoned.fetch_add(1, Ordering::Relaxed);
                    trace!(id = slot.id, "waiter gone; offering unit to the next one");
                    permit = unclaimed;
                }
            }
        }
    }

    /// Refuse new requests and fail every queued one. Queued waiters observe a
    /// closed channel.
    pub fn close(&self) {
        let drained: Vec<WaitSlot> = {
            let mut list = lock(&self.waitlist);
            list.closed = true;
            list.waiting = 0;
            list.bands.iter_mut().flat_map(WeightedQueue::drain_all).collect()
        };
        debug!(failed = drained.len(), "drainer closed");
        drop(drained);
        self.wake.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.waitlist).closed
    }

    pub fn stats(&self) -> DrainerStats {
        DrainerStats {
            waiting: self.waiting(),
            max_waiting: self.max_waiting,
            granted: self.counters.granted.load(Ordering::Relaxed),
            returned: self.counters.returned.load(Ordering::Relaxed),
            retracted: self.counters.retracted.load(Ordering::Relaxed),
            abandoned: self.counters.abandoned.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
        }
    }

    /// Consume notifications until the channel closes or the drainer is closed.
    ///
    /// While nobody waits the loop parks, leaving producers blocked on the full
    /// channel. After `miss_limit` unusable notifications in a row, and only once
    /// the channel holds nothing more, it pauses for the idle backoff or until
    /// the next enqueue.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<QuotaNotification>) {
        debug!(max_waiting = self.max_waiting, "queue drainer started");
        let mut misses = 0usize;
        loop {
            loop {
                if self.is_closed() {
                    debug!("queue drainer stopping");
                    return;
                }
                if self.waiting() > 0 {
                    break;
                }
                self.wake.notified().await;
            }

            let Some(notification) = rx.recv().await else {
                debug!("notification channel closed; queue drainer stopping");
                return;
            };

            if self.process(notification) {
                misses = 0;
                continue;
            }
            misses += 1;
            // Units already buffered are worth trying before pausing.
            if misses >= self.miss_limit && rx.is_empty() {
                misses = 0;
                tokio::select! {
                    _ = tokio::time::sleep(self.idle_backoff) => {}
                    _ = self.wake.notified() => {}
                }
            }
        }
    }
}
