//! Weighted fair queue for one priority band.
//!
//! Each bucket owns a FIFO lane. [`WeightedQueue::dequeue_weighted`] picks a
//! non-empty lane with probability proportional to its weight and pops its head;
//! [`WeightedQueue::dequeue_direct`] pops the head of one named lane. Selection is
//! weighted-random, so repeated draws approach the weight ratios without any
//! guarantee of exact interleaving.
//!
//! The queue holds no lock of its own. The drainer keeps every band's queue and
//! the waiting counter behind a single mutex so that enqueue, dequeue and retract
//! observe the same state.

use crate::bucket::Bucket;
use rand::Rng;
use std::collections::{HashMap, VecDeque};

const DEFAULT_LANE_WEIGHT: f64 = 1.0;

#[derive(Debug)]
struct Lane<T> {
    name: String,
    weight: f64,
    items: VecDeque<T>,
}

/// FIFO lanes keyed by bucket name with weighted-random selection across lanes.
#[derive(Debug)]
pub struct WeightedQueue<T> {
    lanes: Vec<Lane<T>>,
    index: HashMap<String, usize>,
    len: usize,
}

impl<T> Default for WeightedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WeightedQueue<T> {
    pub fn new() -> Self {
        Self { lanes: Vec::new(), index: HashMap::new(), len: 0 }
    }

    /// Queue with one lane per bucket, weighted by the bucket's weight.
    pub fn with_buckets<'a, I>(buckets: I) -> Self
    where
        I: IntoIterator<Item = &'a Bucket>,
    {
        let mut queue = Self::new();
        for bucket in buckets {
            queue.register(bucket.name(), bucket.weight_value());
        }
        queue
    }

    /// Add a lane, or update the weight of an existing one.
    pub fn register(&mut self, bucket: &str, weight: f64) {
        match self.index.get(bucket) {
            Some(&i) => self.lanes[i].weight = weight,
            None => {
                self.index.insert(bucket.to_string(), self.lanes.len());
                self.lanes.push(Lane { name: bucket.to_string(), weight, items: VecDeque::new() });
            }
        }
    }

    /// Append to the bucket's lane. Unknown buckets get a lane of weight 1.
    pub fn enqueue(&mut self, bucket: &str, item: T) {
        let i = match self.index.get(bucket) {
            Some(&i) => i,
            None => {
                self.register(bucket, DEFAULT_LANE_WEIGHT);
                self.lanes.len() - 1
            }
        };
        self.lanes[i].items.push_back(item);
        self.len += 1;
    }

    /// Pop the head of a lane chosen by weight, using the thread-local RNG.
    pub fn dequeue_weighted(&mut self) -> Option<T> {
        self.dequeue_weighted_with(&mut rand::rng())
    }

    /// Pop the head of a lane chosen by weight, using the given RNG.
    pub fn dequeue_weighted_with<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<T> {
        if self.len == 0 {
            return None;
        }

        // TODO: replace the linear scan with a Fenwick tree over lane weights once
        // bands routinely carry hundreds of buckets.
        let total: f64 = self
            .lanes
            .iter()
            .filter(|lane| !lane.items.is_empty())
            .map(|lane| lane.weight)
            .sum();

        let chosen = if total > 0.0 && total.is_finite() {
            let draw = rng.random_range(0.0..total);
            let mut cumulative = 0.0;
            let mut chosen = None;
            for (i, lane) in self.lanes.iter().enumerate() {
                if lane.items.is_empty() {
                    continue;
                }
                cumulative += lane.weight;
                chosen = Some(i);
                if cumulative > draw {
                    break;
                }
            }
            chosen
        } else {
            self.lanes.iter().position(|lane| !lane.items.is_empty())
        };

        self.pop_lane(chosen?)
    }

    /// Pop the head of the named lane, ignoring weights.
    pub fn dequeue_direct(&mut self, bucket: &str) -> Option<T> {
        let i = *self.index.get(bucket)?;
        self.pop_lane(i)
    }

    /// Remove the first item in the bucket's lane satisfying `pred`.
    pub fn retract_where<P>(&mut self, bucket: &str, mut pred: P) -> Option<T>
    where
        P: FnMut(&T) -> bool,
    {
        let lane = &mut self.lanes[*self.index.get(bucket)?];
        let position = lane.items.iter().position(|item| pred(item))?;
        let item = lane.items.remove(position)?;
        self.len -= 1;
        Some(item)
    }

    /// Remove every queued item, lane by lane.
    pub fn drain_all(&mut self) -> Vec<T> {
        let mut drained = Vec::with_capacity(self.len);
        for lane in &mut self.lanes {
            drained.extend(lane.items.drain(..));
        }
        self.len = 0;
        drained
    }

    /// Total queued items across lanes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Queued items in one lane.
    pub fn lane_len(&self, bucket: &str) -> usize {
        self.index.get(bucket).map_or(0, |&i| self.lanes[i].items.len())
    }

    /// Lane names in iteration order.
    pub fn lanes(&self) -> impl Iterator<Item = &str> {
        self.lanes.iter().map(|lane| lane.name.as_str())
    }

    fn pop_lane(&mut self, i: usize) -> Option<T> {
        let item = self.lanes[i].items.pop_front()?;
        self.len -= 1;
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::PriorityBand;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn empty_queue_yields_nothing() {
        let mut queue: WeightedQueue<u32> = WeightedQueue::new();
        assert!(queue.dequeue_weighted().is_none());
        assert!(queue.dequeue_direct("missing").is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn direct_dequeue_is_fifo_per_lane() {
        let mut queue = WeightedQueue::new();
        queue.enqueue("a", 1);
        queue.enqueue("b", 10);
        queue.enqueue("a", 2);
        queue.enqueue("a", 3);

        assert_eq!(queue.dequeue_direct("a"), Some(1));
        assert_eq!(queue.dequeue_direct("a"), Some(2));
        assert_eq!(queue.lane_len("a"), 1);
        assert_eq!(queue.lane_len("b"), 1);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn weighted_dequeue_skips_empty_lanes() {
        let mut queue = WeightedQueue::new();
        queue.register("heavy", 1000.0);
        queue.enqueue("light", 7);
        let mut rng = StdRng::seed_from_u64(3);
        assert_eq!(queue.dequeue_weighted_with(&mut rng), Some(7));
        assert_eq!(queue.dequeue_weighted_with(&mut rng), None);
    }

    #[test]
    fn weighted_dequeue_tracks_weight_ratio() {
        let buckets = [
            Bucket::new("a", PriorityBand::Normal).weight(3.0),
            Bucket::new("b", PriorityBand::Normal).weight(1.0),
        ];
        let mut queue = WeightedQueue::with_buckets(buckets.iter());
        let mut rng = StdRng::seed_from_u64(42);
        let mut picked_a = 0;
        let draws = 4_000;

        for _ in 0..draws {
            queue.enqueue("a", "a");
            queue.enqueue("b", "b");
            if queue.dequeue_weighted_with(&mut rng) == Some("a") {
                picked_a += 1;
            }
            // Reset to one item per lane so every draw sees both lanes.
            queue.drain_all();
        }

        let ratio = picked_a as f64 / draws as f64;
        assert!((0.70..0.80).contains(&ratio), "expected ~0.75, got {ratio}");
    }

    #[test]
    fn retract_removes_a_specific_item() {
        let mut queue = WeightedQueue::new();
        queue.enqueue("a", 1);
        queue.enqueue("a", 2);
        queue.enqueue("a", 3);

        assert_eq!(queue.retract_where("a", |&item| item == 2), Some(2));
        assert_eq!(queue.retract_where("a", |&item| item == 2), None);
        assert_eq!(queue.retract_where("missing", |_| true), None);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dequeue_direct("a"), Some(1));
        assert_eq!(queue.dequeue_direct("a"), Some(3));
    }

    #[test]
    fn drain_all_empties_every_lane() {
        let mut queue = WeightedQueue::new();
        queue.enqueue("a", 1);
        queue.enqueue("b", 2);
        let mut drained = queue.drain_all();
        drained.sort();
        assert_eq!(drained, vec![1, 2]);
        assert!(queue.is_empty());
        assert_eq!(queue.lanes().collect::<Vec<_>>(), vec!["a", "b"]);
    }
}
