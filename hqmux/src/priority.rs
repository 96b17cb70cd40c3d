//! Egress priority queue interface and the default urgency queue.
//!
//! The queue data structure itself is replaceable; the session only needs
//! the [`EgressQueue`] surface: membership, pending-egress signalling, and
//! a per-loop batch of eligible streams with bandwidth ratios.

use hqmux_x::StreamId;
use std::collections::{BTreeMap, HashMap, VecDeque};

/// Stream priority (RFC 9218 extensible priorities).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamPriority {
    /// Urgency level, 0-7; lower is more urgent.
    pub urgency: u8,

    /// Whether the response can be processed incrementally.
    pub incremental: bool,
}

impl Default for StreamPriority {
    fn default() -> Self {
        Self {
            urgency: 3,
            incremental: false,
        }
    }
}

/// The priority queue surface the egress scheduler consumes.
pub trait EgressQueue {
    /// Register a stream. Registration does not mark it pending.
    fn insert(&mut self, id: StreamId, priority: StreamPriority);

    /// Remove a stream entirely.
    fn remove(&mut self, id: StreamId);

    /// Mark a stream as having egress to write.
    fn signal_pending_egress(&mut self, id: StreamId);

    /// Clear a stream's pending-egress mark, keeping it registered.
    fn clear_pending_egress(&mut self, id: StreamId);

    fn is_enqueued(&self, id: StreamId) -> bool;

    /// True when no stream has pending egress.
    fn is_empty(&self) -> bool;

    /// The next batch of eligible streams in priority order, each with the
    /// share of the egress budget it should receive.
    fn next_egress(&mut self) -> Vec<(StreamId, f64)>;
}

/// Default queue: urgency buckets with round-robin inside each bucket.
///
/// `next_egress` returns every stream of the most urgent non-empty bucket,
/// with equal ratios. Incremental streams rotate to the bucket tail so they
/// interleave across loop turns.
#[derive(Default)]
pub struct UrgencyQueue {
    priorities: HashMap<StreamId, StreamPriority>,
    buckets: BTreeMap<u8, VecDeque<StreamId>>,
}

impl UrgencyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn bucket_remove(&mut self, urgency: u8, id: StreamId) {
        if let Some(bucket) = self.buckets.get_mut(&urgency) {
            bucket.retain(|entry| *entry != id);
            if bucket.is_empty() {
                self.buckets.remove(&urgency);
            }
        }
    }
}

impl EgressQueue for UrgencyQueue {
    fn insert(&mut self, id: StreamId, priority: StreamPriority) {
        self.priorities.insert(id, priority);
    }

    fn remove(&mut self, id: StreamId) {
        if let Some(priority) = self.priorities.remove(&id) {
            self.bucket_remove(priority.urgency, id);
        }
    }

    fn signal_pending_egress(&mut self, id: StreamId) {
        let Some(priority) = self.priorities.get(&id).copied() else {
            return;
        };
        let bucket = self.buckets.entry(priority.urgency).or_default();
        if !bucket.contains(&id) {
            bucket.push_back(id);
        }
    }

    fn clear_pending_egress(&mut self, id: StreamId) {
        if let Some(priority) = self.priorities.get(&id).copied() {
            self.bucket_remove(priority.urgency, id);
        }
    }

    fn is_enqueued(&self, id: StreamId) -> bool {
        self.priorities
            .get(&id)
            .map(|priority| {
                self.buckets
                    .get(&priority.urgency)
                    .is_some_and(|bucket| bucket.contains(&id))
            })
            .unwrap_or(false)
    }

    fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    fn next_egress(&mut self) -> Vec<(StreamId, f64)> {
        let Some(bucket) = self.buckets.values_mut().next() else {
            return Vec::new();
        };
        let ratio = 1.0 / bucket.len() as f64;
        let batch: Vec<(StreamId, f64)> = bucket.iter().map(|id| (*id, ratio)).collect();
        // Rotate incremental streams so interleaving is fair across turns.
        if bucket.len() > 1 {
            if let Some(front) = bucket.front().copied() {
                let incremental = self
                    .priorities
                    .get(&front)
                    .map(|p| p.incremental)
                    .unwrap_or(false);
                if incremental {
                    bucket.rotate_left(1);
                }
            }
        }
        batch
    }
}
