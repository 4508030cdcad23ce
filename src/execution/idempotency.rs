/// Bounded record of signal ids already submitted by the loop

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tracing::debug;

/// Insertion-ordered set with TTL and capacity eviction
///
/// Entries older than `ttl` are dropped on access, and the oldest entry is
/// dropped when `capacity` would be exceeded. `ttl` must cover the longest
/// plausible gap between approval and execution, otherwise an evicted id
/// could be submitted a second time.
#[derive(Debug)]
pub struct ExecutedSignals {
    capacity: usize,
    ttl: Duration,
    seen: HashMap<String, Instant>,
    order: VecDeque<(String, Instant)>,
    evicted: u64,
}

impl ExecutedSignals {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            seen: HashMap::new(),
            order: VecDeque::new(),
            evicted: 0,
        }
    }

    pub fn contains(&mut self, signal_id: &str) -> bool {
        self.expire(Instant::now());
        self.seen.contains_key(signal_id)
    }

    /// Record `signal_id`; returns false if it was already present
    pub fn insert(&mut self, signal_id: &str) -> bool {
        self.insert_at(signal_id, Instant::now())
    }

    fn insert_at(&mut self, signal_id: &str, now: Instant) -> bool {
        self.expire(now);
        if self.seen.contains_key(signal_id) {
            return false;
        }

        while self.seen.len() >= self.capacity {
            match self.order.pop_front() {
                Some((oldest, _)) => {
                    self.seen.remove(&oldest);
                    self.evicted += 1;
                    debug!(signal_id = %oldest, "Evicted executed signal id (capacity)");
                }
                None => break,
            }
        }

        self.seen.insert(signal_id.to_string(), now);
        self.order.push_back((signal_id.to_string(), now));
        true
    }

    fn expire(&mut self, now: Instant) {
        while let Some((id, inserted)) = self.order.front() {
            if now.duration_since(*inserted) < self.ttl {
                break;
            }
            self.seen.remove(id);
            self.order.pop_front();
            self.evicted += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn evicted(&self) -> u64 {
        self.evicted
    }
}
