//! Virtual clock for deterministic timer control in simulations.
//!
//! Time only moves when the simulation asks for the next due event, so a run
//! that would take minutes of wall-clock timeouts finishes instantly and
//! always fires timers in the same order.
//!
//! Every event is scheduled under a key. Scheduling again under the same key
//! replaces the pending event, and cancelling removes it. Replaced and
//! cancelled events stay in the heap and are skipped when popped.
//!
//! # Example
//!
//! ```
//! use fba_simulation::VirtualClock;
//! use std::time::Duration;
//!
//! let mut clock: VirtualClock<&str, u32> = VirtualClock::new();
//! clock.schedule("a", Duration::from_secs(2), 1);
//! clock.schedule("b", Duration::from_secs(1), 2);
//! clock.schedule("a", Duration::from_secs(3), 3);
//!
//! assert_eq!(clock.advance_to_next(), Some(("b", 2)));
//! assert_eq!(clock.advance_to_next(), Some(("a", 3)));
//! assert_eq!(clock.now(), Duration::from_secs(3));
//! assert_eq!(clock.advance_to_next(), None);
//! ```

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::hash::Hash;
use std::time::Duration;

/// A scheduled event's position in the queue.
///
/// Ordered by deadline, then by scheduling order so that events due at the
/// same instant fire first-in first-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Deadline {
    when: Duration,
    seq: u64,
}

impl Ord for Deadline {
    fn cmp(&self, other: &Self) -> Ordering {
        self.when
            .cmp(&other.when)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A keyed event queue over virtual time.
pub struct VirtualClock<K, T> {
    now: Duration,
    next_seq: u64,
    heap: BinaryHeap<Reverse<Deadline>>,
    /// Live events by sequence number. Absent means cancelled or replaced.
    events: HashMap<u64, (K, T)>,
    by_key: HashMap<K, u64>,
}

impl<K, T> Default for VirtualClock<K, T>
where
    K: Clone + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T> VirtualClock<K, T>
where
    K: Clone + Eq + Hash,
{
    /// Create a clock at time zero with nothing scheduled.
    pub fn new() -> Self {
        Self {
            now: Duration::ZERO,
            next_seq: 0,
            heap: BinaryHeap::new(),
            events: HashMap::new(),
            by_key: HashMap::new(),
        }
    }

    /// Current virtual time since the clock was created.
    pub fn now(&self) -> Duration {
        self.now
    }

    /// Schedule `payload` to fire `after` from now, replacing any pending
    /// event with the same key.
    pub fn schedule(&mut self, key: K, after: Duration, payload: T) {
        self.cancel(&key);

        let seq = self.next_seq;
        self.next_seq += 1;
        let when = self.now.saturating_add(after);

        self.heap.push(Reverse(Deadline { when, seq }));
        self.by_key.insert(key.clone(), seq);
        self.events.insert(seq, (key, payload));
    }

    /// Drop the pending event for `key`. Returns whether one existed.
    pub fn cancel(&mut self, key: &K) -> bool {
        match self.by_key.remove(key) {
            Some(seq) => self.events.remove(&seq).is_some(),
            None => false,
        }
    }

    /// Whether an event is pending under `key`.
    pub fn is_scheduled(&self, key: &K) -> bool {
        self.by_key.contains_key(key)
    }

    /// Number of live events.
    pub fn pending(&self) -> usize {
        self.events.len()
    }

    /// Deadline of the earliest live event.
    pub fn next_deadline(&mut self) -> Option<Duration> {
        self.skip_dead();
        self.heap.peek().map(|Reverse(deadline)| deadline.when)
    }

    /// Move time forward to the earliest live event and remove it.
    ///
    /// Time never moves backwards: an event scheduled in the past relative
    /// to a later [`advance_by`](Self::advance_by) fires at the current time.
    pub fn advance_to_next(&mut self) -> Option<(K, T)> {
        self.skip_dead();
        let Reverse(deadline) = self.heap.pop()?;
        let (key, payload) = self.events.remove(&deadline.seq)?;
        self.by_key.remove(&key);
        self.now = self.now.max(deadline.when);
        Some((key, payload))
    }

    /// Move time forward without firing anything.
    pub fn advance_by(&mut self, duration: Duration) {
        self.now = self.now.saturating_add(duration);
    }

    /// Pop every live event due at or before the current time.
    pub fn drain_due(&mut self) -> Vec<(K, T)> {
        let mut due = Vec::new();
        while let Some(when) = self.next_deadline() {
            if when > self.now {
                break;
            }
            if let Some(event) = self.advance_to_next() {
                due.push(event);
            }
        }
        due
    }

    fn skip_dead(&mut self) {
        while let Some(Reverse(deadline)) = self.heap.peek() {
            if self.events.contains_key(&deadline.seq) {
                break;
            }
            self.heap.pop();
        }
    }
}
