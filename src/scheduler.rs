//! Min-heap scheduler ordering connections by the next time they need
//!  processing, so a manager with thousands of idle connections only touches the
//!  ones that are actually due each poll.
//!
//! Entries are keyed so a reschedule supersedes older heap entries; superseded
//!  entries stay in the heap and are discarded lazily when popped. The
//!  `watermark` parameter implements the "don't reschedule sooner than the
//!  in-flight batch floor" rule: items rescheduled from within a processing
//!  batch cannot jump back into that same batch.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Instant;

use rustc_hash::FxHashMap;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct HeapEntry {
    due: Instant,
    seq: u64,
    key: u64,
}

pub struct Scheduler<T> {
    heap: BinaryHeap<Reverse<HeapEntry>>,
    items: FxHashMap<u64, (Instant, T)>,
    next_seq: u64,
}

impl<T> Scheduler<T> {
    pub fn new() -> Scheduler<T> {
        Scheduler {
            heap: BinaryHeap::new(),
            items: FxHashMap::default(),
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Schedules (or reschedules) `key` for `due`, floored at `watermark`.
    pub fn schedule(&mut self, key: u64, item: T, due: Instant, watermark: Option<Instant>) {
        let due = match watermark {
            Some(w) => due.max(w),
            None => due,
        };
        self.items.insert(key, (due, item));
        self.heap.push(Reverse(HeapEntry { due, seq: self.next_seq, key }));
        self.next_seq += 1;
    }

    pub fn remove(&mut self, key: u64) {
        self.items.remove(&key);
        // heap entries for it become stale and are skipped on pop
    }

    /// Pops one item whose due time is `<= now`, skipping stale heap entries.
    pub fn pop_due(&mut self, now: Instant) -> Option<T> {
        while let Some(Reverse(entry)) = self.heap.peek().copied() {
            if entry.due > now {
                return None;
            }
            self.heap.pop();

            // anything else is superseded or removed, drop the stale entry
            if self.items.get(&entry.key).is_some_and(|(due, _)| *due == entry.due) {
                if let Some((_, item)) = self.items.remove(&entry.key) {
                    return Some(item);
                }
            }
        }
        None
    }

    /// Earliest due time over all scheduled items.
    pub fn next_due(&self) -> Option<Instant> {
        self.items.values().map(|(due, _)| *due).min()
    }
}
