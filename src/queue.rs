//! Blocking multi-producer multi-consumer priority queue used by the
//! push and pull worker pools.

use std::collections::BinaryHeap;
use std::sync::{Condvar, Mutex};

use crate::types::Priority;

/// Priority MPMC queue over `T`.
///
/// Higher priority is served first; ties are broken FIFO through a
/// monotone sequence number. `pop` blocks until an item arrives or the
/// queue is aborted; after `abort` every pop returns `None` immediately.
pub(crate) struct TaskQueue<T> {
    state: Mutex<State<T>>,
    available: Condvar,
}

struct State<T> {
    heap: BinaryHeap<Entry<T>>,
    next_seq: u64,
    aborted: bool,
}

struct Entry<T> {
    priority: Priority,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: highest priority first, then earliest sequence.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl<T> TaskQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                heap: BinaryHeap::new(),
                next_seq: 0,
                aborted: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Enqueue an item. Never blocks. Items pushed after `abort` are
    /// dropped.
    pub fn push(&self, item: T, priority: Priority) {
        let mut state = self.state.lock().unwrap();
        if state.aborted {
            return;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(Entry {
            priority,
            seq,
            item,
        });
        self.available.notify_one();
    }

    /// Block until an item is available and return it, or `None` once the
    /// queue has been aborted.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(entry) = state.heap.pop() {
                return Some(entry.item);
            }
            if state.aborted {
                return None;
            }
            state = self.available.wait(state).unwrap();
        }
    }

    /// Wake every waiter and make all subsequent pops return `None`.
    ///
    /// Items already queued are still drained before pops start failing.
    pub fn abort(&self) {
        let mut state = self.state.lock().unwrap();
        state.aborted = true;
        self.available.notify_all();
    }
}
