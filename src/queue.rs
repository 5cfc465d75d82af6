//! Bounded priority task queue.
//!
//! Decouples producers (the dispatcher) from consumer threads and enforces a
//! hard ceiling on the number of items *running* at once, independent of how
//! many are waiting. Ordering is highest priority first, then admission order.
//!
//! Consumers block in [`TaskQueue::pop`] until an item is admissible, a
//! cancelled item needs reporting, or the queue is closed.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::error::QueueError;
use crate::task::Priority;

/// Queued item wrapper.
struct Entry<T> {
    id: u64,
    priority: Priority,
    work: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.id == other.id
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first, then lower id (FIFO)
        match self.priority.cmp(&other.priority) {
            Ordering::Equal => other.id.cmp(&self.id),
            other => other,
        }
    }
}

struct State<T> {
    heap: BinaryHeap<Entry<T>>,
    /// Removed by `cancel`, waiting to be handed back to a consumer.
    cancelled: VecDeque<(u64, T)>,
    running: usize,
    next_id: u64,
    closed: bool,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    /// Signalled when work may have become admissible or the queue closed.
    available: Condvar,
    /// Signalled when the running count drops to zero.
    idle: Condvar,
    max_concurrent: usize,
    max_queued: usize,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// What a consumer receives from [`TaskQueue::pop`].
pub enum Dequeued<T> {
    /// Admitted for execution. The running slot is held until the admission
    /// (or its [`RunningSlot`]) is dropped.
    Run(Admission<T>),
    /// Removed by [`TaskQueue::cancel`] before it started.
    Cancelled { id: u64, work: T },
}

/// An item admitted for execution together with its running slot.
pub struct Admission<T> {
    id: u64,
    priority: Priority,
    work: T,
    slot: RunningSlot<T>,
}

impl<T> Admission<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn work(&self) -> &T {
        &self.work
    }

    /// Separate the work item from the slot so the caller can mutate the work
    /// and decide when to release the slot.
    pub fn split(self) -> (T, RunningSlot<T>) {
        (self.work, self.slot)
    }
}

/// Counts toward the concurrency ceiling until dropped.
pub struct RunningSlot<T> {
    shared: Arc<Shared<T>>,
}

impl<T> RunningSlot<T> {
    /// Release explicitly. Equivalent to dropping.
    pub fn release(self) {}
}

impl<T> Drop for RunningSlot<T> {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.running = state.running.saturating_sub(1);
        let idle = state.running == 0;
        drop(state);

        self.shared.available.notify_one();
        if idle {
            self.shared.idle.notify_all();
        }
    }
}

/// Generic blocking priority queue with a concurrency ceiling.
pub struct TaskQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for TaskQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> TaskQueue<T> {
    /// Create a queue.
    ///
    /// `max_concurrent` is clamped to at least 1. `max_queued == 0` means the
    /// number of waiting items is unbounded.
    pub fn new(max_concurrent: usize, max_queued: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    heap: BinaryHeap::new(),
                    cancelled: VecDeque::new(),
                    running: 0,
                    next_id: 0,
                    closed: false,
                }),
                available: Condvar::new(),
                idle: Condvar::new(),
                max_concurrent: max_concurrent.max(1),
                max_queued,
            }),
        }
    }

    /// Add an item. Returns its queue id immediately; never blocks on the
    /// consumer.
    pub fn enqueue(&self, work: T, priority: Priority) -> Result<u64, QueueError> {
        let mut state = self.shared.lock();

        if state.closed {
            return Err(QueueError::Closed);
        }
        if self.shared.max_queued > 0 && state.heap.len() >= self.shared.max_queued {
            return Err(QueueError::Full {
                capacity: self.shared.max_queued,
            });
        }

        state.next_id += 1;
        let id = state.next_id;
        state.heap.push(Entry { id, priority, work });

        debug!(
            queue_id = id,
            priority = priority.0,
            queued = state.heap.len(),
            running = state.running,
            "item enqueued"
        );
        drop(state);

        self.shared.available.notify_one();
        Ok(id)
    }

    /// Block until an item is admissible, a cancelled item is ready to be
    /// reported, or the queue is closed (`None`).
    pub fn pop(&self) -> Option<Dequeued<T>> {
        let mut state = self.shared.lock();
        loop {
            if let Some(next) = self.take_next(&mut state) {
                return Some(next);
            }
            if state.closed {
                return None;
            }
            state = self
                .shared
                .available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Non-blocking variant of [`pop`](Self::pop).
    pub fn try_pop(&self) -> Option<Dequeued<T>> {
        let mut state = self.shared.lock();
        self.take_next(&mut state)
    }

    fn take_next(&self, state: &mut State<T>) -> Option<Dequeued<T>> {
        if let Some((id, work)) = state.cancelled.pop_front() {
            return Some(Dequeued::Cancelled { id, work });
        }
        if state.closed || state.running >= self.shared.max_concurrent {
            return None;
        }

        let entry = state.heap.pop()?;
        state.running += 1;
        debug!(
            queue_id = entry.id,
            priority = entry.priority.0,
            running = state.running,
            "item admitted"
        );

        Some(Dequeued::Run(Admission {
            id: entry.id,
            priority: entry.priority,
            work: entry.work,
            slot: RunningSlot {
                shared: Arc::clone(&self.shared),
            },
        }))
    }

    /// Remove a waiting item. Returns false if it is already running, already
    /// cancelled, or unknown.
    pub fn cancel(&self, id: u64) -> bool {
        let mut state = self.shared.lock();

        // BinaryHeap doesn't support removal, so we rebuild it
        let mut entries = std::mem::take(&mut state.heap).into_vec();
        let position = entries.iter().position(|e| e.id == id);
        let removed = position.map(|i| entries.swap_remove(i));
        state.heap = BinaryHeap::from(entries);

        match removed {
            Some(entry) => {
                state.cancelled.push_back((entry.id, entry.work));
                debug!(queue_id = id, "queued item cancelled");
                drop(state);
                self.shared.available.notify_one();
                true
            }
            None => false,
        }
    }

    /// Reject further items, wake every waiting consumer and wait for running
    /// items to finish. Waiting items are left in place for [`drain`](Self::drain).
    ///
    /// Must not be called from a thread that holds an admission of this queue.
    pub fn close(&self) {
        let mut state = self.shared.lock();
        state.closed = true;
        self.shared.available.notify_all();

        while state.running > 0 {
            state = self
                .shared
                .idle
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Remove and return everything not yet running: cancelled items first,
    /// then waiting items in priority order.
    pub fn drain(&self) -> Vec<T> {
        let mut state = self.shared.lock();
        let mut drained: Vec<T> = state.cancelled.drain(..).map(|(_, work)| work).collect();

        let mut waiting = std::mem::take(&mut state.heap).into_sorted_vec();
        waiting.reverse();
        drained.extend(waiting.into_iter().map(|entry| entry.work));
        drained
    }

    /// Close the queue, wait for running items, and discard everything still
    /// queued. The discarded items are returned.
    pub fn shutdown(&self) -> Vec<T> {
        self.close();
        let discarded = self.drain();
        if !discarded.is_empty() {
            debug!(discarded = discarded.len(), "queue shut down with items pending");
        }
        discarded
    }

    /// Number of items waiting (not running).
    pub fn len(&self) -> usize {
        self.shared.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of admitted items whose slot has not been released.
    pub fn running(&self) -> usize {
        self.shared.lock().running
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    pub fn max_concurrent(&self) -> usize {
        self.shared.max_concurrent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::thread;
    use std::time::Duration;

    fn run<T>(dequeued: Option<Dequeued<T>>) -> Admission<T> {
        match dequeued {
            Some(Dequeued::Run(admission)) => admission,
            Some(Dequeued::Cancelled { id, .. }) => panic!("unexpected cancelled item {id}"),
            None => panic!("queue returned nothing"),
        }
    }

    #[test]
    fn ids_are_monotonic() {
        let queue = TaskQueue::new(1, 0);
        let a = queue.enqueue("a", Priority(1)).unwrap();
        let b = queue.enqueue("b", Priority(9)).unwrap();
        let c = queue.enqueue("c", Priority(1)).unwrap();
        assert!(a < b && b < c);
    }

    #[test]
    fn higher_priority_first_fifo_on_ties() {
        let queue = TaskQueue::new(1, 0);
        queue.enqueue("low", Priority(1)).unwrap();
        queue.enqueue("high-1", Priority(5)).unwrap();
        queue.enqueue("mid", Priority(3)).unwrap();
        queue.enqueue("high-2", Priority(5)).unwrap();

        let mut order = Vec::new();
        while let Some(Dequeued::Run(admission)) = queue.try_pop() {
            order.push(*admission.work());
        }
        assert_eq!(order, vec!["high-1", "high-2", "mid", "low"]);
    }

    #[test]
    fn ceiling_holds_items_until_slot_released() {
        let queue = TaskQueue::new(1, 0);
        queue.enqueue(1, Priority(0)).unwrap();
        queue.enqueue(2, Priority(0)).unwrap();

        let first = run(queue.try_pop());
        assert_eq!(queue.running(), 1);
        assert!(queue.try_pop().is_none(), "second item must wait for the slot");

        drop(first);
        assert_eq!(queue.running(), 0);
        let second = run(queue.try_pop());
        assert_eq!(*second.work(), 2);
    }

    #[test]
    fn full_queue_rejects() {
        let queue = TaskQueue::new(1, 2);
        queue.enqueue(1, Priority(0)).unwrap();
        queue.enqueue(2, Priority(0)).unwrap();
        assert_eq!(
            queue.enqueue(3, Priority(0)),
            Err(QueueError::Full { capacity: 2 })
        );
    }

    #[test]
    fn unbounded_when_max_queued_is_zero() {
        let queue = TaskQueue::new(1, 0);
        for i in 0..10_000 {
            queue.enqueue(i, Priority(0)).unwrap();
        }
        assert_eq!(queue.len(), 10_000);
    }

    #[test]
    fn cancel_waiting_item_hands_it_back() {
        let queue = TaskQueue::new(1, 0);
        let keep = queue.enqueue("keep", Priority(1)).unwrap();
        let drop_id = queue.enqueue("drop", Priority(9)).unwrap();

        assert!(queue.cancel(drop_id));
        assert!(!queue.cancel(drop_id), "second cancel is a no-op");
        assert_eq!(queue.len(), 1);

        match queue.try_pop() {
            Some(Dequeued::Cancelled { id, work }) => {
                assert_eq!(id, drop_id);
                assert_eq!(work, "drop");
            }
            _ => panic!("expected the cancelled item first"),
        }
        let admission = run(queue.try_pop());
        assert_eq!(admission.id(), keep);
    }

    #[test]
    fn cancel_running_item_fails() {
        let queue = TaskQueue::new(1, 0);
        let id = queue.enqueue("busy", Priority(0)).unwrap();
        let _admission = run(queue.try_pop());
        assert!(!queue.cancel(id));
        assert!(!queue.cancel(999));
    }

    #[test]
    fn enqueue_after_close_rejected() {
        let queue: TaskQueue<u8> = TaskQueue::new(1, 0);
        queue.close();
        assert_eq!(queue.enqueue(1, Priority(0)), Err(QueueError::Closed));
        assert!(queue.is_closed());
    }

    #[test]
    fn shutdown_wakes_blocked_consumer_and_discards() {
        let queue: TaskQueue<u32> = TaskQueue::new(1, 0);
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.pop().is_none())
        };
        thread::sleep(Duration::from_millis(50));

        assert!(queue.shutdown().is_empty());
        assert!(consumer.join().unwrap(), "blocked pop must return None");
    }

    #[test]
    fn shutdown_waits_for_running_then_returns_waiting_in_order() {
        let queue = TaskQueue::new(1, 0);
        queue.enqueue(1, Priority(5)).unwrap();
        queue.enqueue(2, Priority(1)).unwrap();
        queue.enqueue(3, Priority(3)).unwrap();

        let (work, slot) = run(queue.try_pop()).split();
        assert_eq!(work, 1);

        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            slot.release();
        });

        let discarded = queue.shutdown();
        assert_eq!(queue.running(), 0);
        assert_eq!(discarded, vec![3, 2]);
        releaser.join().unwrap();
    }

    #[test]
    fn concurrent_consumers_never_exceed_ceiling() {
        let queue = TaskQueue::new(2, 0);
        for i in 0..40 {
            queue.enqueue(i, Priority(i % 4)).unwrap();
        }

        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                let current = Arc::clone(&current);
                let peak = Arc::clone(&peak);
                let done = Arc::clone(&done);
                thread::spawn(move || {
                    while let Some(Dequeued::Run(admission)) = queue.pop() {
                        let now = current.fetch_add(1, AtomicOrdering::SeqCst) + 1;
                        peak.fetch_max(now, AtomicOrdering::SeqCst);
                        thread::sleep(Duration::from_millis(2));
                        current.fetch_sub(1, AtomicOrdering::SeqCst);
                        drop(admission);
                        if done.fetch_add(1, AtomicOrdering::SeqCst) + 1 == 40 {
                            break;
                        }
                    }
                })
            })
            .collect();

        while done.load(AtomicOrdering::SeqCst) < 40 {
            thread::sleep(Duration::from_millis(5));
        }
        queue.shutdown();
        for consumer in consumers {
            consumer.join().unwrap();
        }

        assert!(peak.load(AtomicOrdering::SeqCst) <= 2);
        assert_eq!(done.load(AtomicOrdering::SeqCst), 40);
    }
}
