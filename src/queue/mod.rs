//! Deduplicating, delaying, rate-limited work queue
//!
//! The queue holds opaque keys (one per cluster). It guarantees that a key is
//! never queued twice and never handed to two workers at once:
//!
//! - `add` of a key that is already queued is a no-op.
//! - `add` of a key that is being processed marks it dirty; it is queued
//!   exactly once when the worker calls [`WorkQueue::done`].
//! - `add_after` parks the key in a min-heap keyed by ready time until the
//!   delay elapses, then behaves like `add`.
//!
//! Per key the lifecycle is `Idle -> Queued -> Processing -> {Idle | Queued}`.

mod backoff;

pub use backoff::BackoffPolicy;

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

/// A key waiting for its ready time
struct Delayed<K> {
    ready_at: Instant,
    seq: u64,
    key: K,
}

impl<K> PartialEq for Delayed<K> {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.seq == other.seq
    }
}

impl<K> Eq for Delayed<K> {}

impl<K> PartialOrd for Delayed<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for Delayed<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.ready_at, self.seq).cmp(&(other.ready_at, other.seq))
    }
}

struct State<K> {
    /// Keys ready to be handed out, in FIFO order
    queue: VecDeque<K>,
    /// Keys that need processing (queued, or re-added while processing)
    dirty: HashSet<K>,
    /// Keys currently held by a worker
    processing: HashSet<K>,
    /// Delayed keys, earliest first
    waiting: BinaryHeap<Reverse<Delayed<K>>>,
    /// Earliest ready time per delayed key; heap entries that disagree are stale
    deadlines: HashMap<K, Instant>,
    /// Consecutive failures per key
    failures: HashMap<K, u32>,
    seq: u64,
    shutting_down: bool,
}

impl<K: Clone + Eq + Hash> State<K> {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            dirty: HashSet::new(),
            processing: HashSet::new(),
            waiting: BinaryHeap::new(),
            deadlines: HashMap::new(),
            failures: HashMap::new(),
            seq: 0,
            shutting_down: false,
        }
    }

    fn add(&mut self, key: K) {
        if self.dirty.contains(&key) {
            return;
        }
        self.dirty.insert(key.clone());
        if self.processing.contains(&key) {
            return;
        }
        self.queue.push_back(key);
    }

    fn add_at(&mut self, key: K, ready_at: Instant) {
        if self.deadlines.get(&key).is_some_and(|at| *at <= ready_at) {
            return;
        }
        self.deadlines.insert(key.clone(), ready_at);
        self.seq = self.seq.wrapping_add(1);
        self.waiting.push(Reverse(Delayed {
            ready_at,
            seq: self.seq,
            key,
        }));
    }

    /// Move every delayed key whose time has come onto the ready queue
    fn promote_ready(&mut self, now: Instant) {
        while self
            .waiting
            .peek()
            .is_some_and(|Reverse(next)| next.ready_at <= now)
        {
            let Some(Reverse(entry)) = self.waiting.pop() else {
                break;
            };
            if self.deadlines.get(&entry.key) != Some(&entry.ready_at) {
                continue;
            }
            self.deadlines.remove(&entry.key);
            self.add(entry.key);
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.waiting.peek().map(|Reverse(next)| next.ready_at)
    }
}

/// Work queue shared between event sources and reconciliation workers
pub struct WorkQueue<K> {
    state: Mutex<State<K>>,
    notify: Notify,
    backoff: BackoffPolicy,
}

impl<K: Clone + Eq + Hash + Send> WorkQueue<K> {
    /// Create an empty queue using `backoff` for [`WorkQueue::add_rate_limited`]
    pub fn new(backoff: BackoffPolicy) -> Self {
        Self {
            state: Mutex::new(State::new()),
            notify: Notify::new(),
            backoff,
        }
    }

    /// Enqueue a key for immediate processing
    pub fn add(&self, key: K) {
        {
            let mut state = self.state.lock();
            if state.shutting_down {
                return;
            }
            state.add(key);
        }
        self.notify.notify_waiters();
    }

    /// Enqueue a key once `delay` has elapsed
    ///
    /// If the key is already waiting, the earlier of the two deadlines wins.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            return self.add(key);
        }
        {
            let mut state = self.state.lock();
            if state.shutting_down {
                return;
            }
            state.add_at(key, Instant::now() + delay);
        }
        self.notify.notify_waiters();
    }

    /// Enqueue a key after its per-key failure backoff
    pub fn add_rate_limited(&self, key: K) {
        let delay = {
            let mut state = self.state.lock();
            let failures = state.failures.entry(key.clone()).or_insert(0);
            let delay = self.backoff.delay_for(*failures);
            *failures = failures.saturating_add(1);
            delay
        };
        self.add_after(key, delay);
    }

    /// Reset the failure count of a key
    pub fn forget(&self, key: &K) {
        self.state.lock().failures.remove(key);
    }

    /// Consecutive failures recorded for a key
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.state.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Wait for the next ready key
    ///
    /// The returned key is marked as processing until [`WorkQueue::done`] is
    /// called for it. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);

            let deadline = {
                let mut state = self.state.lock();
                // Register before releasing the lock so no add() is missed.
                notified.as_mut().enable();
                if state.shutting_down {
                    return None;
                }
                state.promote_ready(Instant::now());
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                state.next_deadline()
            };

            match deadline {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Mark a key as no longer being processed
    ///
    /// If the key was re-added meanwhile, it goes back on the ready queue.
    pub fn done(&self, key: &K) {
        let requeued = {
            let mut state = self.state.lock();
            state.processing.remove(key);
            if state.dirty.contains(key) && !state.shutting_down {
                state.queue.push_back(key.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_waiters();
        }
    }

    /// Stop handing out keys and wake every waiting worker
    pub fn shut_down(&self) {
        self.state.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    /// True once [`WorkQueue::shut_down`] has been called
    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }

    /// Number of keys ready to be handed out
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// True if no key is ready right now
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of keys parked with a delay
    pub fn waiting_len(&self) -> usize {
        self.state.lock().deadlines.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn queue() -> WorkQueue<&'static str> {
        WorkQueue::new(BackoffPolicy {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
            multiplier: 2.0,
        })
    }

    #[tokio::test]
    async fn add_is_deduplicated_while_queued() {
        let q = queue();
        q.add("a");
        q.add("a");
        q.add("b");
        assert_eq!(q.len(), 2);

        assert_eq!(q.get().await, Some("a"));
        assert_eq!(q.get().await, Some("b"));
        assert!(q.is_empty());
    }

    /// Story: three change notifications arrive while a sync is running.
    /// Exactly one follow-up pass is scheduled, not three.
    #[tokio::test]
    async fn adds_during_processing_coalesce_into_one_pass() {
        let q = queue();
        q.add("a");
        let key = q.get().await.unwrap();

        q.add("a");
        q.add("a");
        q.add("a");
        assert_eq!(q.len(), 0, "a key being processed is never handed out twice");

        q.done(&key);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await, Some("a"));
        q.done(&"a");
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn done_without_readd_returns_key_to_idle() {
        let q = queue();
        q.add("a");
        let key = q.get().await.unwrap();
        q.done(&key);
        assert!(q.is_empty());

        q.add("a");
        assert_eq!(q.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn add_after_waits_for_delay() {
        let q = queue();
        let start = Instant::now();
        q.add_after("a", Duration::from_secs(10));
        assert!(q.is_empty());
        assert_eq!(q.waiting_len(), 1);

        assert_eq!(q.get().await, Some("a"));
        assert!(start.elapsed() >= Duration::from_secs(10));
        assert_eq!(q.waiting_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_keys_come_out_in_ready_order() {
        let q = queue();
        q.add_after("late", Duration::from_secs(20));
        q.add_after("early", Duration::from_secs(5));

        assert_eq!(q.get().await, Some("early"));
        assert_eq!(q.get().await, Some("late"));
    }

    #[tokio::test(start_paused = true)]
    async fn earlier_deadline_wins_for_same_key() {
        let q = queue();
        let start = Instant::now();
        q.add_after("a", Duration::from_secs(30));
        q.add_after("a", Duration::from_secs(5));
        q.add_after("a", Duration::from_secs(60));
        assert_eq!(q.waiting_len(), 1);

        assert_eq!(q.get().await, Some("a"));
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(5) && waited < Duration::from_secs(30));
        q.done(&"a");

        // The superseded heap entries must not resurrect the key.
        tokio::time::advance(Duration::from_secs(120)).await;
        q.add("b");
        assert_eq!(q.get().await, Some("b"));
        assert!(q.is_empty());
        assert_eq!(q.waiting_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_delay_is_immediate() {
        let q = queue();
        q.add_after("a", Duration::ZERO);
        assert_eq!(q.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_worker_wakes_on_add() {
        let q = Arc::new(queue());
        let worker = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;
        q.add("a");
        assert_eq!(worker.await.unwrap(), Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_adds_back_off_per_key() {
        let q = queue();
        q.add_rate_limited("a");
        q.add_rate_limited("a");
        q.add_rate_limited("a");
        assert_eq!(q.num_requeues(&"a"), 3);
        assert_eq!(q.num_requeues(&"b"), 0);

        q.forget(&"a");
        assert_eq!(q.num_requeues(&"a"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_delay_grows() {
        let q = queue();
        let start = Instant::now();
        q.add_rate_limited("a");
        assert_eq!(q.get().await, Some("a"));
        assert!(start.elapsed() >= Duration::from_secs(1));
        q.done(&"a");

        let second = Instant::now();
        q.add_rate_limited("a");
        assert_eq!(q.get().await, Some("a"));
        assert!(second.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn shutdown_wakes_waiters_and_rejects_adds() {
        let q = Arc::new(queue());
        let worker = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;

        q.shut_down();
        assert_eq!(worker.await.unwrap(), None);
        assert!(q.is_shutting_down());

        q.add("a");
        assert!(q.is_empty());
        assert_eq!(q.get().await, None);
    }
}
