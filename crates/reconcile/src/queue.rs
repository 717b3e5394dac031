//! Keyed work queue feeding a pool of reconcile workers.
//!
//! Notifications for a key coalesce while it waits; a key is never handed to
//! two workers at once, and notifications arriving while it is being worked
//! on are parked until the worker reports back. Retryable failures come back
//! after an exponential delay.

use std::collections::hash_map::Entry;
use std::collections::VecDeque;
use std::fmt;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use capstan_core::{CapstanError, CapstanResult};
use futures::FutureExt;
use metrics::{counter, histogram};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

pub trait QueueItem: Clone + Send + Sync + 'static {
    type Key: Eq + Hash + Clone + fmt::Display + Send + Sync + 'static;

    fn key(&self) -> Self::Key;

    /// Fold a later notification for the same key into this one.
    fn merge(&mut self, newer: Self) { *self = newer; }
}

#[async_trait]
pub trait Reconciler<T>: Send + Sync {
    async fn reconcile(&self, item: &T) -> CapstanResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self { Self { base: Duration::from_millis(5), max: Duration::from_secs(300) } }
}

impl Backoff {
    /// Delay before retry number `failures` (1-based).
    pub fn delay(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(31);
        self.base.saturating_mul(1u32 << exp).min(self.max)
    }
}

struct State<T: QueueItem> {
    pending: FxHashMap<T::Key, T>,
    order: VecDeque<T::Key>,
    active: FxHashSet<T::Key>,
    parked: FxHashMap<T::Key, T>,
    failures: FxHashMap<T::Key, u32>,
    shutdown: bool,
}

impl<T: QueueItem> Default for State<T> {
    fn default() -> Self {
        Self {
            pending: FxHashMap::default(),
            order: VecDeque::new(),
            active: FxHashSet::default(),
            parked: FxHashMap::default(),
            failures: FxHashMap::default(),
            shutdown: false,
        }
    }
}

pub struct WorkQueue<T: QueueItem> {
    name: &'static str,
    backoff: Backoff,
    state: Mutex<State<T>>,
    notify: Notify,
}

impl<T: QueueItem> WorkQueue<T> {
    pub fn new(name: &'static str, backoff: Backoff) -> Arc<Self> {
        Arc::new(Self { name, backoff, state: Mutex::new(State::default()), notify: Notify::new() })
    }

    pub fn name(&self) -> &'static str { self.name }

    fn lock(&self) -> MutexGuard<'_, State<T>> { self.state.lock().unwrap_or_else(PoisonError::into_inner) }

    pub fn add(&self, item: T) {
        let key = item.key();
        let mut guard = self.lock();
        let state = &mut *guard;
        if state.shutdown {
            return;
        }
        if state.active.contains(&key) {
            match state.parked.entry(key) {
                Entry::Occupied(mut e) => e.get_mut().merge(item),
                Entry::Vacant(v) => {
                    v.insert(item);
                }
            }
            return;
        }
        match state.pending.entry(key) {
            Entry::Occupied(mut e) => e.get_mut().merge(item),
            Entry::Vacant(v) => {
                state.order.push_back(v.key().clone());
                v.insert(item);
                drop(guard);
                self.notify.notify_one();
            }
        }
    }

    /// Next item to work on; `None` once the queue is shut down.
    pub async fn next(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut guard = self.lock();
                let state = &mut *guard;
                if state.shutdown {
                    return None;
                }
                while let Some(key) = state.order.pop_front() {
                    if let Some(item) = state.pending.remove(&key) {
                        state.active.insert(key);
                        return Some(item);
                    }
                }
            }
            notified.await;
        }
    }

    /// Report the outcome for an item obtained from [`next`](Self::next).
    pub fn done(self: &Arc<Self>, item: T, result: &CapstanResult<()>) {
        let key = item.key();
        let mut guard = self.lock();
        let state = &mut *guard;
        state.active.remove(&key);

        let retry = match result {
            Err(e) if e.is_retryable() => {
                let failures = state.failures.entry(key.clone()).or_insert(0);
                *failures += 1;
                Some(self.backoff.delay(*failures))
            }
            _ => {
                state.failures.remove(&key);
                None
            }
        };

        let parked = state.parked.remove(&key);
        drop(guard);

        match (parked, retry) {
            (Some(newer), Some(_)) => {
                let mut merged = item;
                merged.merge(newer);
                self.add(merged);
            }
            (Some(newer), None) => self.add(newer),
            (None, Some(delay)) => {
                counter!("workqueue_requeues_total", 1u64, "controller" => self.name);
                debug!(controller = self.name, %key, delay_ms = delay.as_millis() as u64, "requeue scheduled");
                let queue = Arc::clone(self);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    queue.requeue(item);
                });
            }
            (None, None) => {}
        }
    }

    /// Re-add a failed item unless fresher work for its key is already waiting.
    fn requeue(&self, item: T) {
        let key = item.key();
        {
            let state = self.lock();
            if state.pending.contains_key(&key) || state.parked.contains_key(&key) {
                return;
            }
        }
        self.add(item);
    }

    pub fn len(&self) -> usize { self.lock().pending.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn failures(&self, key: &T::Key) -> u32 { self.lock().failures.get(key).copied().unwrap_or(0) }

    pub fn shutdown(&self) {
        self.lock().shutdown = true;
        self.notify.notify_waiters();
    }
}

/// Start `workers` tasks draining `queue` into `reconciler`.
pub fn spawn_workers<T: QueueItem>(
    queue: Arc<WorkQueue<T>>,
    reconciler: Arc<dyn Reconciler<T>>,
    workers: usize,
) -> Vec<JoinHandle<()>> {
    (0..workers.max(1))
        .map(|_| {
            let queue = Arc::clone(&queue);
            let reconciler = Arc::clone(&reconciler);
            tokio::spawn(async move { run_worker(queue, reconciler).await })
        })
        .collect()
}

async fn run_worker<T: QueueItem>(queue: Arc<WorkQueue<T>>, reconciler: Arc<dyn Reconciler<T>>) {
    let controller = queue.name();
    while let Some(item) = queue.next().await {
        let key = item.key();
        let started = Instant::now();
        let result = match AssertUnwindSafe(reconciler.reconcile(&item)).catch_unwind().await {
            Ok(result) => result,
            Err(_) => Err(CapstanError::transient(format!("reconciler panicked on {key}"))),
        };
        histogram!("reconcile_latency_ms", started.elapsed().as_secs_f64() * 1000.0, "controller" => controller);

        let outcome = match &result {
            Ok(()) => {
                debug!(controller, %key, "reconciled");
                "ok"
            }
            Err(e) if e.is_retryable() => {
                warn!(controller, %key, error = %e, "reconcile failed, will retry");
                e.kind()
            }
            Err(e) => {
                error!(controller, %key, error = %e, "reconcile failed");
                e.kind()
            }
        };
        counter!("reconcile_total", 1u64, "controller" => controller, "result" => outcome);
        queue.done(item, &result);
    }
    debug!(controller, "worker stopped");
}
