/// Concurrency primitives for Haystack.
/// Worker pools sized to leave room for generator subprocesses, cooperative
/// cancellation, and per-identifier locks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use dashmap::DashMap;
use tracing::{error, info};

/// Default worker count: half the cores, at least 2.
pub fn default_workers() -> usize {
    std::cmp::max(2, num_cpus::get() / 2)
}

/// Build a dedicated rayon pool for request handling.
/// Leaves the global rayon pool alone.
pub fn build_worker_pool(workers: Option<usize>) -> Result<rayon::ThreadPool> {
    let cores = num_cpus::get();
    let workers = workers.filter(|&w| w > 0).unwrap_or_else(default_workers);

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("haystack-worker-{}", i))
        .panic_handler(|payload| {
            error!(panic = %panic_message(payload.as_ref()), "worker task panicked");
        })
        .build()?;

    info!(workers, cores, "initialized worker pool");
    Ok(pool)
}

/// Text of a panic payload, for logging.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Shared flag that asks long-running work to stop.
///
/// A token may be linked to others; it then also reports their cancellation.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    own: Arc<AtomicBool>,
    linked: Vec<Arc<AtomicBool>>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self {
            own: Arc::new(AtomicBool::new(false)),
            linked: Vec::new(),
        }
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new token cancelled by its own `cancel`, or by either of `self` and `other`.
    pub fn linked_with(&self, other: &CancellationToken) -> CancellationToken {
        let mut linked = vec![Arc::clone(&self.own), Arc::clone(&other.own)];
        linked.extend(self.linked.iter().cloned());
        linked.extend(other.linked.iter().cloned());
        Self {
            own: Arc::new(AtomicBool::new(false)),
            linked,
        }
    }

    pub fn cancel(&self) {
        self.own.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.own.load(Ordering::SeqCst) || self.linked.iter().any(|f| f.load(Ordering::SeqCst))
    }
}

/// One mutex per key. Guards are independent across keys.
#[derive(Debug, Default)]
pub struct PathLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the lock for `key`; hold `lock()` on it for the critical section.
    pub fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Lock a mutex, recovering the guard if a previous holder panicked.
pub fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
