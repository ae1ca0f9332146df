use crate::errors::ErrorKind;
use crate::prelude::*;
use crate::server::metrics::Metrics;
use crate::workers::{registry, Worker, WorkerKind};
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Default)]
struct KindSlots {
    active: usize,
    idle: Vec<IdleWorker>,
}

struct IdleWorker {
    worker: Box<dyn Worker>,
    parked_at: Instant,
}

/// Per-kind worker pool: a counting semaphore capped at the descriptor's
/// `max_concurrent_instances`, with lazy instantiation and idle teardown.
pub struct WorkerPool {
    slots: Mutex<HashMap<WorkerKind, KindSlots>>,
    available: Condvar,
    metrics: Metrics,
}

impl WorkerPool {
    pub fn new(metrics: Metrics) -> Arc<Self> {
        Arc::new(WorkerPool {
            slots: Mutex::new(HashMap::new()),
            available: Condvar::new(),
            metrics,
        })
    }

    /// Blocks up to the deadline when the kind is saturated, then fails with
    /// `PoolExhausted`.
    pub fn acquire(
        self: &Arc<Self>,
        kind: WorkerKind,
        deadline: Instant,
    ) -> Result<WorkerHandle, ErrorKind> {
        let descriptor = registry::descriptor(kind)
            .ok_or_else(|| ErrorKind::Validation(format!("unknown worker kind {kind}")))?;

        let mut slots = self.slots.lock().unwrap();
        loop {
            let entry = slots.entry(kind).or_default();

            if let Some(idle) = entry.idle.pop() {
                entry.active += 1;
                return Ok(self.handle(kind, idle.worker));
            }

            if entry.active < descriptor.max_concurrent_instances {
                // Reserve the slot before instantiating outside the lock.
                entry.active += 1;
                drop(slots);

                return match registry::instantiate(kind) {
                    Ok(worker) => {
                        self.metrics.worker_started(kind.to_str());
                        Ok(self.handle(kind, worker))
                    }
                    Err(err) => {
                        let mut slots = self.slots.lock().unwrap();
                        if let Some(entry) = slots.get_mut(&kind) {
                            entry.active -= 1;
                        }
                        self.available.notify_one();
                        Err(ErrorKind::Internal(format!(
                            "failed to instantiate {kind}: {err}"
                        )))
                    }
                };
            }

            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return Err(ErrorKind::PoolExhausted(kind.to_string()));
            };
            let (guard, timeout) = self
                .available
                .wait_timeout(slots, remaining)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            slots = guard;
            if timeout.timed_out() {
                let entry = slots.entry(kind).or_default();
                if entry.idle.is_empty() && entry.active >= descriptor.max_concurrent_instances {
                    return Err(ErrorKind::PoolExhausted(kind.to_string()));
                }
            }
        }
    }

    fn handle(self: &Arc<Self>, kind: WorkerKind, worker: Box<dyn Worker>) -> WorkerHandle {
        WorkerHandle {
            worker: Some(worker),
            kind,
            pool: self.clone(),
        }
    }

    fn release(&self, kind: WorkerKind, worker: Box<dyn Worker>) {
        let mut slots = self.slots.lock().unwrap();
        let entry = slots.entry(kind).or_default();
        entry.active = entry.active.saturating_sub(1);
        entry.idle.push(IdleWorker {
            worker,
            parked_at: Instant::now(),
        });
        self.available.notify_one();
    }

    /// Tears down workers idle past the soft TTL. Called periodically by the
    /// server's maintenance loop.
    pub fn reap_idle(&self, idle_ttl: Duration) {
        let mut reaped = Vec::new();
        {
            let mut slots = self.slots.lock().unwrap();
            for (kind, entry) in slots.iter_mut() {
                let mut kept = Vec::new();
                for idle in entry.idle.drain(..) {
                    if idle.parked_at.elapsed() >= idle_ttl {
                        reaped.push((*kind, idle.worker));
                    } else {
                        kept.push(idle);
                    }
                }
                entry.idle = kept;
            }
        }

        for (kind, mut worker) in reaped {
            if let Err(err) = worker.shutdown() {
                warn!("worker {} shutdown failed: {}", kind, err);
            }
            self.metrics.worker_stopped(kind.to_str());
        }
    }

    pub fn stats(&self) -> Vec<PoolStats> {
        let slots = self.slots.lock().unwrap();
        let mut stats: Vec<PoolStats> = slots
            .iter()
            .map(|(kind, entry)| PoolStats {
                kind: *kind,
                active: entry.active,
                idle: entry.idle.len(),
            })
            .collect();
        stats.sort_by_key(|s| s.kind.to_str());
        stats
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct PoolStats {
    pub kind: WorkerKind,
    pub active: usize,
    pub idle: usize,
}

/// Checked-out worker; returning it to the pool happens on drop, so
/// cancellation unwinding releases the slot automatically.
pub struct WorkerHandle {
    worker: Option<Box<dyn Worker>>,
    kind: WorkerKind,
    pool: Arc<WorkerPool>,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("kind", &self.kind)
            .finish()
    }
}

impl Deref for WorkerHandle {
    type Target = dyn Worker;

    fn deref(&self) -> &Self::Target {
        self.worker.as_ref().unwrap().as_ref()
    }
}

impl DerefMut for WorkerHandle {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.worker.as_mut().unwrap().as_mut()
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.pool.release(self.kind, worker);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::WorkerPool;
    use crate::errors::ErrorKind;
    use crate::server::metrics::Metrics;
    use crate::workers::{registry, WorkerKind};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[test]
    fn test_acquire_reuses_idle_instances() {
        let pool = WorkerPool::new(Metrics::shared());

        let deadline = Instant::now() + Duration::from_secs(1);
        let handle = pool.acquire(WorkerKind::AnomalyDetector, deadline).unwrap();
        drop(handle);

        let _again = pool.acquire(WorkerKind::AnomalyDetector, deadline).unwrap();
        let stats = pool.stats();
        let anomaly = stats
            .iter()
            .find(|s| s.kind == WorkerKind::AnomalyDetector)
            .unwrap();
        assert_eq!(anomaly.active, 1);
        assert_eq!(anomaly.idle, 0);
    }

    #[test]
    fn test_saturated_pool_times_out() {
        let pool = WorkerPool::new(Metrics::shared());
        let max = registry::descriptor(WorkerKind::Aggregator)
            .unwrap()
            .max_concurrent_instances;

        let deadline = Instant::now() + Duration::from_secs(1);
        let _held: Vec<_> = (0..max)
            .map(|_| pool.acquire(WorkerKind::Aggregator, deadline).unwrap())
            .collect();

        let err = pool
            .acquire(WorkerKind::Aggregator, Instant::now() + Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(err, ErrorKind::PoolExhausted(_)));
    }

    #[test]
    fn test_concurrency_never_exceeds_cap() {
        let pool = WorkerPool::new(Metrics::shared());
        let max = registry::descriptor(WorkerKind::PatternAnalyzer)
            .unwrap()
            .max_concurrent_instances;

        let peak = Arc::new(AtomicUsize::new(0));
        let current = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..max * 4 {
            let pool = pool.clone();
            let peak = peak.clone();
            let current = current.clone();
            handles.push(std::thread::spawn(move || {
                let deadline = Instant::now() + Duration::from_secs(5);
                let handle = pool.acquire(WorkerKind::PatternAnalyzer, deadline).unwrap();

                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(10));
                current.fetch_sub(1, Ordering::SeqCst);

                drop(handle);
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= max);
    }

    #[test]
    fn test_reap_idle_tears_down_old_workers() {
        let pool = WorkerPool::new(Metrics::shared());
        let deadline = Instant::now() + Duration::from_secs(1);

        drop(pool.acquire(WorkerKind::TextualAnalyzer, deadline).unwrap());
        pool.reap_idle(Duration::from_secs(0));

        let stats = pool.stats();
        let textual = stats
            .iter()
            .find(|s| s.kind == WorkerKind::TextualAnalyzer)
            .unwrap();
        assert_eq!(textual.idle, 0);
        assert_eq!(textual.active, 0);
    }
}
