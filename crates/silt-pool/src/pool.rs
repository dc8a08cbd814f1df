//! The worker pool.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use silt_types::PoolConfig;

use crate::error::PoolError;
use crate::hint::SchedulingHint;
use crate::latch::CountdownLatch;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Process-wide CPU pressure signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuPressure {
    /// The host is CPU-saturated; shed pool threads.
    High,
    /// Pressure subsided; restore the full pool.
    Low,
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    /// Configured worker thread count.
    pub total: usize,
    /// Workers currently allowed to pick up jobs.
    pub active_limit: usize,
    /// Workers currently executing a job.
    pub busy: usize,
    /// Jobs waiting in the queue.
    pub queued: usize,
}

/// Outcome of [`WorkerPool::execute_batch`].
pub struct BatchOutcome<R> {
    /// Results available when the call returned, as (item index, result).
    pub completed: Vec<(usize, R)>,
    /// Channel delivering straggler results when the call resumed
    /// early; `None` when every item completed synchronously.
    pub pending: Option<Receiver<(usize, R)>>,
    /// True when the call returned before all items finished.
    pub resumed_early: bool,
}

struct PoolShared {
    queue: Mutex<VecDeque<Job>>,
    job_ready: Condvar,
    active_limit: AtomicUsize,
    busy: AtomicUsize,
    shutdown: AtomicBool,
    total: usize,
    unstoppable: usize,
    hint: Box<dyn SchedulingHint>,
}

/// Fixed pool of worker threads with CPU-pressure throttling.
///
/// Workers `0..unstoppable` are designated long-running threads that
/// are never throttled away; the remainder yield when the active limit
/// drops below their id.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    config: PoolConfig,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn the pool. A zero `workers` config means one per core.
    pub fn new(config: PoolConfig, hint: Box<dyn SchedulingHint>) -> Self {
        let requested = if config.workers == 0 {
            num_cpus::get()
        } else {
            config.workers
        };
        let total = requested.max(config.unstoppable_workers + 1);

        let shared = Arc::new(PoolShared {
            queue: Mutex::new(VecDeque::new()),
            job_ready: Condvar::new(),
            active_limit: AtomicUsize::new(total),
            busy: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            total,
            unstoppable: config.unstoppable_workers.min(total.saturating_sub(1)),
            hint,
        });

        let mut handles = Vec::with_capacity(total);
        for worker_id in 0..total {
            let shared = shared.clone();
            let handle = thread::Builder::new()
                .name(format!("silt-worker-{worker_id}"))
                .spawn(move || worker_loop(worker_id, shared))
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }

        debug!(workers = total, "Worker pool started");
        Self {
            shared,
            config,
            handles: Mutex::new(handles),
        }
    }

    /// Submit a single job.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) -> Result<(), PoolError> {
        if self.shared.shutdown.load(Ordering::SeqCst) {
            return Err(PoolError::ShutDown);
        }
        self.shared.queue.lock().push_back(Box::new(job));
        // notify_all: a notify_one could land on a throttled worker
        // that immediately goes back to waiting.
        self.shared.job_ready.notify_all();
        Ok(())
    }

    /// Execute `action` over every item on the pool.
    ///
    /// With `allow_partial_resumption`, the call returns once the
    /// configured completion ratio of items is done and enough workers
    /// are free again; straggler results arrive on
    /// [`BatchOutcome::pending`]. Without it, the call blocks until
    /// every item finished.
    pub fn execute_batch<T, R>(
        &self,
        items: Vec<T>,
        action: impl Fn(T) -> R + Send + Sync + 'static,
        allow_partial_resumption: bool,
    ) -> Result<BatchOutcome<R>, PoolError>
    where
        T: Send + 'static,
        R: Send + 'static,
    {
        let n = items.len();
        if n == 0 {
            return Ok(BatchOutcome {
                completed: Vec::new(),
                pending: None,
                resumed_early: false,
            });
        }

        let action = Arc::new(action);
        let (tx, rx) = mpsc::channel::<(usize, R)>();
        let latch = Arc::new(CountdownLatch::new(n));
        let done = Arc::new(AtomicUsize::new(0));

        for (i, item) in items.into_iter().enumerate() {
            let action = action.clone();
            let tx = tx.clone();
            let latch = latch.clone();
            let done = done.clone();
            self.submit(move || {
                match catch_unwind(AssertUnwindSafe(|| action(item))) {
                    Ok(result) => {
                        let _ = tx.send((i, result));
                    }
                    Err(_) => warn!(item = i, "Batch item panicked; result dropped"),
                }
                done.fetch_add(1, Ordering::SeqCst);
                latch.count_down();
            })?;
        }
        drop(tx);

        if allow_partial_resumption {
            let threshold =
                (((n as f64) * self.config.partial_completion_ratio).ceil() as usize).clamp(1, n);
            loop {
                if latch.wait_for(Duration::from_millis(2)) {
                    break;
                }
                if done.load(Ordering::SeqCst) >= threshold
                    && self.free_worker_ratio() >= self.config.free_thread_ratio
                {
                    break;
                }
            }
        } else {
            latch.wait();
        }

        let mut completed = Vec::new();
        while let Ok(entry) = rx.try_recv() {
            completed.push(entry);
        }
        let resumed_early = done.load(Ordering::SeqCst) < n;

        Ok(BatchOutcome {
            completed,
            pending: resumed_early.then_some(rx),
            resumed_early,
        })
    }

    /// React to a process-wide CPU pressure signal.
    ///
    /// High pressure halves the active worker limit, never below
    /// unstoppable + 1; low pressure restores the full pool. The
    /// platform hint is forwarded in both directions.
    pub fn on_cpu_pressure(&self, pressure: CpuPressure) {
        match pressure {
            CpuPressure::High => {
                let target = (self.shared.total / 2)
                    .max(self.shared.unstoppable + 1)
                    .min(self.shared.total);
                self.shared.active_limit.store(target, Ordering::SeqCst);
                self.shared.hint.throttle();
                debug!(active_limit = target, "Worker pool throttled");
            }
            CpuPressure::Low => {
                self.shared
                    .active_limit
                    .store(self.shared.total, Ordering::SeqCst);
                self.shared.hint.restore();
                debug!(active_limit = self.shared.total, "Worker pool restored");
            }
        }
        self.shared.job_ready.notify_all();
    }

    /// Current occupancy snapshot.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            total: self.shared.total,
            active_limit: self.shared.active_limit.load(Ordering::SeqCst),
            busy: self.shared.busy.load(Ordering::SeqCst),
            queued: self.shared.queue.lock().len(),
        }
    }

    /// Stop accepting work, drain the queue, and join every worker.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.job_ready.notify_all();
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if handle.join().is_err() {
                warn!("Worker thread panicked during shutdown");
            }
        }
        debug!("Worker pool shut down");
    }

    fn free_worker_ratio(&self) -> f64 {
        let active = self.shared.active_limit.load(Ordering::SeqCst).max(1);
        let busy = self.shared.busy.load(Ordering::SeqCst).min(active);
        (active - busy) as f64 / active as f64
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(worker_id: usize, shared: Arc<PoolShared>) {
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                if shared.shutdown.load(Ordering::SeqCst) && queue.is_empty() {
                    return;
                }
                let throttled = worker_id >= shared.active_limit.load(Ordering::SeqCst)
                    && worker_id >= shared.unstoppable;
                if !throttled {
                    if let Some(job) = queue.pop_front() {
                        break job;
                    }
                }
                shared.job_ready.wait(&mut queue);
            }
        };

        shared.busy.fetch_add(1, Ordering::SeqCst);
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            warn!(worker = worker_id, "Job panicked");
        }
        shared.busy.fetch_sub(1, Ordering::SeqCst);
    }
}
