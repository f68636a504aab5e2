//! Worker pool for parallel engine jobs
//!
//! A fixed set of threads draining a FIFO queue. The model-update
//! coordinator fans its validation, population, and rewrite jobs out over
//! the pool and waits on a completion latch; the first failing job's error
//! wins.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::error;
use velox_core::{DbError, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolShared {
    queue: Mutex<VecDeque<Job>>,
    available: Condvar,
    shutdown: AtomicBool,
}

/// Fixed-size worker pool.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `threads` workers (at least one).
    pub fn new(threads: usize) -> Self {
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let workers = (0..threads.max(1))
            .map(|i| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("velox-worker-{i}"))
                    .spawn(move || worker_loop(shared))
                    .expect("spawn worker thread")
            })
            .collect();
        WorkerPool { shared, workers }
    }

    /// Pool sized to the machine.
    pub fn with_default_size() -> Self {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self::new(threads)
    }

    /// Number of worker threads.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Enqueue one fire-and-forget job.
    pub fn submit(&self, job: Job) {
        let mut queue = self.shared.queue.lock();
        queue.push_back(job);
        self.shared.available.notify_one();
    }

    /// Run jobs across the pool and wait for all of them.
    ///
    /// Returns the first error any job produced.
    pub fn run_parallel(
        &self,
        jobs: Vec<Box<dyn FnOnce() -> Result<()> + Send + 'static>>,
    ) -> Result<()> {
        if jobs.is_empty() {
            return Ok(());
        }
        struct Latch {
            state: Mutex<(usize, Option<DbError>)>,
            done: Condvar,
        }
        let latch = Arc::new(Latch {
            state: Mutex::new((jobs.len(), None)),
            done: Condvar::new(),
        });
        for job in jobs {
            let latch = Arc::clone(&latch);
            self.submit(Box::new(move || {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(job))
                    .unwrap_or(Err(DbError::Unknown));
                let mut state = latch.state.lock();
                if let Err(err) = outcome {
                    if state.1.is_none() {
                        state.1 = Some(err);
                    }
                }
                state.0 -= 1;
                if state.0 == 0 {
                    latch.done.notify_all();
                }
            }));
        }
        let mut state = latch.state.lock();
        while state.0 > 0 {
            latch.done.wait(&mut state);
        }
        match state.1.take() {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(job) = queue.pop_front() {
                    break Some(job);
                }
                if shared.shutdown.load(Ordering::Acquire) {
                    break None;
                }
                shared.available.wait(&mut queue);
            }
        };
        match job {
            None => return,
            Some(job) => {
                if std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)).is_err() {
                    error!(target: "velox::workers", "worker job panicked");
                }
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.available.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers.len())
            .finish()
    }
}
