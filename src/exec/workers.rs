//! Minimal worker pool
//!
//! Worker threads pull ready tasks from the virtual processors and run task
//! bodies. This is the smallest execution layer that makes the engine run
//! end-to-end; a host runtime with its own thread management only needs
//! [`ExecutionContext::select`] and the engine's task entry point.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use tracing::trace;

use crate::engine::{self, Taskpool};
use crate::exec::ExecutionContext;

/// Threads pulling ready tasks from an [`ExecutionContext`].
#[derive(Debug)]
pub struct WorkerPool {
    workers: Vec<thread::JoinHandle<()>>,
    running: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Spawn `nb_workers` worker threads for `pool`.
    pub fn start(pool: &Arc<Taskpool>, ctx: &Arc<ExecutionContext>, nb_workers: usize) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let mut workers = Vec::with_capacity(nb_workers);

        for worker_id in 0..nb_workers {
            let pool = Arc::clone(pool);
            let ctx = Arc::clone(ctx);
            let running = Arc::clone(&running);

            let worker = thread::Builder::new()
                .name(format!("tileflow-worker-{worker_id}"))
                .spawn(move || {
                    Self::worker_loop(worker_id, &pool, &ctx, &running);
                })
                .expect("failed to spawn worker thread");

            workers.push(worker);
        }

        Self { workers, running }
    }

    /// Worker thread main loop.
    fn worker_loop(
        worker_id: usize,
        pool: &Arc<Taskpool>,
        ctx: &Arc<ExecutionContext>,
        running: &Arc<AtomicBool>,
    ) {
        let vp = worker_id % ctx.nb_vps();
        let mut misses: u64 = 0;
        while running.load(Ordering::SeqCst) {
            match ctx.select(vp) {
                Some(task) => {
                    misses = 0;
                    engine::run_task(pool, ctx, vp, task);
                }
                None => {
                    misses += 1;
                    thread::sleep(engine::backoff_delay(misses));
                }
            }
        }
        trace!(worker_id, "worker stopping");
    }

    /// Whether the pool is accepting work.
    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the workers and wait for them to finish.
    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        for worker in self.workers.drain(..) {
            worker.join().expect("worker thread panicked");
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if self.is_running() {
            self.shutdown();
        }
    }
}
