//! Window backpressure
//!
//! Naive streaming insertion would hold an unbounded graph in memory. The
//! per-taskpool window starts at one task and doubles per insertion batch up
//! to the configured ceiling; once there, every window-th local insertion
//! makes the inserting thread join the workers until the pending count falls
//! back to the threshold. Producer and consumer rate couple without a
//! separate blocking queue.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rand::Rng;
use tracing::trace;

use crate::engine::{release, Taskpool};
use crate::exec::ExecutionContext;

/// Granularity of one backoff step.
const BACKOFF_STEP_NANOS: u64 = 5410;

/// Bounded exponential backoff: a random number of steps, growing with the
/// miss count, capped at 64 steps.
pub fn backoff_delay(misses: u64) -> Duration {
    let cap = misses.min(64);
    let steps = rand::rng().random_range(0..=cap);
    Duration::from_nanos(steps * BACKOFF_STEP_NANOS)
}

/// The calling thread executes ready tasks until the pending local task
/// count drops to `threshold`.
///
/// Misses poll with increasing backoff sleeps rather than spinning.
pub(crate) fn execute_and_come_back(pool: &Taskpool, ctx: &Arc<ExecutionContext>, threshold: i32) {
    let mut misses: u64 = 1;
    while pool.nb_tasks.load(Ordering::SeqCst) > threshold {
        if misses > 1 {
            thread::sleep(backoff_delay(misses));
        }
        // Assume the extraction fails; a hit resets the streak.
        misses += 1;
        if let Some(task) = ctx.select(0) {
            misses = 0;
            release::run_task(pool, ctx, 0, task);
        }
    }
}

/// End-of-insertion window bookkeeping. Doubles the window while it is below
/// the ceiling; at the ceiling, joins execution until the threshold is
/// reached. Returns `true` if the calling thread blocked.
pub(crate) fn block_if_threshold_reached(pool: &Taskpool, ctx: &Arc<ExecutionContext>) -> bool {
    let inserted = pool.local_inserted.load(Ordering::SeqCst);
    let window = pool.window.load(Ordering::SeqCst);
    if inserted % window as u64 != 0 {
        return false;
    }
    if window < pool.config.window_size {
        let doubled = (window * 2).min(pool.config.window_size);
        pool.window.store(doubled, Ordering::SeqCst);
        return false;
    }
    trace!(
        window,
        pending = pool.nb_pending_tasks(),
        "window exhausted, joining workers"
    );
    execute_and_come_back(pool, ctx, pool.config.threshold as i32);
    true
}

/// Poll the pending-action counter down to its bias. Returns only once every
/// inserted task has both executed and released its dependents.
pub(crate) fn wait_on_pending_actions(pool: &Taskpool) {
    let mut waited: u64 = 0;
    while pool.nb_pending_actions.load(Ordering::SeqCst) > 1 {
        waited += 1;
        if waited % 100 == 0 {
            thread::sleep(backoff_delay(waited / 100));
        } else {
            std::hint::spin_loop();
        }
    }
}
