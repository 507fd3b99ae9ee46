//! Task execution, successor release, and lifecycle end
//!
//! A completed task runs its successor release once per flow: the registered
//! successor (if any) gets the data binding propagated and its readiness
//! counter decremented, and a flow with no successor yet marks the tile
//! record dead so that a later task re-runs the release itself. Lifecycle
//! obligations drain through [`release_obligation`]; the last one retires
//! the instance.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::trace;

use crate::engine::Taskpool;
use crate::exec::ExecutionContext;
use crate::task::{TaskContext, TaskRef, TaskState, FLOW_DATA_RELEASED};

/// Run a ready task on the calling thread, then complete it.
///
/// This is the entry point both for worker threads and for an inserting
/// thread that joined back; `vp` is the virtual processor the caller drains.
pub fn run_task(pool: &Taskpool, ctx: &Arc<ExecutionContext>, vp: usize, task: TaskRef) {
    debug_assert!(task.is_local(), "remote tasks never execute here");
    debug_assert_eq!(task.state(), TaskState::Ready);
    task.set_state(TaskState::Running);
    trace!(task = %task.id(), class = task.class().name(), vp, "executing task");

    let mut view = TaskContext::new(&task);
    (task.class().body())(&mut view);

    complete_task(pool, ctx, vp, task);
}

/// Completion hook: notify successors on every flow, then drop the
/// execution obligation.
pub(crate) fn complete_task(pool: &Taskpool, ctx: &Arc<ExecutionContext>, vp: usize, task: TaskRef) {
    for flow_index in 0..task.flows().len() {
        release_flow(pool, ctx, &task, flow_index, vp);
    }
    task.set_state(TaskState::Finished);
    pool.nb_tasks.fetch_sub(1, Ordering::SeqCst);
    trace!(task = %task.id(), "task complete");
    release_obligation(pool, &task);
}

/// Successor-release logic for one flow.
///
/// Invoked once per flow when the task completes, and possibly again,
/// synchronously, by a successor that arrived after completion and missed
/// the natural notification. The successor link is taken exactly once, so
/// the two paths cannot both fire.
pub(crate) fn release_flow(
    pool: &Taskpool,
    ctx: &Arc<ExecutionContext>,
    task: &TaskRef,
    flow_index: usize,
    vp: usize,
) {
    let flow = task.flow(flow_index);
    let successor = match flow.tile() {
        Some(tile) => {
            let mut users = tile.users();
            let successor = flow.take_successor();
            if successor.is_none() {
                // Nobody chained behind this flow yet. Mark the record dead
                // so the next task on the tile re-runs this release.
                let record = &mut users.last_user;
                if record.alive
                    && record.flow == flow_index
                    && record.task.as_ref().is_some_and(|t| Arc::ptr_eq(t, task))
                {
                    record.alive = false;
                }
            }
            successor
        }
        None => flow.take_successor(),
    };

    let Some(link) = successor else {
        return;
    };

    if link.task.is_local() {
        // Propagate the data binding downstream before waking the task.
        let child_flow = link.task.flow(link.flow);
        if child_flow.data().is_none() {
            let data = flow.data().or_else(|| flow.tile().and_then(|t| t.data()));
            child_flow.set_data(data);
        }
        let ready = link.task.satisfy(1);
        trace!(
            parent = %task.id(),
            child = %link.task.id(),
            ready,
            "dependency released"
        );
        if ready {
            schedule_ready(ctx, Arc::clone(&link.task), vp);
        }
    } else {
        // Remote successor: record the destination once; the transport layer
        // owns the actual notification. The obligation taken when the remote
        // task chained behind a local writer ends here.
        if task.is_local() && flow.first_notify(link.task.rank()) {
            trace!(
                parent = %task.id(),
                child = %link.task.id(),
                rank = link.task.rank(),
                "remote successor recorded"
            );
        }
        release_obligation(pool, &link.task);
    }
}

/// Hand a task whose dependencies are all satisfied to the execution
/// context.
pub(crate) fn schedule_ready(ctx: &Arc<ExecutionContext>, task: TaskRef, vp: usize) {
    debug_assert!(task.is_local());
    debug_assert_eq!(
        task.state(),
        TaskState::Waiting,
        "task scheduled more than once"
    );
    task.set_state(TaskState::Ready);
    ctx.schedule(vp, task);
}

/// Drop one lifecycle obligation; the last one retires the instance.
///
/// Retirement drops the per-flow data bindings (each at most once — the
/// terminal flow of a same-task chain covers the flows that transferred
/// their binding to it), removes the task from the registry, and releases
/// the class instance reference. At steady state every retain is matched
/// here, verified by the underflow assertion in [`crate::task::Task`].
pub(crate) fn release_obligation(pool: &Taskpool, task: &TaskRef) {
    if !task.release() {
        return;
    }

    for flow in task.flows() {
        if flow.has_flag(FLOW_DATA_RELEASED) {
            continue;
        }
        flow.set_flag(FLOW_DATA_RELEASED);
        flow.clear_data();
    }

    if task.is_local() {
        pool.tasks.remove(task.id().0);
        let remaining = pool.nb_pending_actions.fetch_sub(1, Ordering::SeqCst) - 1;
        debug_assert!(remaining >= 1, "pending-action counter underflow");
    }
    task.class().release();
    trace!(task = %task.id(), "task retired");
}
