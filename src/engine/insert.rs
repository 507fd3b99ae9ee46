//! Task insertion and dependency wiring
//!
//! The insertion path resolves, per declared tile access, the producer the
//! new task must wait for, using the tile's last-user and last-writer
//! records. Flows that need no predecessor count as satisfied immediately;
//! the rest are released later, as their producers complete. A creation bias
//! of one on the readiness counter keeps predecessors from completing the
//! task while it is still being wired.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::class::{FlowDesc, ParamLayout, TaskClass};
use crate::engine::{first_writer_body, release, window, Taskpool};
use crate::exec::ExecutionContext;
use crate::task::{
    FlowInfo, FlowLink, Task, TaskArg, TaskId, TaskParam, TaskRef, TaskSpec,
    FLOW_OWNERSHIP_SPECIAL,
};
use crate::tile::{AccessKind, TileUser};

pub(crate) fn insert_task(pool: &Taskpool, spec: TaskSpec) {
    let ctx = Arc::clone(pool.context());
    let TaskSpec {
        body,
        name,
        priority,
        explicit_rank,
        args,
    } = spec;

    // First pass: rank resolution and shape accounting.
    let mut flow_count = 0usize;
    let mut write_flows = 0u32;
    let mut affinity_rank: Option<u32> = None;
    let mut params = ParamLayout::default();
    for arg in &args {
        match arg {
            TaskArg::Tile {
                tile,
                access,
                affinity,
                tracked,
            } => {
                flow_count += 1;
                if *tracked && access.is_write() {
                    write_flows += 1;
                }
                if *affinity {
                    if affinity_rank.is_none() {
                        affinity_rank = Some(tile.rank());
                    } else {
                        warn!(
                            task = name.as_str(),
                            "task is already placed; only the first affinity argument is effective"
                        );
                    }
                }
            }
            TaskArg::Value { bytes, .. } | TaskArg::Scratch(bytes) => {
                params.count += 1;
                params.bytes += bytes;
            }
            TaskArg::Reference(_) => {
                params.count += 1;
                params.bytes += std::mem::size_of::<usize>();
            }
        }
    }

    let rank = match explicit_rank {
        Some(rank) if rank < ctx.nb_ranks() => rank,
        Some(rank) => {
            warn!(rank, "explicit rank is out of range, placing task on rank 0");
            0
        }
        None => match affinity_rank {
            Some(rank) => rank,
            None if ctx.nb_ranks() > 1 && write_flows > 0 => panic!(
                "task '{name}' writes tiles on a multi-rank run but carries neither an \
                 affinity argument nor an explicit rank"
            ),
            None => ctx.my_rank(),
        },
    };
    let local = rank == ctx.my_rank();

    let class = pool.classes.find_or_create(body, &name, flow_count, params);
    class.retain();

    // Build flows and parameters in declaration order. Remote instances keep
    // only what dependency wiring needs.
    let mut flows = Vec::with_capacity(flow_count);
    let mut stored: Vec<TaskParam> = Vec::with_capacity(params.count);
    for arg in args {
        match arg {
            TaskArg::Tile {
                tile,
                access,
                tracked,
                ..
            } => flows.push(FlowInfo::new(tile, access, tracked)),
            TaskArg::Value { value, .. } => {
                if local {
                    stored.push(TaskParam::Value(value));
                }
            }
            TaskArg::Scratch(bytes) => {
                if local {
                    stored.push(TaskParam::Scratch(Mutex::new(vec![0u8; bytes])));
                }
            }
            TaskArg::Reference(handle) => {
                if local {
                    stored.push(TaskParam::Reference(handle));
                }
            }
        }
    }

    let id = TaskId(pool.next_task_id.fetch_add(1, Ordering::SeqCst));
    let task: TaskRef = Arc::new(Task::new(
        id,
        Arc::clone(&class),
        rank,
        local,
        priority,
        flows.into_boxed_slice(),
        stored.into_boxed_slice(),
    ));
    trace!(task = %id, class = class.name(), rank, local, "inserting task");

    if local {
        pool.nb_pending_actions
            .fetch_add(1, Ordering::SeqCst);
        pool.tasks.insert(id.0, Arc::clone(&task));
    } else {
        // Insertion scope: keeps the remote instance's obligations from
        // draining to zero while its flows are still being wired.
        task.retain();
    }

    let first_instance = class.take_first_instance();
    let mut satisfied: i32 = 0;
    for flow_index in 0..task.flows().len() {
        satisfied += wire_flow(pool, &ctx, &task, flow_index, first_instance);
    }

    if local {
        pool.nb_tasks
            .fetch_add(1, Ordering::SeqCst);
        pool.local_inserted
            .fetch_add(1, Ordering::SeqCst);
    }

    // Cancel the creation-time bias.
    satisfied += 1;

    if local {
        if task.satisfy(satisfied) {
            let vp = pool
                .next_vp
                .fetch_add(1, Ordering::SeqCst)
                % ctx.nb_vps();
            release::schedule_ready(&ctx, task, vp);
        }
        window::block_if_threshold_reached(pool, &ctx);
    } else {
        release::release_obligation(pool, &task);
    }
}

/// Resolve one declared tile access. Returns how many of the task's flows
/// this wiring satisfied immediately.
fn wire_flow(
    pool: &Taskpool,
    ctx: &Arc<ExecutionContext>,
    task: &TaskRef,
    flow_index: usize,
    first_instance: bool,
) -> i32 {
    let class = task.class();
    let flow = task.flow(flow_index);
    if first_instance {
        class.register_flow(
            flow_index,
            FlowDesc {
                access: flow.access(),
                tracked: flow.tracked(),
            },
        );
    }

    let tile = Arc::clone(flow.tile().expect("tile flows carry a tile"));
    let access = flow.access();

    // The caller opted out of dependency tracking for this flow.
    if !flow.tracked() {
        flow.set_data(tile.data());
        return 1;
    }

    let mut users = tile.users();

    // Parentless tile: synthesize a zero-cost first writer so every tile has
    // a well-defined producer before it is consumed, then re-read.
    if users.last_user.task.is_none()
        && (task.rank() != tile.rank() || access == AccessKind::Read)
    {
        drop(users);
        trace!(tile = tile.key(), "synthesizing first writer");
        insert_task(
            pool,
            TaskSpec::new(first_writer_body, "first_writer")
                .inout(&tile)
                .pin_to_owner(),
        );
        users = tile.users();
        debug_assert!(
            users.last_user.task.is_some(),
            "first-writer synthesis left the tile without a user"
        );
    }

    let last_user = users.last_user.clone();
    let last_writer = users.last_writer.clone();

    let mut put_in_chain = true;
    if access.is_write() {
        users.last_writer = TileUser {
            task: Some(Arc::clone(task)),
            flow: flow_index,
            access,
            alive: true,
        };
        if !task.is_local() {
            // One obligation per write flow a remote task carries, and one
            // more when it supersedes a local writer.
            task.retain();
            if let Some(previous) = &last_writer.task {
                if previous.is_local() {
                    task.retain();
                }
            }
        }
    } else {
        match &last_writer.task {
            Some(previous) if !previous.is_local() && !task.is_local() => {
                // Remote-to-remote read dependencies are not tracked locally.
                put_in_chain = false;
            }
            Some(previous) if previous.is_local() && !task.is_local() => {
                // Released again once the local writer has notified us.
                task.retain();
            }
            _ => {}
        }
    }

    if put_in_chain {
        users.last_user = TileUser {
            task: Some(Arc::clone(task)),
            flow: flow_index,
            access,
            alive: true,
        };
    }

    let same_task = last_user
        .task
        .as_ref()
        .is_some_and(|previous| Arc::ptr_eq(previous, task));
    let mut satisfied = 0;

    if last_user.alive {
        // The previous user has not run its successor release yet; we will
        // be notified naturally.
        if let Some(writer) = &last_writer.task {
            flow.set_parent(FlowLink {
                task: Arc::clone(writer),
                flow: last_writer.flow,
                access: last_writer.access,
            });
            TaskClass::record_edge(writer.class(), last_writer.flow, class, flow_index);
        }
        if put_in_chain {
            let previous = last_user.task.as_ref().expect("alive user has a task");
            previous.flow(last_user.flow).set_successor(FlowLink {
                task: Arc::clone(task),
                flow: flow_index,
                access,
            });
        }
        if same_task {
            // The task reuses, on this flow, a tile it already holds on an
            // earlier flow: the flow resolves against ourselves here and the
            // shared data binding moves across.
            satisfied += 1;
            flow.set_data(task.flow(last_user.flow).data());
            resolve_same_task_ordering(task, &last_user, flow_index, access);
        }
        drop(users);
    } else if let Some(previous) = last_user.task.clone() {
        // The previous user finished before we arrived, so the natural
        // notification was missed: wire up, then re-run its successor
        // release for that flow ourselves.
        if let Some(writer) = &last_writer.task {
            flow.set_parent(FlowLink {
                task: Arc::clone(writer),
                flow: last_writer.flow,
                access: last_writer.access,
            });
            TaskClass::record_edge(writer.class(), last_writer.flow, class, flow_index);
        }
        if put_in_chain {
            previous.flow(last_user.flow).set_successor(FlowLink {
                task: Arc::clone(task),
                flow: flow_index,
                access,
            });
            drop(users);
            release::release_flow(pool, ctx, &previous, last_user.flow, 0);
        } else {
            drop(users);
        }
    } else {
        // Parentless write on a locally owned tile: the tile's own store is
        // the input and the flow needs no predecessor.
        flow.set_data(tile.data());
        satisfied += 1;
        drop(users);
    }

    // A superseded remote writer has now been observed by every local
    // consumer that will ever chain behind it.
    if access.is_write() {
        if let Some(previous) = &last_writer.task {
            if !previous.is_local() {
                release::release_obligation(pool, previous);
            }
        }
    }

    satisfied
}

/// Same-task-reuses-same-tile ordering: when one task touches a tile on two
/// flows, ownership release belongs to the terminal flow only. A write
/// followed by a read marks the read; a read followed by a read moves the
/// mark forward; a read followed by a write returns the release to the
/// normal path.
fn resolve_same_task_ordering(
    task: &TaskRef,
    last_user: &TileUser,
    flow_index: usize,
    access: AccessKind,
) {
    let flow = task.flow(flow_index);
    let earlier = task.flow(last_user.flow);
    if last_user.access.is_write() && access == AccessKind::Read {
        flow.set_flag(FLOW_OWNERSHIP_SPECIAL);
    } else if last_user.access == AccessKind::Read && access == AccessKind::Read {
        earlier.clear_flag(FLOW_OWNERSHIP_SPECIAL);
        flow.set_flag(FLOW_OWNERSHIP_SPECIAL);
    } else if last_user.access == AccessKind::Read && access.is_write() {
        earlier.clear_flag(FLOW_OWNERSHIP_SPECIAL);
    }
}
