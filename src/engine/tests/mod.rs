//! Dependency engine unit tests
//!
//! These drive the engine without worker threads: ready tasks sit on the
//! execution context until the test pulls them, which makes readiness
//! transitions observable.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::*;
use crate::exec::WorkerPool;
use crate::task::{TaskState, FLOW_OWNERSHIP_SPECIAL};
use crate::tile::{AccessKind, DataHandle, TileCollection};

/// Everything on rank 0.
struct OneRank;

impl TileCollection for OneRank {
    fn rank_of(&self, _: TileKey) -> u32 {
        0
    }

    fn data_of(&self, key: TileKey) -> Option<DataHandle> {
        Some(Arc::new(key))
    }
}

/// Tiles spread round-robin over two ranks.
struct TwoRanks;

impl TileCollection for TwoRanks {
    fn rank_of(&self, key: TileKey) -> u32 {
        (key % 2) as u32
    }

    fn data_of(&self, key: TileKey) -> Option<DataHandle> {
        Some(Arc::new(key))
    }
}

type Session = (Arc<Taskpool>, Arc<ExecutionContext>, Arc<TileMap>);

fn session_with(config: RuntimeConfig, collection: Arc<dyn TileCollection>) -> Session {
    let ctx = ExecutionContext::new(&config);
    let pool = Taskpool::new(config.clone()).unwrap();
    pool.attach(&ctx).unwrap();
    let map = Arc::new(TileMap::new(collection, &config));
    (pool, ctx, map)
}

fn session() -> Session {
    session_with(
        RuntimeConfig {
            nb_vps: 1,
            ..RuntimeConfig::default()
        },
        Arc::new(OneRank),
    )
}

/// Run every queued ready task on the calling thread; returns how many ran.
fn drive(pool: &Taskpool, ctx: &Arc<ExecutionContext>) -> usize {
    let mut ran = 0;
    while let Some(task) = ctx.select(0) {
        run_task(pool, ctx, 0, task);
        ran += 1;
    }
    ran
}

/// Body appending its tag parameter to a shared log.
fn tag_body(ctx: &mut TaskContext<'_>) {
    let log = ctx.reference::<Mutex<Vec<u64>>>(0);
    let tag: u64 = ctx.value(1);
    log.lock().push(tag);
}

/// Body bumping a shared counter.
fn bump_body(ctx: &mut TaskContext<'_>) {
    let counter = ctx.reference::<AtomicUsize>(0);
    counter.fetch_add(1, Ordering::SeqCst);
}

fn tagged(log: &Arc<Mutex<Vec<u64>>>, tag: u64) -> TaskSpec {
    TaskSpec::new(tag_body, "tagged")
        .reference(Arc::clone(log))
        .value(tag)
}

#[test]
fn test_parentless_write_is_ready_immediately() {
    let (pool, ctx, map) = session();
    let log = Arc::new(Mutex::new(Vec::new()));
    let x = map.tile_of(0);

    pool.insert(tagged(&log, 7).output(&x));
    let writer = pool.find_task(TaskId(0)).unwrap();
    assert_eq!(writer.state(), TaskState::Ready);
    assert_eq!(ctx.queued(), 1);

    assert_eq!(drive(&pool, &ctx), 1);
    assert_eq!(*log.lock(), vec![7]);
    assert_eq!(writer.state(), TaskState::Finished);
}

#[test]
fn test_single_writer_many_readers() {
    let (pool, ctx, map) = session();
    let log = Arc::new(Mutex::new(Vec::new()));
    let x = map.tile_of(0);

    pool.insert(tagged(&log, 100).output(&x));
    for tag in 1..=4 {
        pool.insert(tagged(&log, tag).input(&x));
    }

    let writer = pool.find_task(TaskId(0)).unwrap();
    let readers: Vec<_> = (1..=4)
        .map(|i| pool.find_task(TaskId(i)).unwrap())
        .collect();

    // Every reader's producer is the writer, and none is ready before the
    // writer completes.
    for reader in &readers {
        let parent = reader.flow(0).parent().unwrap();
        assert_eq!(parent.task.id(), writer.id());
        assert_eq!(reader.state(), TaskState::Waiting);
        assert!(reader.pending_flows() > 0);
    }

    assert_eq!(drive(&pool, &ctx), 5);
    assert_eq!(*log.lock(), vec![100, 1, 2, 3, 4]);
}

#[test]
fn test_write_after_write_chain() {
    let (pool, ctx, map) = session();
    let log = Arc::new(Mutex::new(Vec::new()));
    let x = map.tile_of(0);

    pool.insert(tagged(&log, 1).output(&x));
    pool.insert(tagged(&log, 2).output(&x));

    let w1 = pool.find_task(TaskId(0)).unwrap();
    let w2 = pool.find_task(TaskId(1)).unwrap();

    // The second writer depends on the first, and the tile's last writer is
    // the second.
    assert_eq!(w2.flow(0).parent().unwrap().task.id(), w1.id());
    assert_eq!(w2.state(), TaskState::Waiting);
    {
        let users = x.users();
        assert_eq!(
            users.last_writer.task.as_ref().unwrap().id(),
            w2.id()
        );
    }

    assert_eq!(drive(&pool, &ctx), 2);
    assert_eq!(*log.lock(), vec![1, 2]);
}

#[test]
fn test_same_task_double_access_read_then_write() {
    let (pool, ctx, map) = session();
    let log = Arc::new(Mutex::new(Vec::new()));
    let x = map.tile_of(0);

    pool.insert(tagged(&log, 1).output(&x));
    pool.insert(tagged(&log, 2).input(&x).output(&x));

    let double = pool.find_task(TaskId(1)).unwrap();
    // Exactly one satisfied-flow increment for the self-dependency: only the
    // read flow's predecessor remains outstanding.
    assert_eq!(double.pending_flows(), 1);

    // No deadlock acquiring the tile lock twice, and the task runs once.
    assert_eq!(drive(&pool, &ctx), 2);
    assert_eq!(*log.lock(), vec![1, 2]);
}

#[test]
fn test_same_task_write_then_read_marks_terminal_flow() {
    let (pool, ctx, map) = session();
    let log = Arc::new(Mutex::new(Vec::new()));
    let y = map.tile_of(1);

    pool.insert(tagged(&log, 5).output(&y).input(&y));
    let task = pool.find_task(TaskId(0)).unwrap();

    // Write-then-read on the same tile: the terminal read flow owns the
    // special ownership release.
    assert!(task.flow(1).has_flag(FLOW_OWNERSHIP_SPECIAL));
    assert!(!task.flow(0).has_flag(FLOW_OWNERSHIP_SPECIAL));

    assert_eq!(drive(&pool, &ctx), 1);
    assert_eq!(*log.lock(), vec![5]);
}

#[test]
fn test_untracked_and_value_only_tasks_are_ready() {
    let (pool, ctx, map) = session();
    let counter = Arc::new(AtomicUsize::new(0));
    let x = map.tile_of(0);

    pool.insert(
        TaskSpec::new(bump_body, "untracked")
            .reference(Arc::clone(&counter))
            .input(&x)
            .untracked(),
    );
    pool.insert(TaskSpec::new(bump_body, "value_only").reference(Arc::clone(&counter)));

    // No placeholder was synthesized for the untracked read.
    assert_eq!(ctx.queued(), 2);
    assert_eq!(drive(&pool, &ctx), 2);
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[test]
fn test_first_read_synthesizes_placeholder_writer() {
    let (pool, ctx, map) = session();
    let log = Arc::new(Mutex::new(Vec::new()));
    let x = map.tile_of(0);

    pool.insert(tagged(&log, 9).input(&x));

    let reader = pool.find_task(TaskId(0)).unwrap();
    let placeholder = pool.find_task(TaskId(1)).unwrap();
    assert_eq!(placeholder.class().name(), "first_writer");
    assert_eq!(
        reader.flow(0).parent().unwrap().task.id(),
        placeholder.id()
    );
    assert_eq!(reader.state(), TaskState::Waiting);

    // Placeholder runs first, costs nothing, and releases the reader.
    assert_eq!(drive(&pool, &ctx), 2);
    assert_eq!(*log.lock(), vec![9]);
}

#[test]
fn test_priority_order_on_ready_list() {
    let (pool, ctx, map) = session();
    let log = Arc::new(Mutex::new(Vec::new()));

    for (tag, priority) in [(1, 1), (5, 5), (3, 3)] {
        let tile = map.tile_of(tag);
        pool.insert(tagged(&log, tag).priority(priority as i32).output(&tile));
    }

    drive(&pool, &ctx);
    assert_eq!(*log.lock(), vec![5, 3, 1]);
}

#[test]
fn test_window_backpressure_blocks_inserter() {
    let config = RuntimeConfig {
        window_size: 4,
        threshold: 2,
        nb_vps: 1,
        ..RuntimeConfig::default()
    };
    let (pool, ctx, map) = session_with(config, Arc::new(OneRank));
    let counter = Arc::new(AtomicUsize::new(0));

    let total = 32;
    for key in 0..total {
        let tile = map.tile_of(key);
        pool.insert(
            TaskSpec::new(bump_body, "bump")
                .reference(Arc::clone(&counter))
                .output(&tile),
        );
    }

    // The window doubled up to its ceiling and stayed there.
    assert_eq!(pool.window_size(), 4);
    // The inserting thread had to join the workers: most tasks already ran
    // inside insert(), and the last blocking insertion drained the pending
    // count down to the threshold.
    assert!(counter.load(Ordering::SeqCst) as u64 >= total - 2);
    assert!(pool.nb_pending_tasks() <= 2);

    pool.wait();
    assert_eq!(counter.load(Ordering::SeqCst) as u64, total);
    assert_eq!(pool.nb_pending_tasks(), 0);
    assert_eq!(pool.nb_pending_actions(), 0);
}

#[test]
fn test_end_to_end_readiness_transition() {
    let (pool, ctx, map) = session();
    let log = Arc::new(Mutex::new(Vec::new()));
    let x = map.tile_of(0);

    pool.insert(tagged(&log, 1).output(&x));
    pool.insert(tagged(&log, 2).input(&x));

    let a = pool.find_task(TaskId(0)).unwrap();
    let b = pool.find_task(TaskId(1)).unwrap();

    assert_eq!(ctx.queued(), 1, "only the producer is ready");
    assert!(b.pending_flows() > 0);

    // Completing the producer moves the consumer to the ready list exactly
    // once.
    let first = ctx.select(0).unwrap();
    assert_eq!(first.id(), a.id());
    run_task(&pool, &ctx, 0, first);

    assert_eq!(b.state(), TaskState::Ready);
    assert_eq!(ctx.queued(), 1);
    assert_eq!(b.pending_flows(), 0);

    run_task(&pool, &ctx, 0, ctx.select(0).unwrap());
    assert_eq!(ctx.queued(), 0);
    assert_eq!(*log.lock(), vec![1, 2]);
}

#[test]
fn test_flush_retires_tile() {
    let (pool, ctx, map) = session();
    let counter = Arc::new(AtomicUsize::new(0));
    let x = map.tile_of(0);

    pool.insert(
        TaskSpec::new(bump_body, "bump")
            .reference(Arc::clone(&counter))
            .output(&x),
    );
    pool.flush_tile(&map, 0);

    drive(&pool, &ctx);
    pool.wait();

    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert!(x.is_flushed());
    assert_eq!(map.len(), 0);
    assert_eq!(pool.nb_pending_actions(), 0);
}

#[test]
fn test_flush_all_drains_registry() {
    let (pool, ctx, map) = session();
    let counter = Arc::new(AtomicUsize::new(0));
    for key in 0..6 {
        let tile = map.tile_of(key);
        pool.insert(
            TaskSpec::new(bump_body, "bump")
                .reference(Arc::clone(&counter))
                .inout(&tile),
        );
    }
    pool.flush_all(&map);
    drive(&pool, &ctx);
    pool.wait();
    assert_eq!(map.len(), 0);
    assert_eq!(counter.load(Ordering::SeqCst), 6);
}

#[test]
fn test_wait_with_worker_pool() {
    let config = RuntimeConfig {
        nb_vps: 2,
        ..RuntimeConfig::default()
    };
    let (pool, ctx, map) = session_with(config, Arc::new(OneRank));
    let log = Arc::new(Mutex::new(Vec::new()));
    let x = map.tile_of(0);

    let mut workers = WorkerPool::start(&pool, &ctx, 2);
    for tag in 0..50 {
        pool.insert(tagged(&log, tag).inout(&x));
    }
    pool.wait();
    workers.shutdown();

    // The read-write chain serializes in insertion order.
    assert_eq!(*log.lock(), (0..50).collect::<Vec<u64>>());
    assert_eq!(pool.nb_pending_tasks(), 0);
    assert_eq!(pool.nb_pending_actions(), 0);
}

#[test]
#[should_panic(expected = "before an execution context")]
fn test_insert_before_attach_panics() {
    let pool = Taskpool::new(RuntimeConfig::default()).unwrap();
    pool.insert(TaskSpec::new(first_writer_body, "too_early"));
}

#[test]
fn test_attach_twice_is_rejected() {
    let config = RuntimeConfig::default();
    let ctx = ExecutionContext::new(&config);
    let pool = Taskpool::new(config).unwrap();
    pool.attach(&ctx).unwrap();
    assert_eq!(pool.attach(&ctx), Err(crate::error::RuntimeError::AlreadyAttached));
}

#[test]
fn test_remote_lifecycle_nets_one_reference() {
    let config = RuntimeConfig {
        nb_ranks: 2,
        nb_vps: 1,
        ..RuntimeConfig::default()
    };
    let (pool, _ctx, map) = session_with(config, Arc::new(TwoRanks));
    let log = Arc::new(Mutex::new(Vec::new()));
    let remote = map.tile_of(1);
    assert_eq!(remote.rank(), 1);

    // A local read of a remote tile synthesizes a remote first writer. At
    // steady state the remote instance holds exactly one outstanding
    // obligation: its write flow.
    pool.insert(tagged(&log, 1).input(&remote));
    let reader = pool.find_task(TaskId(0)).unwrap();
    let placeholder = reader.flow(0).parent().unwrap().task;
    assert!(!placeholder.is_local());
    assert_eq!(placeholder.refs(), 1);

    // A remote writer superseding it releases that obligation and now nets
    // one itself.
    pool.insert(
        tagged(&log, 2)
            .output(&remote)
            .pin_to_owner(),
    );
    assert_eq!(placeholder.refs(), 0);
    let users = remote.users();
    let writer = users.last_writer.task.clone().unwrap();
    drop(users);
    assert!(!writer.is_local());
    assert_eq!(writer.refs(), 1);
}

#[test]
fn test_class_created_once_per_shape() {
    let (pool, ctx, map) = session();
    let log = Arc::new(Mutex::new(Vec::new()));
    let x = map.tile_of(0);
    let y = map.tile_of(1);

    pool.insert(tagged(&log, 1).output(&x));
    pool.insert(tagged(&log, 2).output(&y));
    // Same body, different arity: a distinct class.
    pool.insert(tagged(&log, 3).output(&x).input(&y));

    // tagged/1, tagged/2.
    assert_eq!(pool.nb_task_classes(), 2);

    let one_flow = pool.classes.find(TaskClass::class_key(tag_body, 1)).unwrap();
    let desc = one_flow.flow(0).unwrap();
    assert_eq!(desc.access, AccessKind::Write);
    assert!(desc.tracked);

    drive(&pool, &ctx);
}

#[test]
fn test_backoff_delay_is_bounded() {
    for misses in [0, 1, 2, 63, 64, 1000] {
        let delay = backoff_delay(misses);
        assert!(delay.as_nanos() <= (64 * 5410) as u128);
    }
}
