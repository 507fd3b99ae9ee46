//! Taskpool and the dependency engine
//!
//! A taskpool is one scheduling session: it owns the task and task-class
//! registries, the monotonic task-id counter, the insertion window, and the
//! counters used for backpressure and completion detection. The insertion
//! path discovers producer-consumer edges through each tile's last-user and
//! last-writer records; completed tasks release their successors, which are
//! handed to the execution context in priority order.

use std::fmt;
use std::sync::atomic::{AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing::trace;

use crate::class::{ClassRegistry, ParamLayout, TaskClass};
use crate::config::RuntimeConfig;
use crate::error::RuntimeError;
use crate::exec::ExecutionContext;
use crate::table::ConcurrentTable;
use crate::task::{TaskBody, TaskContext, TaskId, TaskRef, TaskSpec};
use crate::tile::{TileKey, TileMap};

mod insert;
mod release;
mod window;
#[cfg(test)]
mod tests;

pub use release::run_task;
pub use window::backoff_delay;

/// Body of the synthesized first-writer placeholder: a zero-cost producer
/// bound to a tile before it is ever consumed.
fn first_writer_body(_: &mut TaskContext<'_>) {}

/// Body of the flush task: declares the end of a tile's life and returns it
/// to its registry's recycler.
fn flush_body(ctx: &mut TaskContext<'_>) {
    let map = ctx.reference::<TileMap>(0);
    let tile = ctx.flow_tile(0);
    tile.mark_flushed();
    map.release(&tile);
}

/// Container for one scheduling session.
pub struct Taskpool {
    config: RuntimeConfig,
    /// Task classes keyed by (body, flow-count) identity.
    classes: ClassRegistry,
    /// Live local tasks keyed by task id.
    tasks: ConcurrentTable<TaskRef>,
    next_task_id: AtomicU64,
    /// Local tasks inserted and not yet completed, plus the enqueue bias of
    /// one while attached.
    nb_tasks: AtomicI32,
    /// Outstanding lifecycle actions, plus the enqueue bias of one.
    nb_pending_actions: AtomicI32,
    /// Current insertion window; starts at 1 and doubles per batch up to the
    /// configured ceiling.
    window: AtomicUsize,
    /// Local tasks inserted so far.
    local_inserted: AtomicU64,
    /// Round-robin placement cursor for tasks ready at insertion.
    next_vp: AtomicUsize,
    ctx: OnceCell<Arc<ExecutionContext>>,
}

impl Taskpool {
    /// Create a taskpool for `config`.
    pub fn new(config: RuntimeConfig) -> Result<Arc<Self>, RuntimeError> {
        config.validate()?;
        Ok(Arc::new(Self {
            classes: ClassRegistry::new(6, config.collision_hint),
            tasks: ConcurrentTable::new(config.task_table_bits, config.collision_hint),
            next_task_id: AtomicU64::new(0),
            nb_tasks: AtomicI32::new(0),
            nb_pending_actions: AtomicI32::new(0),
            window: AtomicUsize::new(1),
            local_inserted: AtomicU64::new(0),
            next_vp: AtomicUsize::new(0),
            ctx: OnceCell::new(),
            config,
        }))
    }

    /// Attach the execution context. Must happen before the first insertion;
    /// attaching twice is an error.
    pub fn attach(&self, ctx: &Arc<ExecutionContext>) -> Result<(), RuntimeError> {
        self.ctx
            .set(Arc::clone(ctx))
            .map_err(|_| RuntimeError::AlreadyAttached)?;
        // The bias of one keeps the counters from announcing completion
        // while insertion is still possible.
        self.nb_tasks.store(1, Ordering::SeqCst);
        self.nb_pending_actions.store(1, Ordering::SeqCst);
        Ok(())
    }

    /// The attached execution context.
    ///
    /// Panics when called before [`Taskpool::attach`] — inserting into an
    /// unattached taskpool is a graph-construction contract violation.
    pub fn context(&self) -> &Arc<ExecutionContext> {
        self.ctx.get().unwrap_or_else(|| {
            panic!("taskpool used before an execution context was attached")
        })
    }

    /// The session configuration.
    #[inline]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Insert one task, wiring it behind the current users of its tiles.
    ///
    /// Ready tasks are handed to the execution context immediately; others
    /// stay pending until their predecessors complete. Once the insertion
    /// window is exhausted, the calling thread joins the workers until the
    /// pending count falls below the configured threshold.
    pub fn insert(&self, spec: TaskSpec) {
        insert::insert_task(self, spec);
    }

    /// Register (or look up) the task class for `body` with the given shape.
    ///
    /// Insertion does this lazily; calling it up front is only useful to
    /// pre-warm the registry.
    pub fn create_task_class(
        &self,
        body: TaskBody,
        name: &str,
        param_count: usize,
        param_bytes: usize,
        flow_count: usize,
    ) -> Arc<TaskClass> {
        self.classes.find_or_create(
            body,
            name,
            flow_count,
            ParamLayout {
                count: param_count,
                bytes: param_bytes,
            },
        )
    }

    /// Insert a flush task for `key`: after every access inserted so far has
    /// completed, the tile leaves the registry and may be recycled. No
    /// further accesses may be issued on it.
    pub fn flush_tile(&self, map: &Arc<TileMap>, key: TileKey) {
        let Some(tile) = map.find(key) else {
            return;
        };
        trace!(key, "flushing tile");
        tile.retain();
        self.insert(
            TaskSpec::new(flush_body, "tile_flush")
                .reference(Arc::clone(map))
                .inout(&tile)
                .pin_to_owner(),
        );
    }

    /// Flush every live tile of `map`.
    pub fn flush_all(&self, map: &Arc<TileMap>) {
        for key in map.live_keys() {
            self.flush_tile(map, key);
        }
    }

    /// Block until every task inserted so far, and their transitive
    /// releases, have completed. The calling thread joins execution while
    /// waiting.
    pub fn wait(&self) {
        let ctx = Arc::clone(self.context());
        window::execute_and_come_back(self, &ctx, 1);
        window::wait_on_pending_actions(self);
    }

    /// Local tasks inserted and not yet completed.
    pub fn nb_pending_tasks(&self) -> i32 {
        (self.nb_tasks.load(Ordering::SeqCst) - 1).max(0)
    }

    /// Outstanding lifecycle actions.
    pub fn nb_pending_actions(&self) -> i32 {
        (self.nb_pending_actions.load(Ordering::SeqCst) - 1).max(0)
    }

    /// Current insertion window size.
    #[inline]
    pub fn window_size(&self) -> usize {
        self.window.load(Ordering::SeqCst)
    }

    /// Number of registered task classes.
    #[inline]
    pub fn nb_task_classes(&self) -> usize {
        self.classes.len()
    }

    /// Look up a live local task by id.
    #[inline]
    pub fn find_task(&self, id: TaskId) -> Option<TaskRef> {
        self.tasks.find(id.0)
    }
}

impl Drop for Taskpool {
    fn drop(&mut self) {
        self.classes.release_all();
    }
}

impl fmt::Debug for Taskpool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Taskpool")
            .field("classes", &self.classes)
            .field("nb_tasks", &self.nb_tasks.load(Ordering::SeqCst))
            .field(
                "nb_pending_actions",
                &self.nb_pending_actions.load(Ordering::SeqCst),
            )
            .field("window", &self.window_size())
            .finish()
    }
}
