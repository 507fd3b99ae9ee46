//! Task instances
//!
//! A task is one instance of a task class: a body invocation with an ordered
//! list of declared arguments. Tile arguments become *flows*, the unit of
//! dependency tracking; value, scratch and reference arguments are copied or
//! handed through untouched.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use smallvec::SmallVec;

use crate::class::TaskClass;
use crate::tile::{AccessKind, DataHandle, Tile};


/// Shared handle to a task.
pub type TaskRef = Arc<Task>;

/// Body signature of every task. Bodies unpack their arguments through the
/// [`TaskContext`].
pub type TaskBody = fn(&mut TaskContext<'_>);

/// Unique monotonic task identifier; also the task's key in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub u64);

impl TaskId {
    /// Get the inner value.
    #[inline]
    pub fn inner(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Task({})", self.0)
    }
}

/// Task state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Waiting for dependencies.
    Waiting,
    /// All dependencies satisfied; sitting on a ready list.
    Ready,
    /// Currently executing.
    Running,
    /// Execution and successor release finished.
    Finished,
}

impl TaskState {
    /// Convert from u8 (for atomic storage).
    #[inline]
    pub fn from_u8(val: u8) -> Self {
        match val {
            0 => TaskState::Waiting,
            1 => TaskState::Ready,
            2 => TaskState::Running,
            _ => TaskState::Finished,
        }
    }

    /// Convert to u8 (for atomic storage).
    #[inline]
    pub fn as_u8(&self) -> u8 {
        match self {
            TaskState::Waiting => 0,
            TaskState::Ready => 1,
            TaskState::Running => 2,
            TaskState::Finished => 3,
        }
    }
}

/// One declared argument of a task.
pub enum TaskArg {
    /// By-value parameter, copied into the task.
    Value {
        /// The boxed copy.
        value: Box<dyn Any + Send + Sync>,
        /// Declared size, for the class parameter layout.
        bytes: usize,
    },
    /// Scratch buffer of the given size, private to one execution.
    Scratch(usize),
    /// Opaque shared handle, passed through untouched and never tracked.
    Reference(Arc<dyn Any + Send + Sync>),
    /// Tile access with a declared mode.
    Tile {
        /// The tile being accessed.
        tile: Arc<Tile>,
        /// Declared access mode.
        access: AccessKind,
        /// Pin the task's execution rank to this tile's owner.
        affinity: bool,
        /// Whether the flow participates in dependency tracking.
        tracked: bool,
    },
}

impl fmt::Debug for TaskArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskArg::Value { bytes, .. } => write!(f, "Value({bytes} bytes)"),
            TaskArg::Scratch(bytes) => write!(f, "Scratch({bytes})"),
            TaskArg::Reference(_) => write!(f, "Reference"),
            TaskArg::Tile { tile, access, .. } => {
                write!(f, "Tile({}, {:?})", tile.key(), access)
            }
        }
    }
}

/// A stored non-tile parameter.
pub(crate) enum TaskParam {
    Value(Box<dyn Any + Send + Sync>),
    Scratch(Mutex<Vec<u8>>),
    Reference(Arc<dyn Any + Send + Sync>),
}

/// The flow's data binding was dropped at lifecycle end.
pub(crate) const FLOW_DATA_RELEASED: u8 = 1 << 0;
/// Terminal flow of a same-task multi-access chain; responsible for the
/// ownership release the earlier flows skipped.
pub(crate) const FLOW_OWNERSHIP_SPECIAL: u8 = 1 << 1;

/// Reference to one flow of one task.
#[derive(Clone)]
pub struct FlowLink {
    /// The linked task.
    pub task: TaskRef,
    /// Flow index within that task.
    pub flow: usize,
    /// Access mode of that flow.
    pub access: AccessKind,
}

impl fmt::Debug for FlowLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.task.id(), self.flow)
    }
}

/// Dependency bookkeeping of one declared tile access.
pub struct FlowInfo {
    tile: Option<Arc<Tile>>,
    access: AccessKind,
    tracked: bool,
    flags: AtomicU8,
    /// Data binding for this flow, propagated from the producer.
    data: Mutex<Option<DataHandle>>,
    /// Producer of the data this flow consumes.
    parent: Mutex<Option<FlowLink>>,
    /// Consumer registered behind this flow. Taken exactly once when the
    /// successor is notified.
    successor: Mutex<Option<FlowLink>>,
    /// Ranks already notified for this flow (broadcast de-duplication).
    notified: Mutex<SmallVec<[u64; 1]>>,
}

impl FlowInfo {
    pub(crate) fn new(tile: Arc<Tile>, access: AccessKind, tracked: bool) -> Self {
        Self {
            tile: Some(tile),
            access,
            tracked,
            flags: AtomicU8::new(0),
            data: Mutex::new(None),
            parent: Mutex::new(None),
            successor: Mutex::new(None),
            notified: Mutex::new(SmallVec::new()),
        }
    }

    /// The accessed tile.
    #[inline]
    pub fn tile(&self) -> Option<&Arc<Tile>> {
        self.tile.as_ref()
    }

    /// Declared access mode.
    #[inline]
    pub fn access(&self) -> AccessKind {
        self.access
    }

    /// Whether the flow participates in dependency tracking.
    #[inline]
    pub fn tracked(&self) -> bool {
        self.tracked
    }

    /// Current data binding.
    #[inline]
    pub fn data(&self) -> Option<DataHandle> {
        self.data.lock().clone()
    }

    pub(crate) fn set_data(&self, data: Option<DataHandle>) {
        *self.data.lock() = data;
    }

    pub(crate) fn clear_data(&self) {
        *self.data.lock() = None;
    }

    /// Producer link, if wired.
    #[inline]
    pub fn parent(&self) -> Option<FlowLink> {
        self.parent.lock().clone()
    }

    pub(crate) fn set_parent(&self, link: FlowLink) {
        *self.parent.lock() = Some(link);
    }

    /// Peek at the registered successor (tests).
    #[inline]
    pub fn successor(&self) -> Option<FlowLink> {
        self.successor.lock().clone()
    }

    pub(crate) fn set_successor(&self, link: FlowLink) {
        let mut successor = self.successor.lock();
        debug_assert!(successor.is_none(), "flow successor wired twice");
        *successor = Some(link);
    }

    /// Take the successor for notification; each successor is notified
    /// exactly once.
    pub(crate) fn take_successor(&self) -> Option<FlowLink> {
        self.successor.lock().take()
    }

    pub(crate) fn set_flag(&self, flag: u8) {
        self.flags.fetch_or(flag, Ordering::SeqCst);
    }

    pub(crate) fn clear_flag(&self, flag: u8) {
        self.flags.fetch_and(!flag, Ordering::SeqCst);
    }

    pub(crate) fn has_flag(&self, flag: u8) -> bool {
        self.flags.load(Ordering::SeqCst) & flag != 0
    }

    /// Mark `rank` notified for this flow. Returns `true` the first time.
    pub(crate) fn first_notify(&self, rank: u32) -> bool {
        let mut words = self.notified.lock();
        let word = rank as usize / 64;
        let mask = 1u64 << (rank % 64);
        if words.len() <= word {
            words.resize(word + 1, 0);
        }
        if words[word] & mask != 0 {
            return false;
        }
        words[word] |= mask;
        true
    }

}

impl fmt::Debug for FlowInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowInfo")
            .field("tile", &self.tile.as_ref().map(|t| t.key()))
            .field("access", &self.access)
            .field("tracked", &self.tracked)
            .finish()
    }
}

/// One instance of a task class.
pub struct Task {
    id: TaskId,
    class: Arc<TaskClass>,
    rank: u32,
    local: bool,
    priority: i32,
    state: AtomicU8,
    /// Dependencies remaining before the task is ready. Initialised to
    /// flow-count + 1 so predecessors cannot complete the task while the
    /// inserting thread is still wiring it.
    pending: AtomicI32,
    /// Outstanding lifecycle obligations.
    refs: AtomicI32,
    flows: Box<[FlowInfo]>,
    params: Box<[TaskParam]>,
}

impl Task {
    pub(crate) fn new(
        id: TaskId,
        class: Arc<TaskClass>,
        rank: u32,
        local: bool,
        priority: i32,
        flows: Box<[FlowInfo]>,
        params: Box<[TaskParam]>,
    ) -> Self {
        let pending = flows.len() as i32 + 1;
        // Local tasks carry an execution obligation from birth; a remote
        // instance only ever holds the obligations wired onto it.
        let refs = if local { 1 } else { 0 };
        Self {
            id,
            class,
            rank,
            local,
            priority,
            state: AtomicU8::new(TaskState::Waiting.as_u8()),
            pending: AtomicI32::new(pending),
            refs: AtomicI32::new(refs),
            flows,
            params,
        }
    }

    /// The task's unique identifier.
    #[inline]
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// The task's class.
    #[inline]
    pub fn class(&self) -> &Arc<TaskClass> {
        &self.class
    }

    /// Rank this task executes on.
    #[inline]
    pub fn rank(&self) -> u32 {
        self.rank
    }

    /// Whether the task executes on this process.
    #[inline]
    pub fn is_local(&self) -> bool {
        self.local
    }

    /// Scheduling priority; higher runs earlier.
    #[inline]
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Current state.
    #[inline]
    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Set the task state.
    #[inline]
    pub(crate) fn set_state(&self, state: TaskState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    /// Dependencies remaining, including the creation bias while insertion
    /// is in progress.
    #[inline]
    pub fn pending_flows(&self) -> i32 {
        self.pending.load(Ordering::SeqCst)
    }

    /// Count `n` dependencies as satisfied. Returns `true` when that made
    /// the task ready.
    #[inline]
    pub(crate) fn satisfy(&self, n: i32) -> bool {
        let previous = self.pending.fetch_sub(n, Ordering::SeqCst);
        previous == n
    }

    /// One flow's bookkeeping.
    #[inline]
    pub fn flow(&self, index: usize) -> &FlowInfo {
        &self.flows[index]
    }

    /// All flows.
    #[inline]
    pub fn flows(&self) -> &[FlowInfo] {
        &self.flows
    }

    /// Add one lifecycle obligation.
    #[inline]
    pub(crate) fn retain(&self) {
        self.refs.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop one lifecycle obligation. Returns `true` at zero.
    pub(crate) fn release(&self) -> bool {
        let previous = self.refs.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "task reference count underflow");
        previous == 1
    }

    /// Outstanding lifecycle obligations (tests and assertions).
    #[inline]
    pub fn refs(&self) -> i32 {
        self.refs.load(Ordering::SeqCst)
    }

    pub(crate) fn param(&self, index: usize) -> &TaskParam {
        self.params.get(index).unwrap_or_else(|| {
            panic!(
                "task {} of class {} has no parameter {index}",
                self.id,
                self.class.name()
            )
        })
    }

}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("class", &self.class.name())
            .field("rank", &self.rank)
            .field("priority", &self.priority)
            .field("state", &self.state())
            .field("pending", &self.pending_flows())
            .finish()
    }
}

/// Body-side view of a task: typed access to the declared arguments.
pub struct TaskContext<'a> {
    task: &'a Task,
}

impl<'a> TaskContext<'a> {
    pub(crate) fn new(task: &'a Task) -> Self {
        Self { task }
    }

    /// The executing task's identifier.
    #[inline]
    pub fn id(&self) -> TaskId {
        self.task.id()
    }

    /// The executing task's class name.
    #[inline]
    pub fn name(&self) -> &str {
        self.task.class().name()
    }

    /// Copy of the `index`-th non-tile parameter, declared by-value.
    ///
    /// Panics if the parameter kind or type does not match the declaration —
    /// a graph-construction contract violation.
    pub fn value<T: Copy + 'static>(&self, index: usize) -> T {
        match self.task.param(index) {
            TaskParam::Value(value) => *value
                .downcast_ref::<T>()
                .unwrap_or_else(|| panic!("parameter {index} has a different value type")),
            _ => panic!("parameter {index} was not declared by-value"),
        }
    }

    /// Shared handle of the `index`-th non-tile parameter, declared by
    /// reference.
    pub fn reference<T: Send + Sync + 'static>(&self, index: usize) -> Arc<T> {
        match self.task.param(index) {
            TaskParam::Reference(handle) => Arc::clone(handle)
                .downcast::<T>()
                .unwrap_or_else(|_| panic!("parameter {index} has a different reference type")),
            _ => panic!("parameter {index} was not declared by-reference"),
        }
    }

    /// Scratch buffer of the `index`-th non-tile parameter.
    pub fn scratch(&self, index: usize) -> MutexGuard<'_, Vec<u8>> {
        match self.task.param(index) {
            TaskParam::Scratch(buffer) => buffer.lock(),
            _ => panic!("parameter {index} was not declared as scratch"),
        }
    }

    /// The tile declared on flow `flow`.
    pub fn flow_tile(&self, flow: usize) -> Arc<Tile> {
        self.task
            .flow(flow)
            .tile()
            .cloned()
            .expect("flow has no tile")
    }

    /// Data handle bound to flow `flow`: the producer's binding when wired,
    /// the tile's local backing store otherwise.
    pub fn tile_data(&self, flow: usize) -> Option<DataHandle> {
        let info = self.task.flow(flow);
        info.data().or_else(|| info.tile().and_then(|t| t.data()))
    }

    /// Declared access mode of flow `flow`.
    #[inline]
    pub fn flow_access(&self, flow: usize) -> AccessKind {
        self.task.flow(flow).access()
    }

    /// Number of tile flows.
    #[inline]
    pub fn flow_count(&self) -> usize {
        self.task.flows().len()
    }
}

/// Builder describing one task to insert.
///
/// Arguments are collected in declaration order; tile arguments become flows
/// in that order, other arguments become the task's parameter list.
pub struct TaskSpec {
    pub(crate) body: TaskBody,
    pub(crate) name: String,
    pub(crate) priority: i32,
    pub(crate) explicit_rank: Option<u32>,
    pub(crate) args: SmallVec<[TaskArg; 8]>,
}

impl TaskSpec {
    /// Start describing a task running `body`.
    pub fn new(body: TaskBody, name: impl Into<String>) -> Self {
        Self {
            body,
            name: name.into(),
            priority: 0,
            explicit_rank: None,
            args: SmallVec::new(),
        }
    }

    /// Set the scheduling priority (default 0; higher runs earlier).
    #[inline]
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Pin the task to an explicit rank instead of deriving one from an
    /// affinity argument.
    #[inline]
    pub fn on_rank(mut self, rank: u32) -> Self {
        self.explicit_rank = Some(rank);
        self
    }

    /// Append an argument.
    #[inline]
    pub fn arg(mut self, arg: TaskArg) -> Self {
        self.args.push(arg);
        self
    }

    /// Append a by-value parameter.
    pub fn value<T: Copy + Send + Sync + 'static>(self, value: T) -> Self {
        self.arg(TaskArg::Value {
            value: Box::new(value),
            bytes: std::mem::size_of::<T>(),
        })
    }

    /// Append a scratch buffer of `bytes` bytes.
    pub fn scratch(self, bytes: usize) -> Self {
        self.arg(TaskArg::Scratch(bytes))
    }

    /// Append an opaque shared handle.
    pub fn reference<T: Send + Sync + 'static>(self, handle: Arc<T>) -> Self {
        self.arg(TaskArg::Reference(handle))
    }

    /// Append a tile access.
    pub fn tile(self, tile: &Arc<Tile>, access: AccessKind) -> Self {
        self.arg(TaskArg::Tile {
            tile: Arc::clone(tile),
            access,
            affinity: false,
            tracked: true,
        })
    }

    /// Append a read access.
    #[inline]
    pub fn input(self, tile: &Arc<Tile>) -> Self {
        self.tile(tile, AccessKind::Read)
    }

    /// Append a write access.
    #[inline]
    pub fn output(self, tile: &Arc<Tile>) -> Self {
        self.tile(tile, AccessKind::Write)
    }

    /// Append a read-write access.
    #[inline]
    pub fn inout(self, tile: &Arc<Tile>) -> Self {
        self.tile(tile, AccessKind::ReadWrite)
    }

    /// Append a commutative-write access.
    #[inline]
    pub fn atomic_write(self, tile: &Arc<Tile>) -> Self {
        self.tile(tile, AccessKind::AtomicWrite)
    }

    /// Pin the task's execution rank to the owner of the most recent tile
    /// argument.
    ///
    /// Panics if the most recent argument is not a tile — a malformed
    /// argument list is a fatal contract violation.
    pub fn pin_to_owner(mut self) -> Self {
        match self.args.last_mut() {
            Some(TaskArg::Tile { affinity, .. }) => *affinity = true,
            _ => panic!("pin_to_owner: the preceding argument is not a tile"),
        }
        self
    }

    /// Exclude the most recent tile argument from dependency tracking.
    ///
    /// Panics if the most recent argument is not a tile.
    pub fn untracked(mut self) -> Self {
        match self.args.last_mut() {
            Some(TaskArg::Tile { tracked, .. }) => *tracked = false,
            _ => panic!("untracked: the preceding argument is not a tile"),
        }
        self
    }
}

impl fmt::Debug for TaskSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSpec")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("args", &self.args)
            .finish()
    }
}
