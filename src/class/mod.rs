//! Task classes
//!
//! A task class is the template shared by every task instance running the
//! same body with the same argument shape. Classes are created lazily on the
//! first insertion of a new (body, flow-count) pair and reference-counted
//! independently of their instances.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing::debug;

use crate::table::{ConcurrentTable, Key};
use crate::task::TaskBody;
use crate::tile::AccessKind;


/// Per-flow descriptor of a class, registered once by the first instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowDesc {
    /// Declared access mode of the flow.
    pub access: AccessKind,
    /// Whether the flow participates in dependency tracking.
    pub tracked: bool,
}

/// Byte-layout accounting of the non-tile parameters of a class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParamLayout {
    /// Number of non-tile parameters.
    pub count: usize,
    /// Total declared size of those parameters in bytes.
    pub bytes: usize,
}

/// Shared template for all tasks of one (body, flow-count) identity.
pub struct TaskClass {
    id: u32,
    name: String,
    body: TaskBody,
    flow_count: usize,
    /// Per-flow descriptors, filled in by the first instance.
    flows: Box<[OnceCell<FlowDesc>]>,
    params: ParamLayout,
    refs: AtomicI32,
    /// Set once the first instance has registered the flow descriptors.
    flows_set: AtomicBool,
    /// Flow indices observed receiving data from a parent class.
    deps_in: AtomicU32,
    /// Flow indices observed feeding data to a child class.
    deps_out: AtomicU32,
}

impl TaskClass {
    pub(crate) fn new(
        id: u32,
        name: impl Into<String>,
        body: TaskBody,
        flow_count: usize,
        params: ParamLayout,
    ) -> Arc<Self> {
        let flows = (0..flow_count)
            .map(|_| OnceCell::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Arc::new(Self {
            id,
            name: name.into(),
            body,
            flow_count,
            flows,
            params,
            refs: AtomicI32::new(1),
            flows_set: AtomicBool::new(false),
            deps_in: AtomicU32::new(0),
            deps_out: AtomicU32::new(0),
        })
    }

    /// Identity key of a (body, flow-count) pair. The same body used with a
    /// different arity is a distinct class.
    #[inline]
    pub fn class_key(body: TaskBody, flow_count: usize) -> Key {
        body as usize as u64 + flow_count as u64
    }

    /// Class identifier, unique within its taskpool.
    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Human-readable class name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The task body all instances run.
    #[inline]
    pub fn body(&self) -> TaskBody {
        self.body
    }

    /// Number of tile flows per instance.
    #[inline]
    pub fn flow_count(&self) -> usize {
        self.flow_count
    }

    /// Parameter layout accounting.
    #[inline]
    pub fn params(&self) -> ParamLayout {
        self.params
    }

    /// Whether the calling instance is the first of this class and must
    /// register the flow descriptors. Returns `true` exactly once.
    #[inline]
    pub(crate) fn take_first_instance(&self) -> bool {
        !self.flows_set.swap(true, Ordering::SeqCst)
    }

    /// Register the descriptor of one flow. Later instances of the class
    /// reuse it; a second registration is ignored.
    #[inline]
    pub(crate) fn register_flow(&self, index: usize, desc: FlowDesc) {
        self.flows[index].get_or_init(|| desc);
    }

    /// Descriptor of one flow, if registered.
    #[inline]
    pub fn flow(&self, index: usize) -> Option<FlowDesc> {
        self.flows.get(index).and_then(|cell| cell.get().copied())
    }

    /// Record a parent/child edge between two classes (diagnostics).
    pub(crate) fn record_edge(
        parent: &TaskClass,
        parent_flow: usize,
        child: &TaskClass,
        child_flow: usize,
    ) {
        parent
            .deps_out
            .fetch_or(1 << (parent_flow as u32 & 31), Ordering::SeqCst);
        child
            .deps_in
            .fetch_or(1 << (child_flow as u32 & 31), Ordering::SeqCst);
    }

    /// Flow-index masks of recorded incoming/outgoing edges.
    #[inline]
    pub fn dep_masks(&self) -> (u32, u32) {
        (
            self.deps_in.load(Ordering::SeqCst),
            self.deps_out.load(Ordering::SeqCst),
        )
    }

    /// Add one reference (one per taskpool plus one per live instance).
    #[inline]
    pub(crate) fn retain(&self) {
        self.refs.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop one reference. Returns `true` when the count reached zero.
    pub(crate) fn release(&self) -> bool {
        let previous = self.refs.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "task class reference count underflow");
        previous == 1
    }

    /// Current reference count (tests).
    #[inline]
    pub fn refs(&self) -> i32 {
        self.refs.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for TaskClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskClass")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("flow_count", &self.flow_count)
            .field("params", &self.params)
            .field("refs", &self.refs())
            .finish()
    }
}

/// Registry of the task classes of one taskpool, keyed by
/// [`TaskClass::class_key`].
pub struct ClassRegistry {
    classes: ConcurrentTable<Arc<TaskClass>>,
    next_id: AtomicU32,
}

impl ClassRegistry {
    /// Create an empty registry.
    pub fn new(bits: u32, collision_hint: usize) -> Self {
        Self {
            classes: ConcurrentTable::new(bits, collision_hint),
            next_id: AtomicU32::new(0),
        }
    }

    /// Look up a class by identity key.
    #[inline]
    pub fn find(&self, key: Key) -> Option<Arc<TaskClass>> {
        self.classes.find(key)
    }

    /// Return the class for (body, flow-count), creating it on first use.
    pub fn find_or_create(
        &self,
        body: TaskBody,
        name: &str,
        flow_count: usize,
        params: ParamLayout,
    ) -> Arc<TaskClass> {
        let key = TaskClass::class_key(body, flow_count);
        self.classes.get_or_insert_with(key, || {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            debug!(id, name, flow_count, "creating task class");
            TaskClass::new(id, name, body, flow_count, params)
        })
    }

    /// Number of registered classes.
    #[inline]
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    /// Whether no class has been registered.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Drop the registry's reference on every class. Valid only at taskpool
    /// teardown.
    pub fn release_all(&self) {
        self.classes.for_each(|_, class| {
            class.release();
        });
    }
}

impl fmt::Debug for ClassRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassRegistry")
            .field("classes", &self.classes)
            .finish()
    }
}
