//! Execution-engine boundary
//!
//! The dependency engine hands ready tasks to per-virtual-processor ready
//! lists; worker threads — or an inserting thread that joined back — pull
//! from them and run task bodies. Everything beyond "enqueue here, select
//! from there" belongs to the execution layer, not to this crate's core.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::config::RuntimeConfig;
use crate::task::TaskRef;

mod workers;

pub use workers::WorkerPool;

/// A priority-sorted ready list for one virtual processor.
pub struct VirtualProcessor {
    id: usize,
    ready: Mutex<VecDeque<TaskRef>>,
}

impl VirtualProcessor {
    fn new(id: usize) -> Self {
        Self {
            id,
            ready: Mutex::new(VecDeque::new()),
        }
    }

    /// This processor's index.
    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    /// Insert a ready task, keeping the list sorted by non-increasing
    /// priority. Tasks of equal priority keep their arrival order.
    pub fn push_sorted(&self, task: TaskRef) {
        let mut ready = self.ready.lock();
        let at = ready
            .iter()
            .position(|queued| queued.priority() < task.priority())
            .unwrap_or(ready.len());
        ready.insert(at, task);
    }

    /// Pop the highest-priority ready task.
    #[inline]
    pub fn pop(&self) -> Option<TaskRef> {
        self.ready.lock().pop_front()
    }

    /// Number of queued ready tasks.
    #[inline]
    pub fn len(&self) -> usize {
        self.ready.lock().len()
    }

    /// Whether the ready list is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ready.lock().is_empty()
    }
}

impl fmt::Debug for VirtualProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualProcessor")
            .field("id", &self.id)
            .field("ready", &self.len())
            .finish()
    }
}

/// Shared execution state: the virtual processors and the process topology.
#[derive(Debug)]
pub struct ExecutionContext {
    vps: Vec<VirtualProcessor>,
    my_rank: u32,
    nb_ranks: u32,
}

impl ExecutionContext {
    /// Create the execution context described by `config`.
    pub fn new(config: &RuntimeConfig) -> Arc<Self> {
        let vps = (0..config.nb_vps.max(1))
            .map(VirtualProcessor::new)
            .collect();
        Arc::new(Self {
            vps,
            my_rank: config.my_rank,
            nb_ranks: config.nb_ranks,
        })
    }

    /// Number of virtual processors.
    #[inline]
    pub fn nb_vps(&self) -> usize {
        self.vps.len()
    }

    /// Rank of this process.
    #[inline]
    pub fn my_rank(&self) -> u32 {
        self.my_rank
    }

    /// Total number of ranks.
    #[inline]
    pub fn nb_ranks(&self) -> u32 {
        self.nb_ranks
    }

    /// Enqueue a ready task on virtual processor `vp`.
    pub fn schedule(&self, vp: usize, task: TaskRef) {
        let vp = vp % self.vps.len();
        trace!(task = %task.id(), vp, priority = task.priority(), "enqueueing ready task");
        self.vps[vp].push_sorted(task);
    }

    /// Pull the next ready task, preferring `vp`'s own list and falling back
    /// to the other processors' lists.
    pub fn select(&self, vp: usize) -> Option<TaskRef> {
        let nb = self.vps.len();
        let own = vp % nb;
        if let Some(task) = self.vps[own].pop() {
            return Some(task);
        }
        for offset in 1..nb {
            if let Some(task) = self.vps[(own + offset) % nb].pop() {
                return Some(task);
            }
        }
        None
    }

    /// Total number of queued ready tasks across all processors.
    pub fn queued(&self) -> usize {
        self.vps.iter().map(VirtualProcessor::len).sum()
    }
}
