//! Tiles: units of distributed data tracked for dependencies
//!
//! A tile is the runtime's handle to one element of a distributed
//! collection. The engine never interprets tile contents; it only tracks,
//! per tile, the most recent writer and the most recent accessor so that new
//! tasks can be wired behind them.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::task::TaskRef;

mod map;

pub use map::TileMap;

/// Key of a tile inside its collection.
pub type TileKey = u64;

/// Handle to a tile's local backing store. The store is owned by the
/// collection, never by the tile.
pub type DataHandle = Arc<dyn Any + Send + Sync>;

/// A distributed collection of tiles, as seen by the runtime.
///
/// Implementations describe where each tile lives and hand out local backing
/// stores. This is the boundary to the data-distribution layer; the runtime
/// calls it only while creating tiles.
pub trait TileCollection: Send + Sync {
    /// Rank that owns `key`.
    fn rank_of(&self, key: TileKey) -> u32;

    /// Local backing store for `key`. Only consulted when this process owns
    /// the tile.
    fn data_of(&self, key: TileKey) -> Option<DataHandle>;
}

/// Access mode of one flow on a tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    /// The flow reads the tile.
    Read,
    /// The flow overwrites the tile without reading it.
    Write,
    /// The flow reads and writes the tile.
    ReadWrite,
    /// Commutative write; ordered behind the previous writer like any other
    /// write.
    AtomicWrite,
}

impl AccessKind {
    /// Whether this access writes the tile.
    #[inline]
    pub fn is_write(self) -> bool {
        matches!(
            self,
            AccessKind::Write | AccessKind::ReadWrite | AccessKind::AtomicWrite
        )
    }

    /// Whether this access reads the tile.
    #[inline]
    pub fn is_read(self) -> bool {
        matches!(self, AccessKind::Read | AccessKind::ReadWrite)
    }
}

/// Record of the most recent task that touched a tile.
#[derive(Clone)]
pub struct TileUser {
    /// The recorded task, `None` before any access.
    pub task: Option<TaskRef>,
    /// Flow index of that task on this tile.
    pub flow: usize,
    /// Access mode of that flow.
    pub access: AccessKind,
    /// Whether that task may still notify successors naturally. A task whose
    /// successor-release pass found no successor clears this, telling the
    /// next task on the tile to re-run the release itself.
    pub alive: bool,
}

impl Default for TileUser {
    fn default() -> Self {
        Self {
            task: None,
            flow: 0,
            access: AccessKind::Read,
            alive: false,
        }
    }
}

impl fmt::Debug for TileUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TileUser")
            .field("task", &self.task.as_ref().map(|t| t.id()))
            .field("flow", &self.flow)
            .field("access", &self.access)
            .field("alive", &self.alive)
            .finish()
    }
}

/// Both user records of a tile, guarded by the tile's dedicated lock.
#[derive(Debug, Default)]
pub struct TileUsers {
    /// Most recent accessor of any kind.
    pub last_user: TileUser,
    /// Most recent writer.
    pub last_writer: TileUser,
}

/// One unit of distributed data, tracked for dependency purposes.
///
/// Tiles are created lazily on first reference and looked up by key
/// afterwards. A tile returns to the recycler only when its reference count
/// is back at the creation baseline *and* it has been flushed — flushing is
/// the deliberate "no more accesses will be issued" declaration, separate
/// from reference counting.
pub struct Tile {
    key: TileKey,
    rank: u32,
    data: Option<DataHandle>,
    flushed: AtomicBool,
    refs: AtomicI32,
    users: Mutex<TileUsers>,
}

impl Tile {
    pub(crate) fn new(key: TileKey, rank: u32, data: Option<DataHandle>) -> Self {
        Self {
            key,
            rank,
            data,
            flushed: AtomicBool::new(false),
            refs: AtomicI32::new(1),
            users: Mutex::new(TileUsers::default()),
        }
    }

    /// Re-initialize a recycled instance.
    pub(crate) fn reset(&mut self, key: TileKey, rank: u32, data: Option<DataHandle>) {
        self.key = key;
        self.rank = rank;
        self.data = data;
        self.flushed.store(false, Ordering::SeqCst);
        self.refs.store(1, Ordering::SeqCst);
        *self.users.get_mut() = TileUsers::default();
    }

    /// Key of this tile inside its collection.
    #[inline]
    pub fn key(&self) -> TileKey {
        self.key
    }

    /// Rank that owns this tile.
    #[inline]
    pub fn rank(&self) -> u32 {
        self.rank
    }

    /// Local backing store, when this process owns the tile.
    #[inline]
    pub fn data(&self) -> Option<DataHandle> {
        self.data.clone()
    }

    /// Whether the tile has been flushed.
    #[inline]
    pub fn is_flushed(&self) -> bool {
        self.flushed.load(Ordering::SeqCst)
    }

    /// Declare that no further accesses will be issued on this tile.
    #[inline]
    pub fn mark_flushed(&self) {
        self.flushed.store(true, Ordering::SeqCst);
    }

    /// Lock the last-user/last-writer records.
    ///
    /// The guard must never be held across scheduling or task execution.
    #[inline]
    pub(crate) fn users(&self) -> MutexGuard<'_, TileUsers> {
        self.users.lock()
    }

    /// Current reference count (tests and assertions).
    #[inline]
    pub fn refs(&self) -> i32 {
        self.refs.load(Ordering::SeqCst)
    }

    /// Add one reference.
    #[inline]
    pub fn retain(&self) {
        self.refs.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop one reference. Returns `true` when the count is back at the
    /// creation baseline, i.e. the caller just dropped the last protocol
    /// reference.
    pub(crate) fn release_ref(&self) -> bool {
        let previous = self.refs.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 1, "tile reference count underflow");
        if previous == 2 {
            debug_assert!(
                self.is_flushed(),
                "tile {} released to baseline without a flush",
                self.key
            );
            true
        } else {
            false
        }
    }
}

impl fmt::Debug for Tile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tile")
            .field("key", &self.key)
            .field("rank", &self.rank)
            .field("flushed", &self.is_flushed())
            .field("refs", &self.refs())
            .finish()
    }
}
