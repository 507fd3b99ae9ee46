//! Per-collection tile registry

use std::fmt;
use std::sync::Arc;

use tracing::trace;

use crate::config::RuntimeConfig;
use crate::pool::Recycler;
use crate::table::ConcurrentTable;
use crate::tile::{Tile, TileCollection, TileKey};

/// How many retired tiles to keep for reuse.
const TILE_IDLE_CAP: usize = 256;

/// Registry of the live tiles of one collection.
///
/// Each collection gets its own private table; tiles are created on demand
/// by [`TileMap::tile_of`] and leave the registry when flushed.
pub struct TileMap {
    collection: Arc<dyn TileCollection>,
    tiles: ConcurrentTable<Arc<Tile>>,
    recycler: Recycler<Tile>,
    my_rank: u32,
}

impl TileMap {
    /// Create the registry for `collection`.
    pub fn new(collection: Arc<dyn TileCollection>, config: &RuntimeConfig) -> Self {
        Self {
            collection,
            tiles: ConcurrentTable::new(config.tile_table_bits, config.collision_hint),
            recycler: Recycler::new(TILE_IDLE_CAP),
            my_rank: config.my_rank,
        }
    }

    /// Return the tile for `key`, creating it on first reference.
    ///
    /// Creation binds the owning rank through the collection's rank-of-key
    /// callback and the local backing store when this process owns the tile.
    /// Racing creators for the same key observe a single winner.
    pub fn tile_of(&self, key: TileKey) -> Arc<Tile> {
        let tile = self.tiles.get_or_insert_with(key, || {
            let rank = self.collection.rank_of(key);
            let data = if rank == self.my_rank {
                self.collection.data_of(key)
            } else {
                None
            };
            trace!(key, rank, "creating tile");
            match self.recycler.take() {
                Some(mut idle) => {
                    idle.reset(key, rank, data);
                    Arc::new(idle)
                }
                None => Arc::new(Tile::new(key, rank, data)),
            }
        });
        debug_assert!(!tile.is_flushed(), "tile {key} referenced after flush");
        tile
    }

    /// Look up a tile without creating it.
    #[inline]
    pub fn find(&self, key: TileKey) -> Option<Arc<Tile>> {
        self.tiles.find(key)
    }

    /// Number of live tiles.
    #[inline]
    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    /// Whether the registry is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    /// Keys of every live tile.
    pub fn live_keys(&self) -> Vec<TileKey> {
        let mut keys = Vec::with_capacity(self.tiles.len());
        self.tiles.for_each(|key, _| keys.push(key));
        keys
    }

    /// Drop a flushed tile: remove it from the registry and release the
    /// caller's protocol reference, recycling the instance if that was the
    /// last one.
    pub(crate) fn release(&self, tile: &Arc<Tile>) {
        debug_assert!(tile.is_flushed(), "releasing an unflushed tile");
        self.tiles.remove(tile.key());
        if tile.release_ref() {
            trace!(key = tile.key(), "recycling tile");
            self.recycler.put(Arc::clone(tile));
        }
    }

    /// Number of tiles parked for reuse (tests).
    #[inline]
    pub fn idle_tiles(&self) -> usize {
        self.recycler.idle_len()
    }
}

impl fmt::Debug for TileMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TileMap")
            .field("tiles", &self.tiles)
            .field("my_rank", &self.my_rank)
            .finish()
    }
}
