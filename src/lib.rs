//! tileflow — dynamic dataflow task-scheduling runtime
//!
//! Callers describe a computation incrementally by inserting typed tasks
//! that declare, per argument, how they access shared data tiles (read,
//! write, read-write, or opaque value). The runtime discovers the
//! producer-consumer graph on the fly, tracks per-tile last-writer and
//! last-user state, releases successors as soon as their dependencies are
//! satisfied, and feeds ready tasks to per-virtual-processor ready lists
//! under windowed backpressure.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tileflow::{ExecutionContext, RuntimeConfig, TaskContext, TaskSpec, Taskpool, TileMap};
//!
//! fn scale(ctx: &mut TaskContext<'_>) {
//!     let alpha: f64 = ctx.value(0);
//!     let _ = alpha;
//! }
//!
//! # fn demo(collection: Arc<dyn tileflow::TileCollection>) {
//! let config = RuntimeConfig::default();
//! let ctx = ExecutionContext::new(&config);
//! let pool = Taskpool::new(config.clone()).unwrap();
//! pool.attach(&ctx).unwrap();
//!
//! let tiles = Arc::new(TileMap::new(collection, &config));
//! let x = tiles.tile_of(0);
//! let y = tiles.tile_of(1);
//!
//! pool.insert(
//!     TaskSpec::new(scale, "scale")
//!         .value(2.0_f64)
//!         .input(&x)
//!         .inout(&y),
//! );
//! pool.wait();
//! # }
//! ```

#![warn(rust_2018_idioms)]

pub mod class;
pub mod config;
pub mod engine;
pub mod error;
pub mod exec;
pub mod pool;
pub mod table;
pub mod task;
pub mod tile;

// Utility modules
pub mod util;

// Re-exports
pub use config::RuntimeConfig;
pub use engine::Taskpool;
pub use error::RuntimeError;
pub use exec::{ExecutionContext, WorkerPool};
pub use task::{TaskArg, TaskContext, TaskSpec};
pub use tile::{AccessKind, Tile, TileCollection, TileMap};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
