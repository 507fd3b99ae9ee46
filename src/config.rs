//! Runtime configuration
//!
//! A single explicit configuration value, constructed once and passed by
//! reference to every taskpool and execution context. There is no
//! process-wide mutable state.

use std::thread;

use crate::error::RuntimeError;

/// Configuration for one scheduling session.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Ceiling for the insertion window (in-flight local tasks). The live
    /// window starts at 1 and doubles per insertion batch up to this value.
    pub window_size: usize,
    /// Pending-task level at which an inserting thread that joined the
    /// workers goes back to inserting.
    pub threshold: usize,
    /// log2 of the initial task-registry bucket count.
    pub task_table_bits: u32,
    /// log2 of the initial tile-registry bucket count.
    pub tile_table_bits: u32,
    /// Bucket length above which a table grows.
    pub collision_hint: usize,
    /// Number of virtual processors fed by the engine.
    pub nb_vps: usize,
    /// Rank of this process.
    pub my_rank: u32,
    /// Total number of ranks.
    pub nb_ranks: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let num_cpus = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            window_size: 8000,
            threshold: 4000,
            task_table_bits: 10,
            tile_table_bits: 10,
            collision_hint: 16,
            nb_vps: num_cpus,
            my_rank: 0,
            nb_ranks: 1,
        }
    }
}

impl RuntimeConfig {
    /// Check the configuration for internally inconsistent values.
    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.window_size == 0 {
            return Err(RuntimeError::invalid_config("window_size must be non-zero"));
        }
        if self.threshold > self.window_size {
            return Err(RuntimeError::invalid_config(
                "threshold must not exceed window_size",
            ));
        }
        if !(1..=16).contains(&self.task_table_bits) || !(1..=16).contains(&self.tile_table_bits) {
            return Err(RuntimeError::invalid_config(
                "table bits must be in 1..=16",
            ));
        }
        if self.nb_vps == 0 {
            return Err(RuntimeError::invalid_config("nb_vps must be non-zero"));
        }
        if self.nb_ranks == 0 || self.my_rank >= self.nb_ranks {
            return Err(RuntimeError::invalid_config(
                "my_rank must be below nb_ranks",
            ));
        }
        Ok(())
    }
}
