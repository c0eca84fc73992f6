use std::collections::HashMap;

use crate::thread_pool::PoolKind;

/// How envelope payloads reach the disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Write to a `.tmp` sibling and rename into place (default).
    Atomic,
    /// Write the file in place. Cheaper, but a crash mid-write leaves a
    /// corrupt file behind.
    InPlace,
}

/// Startup configuration, consumed once by `LodContext::new`.
#[derive(Debug, Clone)]
pub struct LodConfig {
    /// Worker threads for the async/file-io runtime.
    pub io_threads: usize,
    /// Thread counts for the named CPU pools; missing entries default to 2.
    pub pool_threads: HashMap<PoolKind, usize>,
    /// Sustained CPU duty cycle per worker pool, in (0, 1].
    pub duty_cycle: f64,
    pub write_mode: WriteMode,
}

impl Default for LodConfig {
    fn default() -> Self {
        let cpu_count = num_cpus::get();
        let mut pool_threads = HashMap::new();
        pool_threads.insert(PoolKind::WorldGen, (cpu_count / 2).max(1));
        pool_threads.insert(PoolKind::DataConversion, (cpu_count / 4).max(1));
        pool_threads.insert(PoolKind::BufferBuilding, (cpu_count / 4).max(1));

        Self {
            io_threads: 2,
            pool_threads,
            duty_cycle: 1.0,
            write_mode: WriteMode::Atomic,
        }
    }
}
