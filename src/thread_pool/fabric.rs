use parking_lot::RwLock;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Runtime;
use tokio::sync::oneshot;

use crate::config::LodConfig;
use crate::error::{LodError, LodResult};

/// CPU worker pool categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    /// World generation batches
    WorldGen,
    /// Downsampling, merging and remapping work
    DataConversion,
    /// Consumer-side buffer assembly
    BufferBuilding,
}

impl PoolKind {
    fn label(&self) -> &'static str {
        match self {
            PoolKind::WorldGen => "worldgen",
            PoolKind::DataConversion => "convert",
            PoolKind::BufferBuilding => "buffer",
        }
    }
}

/// Lock-free per-pool counters.
#[derive(Debug, Default)]
struct PoolCounters {
    tasks_submitted: AtomicU64,
    tasks_completed: AtomicU64,
    total_busy_ns: AtomicU64,
}

/// Snapshot of one pool's counters.
#[derive(Debug, Clone)]
pub struct PoolMetrics {
    pub tasks_submitted: u64,
    pub tasks_completed: u64,
    pub average_task_time_ms: f64,
}

/// Soft CPU limiter: after a task runs for `t`, the worker sleeps
/// `t * (1 - d) / d` for duty cycle `d`, bounding sustained usage to
/// roughly `d` of a core without any OS scheduling hooks.
#[derive(Debug, Clone, Copy)]
struct RateLimiter {
    duty_cycle: f64,
}

impl RateLimiter {
    fn new(duty_cycle: f64) -> Self {
        assert!(
            duty_cycle > 0.0 && duty_cycle <= 1.0,
            "duty cycle {} outside (0, 1]",
            duty_cycle
        );
        Self { duty_cycle }
    }

    fn pause_for(&self, busy: Duration) -> Duration {
        if self.duty_cycle >= 1.0 {
            return Duration::ZERO;
        }
        busy.mul_f64((1.0 - self.duty_cycle) / self.duty_cycle)
    }

    fn throttle(&self, busy: Duration) {
        let pause = self.pause_for(busy);
        if !pause.is_zero() {
            std::thread::sleep(pause);
        }
    }
}

struct WorkerPool {
    pool: ThreadPool,
    limiter: RateLimiter,
    counters: Arc<PoolCounters>,
    threads: usize,
}

impl WorkerPool {
    fn build(kind: PoolKind, threads: usize, duty_cycle: f64) -> LodResult<Self> {
        let label = kind.label();
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(move |idx| format!("lod-{}-{}", label, idx))
            .build()
            .map_err(|e| LodError::ThreadPool(format!("failed to build {} pool: {}", label, e)))?;
        Ok(Self {
            pool,
            limiter: RateLimiter::new(duty_cycle),
            counters: Arc::new(PoolCounters::default()),
            threads,
        })
    }

    fn spawn(&self, task: Box<dyn FnOnce() + Send>) {
        self.counters.tasks_submitted.fetch_add(1, Ordering::Relaxed);
        let counters = self.counters.clone();
        let limiter = self.limiter;
        self.pool.spawn(move || {
            let start = Instant::now();
            task();
            let busy = start.elapsed();
            counters
                .total_busy_ns
                .fetch_add(busy.as_nanos() as u64, Ordering::Relaxed);
            counters.tasks_completed.fetch_add(1, Ordering::Relaxed);
            limiter.throttle(busy);
        });
    }
}

/// The set of named pools plus the async/file-io runtime.
pub struct PoolFabric {
    runtime: Runtime,
    pools: RwLock<HashMap<PoolKind, Arc<WorkerPool>>>,
    pool_threads: HashMap<PoolKind, usize>,
    duty_cycle: f64,
}

impl PoolFabric {
    pub fn new(config: &LodConfig) -> LodResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.io_threads.max(1))
            .thread_name("lod-io")
            .enable_all()
            .build()?;
        Ok(Self {
            runtime,
            pools: RwLock::new(HashMap::new()),
            pool_threads: config.pool_threads.clone(),
            duty_cycle: config.duty_cycle,
        })
    }

    /// Handle for spawning async work onto the io runtime.
    pub fn io_handle(&self) -> tokio::runtime::Handle {
        self.runtime.handle().clone()
    }

    /// Drive a future to completion on the io runtime from sync code.
    pub fn block_on<F: std::future::Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    fn get_pool(&self, kind: PoolKind) -> LodResult<Arc<WorkerPool>> {
        {
            let pools = self.pools.read();
            if let Some(pool) = pools.get(&kind) {
                return Ok(pool.clone());
            }
        }
        let mut pools = self.pools.write();
        // double-check after taking the write lock
        if let Some(pool) = pools.get(&kind) {
            return Ok(pool.clone());
        }
        let threads = self.pool_threads.get(&kind).copied().unwrap_or(2);
        let pool = Arc::new(WorkerPool::build(kind, threads, self.duty_cycle)?);
        pools.insert(kind, pool.clone());
        Ok(pool)
    }

    /// Fire-and-forget a task on a named pool.
    pub fn spawn<F>(&self, kind: PoolKind, task: F) -> LodResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.get_pool(kind)?.spawn(Box::new(task));
        Ok(())
    }

    /// Run a task on a named pool and receive its result asynchronously.
    pub fn submit<F, R>(&self, kind: PoolKind, task: F) -> LodResult<oneshot::Receiver<R>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.spawn(kind, move || {
            let _ = tx.send(task());
        })?;
        Ok(rx)
    }

    /// Rebuild a pool with a different thread count. In-flight tasks on the
    /// old pool finish on its threads; new work lands on the new pool.
    pub fn resize_pool(&self, kind: PoolKind, threads: usize) -> LodResult<()> {
        if threads == 0 {
            return Err(LodError::ThreadPool(format!(
                "cannot resize {} pool to zero threads",
                kind.label()
            )));
        }
        let pool = Arc::new(WorkerPool::build(kind, threads, self.duty_cycle)?);
        self.pools.write().insert(kind, pool);
        log::debug!("resized {} pool to {} threads", kind.label(), threads);
        Ok(())
    }

    pub fn pool_size(&self, kind: PoolKind) -> Option<usize> {
        self.pools.read().get(&kind).map(|p| p.threads)
    }

    pub fn metrics(&self, kind: PoolKind) -> Option<PoolMetrics> {
        self.pools.read().get(&kind).map(|p| {
            let submitted = p.counters.tasks_submitted.load(Ordering::Relaxed);
            let completed = p.counters.tasks_completed.load(Ordering::Relaxed);
            let busy_ns = p.counters.total_busy_ns.load(Ordering::Relaxed);
            PoolMetrics {
                tasks_submitted: submitted,
                tasks_completed: completed,
                average_task_time_ms: if completed > 0 {
                    busy_ns as f64 / completed as f64 / 1_000_000.0
                } else {
                    0.0
                },
            }
        })
    }
}
