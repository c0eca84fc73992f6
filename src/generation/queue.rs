//! Batching generation queue with divide-and-conquer splitting

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::error::LodResult;
use crate::generation::task::{
    ChunkConsumer, GenTask, GenTaskGroup, RequestTracker, SplitTracker, TaskResult,
};
use crate::generation::{GenRequest, LodGenerator};
use crate::section::SectionPos;
use crate::thread_pool::{PoolFabric, PoolKind};

#[derive(Debug, Default)]
struct GenQueueStats {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    split: AtomicU64,
}

/// Counter snapshot for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenQueueSnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub split: u64,
}

/// Routes generation requests to the generator, one batch per cell.
pub struct GenerationQueue {
    generator: Arc<dyn LodGenerator>,
    fabric: Arc<PoolFabric>,
    groups: DashMap<SectionPos, Arc<GenTaskGroup>>,
    stats: GenQueueStats,
}

/// Adapter exposing a group's liveness as a tracker, so split children die
/// with their parent.
struct GroupLiveness(Arc<GenTaskGroup>);

impl RequestTracker for GroupLiveness {
    fn is_valid(&self) -> bool {
        self.0.has_live_tasks()
    }
}

impl GenerationQueue {
    pub fn new(generator: Arc<dyn LodGenerator>, fabric: Arc<PoolFabric>) -> Arc<Self> {
        Arc::new(Self {
            generator,
            fabric,
            groups: DashMap::new(),
            stats: GenQueueStats::default(),
        })
    }

    /// Register interest in `pos`. Tasks for the same cell share one group
    /// and one generator batch. The returned receiver resolves once the
    /// batch (or its split children) settles; a dropped sender means the
    /// queue shut down and reads as `Fail`.
    ///
    /// `data_detail` must be no finer than `pos.detail`, and when the
    /// request is coarser than the generator's batch limit it must also be
    /// no finer than that limit, since the leaves of a split run at the
    /// limit.
    ///
    /// # Panics
    ///
    /// Panics when `data_detail` violates that contract.
    pub fn submit(
        self: &Arc<Self>,
        pos: SectionPos,
        data_detail: u8,
        tracker: Arc<dyn RequestTracker>,
        consumer: ChunkConsumer,
    ) -> oneshot::Receiver<TaskResult> {
        let max_batch = self.generator.max_batch_detail();
        assert!(
            data_detail <= pos.detail,
            "data detail {} is finer than section {}",
            data_detail,
            pos
        );
        assert!(
            pos.detail <= max_batch || data_detail <= max_batch,
            "request for {} splits to detail {} leaves, below its data detail {}",
            pos,
            max_batch,
            data_detail
        );
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let mut task = GenTask::new(tracker, consumer, tx);

        loop {
            let (group, newly_created) = match self.groups.entry(pos) {
                Entry::Occupied(e) => (e.get().clone(), false),
                Entry::Vacant(v) => {
                    let group = Arc::new(GenTaskGroup::new(pos, data_detail));
                    v.insert(group.clone());
                    (group, true)
                }
            };
            match group.try_push(task) {
                Ok(()) => {
                    if newly_created {
                        self.schedule(group);
                    }
                    return rx;
                }
                // lost a race against group completion, retry with a
                // fresh group
                Err(returned) => task = returned,
            }
        }
    }

    fn schedule(self: &Arc<Self>, group: Arc<GenTaskGroup>) {
        let queue = self.clone();
        self.fabric.io_handle().spawn(async move {
            queue.run_group(group).await;
        });
    }

    async fn run_group(self: &Arc<Self>, group: Arc<GenTaskGroup>) {
        let pos = group.pos();

        if !group.has_live_tasks() {
            log::debug!("skipping generation for {}: all requesters vanished", pos);
            self.finish(&group, TaskResult::Fail);
            return;
        }

        if pos.detail > self.generator.max_batch_detail() {
            self.run_split(&group).await;
        } else {
            self.run_batch(&group).await;
        }
    }

    /// Fan the request out to the four children and resolve the parent
    /// once all of them settle.
    async fn run_split(self: &Arc<Self>, group: &Arc<GenTaskGroup>) {
        let pos = group.pos();
        debug_assert!(
            group.data_detail() < pos.detail,
            "single-column request for {} cannot split",
            pos
        );
        self.stats.split.fetch_add(1, Ordering::Relaxed);
        log::trace!("splitting generation request for {}", pos);

        let split = SplitTracker::new(Arc::new(GroupLiveness(group.clone())));
        let receivers: Vec<_> = pos
            .children()
            .iter()
            .map(|&child| {
                let parent = group.clone();
                let tracker: Arc<dyn RequestTracker> = split.clone();
                self.submit(
                    child,
                    group.data_detail(),
                    tracker,
                    Box::new(move |chunk| parent.consume_chunk_data(chunk)),
                )
            })
            .collect();

        let results = futures::future::join_all(receivers).await;
        // children settled one way or another; further invalidation is moot
        split.invalidate();

        let all_ok = results
            .iter()
            .all(|r| matches!(r, Ok(TaskResult::Success(_))));
        let outcome = if all_ok {
            TaskResult::Success(pos)
        } else {
            TaskResult::Fail
        };
        self.finish(group, outcome);
    }

    /// Run one generator batch on the world-gen pool.
    async fn run_batch(self: &Arc<Self>, group: &Arc<GenTaskGroup>) {
        let pos = group.pos();
        let request = GenRequest {
            pos,
            data_detail: group.data_detail(),
        };
        let generator = self.generator.clone();
        let sink_group = group.clone();

        let batch: LodResult<oneshot::Receiver<LodResult<()>>> =
            self.fabric.submit(PoolKind::WorldGen, move || {
                let mut sink = |chunk| sink_group.consume_chunk_data(&chunk);
                generator.generate(&request, &mut sink)
            });

        let outcome = match batch {
            Ok(rx) => match rx.await {
                Ok(Ok(())) => TaskResult::Success(pos),
                Ok(Err(e)) => {
                    log::error!("generation batch for {} failed: {}", pos, e);
                    TaskResult::Fail
                }
                Err(_) => {
                    log::error!("generation batch for {} was dropped by its pool", pos);
                    TaskResult::Fail
                }
            },
            Err(e) => {
                log::error!("could not schedule generation for {}: {}", pos, e);
                TaskResult::Fail
            }
        };
        self.finish(group, outcome);
    }

    fn finish(&self, group: &Arc<GenTaskGroup>, outcome: TaskResult) {
        match outcome {
            TaskResult::Success(_) => self.stats.completed.fetch_add(1, Ordering::Relaxed),
            TaskResult::Fail => self.stats.failed.fetch_add(1, Ordering::Relaxed),
        };
        // remove before completing so late submitters get a fresh group
        self.groups.remove(&group.pos());
        group.complete_all(outcome);
    }

    pub(crate) fn fabric(&self) -> &Arc<PoolFabric> {
        &self.fabric
    }

    pub fn pending_groups(&self) -> usize {
        self.groups.len()
    }

    pub fn stats(&self) -> GenQueueSnapshot {
        GenQueueSnapshot {
            submitted: self.stats.submitted.load(Ordering::Relaxed),
            completed: self.stats.completed.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            split: self.stats.split.load(Ordering::Relaxed),
        }
    }
}
