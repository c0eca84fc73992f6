//! Generation tasks, groups and validity tracking
//!
//! A task is one waiter's interest in a cell's generation. Tasks carry a
//! tracker the requester controls: when the tracker reports invalid the
//! task is dropped without its consumer seeing further data, but its
//! completion future still resolves (to `Fail`) so secondary waiters are
//! never left hanging.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::generation::GenChunk;
use crate::section::SectionPos;

/// Terminal outcome of a generation task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskResult {
    Success(SectionPos),
    Fail,
}

/// Reports whether the requester still wants the result. Polled
/// cooperatively; there is no hard preemption of a running generator.
pub trait RequestTracker: Send + Sync {
    fn is_valid(&self) -> bool;
}

/// Tracker that never goes invalid, used for cache-internal loads.
pub struct AlwaysValid;

impl RequestTracker for AlwaysValid {
    fn is_valid(&self) -> bool {
        true
    }
}

/// Externally togglable tracker.
#[derive(Default)]
pub struct FlagTracker {
    invalid: AtomicBool,
}

impl FlagTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn invalidate(&self) {
        self.invalid.store(true, Ordering::Release);
    }
}

impl RequestTracker for FlagTracker {
    fn is_valid(&self) -> bool {
        !self.invalid.load(Ordering::Acquire)
    }
}

/// Tracker handed to the children of a split request. Wraps the parent's
/// validity so invalidating the parent immediately invalidates every
/// in-flight child; explicit invalidation is idempotent.
pub struct SplitTracker {
    parent: Arc<dyn RequestTracker>,
    cancelled: AtomicBool,
}

impl SplitTracker {
    pub fn new(parent: Arc<dyn RequestTracker>) -> Arc<Self> {
        Arc::new(Self {
            parent,
            cancelled: AtomicBool::new(false),
        })
    }

    pub fn invalidate(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

impl RequestTracker for SplitTracker {
    fn is_valid(&self) -> bool {
        !self.cancelled.load(Ordering::Acquire) && self.parent.is_valid()
    }
}

/// Callback receiving produced chunks for one task.
pub type ChunkConsumer = Box<dyn FnMut(&GenChunk) + Send>;

/// One pending generation request bound to a cell.
pub struct GenTask {
    tracker: Arc<dyn RequestTracker>,
    consumer: ChunkConsumer,
    completion: Option<oneshot::Sender<TaskResult>>,
}

impl GenTask {
    pub fn new(
        tracker: Arc<dyn RequestTracker>,
        consumer: ChunkConsumer,
        completion: oneshot::Sender<TaskResult>,
    ) -> Self {
        Self {
            tracker,
            consumer,
            completion: Some(completion),
        }
    }

    fn is_valid(&self) -> bool {
        self.tracker.is_valid()
    }

    fn complete(mut self, result: TaskResult) {
        if let Some(tx) = self.completion.take() {
            // receiver may have been dropped, which is fine
            let _ = tx.send(result);
        }
    }
}

/// All pending tasks targeting one cell at one data detail level.
pub struct GenTaskGroup {
    pos: SectionPos,
    data_detail: u8,
    tasks: Mutex<GroupState>,
}

struct GroupState {
    tasks: Vec<GenTask>,
    /// Set once the group has been drained; late submitters must retry
    /// with a fresh group.
    closed: bool,
}

impl GenTaskGroup {
    pub fn new(pos: SectionPos, data_detail: u8) -> Self {
        Self {
            pos,
            data_detail,
            tasks: Mutex::new(GroupState {
                tasks: Vec::new(),
                closed: false,
            }),
        }
    }

    pub fn pos(&self) -> SectionPos {
        self.pos
    }

    pub fn data_detail(&self) -> u8 {
        self.data_detail
    }

    /// Add a task unless the group already completed. On failure the task
    /// is handed back so the caller can retry against a new group.
    pub fn try_push(&self, task: GenTask) -> Result<(), GenTask> {
        let mut state = self.tasks.lock();
        if state.closed {
            return Err(task);
        }
        state.tasks.push(task);
        Ok(())
    }

    /// Route one produced chunk to every live task's consumer. Tasks whose
    /// tracker reports invalid are removed here: their consumers never see
    /// the chunk, but their futures resolve to `Fail` so waiters are
    /// released.
    pub fn consume_chunk_data(&self, chunk: &GenChunk) {
        let mut state = self.tasks.lock();
        let mut kept = Vec::with_capacity(state.tasks.len());
        for mut task in state.tasks.drain(..) {
            if task.is_valid() {
                (task.consumer)(chunk);
                kept.push(task);
            } else {
                log::debug!("dropping invalidated generation task for {}", self.pos);
                task.complete(TaskResult::Fail);
            }
        }
        state.tasks = kept;
    }

    /// Whether any task still wants the result. Invalid tasks found along
    /// the way are completed with `Fail` and dropped.
    pub fn has_live_tasks(&self) -> bool {
        let mut state = self.tasks.lock();
        let mut kept = Vec::with_capacity(state.tasks.len());
        for task in state.tasks.drain(..) {
            if task.is_valid() {
                kept.push(task);
            } else {
                task.complete(TaskResult::Fail);
            }
        }
        state.tasks = kept;
        !state.tasks.is_empty()
    }

    /// Drain the group, completing valid tasks with `result` and invalid
    /// ones with `Fail`. Closes the group permanently.
    pub fn complete_all(&self, result: TaskResult) {
        let mut state = self.tasks.lock();
        state.closed = true;
        for task in state.tasks.drain(..) {
            let outcome = if task.is_valid() { result } else { TaskResult::Fail };
            task.complete(outcome);
        }
    }
}
