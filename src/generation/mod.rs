//! World generation task queue
//!
//! Consumers never call the generator directly. They submit a request for a
//! section, requests for the same cell are grouped so one generator batch
//! satisfies every waiter, and results fan back out through per-task
//! consumers. Requests coarser than the generator can handle in one call
//! split into their four children and complete once all children resolve.

pub mod queue;
pub mod task;

pub use queue::{GenQueueSnapshot, GenerationQueue};
pub use task::{
    AlwaysValid, ChunkConsumer, FlagTracker, GenTask, GenTaskGroup, RequestTracker, SplitTracker,
    TaskResult,
};

use crate::error::LodResult;
use crate::section::SectionPos;
use crate::source::ColumnPatch;

/// One generation batch request: the target cell and the granularity the
/// produced columns should have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenRequest {
    pub pos: SectionPos,
    pub data_detail: u8,
}

impl GenRequest {
    /// Covered area in level-0 unit coordinates, min inclusive, max exclusive.
    pub fn unit_bounds(&self) -> ((i64, i64), (i64, i64)) {
        let (min_x, min_z) = self.pos.min_unit_corner();
        let w = self.pos.width_in_units();
        ((min_x, min_z), (min_x + w, min_z + w))
    }
}

/// One produced unit of terrain: a patch whose column coordinates are local
/// to `pos`. Receivers translate it into their own grid via
/// [`crate::source::LodSource::apply_chunk`].
#[derive(Debug, Clone)]
pub struct GenChunk {
    pub pos: SectionPos,
    pub patch: ColumnPatch,
}

/// Generation collaborator contract. Implementations are invoked on the
/// world-gen worker pool and must call `sink` once per produced unit.
pub trait LodGenerator: Send + Sync {
    /// Coarsest section detail a single `generate` call can cover.
    /// Requests above this split into children.
    fn max_batch_detail(&self) -> u8;

    fn generate(&self, request: &GenRequest, sink: &mut dyn FnMut(GenChunk)) -> LodResult<()>;
}
