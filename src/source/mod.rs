//! Columnar LOD data sources
//!
//! One section's terrain at one resolution lives in a [`LodSource`]: a
//! width x width grid of packed data point columns plus the id map those
//! columns resolve against. Instead of a class hierarchy of source variants
//! there is a single storage type and a [`CompletenessTier`] classification
//! derived from explicit generation tracking.

pub mod accessor;
pub mod downsample;

pub use accessor::{ColumnAccessor, SourceView};
pub use downsample::{DownsampleStrategy, RepresentativeColumn};

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::datapoint::{DataPoint, IdEntry, IdMap};
use crate::section::SectionPos;

/// How fully a section has been generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompletenessTier {
    /// Every tracked sub-cell has been generated.
    Complete,
    /// Partially generated at the finest data detail.
    HighDetailIncomplete,
    /// Partially generated at a coarser data detail.
    LowDetailIncomplete,
    /// Created but nothing generated or written yet.
    Sparse,
    /// Holds directly-written columns with no generation coverage.
    Spotty,
}

/// One column carried by a patch, in coordinates local to the target grid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchColumn {
    pub x: u32,
    pub z: u32,
    pub points: Vec<DataPoint>,
}

/// A batch of column replacements with its own id table.
///
/// Patches are self-contained: point ids index `id_entries`, never the
/// target's id map, so a patch can be applied to any source (or replayed
/// against the on-disk copy) without coordination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnPatch {
    pub data_detail: u8,
    pub id_entries: Vec<IdEntry>,
    pub columns: Vec<PatchColumn>,
    /// Area this patch fully generates, if it came from the generator.
    /// Direct edits leave this unset and the target goes Spotty instead.
    pub covers: Option<SectionPos>,
}

/// Convenience builder interning identities into a patch-local id table.
pub struct PatchBuilder {
    data_detail: u8,
    id_map: IdMap,
    columns: Vec<PatchColumn>,
    covers: Option<SectionPos>,
}

impl PatchBuilder {
    pub fn new(data_detail: u8) -> Self {
        Self {
            data_detail,
            id_map: IdMap::new(),
            columns: Vec::new(),
            covers: None,
        }
    }

    pub fn covering(mut self, pos: SectionPos) -> Self {
        self.covers = Some(pos);
        self
    }

    pub fn intern(&mut self, entry: IdEntry) -> u32 {
        self.id_map.intern(entry)
    }

    pub fn push_column(&mut self, x: u32, z: u32, points: Vec<DataPoint>) {
        self.columns.push(PatchColumn { x, z, points });
    }

    pub fn build(self) -> ColumnPatch {
        ColumnPatch {
            data_detail: self.data_detail,
            id_entries: self.id_map.entries().to_vec(),
            columns: self.columns,
            covers: self.covers,
        }
    }
}

/// Columnar terrain data for one section at one data detail level.
#[derive(Debug, Clone)]
pub struct LodSource {
    pos: SectionPos,
    data_detail: u8,
    width: usize,
    columns: Vec<Vec<DataPoint>>,
    id_map: IdMap,
    /// Sub-cells still awaiting generation. Completeness is read off this
    /// list, never inferred from column contents.
    ungenerated: Vec<SectionPos>,
    /// Whether any generation result has ever landed here.
    gen_coverage: bool,
    /// Whether columns were written outside generation tracking.
    patched_untracked: bool,
    data_version: u64,
}

impl LodSource {
    /// Create an empty, fully ungenerated source.
    pub fn empty(pos: SectionPos, data_detail: u8) -> Self {
        assert!(data_detail <= pos.detail, "data detail finer than the section supports");
        let width = 1usize << (pos.detail - data_detail);
        let ungenerated = if pos.detail == 0 {
            vec![pos]
        } else {
            pos.children().to_vec()
        };
        Self {
            pos,
            data_detail,
            width,
            columns: vec![Vec::new(); width * width],
            id_map: IdMap::new(),
            ungenerated,
            gen_coverage: false,
            patched_untracked: false,
            data_version: now_millis(),
        }
    }

    /// Reassemble a source from its serialized parts.
    pub(crate) fn from_parts(
        pos: SectionPos,
        data_detail: u8,
        columns: Vec<Vec<DataPoint>>,
        id_map: IdMap,
        ungenerated: Vec<SectionPos>,
        gen_coverage: bool,
        patched_untracked: bool,
        data_version: u64,
    ) -> Self {
        let width = 1usize << (pos.detail - data_detail);
        assert_eq!(columns.len(), width * width, "column grid does not match section size");
        Self {
            pos,
            data_detail,
            width,
            columns,
            id_map,
            ungenerated,
            gen_coverage,
            patched_untracked,
            data_version,
        }
    }

    pub fn pos(&self) -> SectionPos {
        self.pos
    }

    pub fn data_detail(&self) -> u8 {
        self.data_detail
    }

    pub fn data_version(&self) -> u64 {
        self.data_version
    }

    pub fn ungenerated(&self) -> &[SectionPos] {
        &self.ungenerated
    }

    pub(crate) fn gen_coverage(&self) -> bool {
        self.gen_coverage
    }

    pub(crate) fn patched_untracked(&self) -> bool {
        self.patched_untracked
    }

    pub(crate) fn columns(&self) -> &[Vec<DataPoint>] {
        &self.columns
    }

    pub fn populated_columns(&self) -> usize {
        self.columns.iter().filter(|c| !c.is_empty()).count()
    }

    /// Completeness classification, derived from the tracking state.
    pub fn tier(&self) -> CompletenessTier {
        if self.ungenerated.is_empty() {
            CompletenessTier::Complete
        } else if self.patched_untracked && !self.gen_coverage {
            CompletenessTier::Spotty
        } else if self.populated_columns() == 0 {
            CompletenessTier::Sparse
        } else if self.data_detail == 0 {
            CompletenessTier::HighDetailIncomplete
        } else {
            CompletenessTier::LowDetailIncomplete
        }
    }

    /// Remove everything `covered` generates from the ungenerated list,
    /// splitting tracked cells that are only partially covered.
    pub fn mark_generated(&mut self, covered: SectionPos) {
        if !covered.overlaps(&self.pos) {
            return;
        }
        self.gen_coverage = true;
        let mut stack = std::mem::take(&mut self.ungenerated);
        let mut remaining = Vec::new();
        while let Some(cell) = stack.pop() {
            if covered.contains(&cell) {
                continue;
            }
            if !covered.overlaps(&cell) {
                remaining.push(cell);
                continue;
            }
            if cell.detail > self.data_detail {
                stack.extend_from_slice(&cell.children());
            }
            // Partial coverage at the finest tracked level counts as
            // generated; a single column cannot be half-generated.
        }
        self.ungenerated = remaining;
    }

    /// Apply a column patch: merge its id table, remap its points and
    /// replace the addressed columns.
    pub fn apply_patch(&mut self, patch: &ColumnPatch) {
        assert_eq!(
            patch.data_detail, self.data_detail,
            "patch detail {} does not match source detail {}",
            patch.data_detail, self.data_detail
        );

        let patch_map = IdMap::from_entries(patch.id_entries.clone());
        let remap = self.id_map.merge_from(&patch_map);

        for column in &patch.columns {
            let (x, z) = (column.x as usize, column.z as usize);
            if x >= self.width || z >= self.width {
                log::warn!(
                    "dropping patch column ({}, {}) outside {}x{} grid of {}",
                    x, z, self.width, self.width, self.pos
                );
                continue;
            }
            self.columns[z * self.width + x] =
                column.points.iter().map(|p| p.remap(&remap)).collect();
        }

        match patch.covers {
            Some(covered) => self.mark_generated(covered),
            None => self.patched_untracked = true,
        }
        self.bump_version();
    }

    /// Apply a patch whose column coordinates are local to `chunk_pos`,
    /// translating them into this source's grid. Used to route generator
    /// output, which is produced per chunk, into any enclosing section.
    pub fn apply_chunk(&mut self, chunk_pos: SectionPos, patch: &ColumnPatch) {
        assert!(
            self.pos.contains(&chunk_pos),
            "chunk {} outside section {}",
            chunk_pos,
            self.pos
        );
        debug_assert!(chunk_pos.detail >= self.data_detail, "chunk finer than storage detail");
        let (cx, cz) = chunk_pos.min_unit_corner();
        let (sx, sz) = self.pos.min_unit_corner();
        let x_off = ((cx - sx) >> self.data_detail) as u32;
        let z_off = ((cz - sz) >> self.data_detail) as u32;
        let translated = ColumnPatch {
            data_detail: patch.data_detail,
            id_entries: patch.id_entries.clone(),
            columns: patch
                .columns
                .iter()
                .map(|c| PatchColumn {
                    x: c.x + x_off,
                    z: c.z + z_off,
                    points: c.points.clone(),
                })
                .collect(),
            covers: Some(chunk_pos),
        };
        self.apply_patch(&translated);
    }

    /// Copy this source's columns into the window of `target` covering
    /// this source's area. Both must be at the same data detail and
    /// `target` must contain `self`.
    ///
    /// When the id maps already match this is a plain column copy. When
    /// they differ every point is remapped, which is far more expensive;
    /// the slow path is logged so it cannot creep into hot loops unnoticed.
    pub fn shadow_copy_to(&self, target: &mut LodSource) {
        assert_eq!(self.data_detail, target.data_detail, "shadow copy across data details");
        assert!(
            target.pos.contains(&self.pos),
            "target {} does not contain source {}",
            target.pos,
            self.pos
        );

        let (sx, sz) = self.pos.min_unit_corner();
        let (tx, tz) = target.pos.min_unit_corner();
        let x_off = ((sx - tx) >> self.data_detail) as usize;
        let z_off = ((sz - tz) >> self.data_detail) as usize;

        if self.id_map == target.id_map {
            for z in 0..self.width {
                for x in 0..self.width {
                    target.columns[(z_off + z) * target.width + x_off + x] =
                        self.columns[z * self.width + x].clone();
                }
            }
        } else {
            log::debug!(
                "shadow copy {} -> {} needs id remap ({} entries)",
                self.pos, target.pos, self.id_map.len()
            );
            let remap = target.id_map.merge_from(&self.id_map);
            for z in 0..self.width {
                for x in 0..self.width {
                    target.columns[(z_off + z) * target.width + x_off + x] = self.columns
                        [z * self.width + x]
                        .iter()
                        .map(|p| p.remap(&remap))
                        .collect();
                }
            }
        }

        // Transfer generation tracking: the copied area is as generated in
        // the target as it was in the source.
        target.mark_generated(self.pos);
        for cell in &self.ungenerated {
            target.ungenerated.push(*cell);
        }
        target.bump_version();
    }

    /// Rebuild this source's columns by aggregating a higher-detail
    /// accessor. The source width must be an integer multiple of this
    /// source's width.
    pub fn downsample_from(&mut self, src: &dyn ColumnAccessor, strategy: &dyn DownsampleStrategy) {
        assert!(
            src.width() >= self.width && src.width() % self.width == 0,
            "source width {} is not a multiple of target width {}",
            src.width(),
            self.width
        );
        let factor = src.width() / self.width;
        let remap = self.id_map.merge_from(src.id_map());

        for z in 0..self.width {
            for x in 0..self.width {
                let block = src.sub_view(factor, x * factor, z * factor);
                self.columns[z * self.width + x] = strategy
                    .aggregate(&block)
                    .into_iter()
                    .map(|p| p.remap(&remap))
                    .collect();
            }
        }
        self.bump_version();
    }

    fn bump_version(&mut self) {
        self.data_version = now_millis().max(self.data_version + 1);
    }
}

impl ColumnAccessor for LodSource {
    fn width(&self) -> usize {
        self.width
    }

    fn get(&self, x: usize, z: usize) -> &[DataPoint] {
        assert!(x < self.width && z < self.width, "column ({}, {}) outside grid", x, z);
        &self.columns[z * self.width + x]
    }

    fn id_map(&self) -> &IdMap {
        &self.id_map
    }

    fn sub_view(&self, width: usize, x: usize, z: usize) -> SourceView<'_> {
        SourceView::new(&self.columns, self.width, &self.id_map, x, z, width)
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
