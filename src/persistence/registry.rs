//! Versioned loader registry
//!
//! Payload formats evolve independently of the envelope. Each datatype id
//! maps to a set of loaders covering disjoint format-version ranges;
//! registering overlapping ranges is a configuration error and rejected at
//! startup, never discovered at runtime.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::ops::RangeInclusive;
use std::sync::Arc;

use crate::datapoint::{DataPoint, IdEntry, IdMap};
use crate::error::{LodError, LodResult};
use crate::persistence::envelope::FileHeader;
use crate::section::SectionPos;
use crate::source::{ColumnAccessor, LodSource};

/// Datatype id of the full columnar source payload.
pub const FULL_SOURCE_DATATYPE: u64 = 0x4C4F_4453_5243_0001;

/// Reads and writes one payload format family.
pub trait SourceLoader: Send + Sync {
    fn datatype_id(&self) -> u64;

    /// Format versions this loader understands.
    fn versions(&self) -> RangeInclusive<u8>;

    /// Version written for new files.
    fn current_version(&self) -> u8 {
        *self.versions().end()
    }

    fn read(&self, header: &FileHeader, payload: &[u8]) -> LodResult<LodSource>;

    fn write(&self, source: &LodSource, out: &mut dyn Write) -> LodResult<()>;
}

/// Loader lookup keyed by (datatype id, format version).
pub struct LoaderRegistry {
    loaders: FxHashMap<u64, Vec<Arc<dyn SourceLoader>>>,
}

impl LoaderRegistry {
    pub fn new() -> Self {
        Self { loaders: FxHashMap::default() }
    }

    /// Registry with the built-in loaders installed.
    pub fn with_defaults() -> LodResult<Self> {
        let mut registry = Self::new();
        registry.register(Arc::new(FullSourceLoader))?;
        Ok(registry)
    }

    /// Register a loader. Fails if its version range intersects an existing
    /// registration for the same datatype id.
    pub fn register(&mut self, loader: Arc<dyn SourceLoader>) -> LodResult<()> {
        let datatype = loader.datatype_id();
        let versions = loader.versions();
        let existing = self.loaders.entry(datatype).or_default();
        for other in existing.iter() {
            let theirs = other.versions();
            if versions.start() <= theirs.end() && theirs.start() <= versions.end() {
                return Err(LodError::LoaderConflict {
                    datatype,
                    first: *versions.start(),
                    last: *versions.end(),
                });
            }
        }
        existing.push(loader);
        Ok(())
    }

    pub fn find(&self, datatype: u64, version: u8) -> Option<Arc<dyn SourceLoader>> {
        self.loaders
            .get(&datatype)?
            .iter()
            .find(|l| l.versions().contains(&version))
            .cloned()
    }

    /// Loader with the highest writable version for a datatype, used for
    /// new files.
    pub fn latest(&self, datatype: u64) -> Option<Arc<dyn SourceLoader>> {
        self.loaders
            .get(&datatype)?
            .iter()
            .max_by_key(|l| l.current_version())
            .cloned()
    }
}

impl Default for LoaderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Serialized body of a full columnar source (bincode, format version 1).
#[derive(Serialize, Deserialize)]
struct FullSourcePayload {
    id_entries: Vec<IdEntry>,
    columns: Vec<Vec<DataPoint>>,
    ungenerated: Vec<SectionPos>,
    gen_coverage: bool,
    patched_untracked: bool,
}

/// Built-in loader for [`LodSource`] payloads.
pub struct FullSourceLoader;

impl SourceLoader for FullSourceLoader {
    fn datatype_id(&self) -> u64 {
        FULL_SOURCE_DATATYPE
    }

    fn versions(&self) -> RangeInclusive<u8> {
        1..=1
    }

    fn read(&self, header: &FileHeader, payload: &[u8]) -> LodResult<LodSource> {
        let body: FullSourcePayload = bincode::deserialize(payload)?;
        // decode already rejects data_detail > pos.detail
        let width = 1usize << (header.pos.detail - header.data_detail);
        if body.columns.len() != width * width {
            return Err(LodError::Serialization(format!(
                "payload holds {} columns, section {} at data detail {} needs {}",
                body.columns.len(),
                header.pos,
                header.data_detail,
                width * width
            )));
        }
        Ok(LodSource::from_parts(
            header.pos,
            header.data_detail,
            body.columns,
            IdMap::from_entries(body.id_entries),
            body.ungenerated,
            body.gen_coverage,
            body.patched_untracked,
            header.data_version,
        ))
    }

    fn write(&self, source: &LodSource, out: &mut dyn Write) -> LodResult<()> {
        let body = FullSourcePayload {
            id_entries: source.id_map().entries().to_vec(),
            columns: source.columns().to_vec(),
            ungenerated: source.ungenerated().to_vec(),
            gen_coverage: source.gen_coverage(),
            patched_untracked: source.patched_untracked(),
        };
        bincode::serialize_into(out, &body)?;
        Ok(())
    }
}
