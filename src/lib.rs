//! Multi-resolution terrain LOD storage core.
//!
//! The world is addressed as a quadtree of square sections
//! ([`section::SectionPos`]). Each section's terrain lives in a columnar
//! [`source::LodSource`] of packed [`datapoint::DataPoint`] runs, persists
//! through a checksummed binary envelope with versioned loaders
//! ([`persistence`]), and reaches consumers through a deduplicating
//! load/generate cache ([`cache::LodCache`]) fed by a batching generation
//! queue ([`generation::GenerationQueue`]). CPU and io work runs on the
//! named pools of [`thread_pool::PoolFabric`].
//!
//! Typical embedding:
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use lodstone::{LodConfig, LodContext, SectionPos};
//! # use lodstone::generation::{GenRequest, GenChunk, LodGenerator};
//! # use lodstone::error::LodResult;
//! # struct MyGenerator;
//! # impl LodGenerator for MyGenerator {
//! #     fn max_batch_detail(&self) -> u8 { 4 }
//! #     fn generate(&self, _: &GenRequest, _: &mut dyn FnMut(GenChunk)) -> LodResult<()> { Ok(()) }
//! # }
//! let context = LodContext::new(LodConfig::default())?;
//! let cache = context.open_cache("world/lod".into(), Arc::new(MyGenerator));
//! let section = context.fabric().block_on(async {
//!     cache.get_or_load(SectionPos::new(4, 0, 0), 0).await
//! });
//! # Ok::<(), lodstone::error::LodError>(())
//! ```

pub mod cache;
pub mod config;
pub mod context;
pub mod datapoint;
pub mod error;
pub mod generation;
pub mod persistence;
pub mod section;
pub mod source;
pub mod thread_pool;

pub use cache::{CacheStats, LodCache, SharedSource};
pub use config::{LodConfig, WriteMode};
pub use context::LodContext;
pub use datapoint::{DataPoint, IdEntry, IdMap};
pub use error::{LodError, LodResult};
pub use section::SectionPos;
pub use source::{ColumnPatch, CompletenessTier, LodSource, PatchBuilder};
