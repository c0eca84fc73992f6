//! Named worker pool fabric
//!
//! Each concern (world generation, data conversion, buffer building) gets
//! its own independently sized and rate-limited pool, plus one tokio
//! runtime for async coordination and file io. There is deliberately no
//! global singleton: the fabric lives in `LodContext` and is passed by
//! reference.

pub mod fabric;

pub use fabric::{PoolFabric, PoolKind, PoolMetrics};
