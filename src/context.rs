use std::path::PathBuf;
use std::sync::Arc;

use crate::cache::LodCache;
use crate::config::LodConfig;
use crate::error::LodResult;
use crate::generation::{GenerationQueue, LodGenerator};
use crate::persistence::LoaderRegistry;
use crate::thread_pool::PoolFabric;

/// Shared runtime state: the pool fabric, the loader registry and the
/// configuration everything was built from. One context typically lives
/// for the whole process and hands out caches per storage root.
pub struct LodContext {
    fabric: Arc<PoolFabric>,
    registry: Arc<LoaderRegistry>,
    config: LodConfig,
}

impl LodContext {
    /// Context with the built-in loaders.
    pub fn new(config: LodConfig) -> LodResult<Self> {
        Self::with_registry(config, LoaderRegistry::with_defaults()?)
    }

    /// Context with a caller-assembled registry, for embedders that ship
    /// their own datatypes or format versions.
    pub fn with_registry(config: LodConfig, registry: LoaderRegistry) -> LodResult<Self> {
        let fabric = Arc::new(PoolFabric::new(&config)?);
        Ok(Self {
            fabric,
            registry: Arc::new(registry),
            config,
        })
    }

    /// Open a cache over `root`, backed by `generator` for sections with
    /// no persisted data.
    pub fn open_cache(&self, root: PathBuf, generator: Arc<dyn LodGenerator>) -> Arc<LodCache> {
        let queue = GenerationQueue::new(generator, self.fabric.clone());
        LodCache::new(root, self.registry.clone(), queue, &self.config)
    }

    pub fn fabric(&self) -> &Arc<PoolFabric> {
        &self.fabric
    }

    pub fn registry(&self) -> &Arc<LoaderRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &LodConfig {
        &self.config
    }
}
