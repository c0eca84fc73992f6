//! End-to-end lifecycle: generate, edit, persist, restart, reload.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tempfile::TempDir;

use lodstone::error::LodResult;
use lodstone::generation::{GenChunk, GenRequest, GenerationQueue, LodGenerator};
use lodstone::persistence::LoaderRegistry;
use lodstone::source::ColumnAccessor;
use lodstone::thread_pool::PoolFabric;
use lodstone::{
    CompletenessTier, DataPoint, IdEntry, LodCache, LodConfig, PatchBuilder, SectionPos, WriteMode,
};

struct TerracedGenerator {
    calls: AtomicUsize,
}

impl LodGenerator for TerracedGenerator {
    fn max_batch_detail(&self) -> u8 {
        6
    }

    fn generate(&self, request: &GenRequest, sink: &mut dyn FnMut(GenChunk)) -> LodResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut builder = PatchBuilder::new(request.data_detail);
        let grass = builder.intern(IdEntry { block_state: 2, biome: 1 });
        let width = 1u32 << (request.pos.detail - request.data_detail);
        for z in 0..width {
            for x in 0..width {
                let surface = 60 + (x + z) as u16;
                builder.push_column(x, z, vec![DataPoint::new(grass, surface, 0, 15, 0, 8)]);
            }
        }
        sink(GenChunk {
            pos: request.pos,
            patch: builder.build(),
        });
        Ok(())
    }
}

struct Session {
    fabric: Arc<PoolFabric>,
    cache: Arc<LodCache>,
    generator: Arc<TerracedGenerator>,
}

fn open_session(root: &Path, config: &LodConfig) -> Session {
    let _ = env_logger::builder().is_test(true).try_init();
    let fabric = Arc::new(PoolFabric::new(config).expect("fabric"));
    let registry = Arc::new(LoaderRegistry::with_defaults().expect("registry"));
    let generator = Arc::new(TerracedGenerator {
        calls: AtomicUsize::new(0),
    });
    let queue = GenerationQueue::new(generator.clone(), fabric.clone());
    let cache = LodCache::new(root.to_path_buf(), registry, queue, config);
    Session {
        fabric,
        cache,
        generator,
    }
}

fn marker_patch() -> lodstone::ColumnPatch {
    let mut builder = PatchBuilder::new(0);
    let beacon = builder.intern(IdEntry { block_state: 999, biome: 1 });
    builder.push_column(2, 3, vec![DataPoint::new(beacon, 200, 198, 15, 15, 8)]);
    builder.build()
}

#[test]
fn edits_survive_a_restart() {
    let dir = TempDir::new().expect("tempdir");
    let config = LodConfig::default();
    let pos = SectionPos::new(3, -1, 2);

    {
        let session = open_session(dir.path(), &config);
        let source = session
            .fabric
            .block_on(session.cache.get_or_load(pos, 0))
            .expect("generated");
        assert_eq!(source.read().tier(), CompletenessTier::Complete);

        session
            .fabric
            .block_on(session.cache.apply_patch(pos, marker_patch()))
            .expect("patch");
        let written = session.fabric.block_on(session.cache.flush()).expect("flush");
        assert_eq!(written, 1);
    }

    let session = open_session(dir.path(), &config);
    let source = session
        .fabric
        .block_on(session.cache.get_or_load(pos, 0))
        .expect("reloaded");
    let source = source.read();

    assert_eq!(session.generator.calls.load(Ordering::SeqCst), 0, "restart must load, not regenerate");
    assert_eq!(source.tier(), CompletenessTier::Complete);

    let column = source.get(2, 3);
    assert_eq!(column.len(), 1);
    let entry = source.id_map().get(column[0].id()).expect("marker id");
    assert_eq!(entry.block_state, 999, "edited column must survive the restart");
}

#[test]
fn data_version_is_monotonic_across_sessions() {
    let dir = TempDir::new().expect("tempdir");
    let config = LodConfig::default();
    let pos = SectionPos::new(2, 0, 0);

    let first_version = {
        let session = open_session(dir.path(), &config);
        let source = session
            .fabric
            .block_on(session.cache.get_or_load(pos, 0))
            .expect("generated");
        session.fabric.block_on(session.cache.flush()).expect("flush");
        let v = source.read().data_version();
        v
    };

    let session = open_session(dir.path(), &config);
    let source = session
        .fabric
        .block_on(session.cache.get_or_load(pos, 0))
        .expect("reloaded");
    assert_eq!(source.read().data_version(), first_version);

    session
        .fabric
        .block_on(session.cache.apply_patch(pos, marker_patch()))
        .expect("patch");
    assert!(
        source.read().data_version() > first_version,
        "every mutation must advance the version"
    );
}

#[test]
fn in_place_writes_round_trip() {
    let dir = TempDir::new().expect("tempdir");
    let config = LodConfig {
        write_mode: WriteMode::InPlace,
        ..LodConfig::default()
    };
    let pos = SectionPos::new(1, 4, -4);

    {
        let session = open_session(dir.path(), &config);
        session
            .fabric
            .block_on(session.cache.get_or_load(pos, 0))
            .expect("generated");
        session.fabric.block_on(session.cache.flush()).expect("flush");
    }

    let session = open_session(dir.path(), &config);
    let source = session
        .fabric
        .block_on(session.cache.get_or_load(pos, 0))
        .expect("reloaded");
    assert_eq!(source.read().tier(), CompletenessTier::Complete);
    assert_eq!(session.generator.calls.load(Ordering::SeqCst), 0);
}

#[test]
fn persisted_edit_loads_instead_of_generating() {
    let dir = TempDir::new().expect("tempdir");
    let config = LodConfig::default();
    let pos = SectionPos::new(3, 6, 6);

    let session = open_session(dir.path(), &config);
    // edit a section nothing has generated yet: goes straight to disk
    session
        .fabric
        .block_on(session.cache.apply_patch(pos, marker_patch()))
        .expect("patch");

    let source = session
        .fabric
        .block_on(session.cache.get_or_load(pos, 0))
        .expect("loaded");
    let source = source.read();
    assert_eq!(source.tier(), CompletenessTier::Spotty);
    assert_eq!(source.populated_columns(), 1);
    assert_eq!(session.generator.calls.load(Ordering::SeqCst), 0, "persisted edits shadow generation");
}
