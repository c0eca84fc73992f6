//! Fixed-size file header, checksummed writes and file resolution
//!
//! Header layout (little-endian, 64 bytes):
//! ```text
//! offset  0  magic            b"LODS"
//! offset  4  x                i32
//! offset  8  unused y         i32 (always 0)
//! offset 12  z                i32
//! offset 16  checksum         u32, Adler-32 over the payload bytes
//! offset 20  section detail   u8
//! offset 21  data detail      u8
//! offset 22  loader version   u8
//! offset 23  unused           u8
//! offset 24  datatype id      u64
//! offset 32  data version     u64
//! offset 40  reserved         24 zero bytes
//! ```

use adler32::RollingAdler32;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::config::WriteMode;
use crate::error::{LodError, LodResult};
use crate::persistence::registry::{LoaderRegistry, SourceLoader};
use crate::section::SectionPos;
use crate::source::LodSource;

pub const MAGIC: [u8; 4] = *b"LODS";
pub const HEADER_SIZE: usize = 64;

/// Decoded file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub pos: SectionPos,
    pub checksum: u32,
    pub data_detail: u8,
    pub loader_version: u8,
    pub datatype_id: u64,
    pub data_version: u64,
}

impl FileHeader {
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4..8].copy_from_slice(&self.pos.x.to_le_bytes());
        // bytes 8..12 reserved for a y coordinate, always zero
        buf[12..16].copy_from_slice(&self.pos.z.to_le_bytes());
        buf[16..20].copy_from_slice(&self.checksum.to_le_bytes());
        buf[20] = self.pos.detail;
        buf[21] = self.data_detail;
        buf[22] = self.loader_version;
        buf[24..32].copy_from_slice(&self.datatype_id.to_le_bytes());
        buf[32..40].copy_from_slice(&self.data_version.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8], path: &Path) -> LodResult<FileHeader> {
        if buf.len() < HEADER_SIZE {
            return Err(LodError::Corrupted {
                path: path.to_path_buf(),
                reason: format!("file truncated at {} bytes", buf.len()),
            });
        }
        if buf[0..4] != MAGIC {
            return Err(LodError::Corrupted {
                path: path.to_path_buf(),
                reason: format!("bad magic {:02x?}", &buf[0..4]),
            });
        }
        let x = i32::from_le_bytes(buf[4..8].try_into().unwrap());
        let z = i32::from_le_bytes(buf[12..16].try_into().unwrap());
        let detail = buf[20];
        if detail > crate::section::MAX_DETAIL {
            return Err(LodError::Corrupted {
                path: path.to_path_buf(),
                reason: format!("detail level {} out of range", detail),
            });
        }
        let data_detail = buf[21];
        if data_detail > detail {
            return Err(LodError::Corrupted {
                path: path.to_path_buf(),
                reason: format!(
                    "data detail {} finer than section detail {}",
                    data_detail, detail
                ),
            });
        }
        Ok(FileHeader {
            pos: SectionPos::new(detail, x, z),
            checksum: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
            data_detail,
            loader_version: buf[22],
            datatype_id: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
            data_version: u64::from_le_bytes(buf[32..40].try_into().unwrap()),
        })
    }
}

/// `Write` adapter feeding an Adler-32 rolling checksum.
struct ChecksumWriter<W: Write> {
    inner: W,
    adler: RollingAdler32,
}

impl<W: Write> ChecksumWriter<W> {
    fn new(inner: W) -> Self {
        Self { inner, adler: RollingAdler32::new() }
    }

    fn checksum(&self) -> u32 {
        self.adler.hash()
    }
}

impl<W: Write> Write for ChecksumWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.adler.update_buffer(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Canonical path for a section's file under `root`.
pub fn section_file_path(root: &Path, pos: SectionPos) -> PathBuf {
    root.join(format!("detail_{}", pos.detail))
        .join(format!("{}_{}.lod", pos.x, pos.z))
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(suffix);
    path.with_file_name(name)
}

pub(crate) fn tmp_path(path: &Path) -> PathBuf {
    sibling(path, ".tmp")
}

/// Move a corrupt file aside so the section can be regenerated from
/// scratch while the bytes stay available for inspection.
pub(crate) fn quarantine(path: &Path) {
    let target = sibling(path, ".corrupt");
    match fs::rename(path, &target) {
        Ok(()) => log::warn!("quarantined corrupt file {} -> {}", path.display(), target.display()),
        Err(e) => log::warn!("failed to quarantine {}: {}", path.display(), e),
    }
}

/// Serialize `source` through `loader` into the section file for
/// `source.pos()`.
pub fn write_envelope(
    root: &Path,
    mode: WriteMode,
    source: &LodSource,
    loader: &dyn SourceLoader,
) -> LodResult<()> {
    let path = section_file_path(root, source.pos());
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let target = match mode {
        WriteMode::Atomic => {
            let tmp = tmp_path(&path);
            if tmp.exists() {
                // leftover from an interrupted write; set it aside rather
                // than truncating bytes that may be newer than canonical
                let old = sibling(&tmp, ".old");
                log::warn!(
                    "leftover temp file {} set aside as {}",
                    tmp.display(),
                    old.display()
                );
                fs::rename(&tmp, &old)?;
            }
            tmp
        }
        WriteMode::InPlace => path.clone(),
    };

    let file = File::create(&target)?;
    let mut writer = BufWriter::new(file);
    // header placeholder, rewritten once the payload checksum is known
    writer.write_all(&[0u8; HEADER_SIZE])?;

    let mut checked = ChecksumWriter::new(&mut writer);
    loader.write(source, &mut checked)?;
    let checksum = checked.checksum();

    let header = FileHeader {
        pos: source.pos(),
        checksum,
        data_detail: source.data_detail(),
        loader_version: loader.current_version(),
        datatype_id: loader.datatype_id(),
        data_version: source.data_version(),
    };
    writer.seek(SeekFrom::Start(0))?;
    writer.write_all(&header.encode())?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    drop(writer);

    if mode == WriteMode::Atomic {
        fs::rename(&target, &path)?;
    }
    Ok(())
}

fn peek_header(path: &Path) -> LodResult<FileHeader> {
    let mut file = File::open(path)?;
    let mut buf = [0u8; HEADER_SIZE];
    file.read_exact(&mut buf)
        .map_err(|e| LodError::Corrupted {
            path: path.to_path_buf(),
            reason: format!("short header read: {}", e),
        })?;
    FileHeader::decode(&buf, path)
}

/// Find the on-disk file for `pos`, repairing leftovers from interrupted
/// writes. A `.tmp` sibling with a valid header competes with the
/// canonical file; whichever carries the newer data version wins and the
/// loser is renamed aside with a `.old` suffix. Nothing is deleted.
pub fn resolve_section_file(root: &Path, pos: SectionPos) -> LodResult<Option<PathBuf>> {
    let canonical = section_file_path(root, pos);
    let tmp = tmp_path(&canonical);

    let canonical_exists = canonical.exists();
    if !tmp.exists() {
        return Ok(if canonical_exists { Some(canonical) } else { None });
    }

    let tmp_header = match peek_header(&tmp) {
        Ok(h) => h,
        Err(_) => {
            // interrupted mid-write, the canonical file (if any) stands
            quarantine(&tmp);
            return Ok(if canonical_exists { Some(canonical) } else { None });
        }
    };

    if !canonical_exists {
        log::warn!(
            "recovering orphaned temp file for {}: {}",
            pos,
            tmp.display()
        );
        fs::rename(&tmp, &canonical)?;
        return Ok(Some(canonical));
    }

    let canonical_version = peek_header(&canonical).map(|h| h.data_version).unwrap_or(0);
    if tmp_header.data_version > canonical_version {
        let old = sibling(&canonical, ".old");
        log::warn!(
            "duplicate files for {}: temp copy is newer ({} > {}), keeping it; {} -> {}",
            pos,
            tmp_header.data_version,
            canonical_version,
            canonical.display(),
            old.display()
        );
        fs::rename(&canonical, &old)?;
        fs::rename(&tmp, &canonical)?;
    } else {
        let old = sibling(&tmp, ".old");
        log::warn!(
            "duplicate files for {}: keeping canonical copy, {} -> {}",
            pos,
            tmp.display(),
            old.display()
        );
        fs::rename(&tmp, &old)?;
    }
    Ok(Some(canonical))
}

/// Read and validate the envelope at `path`, expected to hold `pos`.
///
/// The file is trusted for content, not metadata: a header whose position
/// disagrees with the expected address is repaired in place rather than
/// rejected. Bad magic and checksum mismatches are corruption.
pub fn read_envelope(
    path: &Path,
    pos: SectionPos,
    registry: &LoaderRegistry,
) -> LodResult<LodSource> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;

    let mut header = FileHeader::decode(&buf, path)?;
    let payload = &buf[HEADER_SIZE..];

    let mut adler = RollingAdler32::new();
    adler.update_buffer(payload);
    let actual = adler.hash();
    if actual != header.checksum {
        return Err(LodError::ChecksumMismatch {
            path: path.to_path_buf(),
            expected: header.checksum,
            actual,
        });
    }

    if header.pos != pos {
        log::warn!(
            "file {} claims position {} but was addressed as {}; rewriting header",
            path.display(),
            header.pos,
            pos
        );
        header.pos = pos;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header.encode())?;
    }

    let loader = registry
        .find(header.datatype_id, header.loader_version)
        .ok_or(LodError::NoLoader {
            datatype: header.datatype_id,
            version: header.loader_version,
        })?;
    loader.read(&header, payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datapoint::{DataPoint, IdEntry};
    use crate::source::{ColumnAccessor, PatchBuilder};
    use tempfile::TempDir;

    fn registry() -> LoaderRegistry {
        LoaderRegistry::with_defaults().expect("default registry")
    }

    fn sample_source(pos: SectionPos) -> LodSource {
        let mut source = LodSource::empty(pos, 0);
        let mut builder = PatchBuilder::new(0).covering(pos);
        let stone = builder.intern(IdEntry { block_state: 9, biome: 4 });
        let width = 1u32 << pos.detail;
        for z in 0..width {
            for x in 0..width {
                builder.push_column(
                    x,
                    z,
                    vec![
                        DataPoint::new(stone, 90 + x as u16, 60, 15, 0, 8),
                        DataPoint::new(stone, 60, 0, 0, 0, 8),
                    ],
                );
            }
        }
        source.apply_patch(&builder.build());
        source
    }

    #[test]
    fn test_header_encode_decode_round_trip() {
        let header = FileHeader {
            pos: SectionPos::new(6, -12, 400),
            checksum: 0xDEADBEEF,
            data_detail: 2,
            loader_version: 1,
            datatype_id: crate::persistence::FULL_SOURCE_DATATYPE,
            data_version: 123_456_789,
        };
        let decoded = FileHeader::decode(&header.encode(), Path::new("x")).expect("decode");
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_envelope_round_trip() {
        let dir = TempDir::new().expect("temp dir");
        let reg = registry();
        let pos = SectionPos::new(2, 3, -7);
        let source = sample_source(pos);

        let loader = reg.latest(crate::persistence::FULL_SOURCE_DATATYPE).expect("loader");
        write_envelope(dir.path(), WriteMode::Atomic, &source, loader.as_ref()).expect("write");

        let path = resolve_section_file(dir.path(), pos).expect("resolve").expect("file");
        let loaded = read_envelope(&path, pos, &reg).expect("read");

        assert_eq!(loaded.pos(), pos);
        assert_eq!(loaded.data_version(), source.data_version());
        assert_eq!(loaded.tier(), source.tier());
        for z in 0..source.width() {
            for x in 0..source.width() {
                let a = source.get(x, z);
                let b = loaded.get(x, z);
                assert_eq!(a.len(), b.len());
                for (pa, pb) in a.iter().zip(b.iter()) {
                    assert_eq!(source.id_map().get(pa.id()), loaded.id_map().get(pb.id()));
                    assert_eq!(pa.top_y(), pb.top_y());
                    assert_eq!(pa.bottom_y(), pb.bottom_y());
                }
            }
        }
    }

    #[test]
    fn test_bad_magic_is_corruption() {
        let dir = TempDir::new().expect("temp dir");
        let reg = registry();
        let pos = SectionPos::new(1, 0, 0);
        let source = sample_source(pos);
        let loader = reg.latest(crate::persistence::FULL_SOURCE_DATATYPE).expect("loader");
        write_envelope(dir.path(), WriteMode::Atomic, &source, loader.as_ref()).expect("write");

        let path = section_file_path(dir.path(), pos);
        let mut bytes = fs::read(&path).expect("read bytes");
        bytes[0] = b'X';
        fs::write(&path, &bytes).expect("write bytes");

        match read_envelope(&path, pos, &reg) {
            Err(LodError::Corrupted { .. }) => {}
            other => panic!("expected corruption error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_checksum_mismatch_is_corruption() {
        let dir = TempDir::new().expect("temp dir");
        let reg = registry();
        let pos = SectionPos::new(1, 5, 5);
        let source = sample_source(pos);
        let loader = reg.latest(crate::persistence::FULL_SOURCE_DATATYPE).expect("loader");
        write_envelope(dir.path(), WriteMode::Atomic, &source, loader.as_ref()).expect("write");

        let path = section_file_path(dir.path(), pos);
        let mut bytes = fs::read(&path).expect("read bytes");
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, &bytes).expect("write bytes");

        match read_envelope(&path, pos, &reg) {
            Err(LodError::ChecksumMismatch { .. }) => {}
            other => panic!("expected checksum error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_position_mismatch_repairs_header() {
        let dir = TempDir::new().expect("temp dir");
        let reg = registry();
        let stored_pos = SectionPos::new(2, 1, 1);
        let source = sample_source(stored_pos);
        let loader = reg.latest(crate::persistence::FULL_SOURCE_DATATYPE).expect("loader");
        write_envelope(dir.path(), WriteMode::Atomic, &source, loader.as_ref()).expect("write");

        // address the same file as a different section
        let expected = SectionPos::new(2, 8, 8);
        let path = section_file_path(dir.path(), stored_pos);
        let loaded = read_envelope(&path, expected, &reg).expect("read repairs");
        assert_eq!(loaded.pos(), expected);

        // the header on disk was rewritten
        let repaired = peek_header(&path).expect("header");
        assert_eq!(repaired.pos, expected);
    }

    #[test]
    fn test_orphaned_tmp_file_is_recovered() {
        let dir = TempDir::new().expect("temp dir");
        let reg = registry();
        let pos = SectionPos::new(3, 2, 2);
        let source = sample_source(pos);
        let loader = reg.latest(crate::persistence::FULL_SOURCE_DATATYPE).expect("loader");
        write_envelope(dir.path(), WriteMode::Atomic, &source, loader.as_ref()).expect("write");

        // simulate a crash between payload write and rename
        let canonical = section_file_path(dir.path(), pos);
        let tmp = tmp_path(&canonical);
        fs::rename(&canonical, &tmp).expect("stage tmp");

        let resolved = resolve_section_file(dir.path(), pos).expect("resolve").expect("file");
        assert_eq!(resolved, canonical);
        assert!(canonical.exists());
        assert!(!tmp.exists());
    }

    #[test]
    fn test_duplicate_files_keep_newest_version() {
        let dir = TempDir::new().expect("temp dir");
        let reg = registry();
        let pos = SectionPos::new(2, 0, 9);
        let loader = reg.latest(crate::persistence::FULL_SOURCE_DATATYPE).expect("loader");

        let older = sample_source(pos);
        write_envelope(dir.path(), WriteMode::Atomic, &older, loader.as_ref()).expect("write old");
        let canonical = section_file_path(dir.path(), pos);
        let tmp = tmp_path(&canonical);
        fs::rename(&canonical, &tmp).expect("stage tmp");

        let mut newer = sample_source(pos);
        let mut builder = PatchBuilder::new(0).covering(pos);
        let id = builder.intern(IdEntry { block_state: 42, biome: 2 });
        builder.push_column(0, 0, vec![DataPoint::new(id, 10, 0, 0, 0, 9)]);
        newer.apply_patch(&builder.build());
        // in-place so the staged tmp survives until resolution arbitrates
        write_envelope(dir.path(), WriteMode::InPlace, &newer, loader.as_ref()).expect("write new");

        // tmp holds the older copy: canonical must win, tmp goes .old
        let resolved = resolve_section_file(dir.path(), pos).expect("resolve").expect("file");
        let loaded = read_envelope(&resolved, pos, &reg).expect("read");
        assert_eq!(loaded.data_version(), newer.data_version());
        assert!(sibling(&tmp, ".old").exists());
    }

    #[test]
    fn test_leftover_tmp_is_preserved_by_next_write() {
        let dir = TempDir::new().expect("temp dir");
        let reg = registry();
        let pos = SectionPos::new(2, 6, -3);
        let loader = reg.latest(crate::persistence::FULL_SOURCE_DATATYPE).expect("loader");

        let first = sample_source(pos);
        write_envelope(dir.path(), WriteMode::Atomic, &first, loader.as_ref()).expect("write");
        let canonical = section_file_path(dir.path(), pos);
        let tmp = tmp_path(&canonical);
        fs::rename(&canonical, &tmp).expect("stage tmp");

        // a second atomic write must not truncate the leftover
        let second = sample_source(pos);
        write_envelope(dir.path(), WriteMode::Atomic, &second, loader.as_ref()).expect("rewrite");

        assert!(sibling(&tmp, ".old").exists());
        assert!(!tmp.exists());
        let loaded = read_envelope(&canonical, pos, &reg).expect("read");
        assert_eq!(loaded.data_version(), second.data_version());
    }

    #[test]
    fn test_data_detail_finer_than_section_is_corruption() {
        let dir = TempDir::new().expect("temp dir");
        let reg = registry();
        let pos = SectionPos::new(2, 1, -1);
        let source = sample_source(pos);
        let loader = reg.latest(crate::persistence::FULL_SOURCE_DATATYPE).expect("loader");
        write_envelope(dir.path(), WriteMode::Atomic, &source, loader.as_ref()).expect("write");

        // the data detail byte sits outside the payload checksum, so a
        // flipped value must be caught by header validation instead
        let path = section_file_path(dir.path(), pos);
        let mut bytes = fs::read(&path).expect("read bytes");
        bytes[21] = pos.detail + 1;
        fs::write(&path, &bytes).expect("write bytes");

        match read_envelope(&path, pos, &reg) {
            Err(LodError::Corrupted { .. }) => {}
            other => panic!("expected corruption error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_in_place_write_mode() {
        let dir = TempDir::new().expect("temp dir");
        let reg = registry();
        let pos = SectionPos::new(1, -4, 4);
        let source = sample_source(pos);
        let loader = reg.latest(crate::persistence::FULL_SOURCE_DATATYPE).expect("loader");
        write_envelope(dir.path(), WriteMode::InPlace, &source, loader.as_ref()).expect("write");

        let path = section_file_path(dir.path(), pos);
        assert!(path.exists());
        assert!(!tmp_path(&path).exists());
        let loaded = read_envelope(&path, pos, &reg).expect("read");
        assert_eq!(loaded.data_version(), source.data_version());
    }
}
