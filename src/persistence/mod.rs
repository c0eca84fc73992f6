//! Binary file envelope and versioned loaders
//!
//! Every section's data source persists as one file: a fixed 64-byte header
//! (magic, position, Adler-32 checksum, detail levels, datatype id, data
//! version) followed by an opaque payload owned by whichever loader is
//! registered for that (datatype id, format version) pair.

pub mod envelope;
pub mod registry;

pub use envelope::{
    read_envelope, resolve_section_file, section_file_path, write_envelope, FileHeader,
    HEADER_SIZE, MAGIC,
};
pub use registry::{FullSourceLoader, LoaderRegistry, SourceLoader, FULL_SOURCE_DATATYPE};
