//! objectfs: random-access, file-like reads and writes over object storage.
//!
//! The transport layer (`backend`) exposes what a store can do: ranged
//! GETs plus simple, chunked-resumable or append-only uploads. The engine
//! (`file`) turns those capabilities into seekable readers and stateful
//! upload sessions. The client (`fs`) resolves paths, classifies buckets,
//! and hands out handles whose strategy matches the bucket.

pub mod backend;
pub mod error;
pub mod file;
pub mod fs;

pub use backend::transport::{BackendKind, ObjectHandle, ObjectMeta, ObjectTransport};
pub use error::{FsError, Result};
pub use file::checker::ConsistencyMode;
pub use file::reader::ObjectReader;
pub use file::writer::ObjectWriter;
pub use fs::client::{ObjectFs, OpenOptions};
pub use fs::sync::SyncObjectFs;
