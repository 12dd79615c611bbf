//! Object-store transport adapters (backend)
//!
//! Submodules:
//! - `transport`: the `ObjectTransport` capability consumed by the file layer
//! - `memory`: in-memory transport used by tests and local development
//! - `localfs`: local-directory transport mocking an append-capable store
//! - `s3`: S3-compatible transport implementation
//!
//! Responsibilities summary:
//! - Provide an async API for metadata/range-get/put/chunked/append calls.
//! - Normalize backend failure modes onto the `FsError` taxonomy.
//! - Report per-bucket capabilities so the fs layer can pick strategies.

pub mod localfs;
pub mod memory;
pub mod s3;
pub mod transport;
