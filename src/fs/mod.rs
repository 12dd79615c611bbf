//! Filesystem layer (fs)
//!
//! Responsibilities:
//! - Resolve `bucket/key` paths and classify each bucket's backend once,
//!   through an explicit bounded layout cache owned by the client.
//! - Hand out read/write handles whose fetch and upload strategies match
//!   the bucket's capabilities.
//! - Provide the stateless conveniences (`read_range`, `read_block`,
//!   `cat`) and a blocking façade for non-async callers.

pub mod client;
pub mod demo;
pub mod layout;
pub mod sync;
