//! File read/write engine (file)
//!
//! Responsibilities:
//! - Turn ranged GETs into a seekable byte stream with one cached window
//!   per reader and a pluggable consistency checker.
//! - Convert arbitrary (offset, length) requests into backend wire calls,
//!   single-range or batched, with bounded retry at this boundary.
//! - Drive the three upload protocols (simple, chunked-resumable,
//!   append-stream) as explicit state machines with cleanup-on-error.
//!
//! Submodules:
//! - `checker`: running size/digest accumulators validated against metadata
//! - `fetch`: range fetch strategies over the transport
//! - `cache`: the contiguous read-ahead window
//! - `reader`: the public read-side file object
//! - `upload`: upload session state machines
//! - `writer`: the public write-side file object

pub mod cache;
pub mod checker;
pub mod fetch;
pub mod reader;
pub mod upload;
pub mod writer;
