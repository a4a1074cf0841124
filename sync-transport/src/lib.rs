//! Concrete `sync_core::Transport` implementations: an in-memory duplex
//! for tests and a newline-delimited-JSON TCP transport for real
//! connections. This crate binds the pure engine in `sync-core` to an
//! actual socket — it depends on `sync-core`, never the other way around.

pub mod memory;
pub mod ndjson;

pub use memory::MemoryTransport;
pub use ndjson::NdjsonTransport;
