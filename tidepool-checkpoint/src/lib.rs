#![forbid(unsafe_code)]

//! Durable checkpointing for the sampling engine: a bit-exact little-endian
//! codec for span records and reservoir snapshots, and a store that keeps the
//! latest record in an embedded key-value database with scheduled compaction.

pub mod codec;
pub mod store;

pub use codec::{decode_checkpoint, decode_span, encode_checkpoint, encode_span, CheckpointRecord};
pub use store::CheckpointStore;
