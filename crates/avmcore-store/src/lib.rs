//! Persistence layer of the execution core.
//!
//! Five stores share one key-value engine, one column family each (plus the
//! shared `state` family for counters):
//!
//! - [`value_store`]: content-addressed, reference-counted value bodies.
//! - [`code_store`]: immutable code segments, loaded transitively.
//! - [`checkpoint`]: the catalog of machine states keyed by consumed gas.
//! - [`inbox`]: sequencer batch items and the delayed-message stream.
//! - [`outputs`]: append-only logs and sends plus the persisted counters.

pub mod checkpoint;
pub mod code_store;
pub mod inbox;
pub mod outputs;
pub mod value_cache;
pub mod value_store;

pub use code_store::{CodeSegment, CodeStore};
pub use inbox::{DelayedMessage, RawMessageAndAcc, SequencerBatchItem};
pub use value_cache::ValueCache;
