//! # galena-storage: durable primitives
//!
//! The on-disk building blocks of a Galena replica:
//!
//! - [`DataLog`] — an append-only sequence of opaque byte strings with
//!   monotonically increasing 64-bit sequence numbers, stored as
//!   size-bounded segment files with escape-encoded records and
//!   binary-searchable by sequence
//! - [`DataArray`] — a [`DataLog`] with a bounded LRU of in-memory chunks
//!   and a cached end sequence, giving cheap random access
//! - [`FileDict`] — a key→bytes map persisted as one file per key
//! - [`CapDict`] — a persistent dictionary of polymorphic objects,
//!   reconstructed through a tag→factory [`Registry`] and handed a `save`
//!   callback that re-persists them
//! - [`LruCache`] — the bounded map with eviction callbacks the above use
//!
//! Everything recovers deterministically from the on-disk state alone;
//! torn trailing records are skipped, not fatal.

pub mod array;
pub mod cap_dict;
pub mod error;
pub mod file_dict;
pub mod log;
pub mod lru;

pub use array::DataArray;
pub use cap_dict::{CapDict, JsonMap, MemStore, Registry, SaveFn, Store, Stored, downcast};
pub use error::{Result, StorageError};
pub use file_dict::FileDict;
pub use log::{DEFAULT_SEGMENT_LIMIT, DataLog};
pub use lru::LruCache;
