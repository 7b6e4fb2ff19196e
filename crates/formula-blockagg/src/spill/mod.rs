#![forbid(unsafe_code)]

//! External storage for evicted group state.
//!
//! A spill log is an append-only key-value log. Records are appended with an encoded group key
//! and read back through a forward-only cursor that yields them ordered by key bytes, then by
//! append order. Records for one key are therefore contiguous no matter how many spill events
//! wrote them.

mod manager;
mod memory_log;
mod record;
#[cfg(feature = "sqlite")]
mod sqlite_log;

pub use manager::SpillManager;
pub use memory_log::InMemorySpillLog;
pub use record::{decode_record, encode_key, encode_record};
#[cfg(feature = "sqlite")]
pub use sqlite_log::SqliteSpillLog;

use crate::error::AggResult;
use std::fmt;

/// Opaque handle returned by [`SpillLog::append`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordId(pub u64);

/// A record as stored in the log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawRecord {
    pub id: RecordId,
    pub key: Vec<u8>,
    pub data: Vec<u8>,
}

pub trait SpillLog: fmt::Debug + Send {
    fn append(&mut self, key: &[u8], data: &[u8]) -> AggResult<RecordId>;

    /// A cursor positioned before the first record.
    fn cursor(&self) -> AggResult<Box<dyn SpillCursor>>;

    /// Bytes used by the backing storage.
    fn storage_size(&self) -> AggResult<u64>;

    fn record_count(&self) -> u64;
}

pub trait SpillCursor: Send {
    fn next(&mut self) -> AggResult<Option<RawRecord>>;
}
