pub mod buffer;
pub mod config;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod journal;
pub mod key;
pub mod page;
pub mod recover;
pub mod tree;
pub mod txn;
pub mod value;
pub mod volume;
pub mod wire;

// Type (ts_t) used for all engine timestamp storage and arithmetics.
// One atomic clock mints both transaction start and commit timestamps.
pub type Ts = u64;

/// Commit timestamp of a transaction that has not (yet) committed.
pub const TS_UNCOMMITTED: Ts = u64::MAX;

// Byte offset into the journal stream, monotonic across journal files.
pub type JournalAddr = u64;

// 0-based page number within a volume.
pub type PageAddr = u64;

/// Journal-file-scoped handle of a volume (assigned by IV records).
pub type VolumeHandle = u32;

/// Journal-file-scoped handle of a tree (assigned by IT records).
pub type TreeHandle = u32;

pub use config::Config;
pub use engine::{Engine, RecoveryStatus};
pub use error::{Error, Result};
pub use exchange::{Direction, Exchange};
pub use key::Key;
pub use journal::CommitPolicy;
pub use txn::Transaction;
pub use value::Value;
