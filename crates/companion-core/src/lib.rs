//! `companion-core` - shared building blocks for the companion report engine.
//!
//! Everything the engine persists goes through a [`store::KvStore`]: recipient
//! records, the delivery queue, system and run configuration, and the two
//! advisory lock records. This crate owns that seam plus the types every
//! other crate agrees on.

pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod lock;
pub mod store;
pub mod system;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CoreError, Result};
pub use lock::{AdvisoryLock, LockGuard};
pub use store::{KvStore, MemoryKvStore, SqliteKvStore};
pub use system::{SystemConfig, SystemConfigPatch, SystemSettings};
pub use types::{parse_utc_offset, JobId, Period, RecipientId};
