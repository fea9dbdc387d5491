//! Storage adapter for the tracksync orchestration engine.
//!
//! [`SyncStorage`] is the single capability interface every other component
//! talks to. Two interchangeable backends ship with this crate:
//!
//! - [`SqliteStorage`] -- a single SQLite database file (or in-memory DB)
//! - [`FileStorage`] -- one JSON file per record under a data directory
//!
//! Both run the same [`conformance`] suite.

pub mod conformance;
mod error;
mod file;
mod record;
mod sqlite;
mod timestamp;
mod traits;

pub use error::StorageError;
pub use file::FileStorage;
pub use record::{AuditRecord, EntityRef, OperationRecord, Payload, SnapshotRecord};
pub use sqlite::SqliteStorage;
pub use timestamp::{format_timestamp, now_timestamp, parse_timestamp};
pub use traits::SyncStorage;
