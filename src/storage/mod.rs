//! Storage backends for the candidate tray
//!
//! The engine talks to storage through the `CandidateStore` trait.
//! `SqliteStore` is the bundled persistent implementation.

mod sqlite;
mod traits;

pub use sqlite::SqliteStore;
pub use traits::{
    AuditAction, AuditEntry, BacklogStats, CandidateFilter, CandidateStore, OpenStore, SortOrder,
    StorageError, StorageResult,
};
