//! Codebook: Candidate Code Lifecycle & Merge Reconciliation Engine
//!
//! Governs candidate codes of a qualitative-research codebook from the moment
//! they are proposed until they are validated, rejected, merged into a
//! surviving code, or promoted into the canonical codebook.
//!
//! # Core Concepts
//!
//! - **Candidates**: proposed coding labels with a lifecycle state
//! - **Merges**: consolidating source codes into a surviving target code
//! - **Merge plans**: inert AI proposals applied one pair at a time
//! - **Promotion**: moving evidenced, validated candidates into the codebook
//!
//! # Example
//!
//! ```
//! use codebook::{CandidateState, Transition};
//!
//! let state: CandidateState = "pendiente".parse().unwrap();
//! assert_eq!(state.apply(Transition::Validate).unwrap(), CandidateState::Validated);
//! assert!(CandidateState::Merged.apply(Transition::Validate).is_err());
//! ```

pub mod api;
mod candidate;
pub mod config;
pub mod graph_sync;
pub mod oracle;
pub mod reconcile;
pub mod storage;

pub use api::{CodebookApi, Refreshed};
pub use candidate::{
    normalize_code, same_code, CandidateCode, CandidateId, CandidateState, CanonicalCode, CodeOrigin,
    Fragment, InvalidTransition, NewCandidate, Transition, UnknownLabel,
};
pub use config::{ConfigError, EngineConfig};
pub use graph_sync::{DisabledGraphSync, GraphSync, GraphSyncReport, MockGraphSync};
pub use oracle::{SimilarityOracle, TableOracle};
pub use reconcile::{ReconcileError, ReconcileResult};
pub use storage::{CandidateStore, OpenStore, SqliteStore, StorageError, StorageResult};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
