//! Storage trait definitions

use crate::candidate::{
    CandidateCode, CandidateId, CandidateState, CanonicalCode, CodeOrigin, Fragment, NewCandidate,
    UnknownLabel,
};
use crate::reconcile::{MergePlan, PlanDecision};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Candidate not found: {0}")]
    CandidateNotFound(String),

    #[error("Invalid stored label: {0}")]
    InvalidLabel(#[from] UnknownLabel),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Date parsing error: {0}")]
    DateParse(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Candidate {id} is {found}, expected {expected}")]
    StateConflict {
        id: String,
        expected: CandidateState,
        found: CandidateState,
    },
}

impl StorageError {
    /// Errors that mean the store cannot be reached at all, as opposed to a
    /// single request failing.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Io(_))
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Ordering of candidate listings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    Newest,
    Oldest,
    Code,
    Confidence,
}

impl std::str::FromStr for SortOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "newest" => Ok(Self::Newest),
            "oldest" => Ok(Self::Oldest),
            "code" | "codigo" => Ok(Self::Code),
            "confidence" => Ok(Self::Confidence),
            other => Err(format!("unknown sort order: {}", other)),
        }
    }
}

/// Filter criteria for listing candidates
#[derive(Debug, Clone, Default)]
pub struct CandidateFilter {
    /// Accepted states (empty = any)
    pub states: Vec<CandidateState>,
    pub origin: Option<CodeOrigin>,
    /// `Some(true)` only promoted rows, `Some(false)` only unpromoted rows
    pub promoted: Option<bool>,
    /// Match by normalized code
    pub code: Option<String>,
    pub sort_order: SortOrder,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl CandidateFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(mut self, state: CandidateState) -> Self {
        self.states.push(state);
        self
    }

    pub fn with_states(mut self, states: &[CandidateState]) -> Self {
        self.states.extend_from_slice(states);
        self
    }

    pub fn with_origin(mut self, origin: CodeOrigin) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn promoted(mut self, promoted: bool) -> Self {
        self.promoted = Some(promoted);
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn sorted(mut self, order: SortOrder) -> Self {
        self.sort_order = order;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }
}

/// Kind of mutation recorded in the audit trail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Validate,
    Reject,
    Hypothesis,
    Merge,
    Revert,
    Promote,
    PlanCreated,
    PlanApplied,
    PlanRejected,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validate => "validate",
            Self::Reject => "reject",
            Self::Hypothesis => "hypothesis",
            Self::Merge => "merge",
            Self::Revert => "revert",
            Self::Promote => "promote",
            Self::PlanCreated => "plan_created",
            Self::PlanApplied => "plan_applied",
            Self::PlanRejected => "plan_rejected",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AuditAction {
    type Err = UnknownLabel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let action = match s {
            "validate" => Self::Validate,
            "reject" => Self::Reject,
            "hypothesis" => Self::Hypothesis,
            "merge" => Self::Merge,
            "revert" => Self::Revert,
            "promote" => Self::Promote,
            "plan_created" => Self::PlanCreated,
            "plan_applied" => Self::PlanApplied,
            "plan_rejected" => Self::PlanRejected,
            _ => {
                return Err(UnknownLabel {
                    kind: "audit action",
                    label: s.to_string(),
                })
            }
        };
        Ok(action)
    }
}

/// One append-only audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub project: String,
    pub action: AuditAction,
    pub memo: Option<String>,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(project: impl Into<String>, action: AuditAction) -> Self {
        Self {
            project: project.into(),
            action,
            memo: None,
            details: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    pub fn with_memo(mut self, memo: Option<&str>) -> Self {
        self.memo = memo.map(str::to_string);
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// Raw aggregates over the candidate backlog
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BacklogStats {
    pub pending_count: usize,
    pub oldest_pending_at: Option<DateTime<Utc>>,
    pub avg_resolution_hours: Option<f64>,
    /// Advisory warnings computed by the store
    pub alerts: Vec<String>,
}

/// Trait for candidate storage backends
///
/// Implementations must be thread-safe (Send + Sync). All operations are
/// scoped by project.
pub trait CandidateStore: Send + Sync {
    // === Candidate Operations ===

    /// Insert a new candidate in `pendiente`
    fn insert_candidate(&self, project: &str, candidate: &NewCandidate) -> StorageResult<CandidateCode>;

    fn get_candidate(&self, project: &str, id: &CandidateId) -> StorageResult<Option<CandidateCode>>;

    fn list_candidates(&self, project: &str, filter: &CandidateFilter) -> StorageResult<Vec<CandidateCode>>;

    /// Move a row from `from` to `to`. Callers validate the transition first.
    ///
    /// The write only lands while the row is still in `from`; otherwise it
    /// fails with `StateConflict`.
    fn set_state(
        &self,
        project: &str,
        id: &CandidateId,
        from: CandidateState,
        to: CandidateState,
        memo: Option<&str>,
    ) -> StorageResult<()>;

    /// Mark the given rows `fusionado` into `target`.
    ///
    /// Only rows in a mergeable state that have not been promoted change.
    /// When a source code is left with no live rows, rows previously merged
    /// into it are re-pointed at `target`. Returns the number of rows merged.
    fn merge_candidates(
        &self,
        project: &str,
        ids: &[CandidateId],
        target: &str,
        memo: &str,
    ) -> StorageResult<usize>;

    /// Move every `validado` row back to `pendiente` and clear its tray
    /// promotion stamp. The canonical codebook is not touched.
    fn revert_validated(&self, project: &str, memo: &str) -> StorageResult<usize>;

    // === Evidence Operations ===

    fn insert_fragment(&self, fragment: &Fragment) -> StorageResult<()>;

    fn fragment_exists(&self, project: &str, fragment_id: &str) -> StorageResult<bool>;

    // === Codebook Operations ===

    /// Write the candidate into the codebook and stamp `promovido_en`.
    ///
    /// A candidate id appears at most once in a code's `promoted_from`.
    /// Returns false if the row was not validated or already promoted.
    fn promote_candidate(&self, project: &str, id: &CandidateId, at: DateTime<Utc>) -> StorageResult<bool>;

    fn list_codebook(&self, project: &str) -> StorageResult<Vec<CanonicalCode>>;

    // === Audit Operations ===

    fn append_audit(&self, entry: &AuditEntry) -> StorageResult<()>;

    /// Most recent entries first
    fn list_audit(&self, project: &str, limit: Option<usize>) -> StorageResult<Vec<AuditEntry>>;

    // === Health ===

    fn backlog_stats(&self, project: &str) -> StorageResult<BacklogStats>;

    // === Merge Plan Log ===

    fn save_plan(&self, plan: &MergePlan) -> StorageResult<()>;

    fn load_plan(&self, run_id: &str) -> StorageResult<Option<MergePlan>>;

    fn record_plan_decision(&self, decision: &PlanDecision) -> StorageResult<()>;

    fn plan_decisions(&self, run_id: &str) -> StorageResult<Vec<PlanDecision>>;
}

/// Extension trait for opening stores from paths
pub trait OpenStore: CandidateStore + Sized {
    /// Open or create a store at the given path
    fn open(path: impl AsRef<Path>) -> StorageResult<Self>;

    /// Create an in-memory store (useful for testing)
    fn open_in_memory() -> StorageResult<Self>;
}
