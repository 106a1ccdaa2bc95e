//! Reconciliation errors

use super::merge::MergeBatchReport;
use crate::candidate::{CandidateId, InvalidTransition};
use crate::graph_sync::GraphSyncError;
use crate::oracle::OracleError;
use crate::storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("candidate not found: {0}")]
    CandidateNotFound(CandidateId),

    #[error("a justification memo is required to {0}")]
    MissingJustification(&'static str),

    #[error("nothing selected to {0}")]
    EmptySelection(&'static str),

    #[error("threshold {value} outside [{min}, {max}]")]
    InvalidThreshold { value: f32, min: f32, max: f32 },

    #[error("no merge target resolved for '{0}'")]
    NoTargetResolved(String),

    #[error("another merge batch is already in flight")]
    ConcurrentMergeRejected,

    #[error("merge plan not found: {0}")]
    PlanNotFound(String),

    #[error("pair '{from_code}' → '{to_code}' is not pending in plan {run_id}")]
    PlanPairNotPending {
        run_id: String,
        from_code: String,
        to_code: String,
    },

    #[error("plan limit must be at least 1, got {0}")]
    InvalidLimit(usize),

    #[error("remote failure: {0}")]
    RemoteFailure(String),

    /// The store went away mid-batch. `report` holds what was committed
    /// before the abort.
    #[error(
        "remote failure: merge batch aborted after {} of {} pair(s) with {} row(s) merged: {reason}",
        .report.pairs_processed,
        .planned,
        .report.total_merged
    )]
    MergeAborted {
        reason: String,
        planned: usize,
        report: Box<MergeBatchReport>,
    },

    #[error("timed out after {attempts} polls waiting for {job}")]
    TimeoutExceeded { job: String, attempts: u32 },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl ReconcileError {
    /// Errors raised locally before any store or oracle call.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidTransition(_)
                | Self::MissingJustification(_)
                | Self::EmptySelection(_)
                | Self::InvalidThreshold { .. }
                | Self::InvalidLimit(_)
                | Self::NoTargetResolved(_)
        )
    }
}

impl From<OracleError> for ReconcileError {
    fn from(e: OracleError) -> Self {
        Self::RemoteFailure(e.to_string())
    }
}

impl From<GraphSyncError> for ReconcileError {
    fn from(e: GraphSyncError) -> Self {
        Self::RemoteFailure(e.to_string())
    }
}

pub type ReconcileResult<T> = Result<T, ReconcileError>;

/// Reject blank memos; returns the trimmed memo.
pub(crate) fn require_memo<'a>(memo: &'a str, action: &'static str) -> ReconcileResult<&'a str> {
    let memo = memo.trim();
    if memo.is_empty() {
        return Err(ReconcileError::MissingJustification(action));
    }
    Ok(memo)
}

pub(crate) fn check_threshold(value: f32, min: f32, max: f32) -> ReconcileResult<f32> {
    if value.is_nan() || value < min || value > max {
        return Err(ReconcileError::InvalidThreshold { value, min, max });
    }
    Ok(value)
}
