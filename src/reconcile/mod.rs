//! Reconciliation engine
//!
//! Lifecycle transitions, merge batches, duplicate detection, AI merge
//! plans, promotion and backlog health. Every component talks to the
//! candidate store through `Arc<dyn CandidateStore>`; the oracle and graph
//! sync are async collaborators.

mod duplicates;
mod error;
mod health;
mod lifecycle;
mod merge;
mod planner;
mod poll;
mod promotion;
mod types;

pub use duplicates::{
    BatchCheckResult, DuplicateReconciler, DuplicateReport, ExactDuplicateGroup, FlaggedMergeReport,
};
pub use error::{ReconcileError, ReconcileResult};
pub use health::{BacklogHealthMonitor, BacklogHealthSnapshot, HealthSeverity};
pub use lifecycle::{LifecycleStateMachine, StateChange};
pub use merge::{
    prefer_shorter, AutoConfirm, BatchConfirmation, MergeBatchOutcome, MergeBatchReport, MergeCoordinator,
    MergeGuard, MergeIdsResult, MergeLock, MergeStrategy, PairDetail, PairStatus,
};
pub use planner::{AiMergePlanner, ApplyOutcome, PlanView};
pub use poll::{CancellationToken, JobPoller, PollState};
pub use promotion::{GraphSyncStatus, PromotionGate, PromotionReport, PromotionSelection};
pub use types::{MergePair, MergePlan, PlanDecision, PlanDecisionKind, PlanPair};
