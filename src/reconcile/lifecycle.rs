//! LifecycleStateMachine: validated state changes for single candidates

use super::error::{require_memo, ReconcileError, ReconcileResult};
use crate::candidate::{CandidateId, CandidateState, Transition};
use crate::storage::{AuditAction, AuditEntry, CandidateStore};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

/// Result of a single-candidate transition
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateChange {
    pub id: CandidateId,
    pub from: CandidateState,
    pub to: CandidateState,
    /// False when the candidate was already in the requested state
    pub changed: bool,
}

/// Applies lifecycle transitions through the candidate store.
#[derive(Clone)]
pub struct LifecycleStateMachine {
    store: Arc<dyn CandidateStore>,
}

impl LifecycleStateMachine {
    pub fn new(store: Arc<dyn CandidateStore>) -> Self {
        Self { store }
    }

    /// Move a candidate to `validado`.
    pub fn validate(&self, project: &str, id: &CandidateId) -> ReconcileResult<StateChange> {
        self.transition(project, id, Transition::Validate, None)
    }

    /// Move a candidate to `rechazado`, recording the memo when given.
    pub fn reject(&self, project: &str, id: &CandidateId, memo: Option<&str>) -> ReconcileResult<StateChange> {
        self.transition(project, id, Transition::Reject, memo)
    }

    /// Park a pending candidate as `hipotesis`.
    pub fn mark_hypothesis(
        &self,
        project: &str,
        id: &CandidateId,
        memo: Option<&str>,
    ) -> ReconcileResult<StateChange> {
        self.transition(project, id, Transition::Hypothesize, memo)
    }

    /// Administrative bulk reset of every `validado` row in the project back
    /// to `pendiente`. Terminal rows and the canonical codebook are left as
    /// they are. Returns the number of rows reverted.
    pub fn revert_validated_to_pending(&self, project: &str, memo: &str) -> ReconcileResult<usize> {
        let memo = require_memo(memo, "revert validated candidates")?;

        let reverted = self.store.revert_validated(project, memo)?;
        self.store.append_audit(
            &AuditEntry::new(project, AuditAction::Revert)
                .with_memo(Some(memo))
                .with_details(json!({ "reverted_count": reverted })),
        )?;

        info!(project, reverted, "reverted validated candidates to pending");
        Ok(reverted)
    }

    fn transition(
        &self,
        project: &str,
        id: &CandidateId,
        transition: Transition,
        memo: Option<&str>,
    ) -> ReconcileResult<StateChange> {
        let candidate = self
            .store
            .get_candidate(project, id)?
            .ok_or_else(|| ReconcileError::CandidateNotFound(id.clone()))?;
        let from = candidate.state;

        if transition == Transition::Validate && from == CandidateState::Validated {
            return Ok(StateChange {
                id: id.clone(),
                from,
                to: from,
                changed: false,
            });
        }

        let to = from.apply(transition)?;
        let memo = memo.map(str::trim).filter(|m| !m.is_empty());
        self.store.set_state(project, id, from, to, memo)?;

        let action = match transition {
            Transition::Validate => AuditAction::Validate,
            Transition::Reject => AuditAction::Reject,
            _ => AuditAction::Hypothesis,
        };
        self.store.append_audit(
            &AuditEntry::new(project, action)
                .with_memo(memo)
                .with_details(json!({
                    "id": id,
                    "codigo": candidate.code,
                    "from": from,
                    "to": to,
                })),
        )?;

        info!(project, id = %id, from = %from, to = %to, "candidate state changed");
        Ok(StateChange {
            id: id.clone(),
            from,
            to,
            changed: true,
        })
    }
}
