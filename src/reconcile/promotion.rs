//! PromotionGate: moves evidenced, validated candidates into the codebook
//!
//! Promotion is idempotent per row: `promovido_en` is set once and a stamped
//! row never re-enters the eligible set. The graph is synchronized after the
//! codebook write; a failed or abandoned sync never undoes a promotion.

use super::error::{ReconcileError, ReconcileResult};
use super::poll::{CancellationToken, JobPoller, PollState};
use crate::candidate::{CandidateCode, CandidateId, CandidateState};
use crate::config::PollConfig;
use crate::graph_sync::{GraphSync, GraphSyncReport};
use crate::storage::{AuditAction, AuditEntry, CandidateFilter, CandidateStore, SortOrder};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromotionSelection {
    AllValidated,
    Ids(Vec<CandidateId>),
}

/// How the graph synchronization after a promotion ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphSyncStatus {
    Completed,
    Failed,
    TimedOut,
    Cancelled,
    /// Nothing was promoted, so nothing was submitted
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromotionReport {
    pub promoted_count: usize,
    pub eligible_total: usize,
    pub skipped_total: usize,
    pub neo4j_merged: usize,
    pub neo4j_missing_fragments: usize,
    /// Codes written to the codebook by this call
    pub promoted: Vec<String>,
    pub graph_sync: GraphSyncStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub graph_sync_error: Option<String>,
}

pub struct PromotionGate {
    store: Arc<dyn CandidateStore>,
    graph: Arc<dyn GraphSync>,
    poll: PollConfig,
}

impl PromotionGate {
    pub fn new(store: Arc<dyn CandidateStore>, graph: Arc<dyn GraphSync>, poll: PollConfig) -> Self {
        Self { store, graph, poll }
    }

    pub async fn promote(&self, project: &str, selection: PromotionSelection) -> ReconcileResult<PromotionReport> {
        self.promote_with_cancellation(project, selection, CancellationToken::new())
            .await
    }

    /// Promote, observing the graph sync until it settles or `token` is
    /// cancelled. Cancelling only stops the polling.
    pub async fn promote_with_cancellation(
        &self,
        project: &str,
        selection: PromotionSelection,
        token: CancellationToken,
    ) -> ReconcileResult<PromotionReport> {
        let selected = self.select(project, &selection)?;

        let mut eligible = Vec::with_capacity(selected.len());
        for candidate in selected.iter() {
            if self.has_evidence(project, candidate)? {
                eligible.push(candidate);
            }
        }
        let skipped_total = selected.len() - eligible.len();

        let now = Utc::now();
        let mut promoted = Vec::new();
        for candidate in &eligible {
            if self.store.promote_candidate(project, &candidate.id, now)? {
                promoted.push(candidate.code.clone());
            }
        }

        let mut report = PromotionReport {
            promoted_count: promoted.len(),
            eligible_total: eligible.len(),
            skipped_total,
            neo4j_merged: 0,
            neo4j_missing_fragments: 0,
            promoted,
            graph_sync: GraphSyncStatus::Skipped,
            graph_sync_error: None,
        };

        self.store.append_audit(
            &AuditEntry::new(project, AuditAction::Promote).with_details(json!({
                "promoted_count": report.promoted_count,
                "eligible_total": report.eligible_total,
                "skipped_total": report.skipped_total,
                "codes": report.promoted,
            })),
        )?;

        info!(
            project,
            promoted = report.promoted_count,
            eligible = report.eligible_total,
            skipped = report.skipped_total,
            "promotion committed"
        );

        if !report.promoted.is_empty() {
            self.sync_promoted(project, &mut report, token).await;
        }
        Ok(report)
    }

    /// Full synchronization of the canonical codebook.
    pub async fn sync_external_graph(&self, project: &str) -> ReconcileResult<GraphSyncReport> {
        let task = self.graph.submit(project, &[]).await?;
        let job = format!("graph sync {}", task);
        let poller = JobPoller::new(&self.poll);

        match poller.wait(&job, || self.graph.status(&task)).await {
            PollState::Completed(report) => {
                info!(project, synced = report.synced_codes, "graph synchronized");
                Ok(report)
            }
            PollState::Failed(msg) => Err(ReconcileError::RemoteFailure(msg)),
            PollState::TimedOut { attempts } => Err(ReconcileError::TimeoutExceeded { job, attempts }),
            PollState::Cancelled { .. } => Err(ReconcileError::RemoteFailure(format!("{} cancelled", job))),
        }
    }

    fn select(&self, project: &str, selection: &PromotionSelection) -> ReconcileResult<Vec<CandidateCode>> {
        match selection {
            PromotionSelection::AllValidated => Ok(self.store.list_candidates(
                project,
                &CandidateFilter::new()
                    .with_state(CandidateState::Validated)
                    .promoted(false)
                    .sorted(SortOrder::Oldest),
            )?),
            PromotionSelection::Ids(ids) => {
                if ids.is_empty() {
                    return Err(ReconcileError::EmptySelection("promote"));
                }
                let mut rows = Vec::with_capacity(ids.len());
                for id in ids {
                    let candidate = self
                        .store
                        .get_candidate(project, id)?
                        .ok_or_else(|| ReconcileError::CandidateNotFound(id.clone()))?;
                    if candidate.state == CandidateState::Validated && !candidate.is_promoted() {
                        rows.push(candidate);
                    }
                }
                Ok(rows)
            }
        }
    }

    fn has_evidence(&self, project: &str, candidate: &CandidateCode) -> ReconcileResult<bool> {
        match candidate.fragment_id.as_deref().map(str::trim) {
            Some(fragment) if !fragment.is_empty() => Ok(self.store.fragment_exists(project, fragment)?),
            _ => Ok(false),
        }
    }

    async fn sync_promoted(&self, project: &str, report: &mut PromotionReport, token: CancellationToken) {
        let task = match self.graph.submit(project, &report.promoted).await {
            Ok(task) => task,
            Err(e) => {
                warn!(project, error = %e, "graph sync not submitted; promotion kept");
                report.graph_sync = GraphSyncStatus::Failed;
                report.graph_sync_error = Some(e.to_string());
                return;
            }
        };

        let job = format!("graph sync {}", task);
        let poller = JobPoller::new(&self.poll).with_cancellation(token);
        match poller.wait(&job, || self.graph.status(&task)).await {
            PollState::Completed(sync) => {
                report.neo4j_merged = sync.merged;
                report.neo4j_missing_fragments = sync.missing_fragments;
                report.graph_sync = GraphSyncStatus::Completed;
            }
            PollState::Failed(msg) => {
                warn!(project, error = %msg, "graph sync failed; promotion kept");
                report.graph_sync = GraphSyncStatus::Failed;
                report.graph_sync_error = Some(msg);
            }
            PollState::TimedOut { attempts } => {
                report.graph_sync = GraphSyncStatus::TimedOut;
                report.graph_sync_error = Some(format!("no result after {} polls", attempts));
            }
            PollState::Cancelled { .. } => report.graph_sync = GraphSyncStatus::Cancelled,
        }
    }
}
