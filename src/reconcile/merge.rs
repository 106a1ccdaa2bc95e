//! MergeCoordinator: commits merge pairs under a single-writer guard
//!
//! Batches run sequentially with per-pair isolation. A failing pair is
//! recorded in the report and the batch moves on; only a fatal store error
//! (the store itself is gone) aborts the remaining pairs.
//!
//! A code is either a source or a target within one batch, never both, and
//! a target whose rows were all merged away resolves to the code that
//! absorbed them. Two codes can therefore never end up merged into each
//! other.

use super::error::{require_memo, ReconcileError, ReconcileResult};
use super::types::MergePair;
use crate::candidate::{normalize_code, same_code, CandidateId, CandidateState};
use crate::storage::{AuditAction, AuditEntry, CandidateFilter, CandidateStore, StorageError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How a pair's direction is decided before merging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Keep `source → target` exactly as given
    #[default]
    AsGiven,
    /// Merge the longer string into the shorter one
    PreferShorter,
}

impl MergeStrategy {
    pub fn orient(self, pair: MergePair) -> MergePair {
        match self {
            Self::AsGiven => pair,
            Self::PreferShorter => {
                let (source, target) = prefer_shorter(&pair.source, &pair.target);
                MergePair {
                    source: source.to_string(),
                    target: target.to_string(),
                    ..pair
                }
            }
        }
    }
}

impl std::str::FromStr for MergeStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "as_given" | "as-given" => Ok(Self::AsGiven),
            "prefer_shorter" | "prefer-shorter" => Ok(Self::PreferShorter),
            other => Err(format!("unknown merge strategy: {}", other)),
        }
    }
}

/// Returns `(source, target)`: the shorter string by character count is the
/// target. On a tie `first` stays the target.
pub fn prefer_shorter<'a>(first: &'a str, second: &'a str) -> (&'a str, &'a str) {
    if second.chars().count() < first.chars().count() {
        (first, second)
    } else {
        (second, first)
    }
}

/// Process-wide single-writer flag for merge batches.
///
/// Clones share the flag.
#[derive(Debug, Clone, Default)]
pub struct MergeLock {
    held: Arc<AtomicBool>,
}

impl MergeLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self) -> ReconcileResult<MergeGuard> {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ReconcileError::ConcurrentMergeRejected)?;
        Ok(MergeGuard {
            held: Arc::clone(&self.held),
        })
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

/// Releases the merge lock when dropped, on every exit path.
#[derive(Debug)]
pub struct MergeGuard {
    held: Arc<AtomicBool>,
}

impl Drop for MergeGuard {
    fn drop(&mut self) {
        self.held.store(false, Ordering::Release);
    }
}

/// Asked once per batch, after the lock is taken and before any write.
#[async_trait]
pub trait BatchConfirmation: Send + Sync {
    async fn confirm(&self, project: &str, pairs: &[MergePair]) -> bool;
}

/// Confirms every batch.
#[derive(Debug, Default, Clone)]
pub struct AutoConfirm;

#[async_trait]
impl BatchConfirmation for AutoConfirm {
    async fn confirm(&self, _project: &str, _pairs: &[MergePair]) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairStatus {
    Merged,
    /// No mergeable row carries the source code
    NoSourceRows,
    SelfMergeSkipped,
    /// Source is already a target in this batch, or target already a source
    ChainSkipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairDetail {
    #[serde(rename = "source_codigo")]
    pub source: String,
    #[serde(rename = "target_codigo")]
    pub target: String,
    pub status: PairStatus,
    pub merged: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PairDetail {
    fn new(pair: &MergePair, status: PairStatus, merged: usize) -> Self {
        Self {
            source: pair.source.clone(),
            target: pair.target.clone(),
            status,
            merged,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeBatchReport {
    /// Pairs dispatched to the store (self pairs excluded)
    pub pairs_processed: usize,
    pub total_merged: usize,
    pub self_merges_skipped: usize,
    #[serde(default)]
    pub chained_skipped: usize,
    pub failed: usize,
    pub details: Vec<PairDetail>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "report", rename_all = "snake_case")]
pub enum MergeBatchOutcome {
    Completed(MergeBatchReport),
    /// The confirmation was declined; nothing was written
    Cancelled,
    /// Another batch held the lock; nothing was written
    AlreadyRunning,
}

impl MergeBatchOutcome {
    pub fn report(&self) -> Option<&MergeBatchReport> {
        match self {
            Self::Completed(report) => Some(report),
            _ => None,
        }
    }
}

/// Result of merging explicit candidate ids into a target code.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeIdsResult {
    pub merged_count: usize,
    /// Selected rows whose code already equals the target
    pub self_merges_skipped: usize,
}

/// Turns merge pairs into committed merges.
#[derive(Clone)]
pub struct MergeCoordinator {
    store: Arc<dyn CandidateStore>,
    lock: MergeLock,
    confirmation: Arc<dyn BatchConfirmation>,
}

impl MergeCoordinator {
    pub fn new(store: Arc<dyn CandidateStore>) -> Self {
        Self {
            store,
            lock: MergeLock::new(),
            confirmation: Arc::new(AutoConfirm),
        }
    }

    pub fn with_confirmation(mut self, confirmation: Arc<dyn BatchConfirmation>) -> Self {
        self.confirmation = confirmation;
        self
    }

    pub fn lock(&self) -> &MergeLock {
        &self.lock
    }

    /// Run a merge batch.
    ///
    /// Validation errors are returned before the store is touched. A batch
    /// started while another holds the lock returns `AlreadyRunning`.
    pub async fn merge_batch(
        &self,
        project: &str,
        pairs: Vec<MergePair>,
        memo: &str,
        strategy: MergeStrategy,
    ) -> ReconcileResult<MergeBatchOutcome> {
        let memo = require_memo(memo, "merge candidates")?;
        if pairs.is_empty() {
            return Err(ReconcileError::EmptySelection("merge"));
        }

        let mut report = MergeBatchReport::default();
        let mut to_merge = Vec::with_capacity(pairs.len());
        let mut sources = HashSet::new();
        let mut targets = HashSet::new();
        for pair in pairs {
            let pair = strategy.orient(pair);
            if pair.is_self_merge() {
                debug!(project, pair = %pair, "self merge skipped");
                report.self_merges_skipped += 1;
                report
                    .details
                    .push(PairDetail::new(&pair, PairStatus::SelfMergeSkipped, 0));
                continue;
            }
            let (source, target) = (normalize_code(&pair.source), normalize_code(&pair.target));
            if targets.contains(&source) || sources.contains(&target) {
                debug!(project, pair = %pair, "chained merge skipped");
                report.chained_skipped += 1;
                report
                    .details
                    .push(PairDetail::new(&pair, PairStatus::ChainSkipped, 0));
                continue;
            }
            sources.insert(source);
            targets.insert(target);
            to_merge.push(pair);
        }

        let _guard = match self.lock.try_acquire() {
            Ok(guard) => guard,
            Err(ReconcileError::ConcurrentMergeRejected) => {
                warn!(project, pairs = to_merge.len(), "merge batch rejected: another batch is in flight");
                return Ok(MergeBatchOutcome::AlreadyRunning);
            }
            Err(e) => return Err(e),
        };

        if !to_merge.is_empty() && !self.confirmation.confirm(project, &to_merge).await {
            info!(project, pairs = to_merge.len(), "merge batch cancelled");
            return Ok(MergeBatchOutcome::Cancelled);
        }

        for pair in &to_merge {
            report.pairs_processed += 1;
            match self.merge_pair(project, pair, memo) {
                Ok(detail) => {
                    match detail.status {
                        PairStatus::Merged => report.total_merged += detail.merged,
                        PairStatus::SelfMergeSkipped => report.self_merges_skipped += 1,
                        _ => {}
                    }
                    report.details.push(detail);
                }
                Err(e) if e.is_fatal() => {
                    warn!(project, pair = %pair, error = %e, "merge batch aborted");
                    report.failed += 1;
                    report.details.push(PairDetail {
                        error: Some(e.to_string()),
                        ..PairDetail::new(pair, PairStatus::Failed, 0)
                    });
                    // Rows merged so far are committed; record them even though the batch stops.
                    if let Err(audit) = self.audit_batch(project, memo, strategy, &report, Some(&e)) {
                        warn!(project, error = %audit, "could not record aborted merge batch");
                    }
                    return Err(ReconcileError::MergeAborted {
                        reason: e.to_string(),
                        planned: to_merge.len(),
                        report: Box::new(report),
                    });
                }
                Err(e) => {
                    warn!(project, pair = %pair, error = %e, "merge pair failed");
                    report.failed += 1;
                    report.details.push(PairDetail {
                        error: Some(e.to_string()),
                        ..PairDetail::new(pair, PairStatus::Failed, 0)
                    });
                }
            }
        }

        self.audit_batch(project, memo, strategy, &report, None)?;

        info!(
            project,
            processed = report.pairs_processed,
            merged = report.total_merged,
            skipped = report.self_merges_skipped,
            chained = report.chained_skipped,
            failed = report.failed,
            "merge batch completed"
        );
        Ok(MergeBatchOutcome::Completed(report))
    }

    fn audit_batch(
        &self,
        project: &str,
        memo: &str,
        strategy: MergeStrategy,
        report: &MergeBatchReport,
        aborted: Option<&StorageError>,
    ) -> Result<(), StorageError> {
        let mut details = json!({
            "strategy": strategy,
            "pairs_processed": report.pairs_processed,
            "total_merged": report.total_merged,
            "self_merges_skipped": report.self_merges_skipped,
            "chained_skipped": report.chained_skipped,
            "failed": report.failed,
        });
        if let Some(e) = aborted {
            details["aborted"] = json!(e.to_string());
        }
        self.store.append_audit(
            &AuditEntry::new(project, AuditAction::Merge)
                .with_memo(Some(memo))
                .with_details(details),
        )
    }

    /// Merge one pair outside the batch lock.
    pub fn merge_single(&self, project: &str, pair: &MergePair, memo: &str) -> ReconcileResult<PairDetail> {
        let memo = require_memo(memo, "merge candidates")?;
        if pair.is_self_merge() {
            debug!(project, pair = %pair, "self merge skipped");
            return Ok(PairDetail::new(pair, PairStatus::SelfMergeSkipped, 0));
        }

        let detail = self.merge_pair(project, pair, memo)?;
        if detail.status == PairStatus::SelfMergeSkipped {
            return Ok(detail);
        }

        self.store.append_audit(
            &AuditEntry::new(project, AuditAction::Merge)
                .with_memo(Some(pair.memo.as_deref().unwrap_or(memo)))
                .with_details(json!({
                    "source_codigo": detail.source,
                    "target_codigo": detail.target,
                    "requested_target": pair.target,
                    "merged": detail.merged,
                })),
        )?;

        info!(project, pair = %pair, target = %detail.target, merged = detail.merged, "merged pair");
        Ok(detail)
    }

    /// Merge explicit candidate rows into `target`.
    ///
    /// Rows whose code already equals the target are counted as self merges
    /// and left alone.
    pub fn merge_candidates(
        &self,
        project: &str,
        ids: &[CandidateId],
        target: &str,
        memo: &str,
    ) -> ReconcileResult<MergeIdsResult> {
        let memo = require_memo(memo, "merge candidates")?;
        if ids.is_empty() {
            return Err(ReconcileError::EmptySelection("merge"));
        }
        let target = target.trim();
        if target.is_empty() {
            return Err(ReconcileError::NoTargetResolved(
                ids.iter().map(|id| id.as_str()).collect::<Vec<_>>().join(", "),
            ));
        }

        let mut result = MergeIdsResult::default();
        let mut selected = Vec::with_capacity(ids.len());
        for id in ids {
            match self.store.get_candidate(project, id)? {
                Some(row) if same_code(&row.code, target) => result.self_merges_skipped += 1,
                Some(_) => selected.push(id.clone()),
                None => return Err(ReconcileError::CandidateNotFound(id.clone())),
            }
        }

        if !selected.is_empty() {
            result.merged_count = self.store.merge_candidates(project, &selected, target, memo)?;
        }

        self.store.append_audit(
            &AuditEntry::new(project, AuditAction::Merge)
                .with_memo(Some(memo))
                .with_details(json!({
                    "ids": selected,
                    "target_codigo": target,
                    "merged": result.merged_count,
                })),
        )?;

        info!(project, target, merged = result.merged_count, "merged selected candidates");
        Ok(result)
    }

    /// Resolve the source rows of `pair` and merge them into the surviving
    /// target.
    fn merge_pair(&self, project: &str, pair: &MergePair, memo: &str) -> Result<PairDetail, StorageError> {
        let target = self.surviving_target(project, &pair.target)?;
        if !same_code(&target, &pair.target) {
            debug!(project, pair = %pair, survivor = %target, "target was merged away, following it");
        }
        let pair = &MergePair {
            target,
            ..pair.clone()
        };
        if pair.is_self_merge() {
            debug!(project, pair = %pair, "self merge skipped");
            return Ok(PairDetail::new(pair, PairStatus::SelfMergeSkipped, 0));
        }

        let filter = CandidateFilter::new()
            .with_code(pair.source.as_str())
            .with_states(&CandidateState::MERGEABLE)
            .promoted(false);
        let ids: Vec<CandidateId> = self
            .store
            .list_candidates(project, &filter)?
            .into_iter()
            .map(|c| c.id)
            .collect();
        if ids.is_empty() {
            return Ok(PairDetail::new(pair, PairStatus::NoSourceRows, 0));
        }

        let memo = pair.memo.as_deref().map(str::trim).filter(|m| !m.is_empty()).unwrap_or(memo);
        let merged = self.store.merge_candidates(project, &ids, &pair.target, memo)?;
        let status = if merged == 0 {
            PairStatus::NoSourceRows
        } else {
            PairStatus::Merged
        };
        Ok(PairDetail::new(pair, status, merged))
    }

    /// Follow `fusionado_a` from `target` while every row of the code has
    /// been merged away. Codes with a live row, or with no rows at all, are
    /// their own survivor.
    fn surviving_target(&self, project: &str, target: &str) -> Result<String, StorageError> {
        let mut current = target.to_string();
        let mut seen = HashSet::new();
        while seen.insert(normalize_code(&current)) {
            let rows = self
                .store
                .list_candidates(project, &CandidateFilter::new().with_code(current.as_str()))?;
            if rows.iter().any(|c| CandidateState::MERGEABLE.contains(&c.state)) {
                break;
            }
            match rows
                .into_iter()
                .filter(|c| c.state == CandidateState::Merged)
                .find_map(|c| c.merged_into)
            {
                Some(next) => current = next,
                None => break,
            }
        }
        Ok(current)
    }
}
