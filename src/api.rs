//! Transport-independent API layer.
//!
//! `CodebookApi` is the single entry point for all consumer-facing
//! operations. The CLI (and any other front end) calls `CodebookApi`
//! methods; it never reaches into the reconcile components directly.
//!
//! Every mutation re-reads the candidate list and the backlog health before
//! returning, so callers never render state older than the mutation.

use std::sync::Arc;

use serde::Serialize;

use crate::candidate::{CandidateCode, CandidateId, CanonicalCode, Fragment, NewCandidate};
use crate::config::EngineConfig;
use crate::graph_sync::{GraphSync, GraphSyncReport};
use crate::oracle::SimilarityOracle;
use crate::reconcile::{
    AiMergePlanner, ApplyOutcome, AutoConfirm, BacklogHealthMonitor, BacklogHealthSnapshot, BatchCheckResult,
    BatchConfirmation, CancellationToken, DuplicateReconciler, DuplicateReport, FlaggedMergeReport,
    LifecycleStateMachine, MergeBatchOutcome, MergeCoordinator, MergeIdsResult, MergePair, MergePlan,
    MergeStrategy, PlanView, PromotionGate, PromotionReport, PromotionSelection, ReconcileError,
    ReconcileResult, StateChange,
};
use crate::storage::{AuditEntry, CandidateFilter, CandidateStore, SortOrder};

/// The outcome of a mutation plus the state re-read after it.
#[derive(Debug, Clone, Serialize)]
pub struct Refreshed<T> {
    pub outcome: T,
    /// First page of the project's candidates, newest first
    pub candidates: Vec<CandidateCode>,
    pub health: BacklogHealthSnapshot,
}

/// Single entry point for all consumer-facing operations.
#[derive(Clone)]
pub struct CodebookApi {
    store: Arc<dyn CandidateStore>,
    config: EngineConfig,
    lifecycle: LifecycleStateMachine,
    coordinator: MergeCoordinator,
    duplicates: DuplicateReconciler,
    planner: Arc<AiMergePlanner>,
    promotion: Arc<PromotionGate>,
    health: BacklogHealthMonitor,
}

impl CodebookApi {
    /// Create a new API instance that confirms every merge batch.
    pub fn new(
        store: Arc<dyn CandidateStore>,
        oracle: Arc<dyn SimilarityOracle>,
        graph: Arc<dyn GraphSync>,
        config: EngineConfig,
    ) -> Self {
        Self::with_confirmation(store, oracle, graph, config, Arc::new(AutoConfirm))
    }

    /// Create a new API instance that asks `confirmation` before each batch.
    pub fn with_confirmation(
        store: Arc<dyn CandidateStore>,
        oracle: Arc<dyn SimilarityOracle>,
        graph: Arc<dyn GraphSync>,
        config: EngineConfig,
        confirmation: Arc<dyn BatchConfirmation>,
    ) -> Self {
        let coordinator = MergeCoordinator::new(store.clone()).with_confirmation(confirmation);
        Self {
            lifecycle: LifecycleStateMachine::new(store.clone()),
            duplicates: DuplicateReconciler::new(store.clone(), oracle.clone(), coordinator.clone()),
            planner: Arc::new(AiMergePlanner::new(store.clone(), oracle, coordinator.clone())),
            promotion: Arc::new(PromotionGate::new(store.clone(), graph, config.poll.clone())),
            health: BacklogHealthMonitor::new(store.clone(), config.health.clone()),
            coordinator,
            store,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // --- Candidates ---

    /// Insert new candidates in `pendiente`.
    pub fn add_candidates(
        &self,
        project: &str,
        candidates: &[NewCandidate],
    ) -> ReconcileResult<Refreshed<Vec<CandidateCode>>> {
        if candidates.is_empty() {
            return Err(ReconcileError::EmptySelection("add"));
        }
        let mut inserted = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            inserted.push(self.store.insert_candidate(project, candidate)?);
        }
        tracing::info!(project, count = inserted.len(), "candidates added");
        self.refreshed(project, inserted)
    }

    pub fn add_fragment(&self, fragment: &Fragment) -> ReconcileResult<()> {
        Ok(self.store.insert_fragment(fragment)?)
    }

    pub fn list_candidates(&self, project: &str, filter: &CandidateFilter) -> ReconcileResult<Vec<CandidateCode>> {
        Ok(self.store.list_candidates(project, filter)?)
    }

    pub fn get_candidate(&self, project: &str, id: &CandidateId) -> ReconcileResult<CandidateCode> {
        self.store
            .get_candidate(project, id)?
            .ok_or_else(|| ReconcileError::CandidateNotFound(id.clone()))
    }

    // --- Lifecycle ---

    pub fn validate(&self, project: &str, id: &CandidateId) -> ReconcileResult<Refreshed<StateChange>> {
        let change = self.lifecycle.validate(project, id)?;
        self.refreshed(project, change)
    }

    pub fn reject(
        &self,
        project: &str,
        id: &CandidateId,
        memo: Option<&str>,
    ) -> ReconcileResult<Refreshed<StateChange>> {
        let change = self.lifecycle.reject(project, id, memo)?;
        self.refreshed(project, change)
    }

    pub fn mark_hypothesis(
        &self,
        project: &str,
        id: &CandidateId,
        memo: Option<&str>,
    ) -> ReconcileResult<Refreshed<StateChange>> {
        let change = self.lifecycle.mark_hypothesis(project, id, memo)?;
        self.refreshed(project, change)
    }

    pub fn revert_validated(&self, project: &str, memo: &str) -> ReconcileResult<Refreshed<usize>> {
        let reverted = self.lifecycle.revert_validated_to_pending(project, memo)?;
        self.refreshed(project, reverted)
    }

    // --- Merges ---

    pub fn merge_candidates(
        &self,
        project: &str,
        ids: &[CandidateId],
        target: &str,
        memo: &str,
    ) -> ReconcileResult<Refreshed<MergeIdsResult>> {
        let result = self.coordinator.merge_candidates(project, ids, target, memo)?;
        self.refreshed(project, result)
    }

    pub async fn auto_merge_batch(
        &self,
        project: &str,
        pairs: Vec<MergePair>,
        memo: &str,
        strategy: MergeStrategy,
    ) -> ReconcileResult<Refreshed<MergeBatchOutcome>> {
        let outcome = self.coordinator.merge_batch(project, pairs, memo, strategy).await?;
        self.refreshed(project, outcome)
    }

    // --- Duplicate detection ---

    /// Post-hoc scan; `threshold` defaults to the configured value.
    pub async fn detect_duplicates(&self, project: &str, threshold: Option<f32>) -> ReconcileResult<DuplicateReport> {
        let threshold = threshold.unwrap_or(self.config.thresholds.post_hoc);
        self.duplicates.detect_duplicates(project, threshold).await
    }

    /// Pre-hoc check; `threshold` defaults to the configured value.
    pub async fn check_batch_codes(
        &self,
        project: &str,
        codes: &[String],
        threshold: Option<f32>,
    ) -> ReconcileResult<Vec<BatchCheckResult>> {
        let threshold = threshold.unwrap_or(self.config.thresholds.pre_hoc);
        self.duplicates.check_batch(project, codes, threshold).await
    }

    pub async fn merge_flagged(
        &self,
        project: &str,
        results: &[BatchCheckResult],
        target: Option<&str>,
        memo: &str,
    ) -> ReconcileResult<Refreshed<FlaggedMergeReport>> {
        let report = self.duplicates.merge_flagged(project, results, target, memo).await?;
        self.refreshed(project, report)
    }

    // --- AI merge plans ---

    pub async fn plan_merges(
        &self,
        project: &str,
        codes: Option<&[String]>,
        threshold: Option<f32>,
        limit: Option<usize>,
    ) -> ReconcileResult<MergePlan> {
        let threshold = threshold.unwrap_or(self.config.thresholds.plan);
        let limit = limit.unwrap_or(self.config.thresholds.plan_limit);
        self.planner.plan_merges(project, codes, threshold, limit).await
    }

    pub fn current_plan(&self, project: &str) -> ReconcileResult<Option<PlanView>> {
        self.planner.current_plan(project)
    }

    pub fn get_plan(&self, run_id: &str) -> ReconcileResult<PlanView> {
        self.planner.get_plan(run_id)
    }

    pub fn apply_plan_pair(
        &self,
        project: &str,
        run_id: &str,
        source: &str,
        target: &str,
        memo: Option<&str>,
    ) -> ReconcileResult<Refreshed<ApplyOutcome>> {
        let outcome = self.planner.apply_plan_pair(project, run_id, source, target, memo)?;
        self.refreshed(project, outcome)
    }

    /// Reject a plan pair; returns the plan as it stands afterwards.
    pub fn reject_plan_pair(
        &self,
        project: &str,
        run_id: &str,
        source: &str,
        target: &str,
        memo: Option<&str>,
    ) -> ReconcileResult<PlanView> {
        self.planner.reject_plan_pair(project, run_id, source, target, memo)?;
        self.planner.get_plan(run_id)
    }

    // --- Promotion ---

    pub async fn promote(
        &self,
        project: &str,
        selection: PromotionSelection,
    ) -> ReconcileResult<Refreshed<PromotionReport>> {
        let report = self.promotion.promote(project, selection).await?;
        self.refreshed(project, report)
    }

    pub async fn promote_with_cancellation(
        &self,
        project: &str,
        selection: PromotionSelection,
        token: CancellationToken,
    ) -> ReconcileResult<Refreshed<PromotionReport>> {
        let report = self
            .promotion
            .promote_with_cancellation(project, selection, token)
            .await?;
        self.refreshed(project, report)
    }

    pub async fn sync_external_graph(&self, project: &str) -> ReconcileResult<GraphSyncReport> {
        self.promotion.sync_external_graph(project).await
    }

    pub fn codebook(&self, project: &str) -> ReconcileResult<Vec<CanonicalCode>> {
        Ok(self.store.list_codebook(project)?)
    }

    // --- Reads ---

    pub fn backlog_health(&self, project: &str) -> ReconcileResult<BacklogHealthSnapshot> {
        self.health.snapshot(project)
    }

    pub fn audit_log(&self, project: &str, limit: Option<usize>) -> ReconcileResult<Vec<AuditEntry>> {
        Ok(self.store.list_audit(project, limit)?)
    }

    fn refreshed<T>(&self, project: &str, outcome: T) -> ReconcileResult<Refreshed<T>> {
        let candidates = self.store.list_candidates(
            project,
            &CandidateFilter::new()
                .sorted(SortOrder::Newest)
                .with_limit(self.config.page_size),
        )?;
        let health = self.health.snapshot(project)?;
        Ok(Refreshed {
            outcome,
            candidates,
            health,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::{CandidateState, CodeOrigin};
    use crate::graph_sync::DisabledGraphSync;
    use crate::oracle::TableOracle;
    use crate::reconcile::PairStatus;
    use crate::storage::{AuditAction, OpenStore, SqliteStore};

    const P: &str = "p";

    fn setup(oracle: TableOracle) -> CodebookApi {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        CodebookApi::new(store, Arc::new(oracle), Arc::new(DisabledGraphSync), EngineConfig::default())
    }

    fn add(api: &CodebookApi, codes: &[&str]) -> Vec<CandidateCode> {
        let new: Vec<NewCandidate> = codes.iter().map(|c| NewCandidate::new(*c, CodeOrigin::Llm)).collect();
        api.add_candidates(P, &new).unwrap().outcome
    }

    #[test]
    fn mutations_return_refreshed_state() {
        let api = setup(TableOracle::new());
        let rows = add(&api, &["Confianza", "Apoyo"]);

        let refreshed = api.validate(P, &rows[0].id).unwrap();
        assert!(refreshed.outcome.changed);
        assert_eq!(refreshed.candidates.len(), 2);
        let seen = refreshed.candidates.iter().find(|c| c.id == rows[0].id).unwrap();
        assert_eq!(seen.state, CandidateState::Validated);
        assert_eq!(refreshed.health.pending_count, 1);
    }

    #[test]
    fn add_requires_candidates() {
        let api = setup(TableOracle::new());
        assert!(matches!(
            api.add_candidates(P, &[]).unwrap_err(),
            ReconcileError::EmptySelection(_)
        ));
    }

    #[test]
    fn refreshed_list_is_capped_by_page_size() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let config = EngineConfig {
            page_size: 2,
            ..EngineConfig::default()
        };
        let api = CodebookApi::new(store, Arc::new(TableOracle::new()), Arc::new(DisabledGraphSync), config);

        let rows = add(&api, &["A", "B", "C"]);
        assert_eq!(rows.len(), 3);
        assert_eq!(api.reject(P, &rows[0].id, None).unwrap().candidates.len(), 2);
    }

    #[tokio::test]
    async fn thresholds_default_from_config() {
        let api = setup(TableOracle::new().with_score("Apoyo", "Apoyo Mutuo", 0.82));
        add(&api, &["Apoyo", "Apoyo Mutuo"]);

        // post-hoc default 0.80 admits the pair, plan default 0.92 does not
        assert_eq!(api.detect_duplicates(P, None).await.unwrap().pairs.len(), 1);
        assert!(api.plan_merges(P, None, None, None).await.unwrap().is_empty());
        let checks = api
            .check_batch_codes(P, &["Apoyo".to_string(), "Apoyo Mutuo".to_string()], None)
            .await
            .unwrap();
        assert!(checks.iter().all(|c| !c.duplicate_in_batch));
    }

    #[tokio::test]
    async fn auto_merge_batch_and_audit() {
        let api = setup(TableOracle::new());
        add(&api, &["Confianza Social"]);

        let refreshed = api
            .auto_merge_batch(
                P,
                vec![MergePair::new("Confianza Social", "Confianza")],
                "consolidación",
                MergeStrategy::PreferShorter,
            )
            .await
            .unwrap();

        let report = refreshed.outcome.report().unwrap();
        assert_eq!(report.details[0].status, PairStatus::Merged);
        assert_eq!(refreshed.candidates[0].state, CandidateState::Merged);
        assert_eq!(api.audit_log(P, Some(1)).unwrap()[0].action, AuditAction::Merge);
    }

    #[tokio::test]
    async fn promote_with_disabled_graph_completes() {
        let api = setup(TableOracle::new());
        api.add_fragment(&Fragment {
            id: "f1".into(),
            project: P.into(),
            document: "entrevista.docx".into(),
            text: "cita".into(),
        })
        .unwrap();
        let rows = api
            .add_candidates(P, &[NewCandidate::new("Confianza", CodeOrigin::Manual).with_fragment("f1")])
            .unwrap()
            .outcome;
        api.validate(P, &rows[0].id).unwrap();

        let refreshed = api.promote(P, PromotionSelection::AllValidated).await.unwrap();
        assert_eq!(refreshed.outcome.promoted_count, 1);
        assert!(refreshed.candidates[0].is_promoted());
        assert_eq!(api.codebook(P).unwrap()[0].code, "Confianza");
        assert_eq!(api.sync_external_graph(P).await.unwrap(), GraphSyncReport::default());
    }
}
