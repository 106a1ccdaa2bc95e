//! Common fixtures for the codebook integration scenarios
//!
//! Builds a `CodebookApi` over an in-memory store with a score table, and
//! provides a store wrapper that fails merges into chosen targets.

#![allow(dead_code)]

use chrono::{DateTime, Utc};
use codebook::config::{EngineConfig, PollConfig};
use codebook::reconcile::{MergePlan, PlanDecision};
use codebook::storage::{AuditEntry, BacklogStats, CandidateFilter};
use codebook::{
    same_code, CandidateCode, CandidateId, CandidateState, CandidateStore, CanonicalCode, CodeOrigin,
    CodebookApi, Fragment, GraphSync, MockGraphSync, NewCandidate, OpenStore, SqliteStore, StorageError,
    StorageResult, TableOracle,
};
use std::sync::Arc;

pub const PROJECT: &str = "entrevistas-2024";

/// Config with a poll cadence suitable for tests.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        poll: PollConfig {
            interval_ms: 1,
            max_attempts: 5,
        },
        ..EngineConfig::default()
    }
}

pub struct Fixture {
    pub api: CodebookApi,
    pub store: Arc<SqliteStore>,
}

impl Fixture {
    pub fn new(oracle: TableOracle) -> Self {
        Self::with_graph(oracle, Arc::new(MockGraphSync::completing(Default::default(), 0)))
    }

    pub fn with_graph(oracle: TableOracle, graph: Arc<dyn GraphSync>) -> Self {
        let store = Arc::new(SqliteStore::open_in_memory().expect("in-memory store"));
        let api = CodebookApi::new(store.clone(), Arc::new(oracle), graph, test_config());
        Self { api, store }
    }

    /// Insert pending candidates, one per code, in the given order.
    pub fn add(&self, codes: &[&str]) -> Vec<CandidateCode> {
        let base = Utc::now() - chrono::Duration::hours(1);
        let new: Vec<NewCandidate> = codes
            .iter()
            .enumerate()
            .map(|(i, code)| {
                NewCandidate::new(*code, CodeOrigin::Llm).created_at(base + chrono::Duration::seconds(i as i64))
            })
            .collect();
        self.api.add_candidates(PROJECT, &new).expect("add candidates").outcome
    }

    pub fn fragment(&self, id: &str) {
        self.api
            .add_fragment(&Fragment {
                id: id.to_string(),
                project: PROJECT.to_string(),
                document: "entrevista_07.docx".to_string(),
                text: "la gente se organiza cuando confía en sus vecinos".to_string(),
            })
            .expect("add fragment");
    }

    /// Insert and validate a candidate, with evidence when `fragment` is set.
    pub fn validated(&self, code: &str, fragment: Option<&str>) -> CandidateCode {
        let mut new = NewCandidate::new(code, CodeOrigin::Manual);
        if let Some(fragment) = fragment {
            self.fragment(fragment);
            new = new.with_fragment(fragment);
        }
        let row = self.api.add_candidates(PROJECT, &[new]).expect("add").outcome.remove(0);
        self.api.validate(PROJECT, &row.id).expect("validate");
        row
    }

    pub fn state_of(&self, id: &CandidateId) -> CandidateState {
        self.api.get_candidate(PROJECT, id).expect("candidate").state
    }

    pub fn count_in(&self, state: CandidateState) -> usize {
        self.api
            .list_candidates(PROJECT, &CandidateFilter::new().with_state(state))
            .expect("list")
            .len()
    }
}

/// SQLite store whose merges into `fail_target` error out.
///
/// `fatal` selects `StorageError::Unavailable` (the store is gone) over a
/// per-row error.
pub struct FlakyStore {
    inner: SqliteStore,
    fail_target: String,
    fatal: bool,
}

impl FlakyStore {
    pub fn new(fail_target: &str, fatal: bool) -> Self {
        Self {
            inner: SqliteStore::open_in_memory().expect("in-memory store"),
            fail_target: fail_target.to_string(),
            fatal,
        }
    }
}

impl CandidateStore for FlakyStore {
    fn insert_candidate(&self, project: &str, candidate: &NewCandidate) -> StorageResult<CandidateCode> {
        self.inner.insert_candidate(project, candidate)
    }

    fn get_candidate(&self, project: &str, id: &CandidateId) -> StorageResult<Option<CandidateCode>> {
        self.inner.get_candidate(project, id)
    }

    fn list_candidates(&self, project: &str, filter: &CandidateFilter) -> StorageResult<Vec<CandidateCode>> {
        self.inner.list_candidates(project, filter)
    }

    fn set_state(
        &self,
        project: &str,
        id: &CandidateId,
        from: CandidateState,
        to: CandidateState,
        memo: Option<&str>,
    ) -> StorageResult<()> {
        self.inner.set_state(project, id, from, to, memo)
    }

    fn merge_candidates(
        &self,
        project: &str,
        ids: &[CandidateId],
        target: &str,
        memo: &str,
    ) -> StorageResult<usize> {
        if same_code(target, &self.fail_target) {
            return Err(if self.fatal {
                StorageError::Unavailable("connection reset".to_string())
            } else {
                StorageError::CandidateNotFound(format!("merge target '{}'", target))
            });
        }
        self.inner.merge_candidates(project, ids, target, memo)
    }

    fn revert_validated(&self, project: &str, memo: &str) -> StorageResult<usize> {
        self.inner.revert_validated(project, memo)
    }

    fn insert_fragment(&self, fragment: &Fragment) -> StorageResult<()> {
        self.inner.insert_fragment(fragment)
    }

    fn fragment_exists(&self, project: &str, fragment_id: &str) -> StorageResult<bool> {
        self.inner.fragment_exists(project, fragment_id)
    }

    fn promote_candidate(&self, project: &str, id: &CandidateId, at: DateTime<Utc>) -> StorageResult<bool> {
        self.inner.promote_candidate(project, id, at)
    }

    fn list_codebook(&self, project: &str) -> StorageResult<Vec<CanonicalCode>> {
        self.inner.list_codebook(project)
    }

    fn append_audit(&self, entry: &AuditEntry) -> StorageResult<()> {
        self.inner.append_audit(entry)
    }

    fn list_audit(&self, project: &str, limit: Option<usize>) -> StorageResult<Vec<AuditEntry>> {
        self.inner.list_audit(project, limit)
    }

    fn backlog_stats(&self, project: &str) -> StorageResult<BacklogStats> {
        self.inner.backlog_stats(project)
    }

    fn save_plan(&self, plan: &MergePlan) -> StorageResult<()> {
        self.inner.save_plan(plan)
    }

    fn load_plan(&self, run_id: &str) -> StorageResult<Option<MergePlan>> {
        self.inner.load_plan(run_id)
    }

    fn record_plan_decision(&self, decision: &PlanDecision) -> StorageResult<()> {
        self.inner.record_plan_decision(decision)
    }

    fn plan_decisions(&self, run_id: &str) -> StorageResult<Vec<PlanDecision>> {
        self.inner.plan_decisions(run_id)
    }
}
