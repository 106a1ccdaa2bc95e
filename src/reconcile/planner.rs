//! AiMergePlanner: inert merge proposals applied one pair at a time
//!
//! A plan is generated from oracle scores, logged, and never executed as a
//! whole. Each pair is applied or rejected individually; both decisions are
//! appended to the plan log and the pending list is the set difference.

use super::error::{check_threshold, ReconcileError, ReconcileResult};
use super::merge::{prefer_shorter, MergeCoordinator};
use super::types::{MergePair, MergePlan, PlanDecision, PlanDecisionKind, PlanPair};
use crate::candidate::{normalize_code, same_code, CandidateState};
use crate::oracle::SimilarityOracle;
use crate::storage::{AuditAction, AuditEntry, CandidateFilter, CandidateStore, SortOrder};
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// A stored plan together with its decision log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanView {
    pub plan: MergePlan,
    pub pending: Vec<PlanPair>,
    pub decisions: Vec<PlanDecision>,
}

impl PlanView {
    pub fn is_consumed(&self) -> bool {
        self.pending.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyOutcome {
    pub success: bool,
    pub merged: usize,
}

pub struct AiMergePlanner {
    store: Arc<dyn CandidateStore>,
    oracle: Arc<dyn SimilarityOracle>,
    coordinator: MergeCoordinator,
    /// project -> run_id of the plan currently under review
    sessions: DashMap<String, String>,
}

impl AiMergePlanner {
    pub fn new(
        store: Arc<dyn CandidateStore>,
        oracle: Arc<dyn SimilarityOracle>,
        coordinator: MergeCoordinator,
    ) -> Self {
        Self {
            store,
            oracle,
            coordinator,
            sessions: DashMap::new(),
        }
    }

    /// Propose merges among `codes` (the project backlog when `None`).
    ///
    /// No candidate changes state. An empty plan means no pair reached the
    /// threshold.
    pub async fn plan_merges(
        &self,
        project: &str,
        codes: Option<&[String]>,
        threshold: f32,
        limit: usize,
    ) -> ReconcileResult<MergePlan> {
        let threshold = check_threshold(threshold, 0.0, 1.0)?;
        if limit == 0 {
            return Err(ReconcileError::InvalidLimit(limit));
        }
        let pool = match codes {
            Some(codes) => distinct_codes(codes.iter().map(String::as_str)),
            None => {
                let rows = self.store.list_candidates(
                    project,
                    &CandidateFilter::new()
                        .with_states(&CandidateState::BACKLOG)
                        .sorted(SortOrder::Oldest),
                )?;
                distinct_codes(rows.iter().map(|r| r.code.as_str()))
            }
        };

        let mut pairs: Vec<PlanPair> = self
            .oracle
            .pairs_above(&pool, threshold)
            .await?
            .into_iter()
            .filter(|p| !same_code(&p.code1, &p.code2))
            .map(|p| {
                let (source, target) = prefer_shorter(&p.code1, &p.code2);
                PlanPair {
                    reason: format!(
                        "similarity {:.2} >= {:.2}; '{}' is the shorter label",
                        p.similarity, threshold, target
                    ),
                    source: source.to_string(),
                    target: target.to_string(),
                    similarity: p.similarity,
                }
            })
            .collect();
        pairs.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        pairs.truncate(limit);

        let plan = MergePlan {
            run_id: Uuid::new_v4().to_string(),
            project: project.to_string(),
            threshold,
            created_at: Utc::now(),
            pairs,
        };

        self.store.save_plan(&plan)?;
        self.store.append_audit(
            &AuditEntry::new(project, AuditAction::PlanCreated).with_details(json!({
                "run_id": plan.run_id,
                "threshold": threshold,
                "pool": pool.len(),
                "pairs": plan.pairs.len(),
            })),
        )?;

        if plan.is_empty() {
            self.sessions.remove(project);
            info!(project, threshold, "no high-confidence pairs; empty merge plan");
        } else {
            self.sessions.insert(project.to_string(), plan.run_id.clone());
            info!(project, run_id = %plan.run_id, pairs = plan.pairs.len(), "merge plan created");
        }
        Ok(plan)
    }

    /// The plan this session is reviewing for `project`, if any.
    pub fn current_plan(&self, project: &str) -> ReconcileResult<Option<PlanView>> {
        let run_id = match self.sessions.get(project) {
            Some(entry) => entry.value().clone(),
            None => return Ok(None),
        };
        self.get_plan(&run_id).map(Some)
    }

    pub fn get_plan(&self, run_id: &str) -> ReconcileResult<PlanView> {
        let plan = self
            .store
            .load_plan(run_id)?
            .ok_or_else(|| ReconcileError::PlanNotFound(run_id.to_string()))?;
        let decisions = self.store.plan_decisions(run_id)?;
        let pending = plan.pending(&decisions).into_iter().cloned().collect();
        Ok(PlanView {
            plan,
            pending,
            decisions,
        })
    }

    /// Apply one pending pair through the single-pair merge path.
    pub fn apply_plan_pair(
        &self,
        project: &str,
        run_id: &str,
        source: &str,
        target: &str,
        memo: Option<&str>,
    ) -> ReconcileResult<ApplyOutcome> {
        let (view, pair) = self.pending_pair(project, run_id, source, target)?;

        let mut auto_memo = format!(
            "AI merge plan {}: '{}' -> '{}' (similarity {:.3})",
            run_id, pair.source, pair.target, pair.similarity
        );
        if let Some(extra) = memo.map(str::trim).filter(|m| !m.is_empty()) {
            auto_memo.push_str("; ");
            auto_memo.push_str(extra);
        }

        let merge = MergePair::new(pair.source.clone(), pair.target.clone()).with_similarity(pair.similarity);
        let detail = self.coordinator.merge_single(project, &merge, &auto_memo)?;

        self.store.record_plan_decision(&PlanDecision {
            run_id: run_id.to_string(),
            source: pair.source.clone(),
            target: pair.target.clone(),
            kind: PlanDecisionKind::Applied,
            memo: Some(auto_memo.clone()),
            merged: detail.merged,
            decided_at: Utc::now(),
        })?;
        self.store.append_audit(
            &AuditEntry::new(project, AuditAction::PlanApplied)
                .with_memo(Some(&auto_memo))
                .with_details(json!({
                    "run_id": run_id,
                    "source_codigo": pair.source,
                    "target_codigo": pair.target,
                    "merged_into": detail.target,
                    "merged": detail.merged,
                })),
        )?;

        self.forget_if_consumed(project, &view);
        info!(project, run_id, source = %pair.source, target = %detail.target, merged = detail.merged, "plan pair applied");
        Ok(ApplyOutcome {
            success: true,
            merged: detail.merged,
        })
    }

    /// Drop one pending pair from the plan without touching candidates.
    pub fn reject_plan_pair(
        &self,
        project: &str,
        run_id: &str,
        source: &str,
        target: &str,
        memo: Option<&str>,
    ) -> ReconcileResult<()> {
        let (view, pair) = self.pending_pair(project, run_id, source, target)?;
        let memo = memo.map(str::trim).filter(|m| !m.is_empty());

        self.store.record_plan_decision(&PlanDecision {
            run_id: run_id.to_string(),
            source: pair.source.clone(),
            target: pair.target.clone(),
            kind: PlanDecisionKind::Rejected,
            memo: memo.map(str::to_string),
            merged: 0,
            decided_at: Utc::now(),
        })?;
        self.store.append_audit(
            &AuditEntry::new(project, AuditAction::PlanRejected)
                .with_memo(memo)
                .with_details(json!({
                    "run_id": run_id,
                    "source_codigo": pair.source,
                    "target_codigo": pair.target,
                })),
        )?;

        self.forget_if_consumed(project, &view);
        info!(project, run_id, source = %pair.source, target = %pair.target, "plan pair rejected");
        Ok(())
    }

    fn pending_pair(
        &self,
        project: &str,
        run_id: &str,
        source: &str,
        target: &str,
    ) -> ReconcileResult<(PlanView, PlanPair)> {
        let view = self.get_plan(run_id)?;
        if view.plan.project != project {
            return Err(ReconcileError::PlanNotFound(run_id.to_string()));
        }
        let pair = view
            .pending
            .iter()
            .find(|p| p.matches(source, target))
            .cloned()
            .ok_or_else(|| ReconcileError::PlanPairNotPending {
                run_id: run_id.to_string(),
                from_code: source.to_string(),
                to_code: target.to_string(),
            })?;
        Ok((view, pair))
    }

    /// `view` is the state before the decision just recorded.
    fn forget_if_consumed(&self, project: &str, view: &PlanView) {
        if view.pending.len() <= 1 {
            self.sessions
                .remove_if(project, |_, run_id| run_id == &view.plan.run_id);
        }
    }
}

/// Trimmed, non-blank codes with one spelling per normalized code.
fn distinct_codes<'a>(codes: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    codes
        .map(str::trim)
        .filter(|c| !c.is_empty() && seen.insert(normalize_code(c)))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::{CodeOrigin, NewCandidate};
    use crate::oracle::TableOracle;
    use crate::storage::{OpenStore, SqliteStore};

    const P: &str = "p";

    fn planner(oracle: TableOracle, codes: &[&str]) -> (AiMergePlanner, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        for code in codes {
            store
                .insert_candidate(P, &NewCandidate::new(*code, CodeOrigin::Llm))
                .unwrap();
        }
        let coordinator = MergeCoordinator::new(store.clone());
        (
            AiMergePlanner::new(store.clone(), Arc::new(oracle), coordinator),
            store,
        )
    }

    fn oracle() -> TableOracle {
        TableOracle::new()
            .with_score("Participación Comunitaria", "Participación", 0.95)
            .with_score("Confianza Social", "Confianza", 0.93)
            .with_score("Apoyo", "Apoyo Mutuo", 0.88)
    }

    const CODES: [&str; 6] = [
        "Participación Comunitaria",
        "Participación",
        "Confianza Social",
        "Confianza",
        "Apoyo",
        "Apoyo Mutuo",
    ];

    #[tokio::test]
    async fn plan_orients_sorts_and_limits_without_side_effects() {
        let (planner, store) = planner(oracle(), &CODES);

        let plan = planner.plan_merges(P, None, 0.90, 50).await.unwrap();

        assert_eq!(plan.pairs.len(), 2);
        assert_eq!(plan.pairs[0].source, "Participación Comunitaria");
        assert_eq!(plan.pairs[0].target, "Participación");
        assert_eq!(plan.pairs[1].target, "Confianza");
        assert!(plan.pairs.iter().all(|p| !p.reason.is_empty()));
        assert!(store
            .list_candidates(P, &CandidateFilter::new())
            .unwrap()
            .iter()
            .all(|c| c.state == CandidateState::Pending));

        let limited = planner.plan_merges(P, None, 0.80, 1).await.unwrap();
        assert_eq!(limited.pairs.len(), 1);
        assert_eq!(limited.pairs[0].similarity, 0.95);
    }

    // === Scenario: nothing reaches a high threshold ===

    #[tokio::test]
    async fn high_threshold_yields_empty_plan() {
        let (planner, _) = planner(oracle(), &["Apoyo", "Apoyo Mutuo"]);

        let plan = planner.plan_merges(P, None, 0.92, 50).await.unwrap();

        assert!(plan.is_empty());
        assert!(planner.current_plan(P).unwrap().is_none());
        // still logged for audit
        assert!(planner.get_plan(&plan.run_id).unwrap().is_consumed());
    }

    #[tokio::test]
    async fn explicit_code_pool_is_deduplicated() {
        let (planner, _) = planner(oracle(), &[]);
        let codes: Vec<String> = ["Apoyo", " apoyo", "Apoyo Mutuo", ""].iter().map(|s| s.to_string()).collect();

        let plan = planner.plan_merges(P, Some(&codes), 0.85, 10).await.unwrap();

        assert_eq!(plan.pairs.len(), 1);
        assert_eq!(plan.pairs[0].source, "Apoyo Mutuo");
    }

    // === Scenario: applying a pair removes exactly that pair ===

    #[tokio::test]
    async fn apply_removes_pair_and_merges() {
        let (planner, store) = planner(oracle(), &CODES);
        let plan = planner.plan_merges(P, None, 0.90, 50).await.unwrap();
        let run_id = plan.run_id.clone();

        let outcome = planner
            .apply_plan_pair(P, &run_id, "Confianza Social", "Confianza", None)
            .unwrap();
        assert_eq!(outcome, ApplyOutcome { success: true, merged: 1 });

        let view = planner.get_plan(&run_id).unwrap();
        assert_eq!(view.pending.len(), 1);
        assert_eq!(view.pending[0].source, "Participación Comunitaria");
        assert_eq!(view.plan.pairs.len(), 2);

        let merged = store
            .list_candidates(P, &CandidateFilter::new().with_state(CandidateState::Merged))
            .unwrap();
        let memo = merged[0].memo.as_deref().unwrap();
        assert!(memo.contains(&run_id));
        assert!(memo.contains("0.930"));

        let err = planner
            .apply_plan_pair(P, &run_id, "confianza social", "CONFIANZA", None)
            .unwrap_err();
        assert!(matches!(err, ReconcileError::PlanPairNotPending { .. }));
        assert_eq!(planner.get_plan(&run_id).unwrap().pending.len(), 1);
    }

    #[tokio::test]
    async fn rejecting_last_pair_consumes_the_session_plan() {
        let (planner, store) = planner(oracle(), &CODES);
        let plan = planner.plan_merges(P, None, 0.94, 50).await.unwrap();
        assert_eq!(planner.current_plan(P).unwrap().unwrap().plan.run_id, plan.run_id);

        planner
            .reject_plan_pair(P, &plan.run_id, "Participación Comunitaria", "Participación", Some("distintos"))
            .unwrap();

        assert!(planner.current_plan(P).unwrap().is_none());
        let view = planner.get_plan(&plan.run_id).unwrap();
        assert!(view.is_consumed());
        assert_eq!(view.decisions[0].kind, PlanDecisionKind::Rejected);
        assert!(store
            .list_candidates(P, &CandidateFilter::new())
            .unwrap()
            .iter()
            .all(|c| c.state == CandidateState::Pending));
    }

    #[tokio::test]
    async fn zero_limit_is_rejected() {
        let (planner, _) = planner(oracle(), &CODES);
        let err = planner.plan_merges(P, None, 0.90, 0).await.unwrap_err();
        assert!(matches!(err, ReconcileError::InvalidLimit(0)));
        assert!(err.is_validation());
        assert!(planner.current_plan(P).unwrap().is_none());
    }

    // === Scenario: overlapping plan pairs applied in either order ===

    #[tokio::test]
    async fn chained_plan_pairs_end_on_one_survivor() {
        let chain = || {
            TableOracle::new()
                .with_score("Apoyo Mutuo Vecinal", "Apoyo Mutuo", 0.95)
                .with_score("Apoyo Mutuo", "Apoyo", 0.93)
        };
        let codes = ["Apoyo Mutuo Vecinal", "Apoyo Mutuo", "Apoyo"];
        let outer = ("Apoyo Mutuo Vecinal", "Apoyo Mutuo");
        let inner = ("Apoyo Mutuo", "Apoyo");

        for order in [[outer, inner], [inner, outer]] {
            let (planner, store) = planner(chain(), &codes);
            let plan = planner.plan_merges(P, None, 0.90, 50).await.unwrap();
            assert_eq!(plan.pairs.len(), 2);

            for (source, target) in order {
                let outcome = planner.apply_plan_pair(P, &plan.run_id, source, target, None).unwrap();
                assert_eq!(outcome.merged, 1);
            }

            let rows = store.list_candidates(P, &CandidateFilter::new()).unwrap();
            let live: Vec<_> = rows.iter().filter(|c| c.state == CandidateState::Pending).collect();
            assert_eq!(live.len(), 1);
            assert_eq!(live[0].code, "Apoyo");
            for row in rows.iter().filter(|c| c.state == CandidateState::Merged) {
                assert_eq!(row.merged_into.as_deref(), Some("Apoyo"), "{}", row.code);
            }
        }
    }

    #[tokio::test]
    async fn plan_is_scoped_to_its_project() {
        let (planner, _) = planner(oracle(), &CODES);
        let plan = planner.plan_merges(P, None, 0.90, 50).await.unwrap();

        let err = planner
            .apply_plan_pair("other", &plan.run_id, "Confianza Social", "Confianza", None)
            .unwrap_err();
        assert!(matches!(err, ReconcileError::PlanNotFound(_)));

        let err = planner.get_plan("missing").unwrap_err();
        assert!(matches!(err, ReconcileError::PlanNotFound(_)));
    }
}
