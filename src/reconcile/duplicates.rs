//! DuplicateReconciler: post-hoc backlog scans and pre-hoc batch checks

use super::error::{check_threshold, require_memo, ReconcileError, ReconcileResult};
use super::merge::{MergeBatchOutcome, MergeCoordinator, MergeStrategy};
use super::types::MergePair;
use crate::candidate::{normalize_code, same_code, CandidateState};
use crate::config::POST_HOC_RANGE;
use crate::oracle::{ScoredPair, SimilarityOracle, Suggestion};
use crate::storage::{CandidateFilter, CandidateStore, SortOrder};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

/// Rows of the backlog that share one normalized code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExactDuplicateGroup {
    pub normalized: String,
    /// Distinct spellings as stored, first seen first
    pub variants: Vec<String>,
    pub rows: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateReport {
    pub threshold: f32,
    /// Mergeable pairs, best first
    pub pairs: Vec<ScoredPair>,
    pub exact_duplicates: Vec<ExactDuplicateGroup>,
}

/// Pre-hoc verdict for one logical code of a proposed batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchCheckResult {
    pub codigo: String,
    pub has_similar: bool,
    pub duplicate_in_batch: bool,
    /// Set when several batch entries collapsed into this code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_group_size: Option<usize>,
    /// Codebook entries at or above the threshold, best first
    pub similar: Vec<Suggestion>,
    /// Other batch members at or above the threshold, best first
    pub batch_matches: Vec<Suggestion>,
}

impl BatchCheckResult {
    pub fn is_flagged(&self) -> bool {
        self.has_similar || self.duplicate_in_batch
    }

    /// Top-ranked destination: the codebook first, then the batch.
    pub fn top_suggestion(&self) -> Option<&Suggestion> {
        self.similar.first().or_else(|| self.batch_matches.first())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlaggedMergeReport {
    pub skipped_no_target: usize,
    pub skipped_self_merge: usize,
    /// Items whose destination is itself being merged away in this run, or
    /// that are already the destination of another item
    #[serde(default)]
    pub skipped_cycle: usize,
    /// None when no pair survived target resolution
    pub outcome: Option<MergeBatchOutcome>,
}

/// Finds duplicate codes before and after they enter the backlog.
#[derive(Clone)]
pub struct DuplicateReconciler {
    store: Arc<dyn CandidateStore>,
    oracle: Arc<dyn SimilarityOracle>,
    coordinator: MergeCoordinator,
}

impl DuplicateReconciler {
    pub fn new(
        store: Arc<dyn CandidateStore>,
        oracle: Arc<dyn SimilarityOracle>,
        coordinator: MergeCoordinator,
    ) -> Self {
        Self {
            store,
            oracle,
            coordinator,
        }
    }

    /// Scan the backlog (`pendiente` and `hipotesis` rows) for near
    /// duplicates scoring at or above `threshold`.
    pub async fn detect_duplicates(&self, project: &str, threshold: f32) -> ReconcileResult<DuplicateReport> {
        let (min, max) = POST_HOC_RANGE;
        let threshold = check_threshold(threshold, min, max)?;

        let rows = self.store.list_candidates(
            project,
            &CandidateFilter::new()
                .with_states(&CandidateState::BACKLOG)
                .sorted(SortOrder::Oldest),
        )?;

        let mut groups: BTreeMap<String, ExactDuplicateGroup> = BTreeMap::new();
        let mut distinct: Vec<String> = Vec::new();
        for row in &rows {
            let spelling = row.code.trim().to_string();
            let group = groups
                .entry(row.normalized())
                .or_insert_with(|| ExactDuplicateGroup {
                    normalized: row.normalized(),
                    variants: Vec::new(),
                    rows: 0,
                });
            group.rows += 1;
            if !group.variants.contains(&spelling) {
                group.variants.push(spelling.clone());
                distinct.push(spelling);
            }
        }

        let scored = self.oracle.pairs_above(&distinct, threshold).await?;

        // One entry per logical pair, keeping the best score across spellings.
        let mut best: HashMap<(String, String), ScoredPair> = HashMap::new();
        for pair in scored {
            if same_code(&pair.code1, &pair.code2) {
                continue;
            }
            let (a, b) = (normalize_code(&pair.code1), normalize_code(&pair.code2));
            let key = if a <= b { (a, b) } else { (b, a) };
            match best.get(&key) {
                Some(existing) if existing.similarity >= pair.similarity => {}
                _ => {
                    best.insert(key, pair);
                }
            }
        }

        let mut pairs: Vec<ScoredPair> = best.into_values().collect();
        pairs.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| a.code1.cmp(&b.code1))
                .then_with(|| a.code2.cmp(&b.code2))
        });

        let exact_duplicates: Vec<ExactDuplicateGroup> =
            groups.into_values().filter(|g| g.rows > 1).collect();

        info!(
            project,
            threshold,
            scanned = rows.len(),
            pairs = pairs.len(),
            exact = exact_duplicates.len(),
            "duplicate scan finished"
        );
        Ok(DuplicateReport {
            threshold,
            pairs,
            exact_duplicates,
        })
    }

    /// Check proposed codes against the codebook and each other before
    /// they are inserted.
    pub async fn check_batch(
        &self,
        project: &str,
        codes: &[String],
        threshold: f32,
    ) -> ReconcileResult<Vec<BatchCheckResult>> {
        let threshold = check_threshold(threshold, 0.0, 1.0)?;

        // (first-seen spelling, entries collapsed into it)
        let mut logical: Vec<(String, usize)> = Vec::new();
        for code in codes {
            let code = code.trim();
            if code.is_empty() {
                continue;
            }
            match logical.iter_mut().find(|(seen, _)| same_code(seen, code)) {
                Some((_, count)) => *count += 1,
                None => logical.push((code.to_string(), 1)),
            }
        }
        if logical.is_empty() {
            return Err(ReconcileError::EmptySelection("check"));
        }

        let catalog: Vec<String> = self
            .store
            .list_codebook(project)?
            .into_iter()
            .map(|c| c.code)
            .collect();

        let mut results = Vec::with_capacity(logical.len());
        for (i, (code, count)) in logical.iter().enumerate() {
            let similar = self.oracle.rank(code, &catalog, threshold).await?;
            let others: Vec<String> = logical
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(_, (other, _))| other.clone())
                .collect();
            let batch_matches = self.oracle.rank(code, &others, threshold).await?;

            results.push(BatchCheckResult {
                codigo: code.clone(),
                has_similar: !similar.is_empty(),
                duplicate_in_batch: *count > 1 || !batch_matches.is_empty(),
                batch_group_size: (*count > 1).then_some(*count),
                similar,
                batch_matches,
            });
        }

        debug!(
            project,
            checked = results.len(),
            flagged = results.iter().filter(|r| r.is_flagged()).count(),
            "batch check finished"
        );
        Ok(results)
    }

    /// The destination for a flagged item: the explicit target when given,
    /// otherwise the top-ranked suggestion.
    pub fn resolve_target(result: &BatchCheckResult, explicit_target: Option<&str>) -> ReconcileResult<String> {
        explicit_target
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .or_else(|| result.top_suggestion().map(|s| s.code.clone()))
            .ok_or_else(|| ReconcileError::NoTargetResolved(result.codigo.clone()))
    }

    /// Merge every flagged item into its resolved destination through the
    /// batch path.
    pub async fn merge_flagged(
        &self,
        project: &str,
        results: &[BatchCheckResult],
        explicit_target: Option<&str>,
        memo: &str,
    ) -> ReconcileResult<FlaggedMergeReport> {
        let memo = require_memo(memo, "merge flagged codes")?;

        let mut report = FlaggedMergeReport {
            skipped_no_target: 0,
            skipped_self_merge: 0,
            skipped_cycle: 0,
            outcome: None,
        };
        let mut pairs = Vec::new();
        let mut sources = HashSet::new();
        let mut targets = HashSet::new();
        for result in results.iter().filter(|r| r.is_flagged()) {
            let target = match Self::resolve_target(result, explicit_target) {
                Ok(target) => target,
                Err(ReconcileError::NoTargetResolved(code)) => {
                    debug!(project, codigo = %code, "no merge target");
                    report.skipped_no_target += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };
            if same_code(&result.codigo, &target) {
                report.skipped_self_merge += 1;
                continue;
            }
            // Two batch entries flag each other; the first one seen is merged.
            let (source, destination) = (normalize_code(&result.codigo), normalize_code(&target));
            if targets.contains(&source) || sources.contains(&destination) {
                debug!(project, codigo = %result.codigo, target = %target, "circular merge skipped");
                report.skipped_cycle += 1;
                continue;
            }
            sources.insert(source);
            targets.insert(destination);
            let similarity = result
                .similar
                .iter()
                .chain(&result.batch_matches)
                .find(|s| same_code(&s.code, &target))
                .map(|s| s.similarity)
                .unwrap_or(0.0);
            pairs.push(MergePair::new(result.codigo.clone(), target).with_similarity(similarity));
        }

        if !pairs.is_empty() {
            report.outcome = Some(
                self.coordinator
                    .merge_batch(project, pairs, memo, MergeStrategy::AsGiven)
                    .await?,
            );
        }

        info!(
            project,
            no_target = report.skipped_no_target,
            self_merge = report.skipped_self_merge,
            cycle = report.skipped_cycle,
            "flagged merge finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::{CodeOrigin, NewCandidate};
    use crate::oracle::TableOracle;
    use crate::storage::{OpenStore, SqliteStore};
    use chrono::Utc;

    const P: &str = "p";

    fn reconciler(oracle: TableOracle) -> (DuplicateReconciler, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let coordinator = MergeCoordinator::new(store.clone());
        (
            DuplicateReconciler::new(store.clone(), Arc::new(oracle), coordinator),
            store,
        )
    }

    fn add(store: &SqliteStore, code: &str) {
        let n = store.list_candidates(P, &CandidateFilter::new()).unwrap().len() as i64;
        let at = Utc::now() - chrono::Duration::hours(100 - n);
        store
            .insert_candidate(P, &NewCandidate::new(code, CodeOrigin::Llm).created_at(at))
            .unwrap();
    }

    fn strings(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn detect_reports_pairs_and_exact_groups() {
        let oracle = TableOracle::new()
            .with_score("Confianza", "Confianza Social", 0.91)
            .with_score("confianza", "Confianza Social", 0.93)
            .with_score("Apoyo", "Apoyo Mutuo", 0.82)
            .with_score("Apoyo", "Miedo", 0.40);
        let (reconciler, store) = reconciler(oracle);
        for code in ["Confianza", "confianza", "Confianza Social", "Apoyo", "Apoyo Mutuo", "Miedo"] {
            add(&store, code);
        }

        let report = reconciler.detect_duplicates(P, 0.80).await.unwrap();

        assert_eq!(report.pairs.len(), 2);
        assert_eq!(report.pairs[0].similarity, 0.93);
        assert_eq!(report.pairs[1].code1, "Apoyo");
        assert!(report.pairs.iter().all(|p| !same_code(&p.code1, &p.code2)));

        assert_eq!(report.exact_duplicates.len(), 1);
        let group = &report.exact_duplicates[0];
        assert_eq!(group.normalized, "confianza");
        assert_eq!(group.variants, strings(&["Confianza", "confianza"]));
        assert_eq!(group.rows, 2);
    }

    #[tokio::test]
    async fn detect_ignores_resolved_rows() {
        let oracle = TableOracle::new().with_score("Apoyo", "Apoyo Mutuo", 0.9);
        let (reconciler, store) = reconciler(oracle);
        add(&store, "Apoyo");
        let done = store
            .insert_candidate(P, &NewCandidate::new("Apoyo Mutuo", CodeOrigin::Llm))
            .unwrap();
        store.set_state(P, &done.id, CandidateState::Pending, CandidateState::Rejected, None).unwrap();

        assert!(reconciler.detect_duplicates(P, 0.8).await.unwrap().pairs.is_empty());
    }

    #[tokio::test]
    async fn detect_threshold_must_be_in_range() {
        let (reconciler, _) = reconciler(TableOracle::new());
        for bad in [0.3, 0.99, f32::NAN] {
            let err = reconciler.detect_duplicates(P, bad).await.unwrap_err();
            assert!(matches!(err, ReconcileError::InvalidThreshold { .. }));
        }
        assert!(reconciler.detect_duplicates(P, 0.5).await.is_ok());
        assert!(reconciler.detect_duplicates(P, 0.95).await.is_ok());
    }

    #[tokio::test]
    async fn unavailable_oracle_is_a_remote_failure() {
        let (reconciler, store) = reconciler(TableOracle::unavailable());
        add(&store, "Apoyo");
        add(&store, "Apoyo Mutuo");
        let err = reconciler.detect_duplicates(P, 0.8).await.unwrap_err();
        assert!(matches!(err, ReconcileError::RemoteFailure(_)));
    }

    #[tokio::test]
    async fn check_batch_flags_codebook_and_batch_matches() {
        let oracle = TableOracle::new()
            .with_score("Resiliencia Comunitaria", "Resiliencia", 0.9)
            .with_score("Autogestión", "Autogestion vecinal", 0.87);
        let (reconciler, store) = reconciler(oracle);
        let seeded = store
            .insert_candidate(
                P,
                &NewCandidate::new("Resiliencia", CodeOrigin::Manual).with_fragment("f1"),
            )
            .unwrap();
        store.set_state(P, &seeded.id, CandidateState::Pending, CandidateState::Validated, None).unwrap();
        store.promote_candidate(P, &seeded.id, Utc::now()).unwrap();

        let results = reconciler
            .check_batch(
                P,
                &strings(&["Resiliencia Comunitaria", "Autogestión", "Autogestion vecinal", " ", "Nuevo"]),
                0.85,
            )
            .await
            .unwrap();

        assert_eq!(results.len(), 4);
        assert!(results[0].has_similar);
        assert_eq!(results[0].similar[0].code, "Resiliencia");
        assert!(!results[0].duplicate_in_batch);
        assert!(results[1].duplicate_in_batch);
        assert_eq!(results[1].batch_matches[0].code, "Autogestion vecinal");
        assert_eq!(results[1].batch_group_size, None);
        assert!(!results[3].is_flagged());
    }

    // === Scenario: two spellings of one code in a batch ===

    #[tokio::test]
    async fn collapsed_batch_entries_are_one_logical_code() {
        let (reconciler, store) = reconciler(TableOracle::new());
        add(&store, "Liderazgo");
        add(&store, "liderazgo ");

        let results = reconciler
            .check_batch(P, &strings(&["Liderazgo", "liderazgo "]), 0.85)
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].codigo, "Liderazgo");
        assert!(results[0].duplicate_in_batch);
        assert_eq!(results[0].batch_group_size, Some(2));

        let report = reconciler
            .merge_flagged(P, &results, Some("liderazgo"), "unificar")
            .await
            .unwrap();
        assert_eq!(report.skipped_self_merge, 1);
        assert!(report.outcome.is_none());
        assert_eq!(
            store
                .list_candidates(P, &CandidateFilter::new().with_state(CandidateState::Merged))
                .unwrap()
                .len(),
            0
        );
    }

    #[tokio::test]
    async fn merge_flagged_resolves_targets_and_counts_skips() {
        let oracle = TableOracle::new().with_score("Resiliencia Comunitaria", "Resiliencia", 0.9);
        let (reconciler, store) = reconciler(oracle);
        add(&store, "Resiliencia Comunitaria");

        let with_suggestion = BatchCheckResult {
            codigo: "Resiliencia Comunitaria".into(),
            has_similar: true,
            duplicate_in_batch: false,
            batch_group_size: None,
            similar: vec![Suggestion {
                code: "Resiliencia".into(),
                similarity: 0.9,
            }],
            batch_matches: vec![],
        };
        let without = BatchCheckResult {
            codigo: "Huérfano".into(),
            has_similar: false,
            duplicate_in_batch: true,
            batch_group_size: None,
            similar: vec![],
            batch_matches: vec![],
        };

        assert!(matches!(
            DuplicateReconciler::resolve_target(&without, None).unwrap_err(),
            ReconcileError::NoTargetResolved(_)
        ));

        let report = reconciler
            .merge_flagged(P, &[with_suggestion, without], None, "pre-hoc")
            .await
            .unwrap();

        assert_eq!(report.skipped_no_target, 1);
        let batch = report.outcome.unwrap();
        let batch = batch.report().unwrap();
        assert_eq!(batch.total_merged, 1);
        assert_eq!(batch.details[0].target, "Resiliencia");
    }

    // === Scenario: two new codes flag each other ===

    #[tokio::test]
    async fn mutual_batch_matches_keep_one_survivor() {
        let (reconciler, store) = reconciler(TableOracle::new().with_score("Miedo", "Temor", 0.9));
        add(&store, "Miedo");
        add(&store, "Temor");

        let results = reconciler
            .check_batch(P, &strings(&["Miedo", "Temor"]), 0.85)
            .await
            .unwrap();
        assert!(results.iter().all(|r| r.duplicate_in_batch));

        let report = reconciler.merge_flagged(P, &results, None, "dedupe").await.unwrap();
        assert_eq!(report.skipped_cycle, 1);
        assert_eq!(report.outcome.unwrap().report().unwrap().total_merged, 1);

        let survivors = store
            .list_candidates(P, &CandidateFilter::new().with_states(&CandidateState::MERGEABLE))
            .unwrap();
        assert_eq!(survivors.len(), 1);
        assert_eq!(survivors[0].code, "Temor");
        let miedo = &store.list_candidates(P, &CandidateFilter::new().with_code("Miedo")).unwrap()[0];
        assert_eq!(miedo.merged_into.as_deref(), Some("Temor"));
    }

    #[tokio::test]
    async fn merge_flagged_requires_memo() {
        let (reconciler, _) = reconciler(TableOracle::new());
        let err = reconciler.merge_flagged(P, &[], None, "").await.unwrap_err();
        assert!(matches!(err, ReconcileError::MissingJustification(_)));
    }
}
