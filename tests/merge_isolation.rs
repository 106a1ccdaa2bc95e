//! Merge batch isolation: per-pair failures, fatal aborts and the batch lock

mod common;

use async_trait::async_trait;
use codebook::reconcile::{
    BatchConfirmation, MergeBatchOutcome, MergeCoordinator, MergePair, MergeStrategy, PairStatus, ReconcileError,
};
use codebook::storage::AuditAction;
use codebook::{CandidateState, CandidateStore, CodeOrigin, NewCandidate};
use common::{FlakyStore, PROJECT};
use std::sync::Arc;

fn seed(store: &FlakyStore, codes: &[&str]) {
    for code in codes {
        store
            .insert_candidate(PROJECT, &NewCandidate::new(*code, CodeOrigin::Llm))
            .unwrap();
    }
}

fn states_of(store: &FlakyStore, code: &str) -> Vec<CandidateState> {
    store
        .list_candidates(PROJECT, &codebook::storage::CandidateFilter::new().with_code(code))
        .unwrap()
        .into_iter()
        .map(|c| c.state)
        .collect()
}

struct Decline;

#[async_trait]
impl BatchConfirmation for Decline {
    async fn confirm(&self, _project: &str, _pairs: &[MergePair]) -> bool {
        false
    }
}

/// Yields a few times before confirming, so a second batch can start meanwhile.
struct Yielding;

#[async_trait]
impl BatchConfirmation for Yielding {
    async fn confirm(&self, _project: &str, _pairs: &[MergePair]) -> bool {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        true
    }
}

struct Panicking;

#[async_trait]
impl BatchConfirmation for Panicking {
    async fn confirm(&self, _project: &str, _pairs: &[MergePair]) -> bool {
        panic!("confirmation prompt crashed");
    }
}

#[tokio::test]
async fn failing_pair_does_not_stop_the_batch() {
    let store = Arc::new(FlakyStore::new("Temor", false));
    seed(&store, &["Miedo", "Temor", "Apoyo Mutuo", "Apoyo"]);
    let coordinator = MergeCoordinator::new(store.clone());

    let outcome = coordinator
        .merge_batch(
            PROJECT,
            vec![MergePair::new("Miedo", "Temor"), MergePair::new("Apoyo Mutuo", "Apoyo")],
            "limpieza de sinónimos",
            MergeStrategy::AsGiven,
        )
        .await
        .unwrap();

    let report = outcome.report().unwrap();
    assert_eq!(report.pairs_processed, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.total_merged, 1);
    assert_eq!(report.details[0].status, PairStatus::Failed);
    assert!(report.details[0].error.is_some());
    assert_eq!(report.details[1].status, PairStatus::Merged);

    assert_eq!(states_of(&store, "Miedo"), vec![CandidateState::Pending]);
    assert_eq!(states_of(&store, "Apoyo Mutuo"), vec![CandidateState::Merged]);
    assert!(!coordinator.lock().is_held());
}

#[tokio::test]
async fn unavailable_store_aborts_and_releases_the_lock() {
    let store = Arc::new(FlakyStore::new("Temor", true));
    seed(&store, &["Miedo", "Temor", "Apoyo Mutuo", "Apoyo"]);
    let coordinator = MergeCoordinator::new(store.clone());

    let err = coordinator
        .merge_batch(
            PROJECT,
            vec![MergePair::new("Apoyo Mutuo", "Apoyo"), MergePair::new("Miedo", "Temor")],
            "limpieza de sinónimos",
            MergeStrategy::AsGiven,
        )
        .await
        .unwrap_err();

    assert!(!coordinator.lock().is_held());
    // pairs committed before the failure stay merged
    assert_eq!(states_of(&store, "Apoyo Mutuo"), vec![CandidateState::Merged]);
    assert_eq!(states_of(&store, "Miedo"), vec![CandidateState::Pending]);

    match err {
        ReconcileError::MergeAborted { planned, report, .. } => {
            assert_eq!(planned, 2);
            assert_eq!(report.pairs_processed, 2);
            assert_eq!(report.total_merged, 1);
            assert_eq!(report.failed, 1);
            assert_eq!(report.details[0].status, PairStatus::Merged);
            assert_eq!(report.details[1].status, PairStatus::Failed);
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn aborted_batch_still_leaves_an_audit_entry() {
    let store = Arc::new(FlakyStore::new("Temor", true));
    seed(&store, &["Miedo", "Temor", "Apoyo Mutuo", "Apoyo"]);
    let coordinator = MergeCoordinator::new(store.clone());

    let err = coordinator
        .merge_batch(
            PROJECT,
            vec![MergePair::new("Apoyo Mutuo", "Apoyo"), MergePair::new("Miedo", "Temor")],
            "limpieza de sinónimos",
            MergeStrategy::AsGiven,
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("1 row(s) merged"));

    let merges: Vec<_> = store
        .list_audit(PROJECT, None)
        .unwrap()
        .into_iter()
        .filter(|e| e.action == AuditAction::Merge)
        .collect();
    assert_eq!(merges.len(), 1);
    assert_eq!(merges[0].details["total_merged"], 1);
    assert_eq!(merges[0].details["failed"], 1);
    assert!(merges[0].details["aborted"].as_str().unwrap().contains("connection reset"));
}

#[tokio::test]
async fn declined_batch_is_cancelled_without_changes() {
    let store = Arc::new(FlakyStore::new("", false));
    seed(&store, &["Apoyo Mutuo", "Apoyo"]);
    let coordinator = MergeCoordinator::new(store.clone()).with_confirmation(Arc::new(Decline));

    let outcome = coordinator
        .merge_batch(
            PROJECT,
            vec![MergePair::new("Apoyo Mutuo", "Apoyo")],
            "consolidar",
            MergeStrategy::AsGiven,
        )
        .await
        .unwrap();

    assert_eq!(outcome, MergeBatchOutcome::Cancelled);
    assert!(!coordinator.lock().is_held());
    assert_eq!(states_of(&store, "Apoyo Mutuo"), vec![CandidateState::Pending]);
}

#[tokio::test]
async fn second_batch_while_first_is_in_flight_is_rejected() {
    let store = Arc::new(FlakyStore::new("", false));
    seed(&store, &["Apoyo Mutuo", "Apoyo", "Confianza Social", "Confianza"]);
    let coordinator = MergeCoordinator::new(store.clone()).with_confirmation(Arc::new(Yielding));

    let first = coordinator.merge_batch(
        PROJECT,
        vec![MergePair::new("Apoyo Mutuo", "Apoyo")],
        "primer lote",
        MergeStrategy::AsGiven,
    );
    let second = coordinator.merge_batch(
        PROJECT,
        vec![MergePair::new("Confianza Social", "Confianza")],
        "segundo lote",
        MergeStrategy::AsGiven,
    );
    let (first, second) = tokio::join!(first, second);

    assert_eq!(first.unwrap().report().unwrap().total_merged, 1);
    assert_eq!(second.unwrap(), MergeBatchOutcome::AlreadyRunning);
    assert_eq!(states_of(&store, "Confianza Social"), vec![CandidateState::Pending]);
    assert!(!coordinator.lock().is_held());
}

#[tokio::test]
async fn panic_inside_a_batch_releases_the_lock() {
    let store = Arc::new(FlakyStore::new("", false));
    seed(&store, &["Apoyo Mutuo", "Apoyo"]);
    let coordinator = MergeCoordinator::new(store.clone()).with_confirmation(Arc::new(Panicking));

    let task = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            coordinator
                .merge_batch(
                    PROJECT,
                    vec![MergePair::new("Apoyo Mutuo", "Apoyo")],
                    "consolidar",
                    MergeStrategy::AsGiven,
                )
                .await
        })
    };
    assert!(task.await.unwrap_err().is_panic());

    assert!(!coordinator.lock().is_held());
    assert!(coordinator.lock().try_acquire().is_ok());
    assert_eq!(states_of(&store, "Apoyo Mutuo"), vec![CandidateState::Pending]);
}

#[tokio::test]
async fn invalid_input_is_rejected_before_taking_the_lock() {
    let store = Arc::new(FlakyStore::new("", false));
    let coordinator = MergeCoordinator::new(store);
    let _held = coordinator.lock().try_acquire().unwrap();

    let err = coordinator
        .merge_batch(PROJECT, vec![MergePair::new("a", "b")], "  ", MergeStrategy::AsGiven)
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::MissingJustification(_)));

    let err = coordinator
        .merge_batch(PROJECT, Vec::new(), "memo", MergeStrategy::AsGiven)
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::EmptySelection(_)));
}
