//! Merge pairs and AI merge plans

use crate::candidate::{normalize_code, same_code, UnknownLabel};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A proposed consolidation of `source` into `target`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergePair {
    #[serde(rename = "source_codigo")]
    pub source: String,
    #[serde(rename = "target_codigo")]
    pub target: String,
    #[serde(default)]
    pub similarity: f32,
    /// Per-pair justification; the batch memo applies when absent
    #[serde(default)]
    pub memo: Option<String>,
}

impl MergePair {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            similarity: 0.0,
            memo: None,
        }
    }

    pub fn with_similarity(mut self, similarity: f32) -> Self {
        self.similarity = similarity;
        self
    }

    pub fn with_memo(mut self, memo: impl Into<String>) -> Self {
        self.memo = Some(memo.into());
        self
    }

    /// Source and target name the same logical code.
    pub fn is_self_merge(&self) -> bool {
        same_code(&self.source, &self.target)
    }
}

impl fmt::Display for MergePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' → '{}'", self.source, self.target)
    }
}

/// One AI-proposed pair inside a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanPair {
    pub source: String,
    pub target: String,
    pub similarity: f32,
    pub reason: String,
}

impl PlanPair {
    /// Identity of the pair within a plan
    pub fn key(&self) -> (String, String) {
        (normalize_code(&self.source), normalize_code(&self.target))
    }

    pub fn matches(&self, source: &str, target: &str) -> bool {
        same_code(&self.source, source) && same_code(&self.target, target)
    }
}

/// An inert, auditable set of AI-proposed merges
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergePlan {
    pub run_id: String,
    pub project: String,
    pub threshold: f32,
    pub created_at: DateTime<Utc>,
    pub pairs: Vec<PlanPair>,
}

impl MergePlan {
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Pairs not yet covered by a decision, in plan order.
    pub fn pending<'a>(&'a self, decisions: &[PlanDecision]) -> Vec<&'a PlanPair> {
        self.pairs
            .iter()
            .filter(|p| !decisions.iter().any(|d| p.matches(&d.source, &d.target)))
            .collect()
    }
}

/// What a human did with a plan pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanDecisionKind {
    Applied,
    Rejected,
}

impl PlanDecisionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Rejected => "rejected",
        }
    }
}

impl std::str::FromStr for PlanDecisionKind {
    type Err = UnknownLabel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "applied" => Ok(Self::Applied),
            "rejected" => Ok(Self::Rejected),
            other => Err(UnknownLabel {
                kind: "plan decision",
                label: other.to_string(),
            }),
        }
    }
}

/// Append-only record of a decision on a plan pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanDecision {
    pub run_id: String,
    pub source: String,
    pub target: String,
    pub kind: PlanDecisionKind,
    pub memo: Option<String>,
    pub merged: usize,
    pub decided_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> MergePlan {
        MergePlan {
            run_id: "run-1".into(),
            project: "p".into(),
            threshold: 0.9,
            created_at: Utc::now(),
            pairs: vec![
                PlanPair {
                    source: "Confianza Social".into(),
                    target: "Confianza".into(),
                    similarity: 0.93,
                    reason: String::new(),
                },
                PlanPair {
                    source: "Participación Comunitaria".into(),
                    target: "Participación".into(),
                    similarity: 0.91,
                    reason: String::new(),
                },
            ],
        }
    }

    #[test]
    fn self_merge_detection_is_case_and_space_insensitive() {
        assert!(MergePair::new("Liderazgo", "liderazgo ").is_self_merge());
        assert!(!MergePair::new("Liderazgo", "Liderazgos").is_self_merge());
    }

    #[test]
    fn pending_is_set_difference_over_decisions() {
        let plan = plan();
        let decision = PlanDecision {
            run_id: "run-1".into(),
            source: "confianza social".into(),
            target: "CONFIANZA".into(),
            kind: PlanDecisionKind::Applied,
            memo: None,
            merged: 1,
            decided_at: Utc::now(),
        };

        let pending = plan.pending(&[decision]);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].target, "Participación");
        // history is untouched
        assert_eq!(plan.pairs.len(), 2);
    }
}
