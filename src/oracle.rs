//! Similarity oracle: the external scorer the reconciler consults
//!
//! The engine never computes similarity itself. It asks an oracle for
//! scores in [0, 1] between two code strings, or for a ranking of a code
//! against a catalog.
//!
//! `TableOracle` answers from a table of pre-computed scores (loadable from
//! YAML). It backs the CLI and the test suite.

use crate::candidate::{normalize_code, same_code};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// A pair of codes the oracle considers similar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredPair {
    pub code1: String,
    pub code2: String,
    pub similarity: f32,
}

/// A catalog entry ranked against a query code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    #[serde(rename = "codigo")]
    pub code: String,
    pub similarity: f32,
}

/// Errors from oracle operations.
#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("similarity oracle not available: {0}")]
    Unavailable(String),
    #[error("scoring failed: {0}")]
    ScoringFailed(String),
    #[error("cannot read score table: {0}")]
    Table(String),
}

/// Client trait for the similarity oracle.
#[async_trait]
pub trait SimilarityOracle: Send + Sync {
    /// Similarity between two code strings, in [0, 1].
    async fn score(&self, a: &str, b: &str) -> Result<f32, OracleError>;

    /// Catalog entries scoring at or above `threshold`, best first.
    async fn rank(
        &self,
        code: &str,
        catalog: &[String],
        threshold: f32,
    ) -> Result<Vec<Suggestion>, OracleError> {
        let mut out = Vec::new();
        for entry in catalog {
            let similarity = self.score(code, entry).await?;
            if similarity >= threshold {
                out.push(Suggestion {
                    code: entry.clone(),
                    similarity,
                });
            }
        }
        out.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        Ok(out)
    }

    /// Every unordered pair of `codes` scoring at or above `threshold`.
    async fn pairs_above(
        &self,
        codes: &[String],
        threshold: f32,
    ) -> Result<Vec<ScoredPair>, OracleError> {
        let mut out = Vec::new();
        for (i, a) in codes.iter().enumerate() {
            for b in &codes[i + 1..] {
                let similarity = self.score(a, b).await?;
                if similarity >= threshold {
                    out.push(ScoredPair {
                        code1: a.clone(),
                        code2: b.clone(),
                        similarity,
                    });
                }
            }
        }
        Ok(out)
    }
}

/// On-disk format for `TableOracle::from_yaml`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ScoreTable {
    #[serde(default)]
    pub pairs: Vec<ScoredPair>,
}

/// Oracle backed by a fixed table of pairwise scores.
///
/// Lookups are symmetric and case-insensitive. Codes that normalize equal
/// score 1.0; pairs missing from the table score 0.0.
#[derive(Debug, Clone)]
pub struct TableOracle {
    available: bool,
    scores: HashMap<(String, String), f32>,
}

fn table_key(a: &str, b: &str) -> (String, String) {
    let (a, b) = (normalize_code(a), normalize_code(b));
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

impl TableOracle {
    pub fn new() -> Self {
        Self {
            available: true,
            scores: HashMap::new(),
        }
    }

    /// An oracle that fails every request.
    pub fn unavailable() -> Self {
        Self {
            available: false,
            scores: HashMap::new(),
        }
    }

    pub fn with_score(mut self, a: &str, b: &str, similarity: f32) -> Self {
        self.insert(a, b, similarity);
        self
    }

    pub fn insert(&mut self, a: &str, b: &str, similarity: f32) {
        self.scores.insert(table_key(a, b), similarity.clamp(0.0, 1.0));
    }

    pub fn from_table(table: ScoreTable) -> Self {
        let mut oracle = Self::new();
        for pair in table.pairs {
            oracle.insert(&pair.code1, &pair.code2, pair.similarity);
        }
        oracle
    }

    /// Load a score table from a YAML file with a top-level `pairs` list.
    pub fn from_yaml(path: impl AsRef<Path>) -> Result<Self, OracleError> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| OracleError::Table(format!("{}: {}", path.as_ref().display(), e)))?;
        let table: ScoreTable =
            serde_yaml::from_str(&text).map_err(|e| OracleError::Table(e.to_string()))?;
        Ok(Self::from_table(table))
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }
}

impl Default for TableOracle {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SimilarityOracle for TableOracle {
    async fn score(&self, a: &str, b: &str) -> Result<f32, OracleError> {
        if !self.available {
            return Err(OracleError::Unavailable(
                "table oracle configured as unavailable".to_string(),
            ));
        }
        if same_code(a, b) {
            return Ok(1.0);
        }
        Ok(self.scores.get(&table_key(a, b)).copied().unwrap_or(0.0))
    }
}
