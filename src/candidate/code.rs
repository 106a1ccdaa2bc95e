//! CandidateCode: a proposed coding label awaiting governance

use super::state::{CandidateState, UnknownLabel};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for a candidate row
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CandidateId(String);

impl CandidateId {
    /// Create a new random CandidateId (UUID-based)
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CandidateId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CandidateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CandidateId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for CandidateId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Where a candidate came from (`fuente_origen`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeOrigin {
    Manual,
    Llm,
    Discovery,
    SemanticSuggestion,
    LinkPrediction,
    Legacy,
}

impl CodeOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Llm => "llm",
            Self::Discovery => "discovery",
            Self::SemanticSuggestion => "semantic_suggestion",
            Self::LinkPrediction => "link_prediction",
            Self::Legacy => "legacy",
        }
    }
}

impl fmt::Display for CodeOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CodeOrigin {
    type Err = UnknownLabel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "manual" => Ok(Self::Manual),
            "llm" => Ok(Self::Llm),
            "discovery" => Ok(Self::Discovery),
            "semantic_suggestion" => Ok(Self::SemanticSuggestion),
            "link_prediction" => Ok(Self::LinkPrediction),
            "legacy" => Ok(Self::Legacy),
            _ => Err(UnknownLabel {
                kind: "fuente_origen",
                label: s.to_string(),
            }),
        }
    }
}

/// Identity key for duplicate purposes: trimmed, lowercased.
pub fn normalize_code(code: &str) -> String {
    code.trim().to_lowercase()
}

/// True if two code strings name the same logical code.
pub fn same_code(a: &str, b: &str) -> bool {
    normalize_code(a) == normalize_code(b)
}

/// A candidate row as persisted by the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateCode {
    pub id: CandidateId,
    pub project: String,
    #[serde(rename = "codigo")]
    pub code: String,
    #[serde(rename = "estado")]
    pub state: CandidateState,
    #[serde(rename = "fuente_origen")]
    pub origin: CodeOrigin,
    #[serde(rename = "score_confianza")]
    pub confidence: Option<f32>,
    #[serde(rename = "cita")]
    pub quote: String,
    #[serde(rename = "fragmento_id")]
    pub fragment_id: Option<String>,
    #[serde(rename = "archivo")]
    pub document: String,
    /// Surviving code name; set iff `state == Merged`
    #[serde(rename = "fusionado_a")]
    pub merged_into: Option<String>,
    /// Set at most once, only while validated
    #[serde(rename = "promovido_en")]
    pub promoted_at: Option<DateTime<Utc>>,
    /// Last recorded justification
    pub memo: Option<String>,
    pub created_at: DateTime<Utc>,
    /// When the row first left the backlog
    pub resolved_at: Option<DateTime<Utc>>,
}

impl CandidateCode {
    pub fn normalized(&self) -> String {
        normalize_code(&self.code)
    }

    pub fn is_promoted(&self) -> bool {
        self.promoted_at.is_some()
    }

    pub fn has_evidence_reference(&self) -> bool {
        self.fragment_id
            .as_deref()
            .map(|f| !f.trim().is_empty())
            .unwrap_or(false)
    }

    /// Check the row-level invariants between state and the nullable columns.
    pub fn is_consistent(&self) -> bool {
        let merge_ok = self.merged_into.is_some() == (self.state == CandidateState::Merged);
        let promote_ok = self.promoted_at.is_none() || self.state == CandidateState::Validated;
        merge_ok && promote_ok
    }
}

/// Input for inserting a new candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCandidate {
    pub code: String,
    pub origin: CodeOrigin,
    #[serde(default)]
    pub confidence: Option<f32>,
    #[serde(default)]
    pub quote: String,
    #[serde(default)]
    pub fragment_id: Option<String>,
    #[serde(default)]
    pub document: String,
    /// Override for imported rows; defaults to now
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl NewCandidate {
    pub fn new(code: impl Into<String>, origin: CodeOrigin) -> Self {
        Self {
            code: code.into(),
            origin,
            confidence: None,
            quote: String::new(),
            fragment_id: None,
            document: String::new(),
            created_at: None,
        }
    }

    pub fn with_fragment(mut self, fragment_id: impl Into<String>) -> Self {
        self.fragment_id = Some(fragment_id.into());
        self
    }

    pub fn with_quote(mut self, quote: impl Into<String>) -> Self {
        self.quote = quote.into();
        self
    }

    pub fn with_document(mut self, document: impl Into<String>) -> Self {
        self.document = document.into();
        self
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }
}

/// An evidence unit a candidate can cite
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fragment {
    pub id: String,
    pub project: String,
    #[serde(rename = "archivo")]
    pub document: String,
    pub text: String,
}

/// An entry in the canonical codebook
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalCode {
    pub project: String,
    #[serde(rename = "codigo")]
    pub code: String,
    /// Candidate rows that were promoted into this entry
    pub promoted_from: Vec<CandidateId>,
    pub first_promoted_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(state: CandidateState) -> CandidateCode {
        CandidateCode {
            id: CandidateId::new(),
            project: "p".into(),
            code: "Liderazgo".into(),
            state,
            origin: CodeOrigin::Manual,
            confidence: None,
            quote: String::new(),
            fragment_id: None,
            document: String::new(),
            merged_into: None,
            promoted_at: None,
            memo: None,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }

    #[test]
    fn normalization_ignores_case_and_padding() {
        assert!(same_code("Liderazgo", "liderazgo "));
        assert!(same_code("  PARTICIPACIÓN", "participación"));
        assert!(!same_code("Confianza", "Confianza Social"));
    }

    #[test]
    fn origin_labels_parse() {
        assert_eq!("link_prediction".parse::<CodeOrigin>().unwrap(), CodeOrigin::LinkPrediction);
        assert_eq!(
            serde_json::to_string(&CodeOrigin::SemanticSuggestion).unwrap(),
            "\"semantic_suggestion\""
        );
        assert!("gpt".parse::<CodeOrigin>().is_err());
    }

    #[test]
    fn consistency_tracks_merge_and_promotion_columns() {
        let mut c = candidate(CandidateState::Pending);
        assert!(c.is_consistent());

        c.merged_into = Some("Otro".into());
        assert!(!c.is_consistent());

        c.state = CandidateState::Merged;
        assert!(c.is_consistent());

        let mut v = candidate(CandidateState::Pending);
        v.promoted_at = Some(Utc::now());
        assert!(!v.is_consistent());
        v.state = CandidateState::Validated;
        assert!(v.is_consistent());
    }

    #[test]
    fn blank_fragment_is_not_evidence() {
        let mut c = candidate(CandidateState::Validated);
        assert!(!c.has_evidence_reference());
        c.fragment_id = Some("  ".into());
        assert!(!c.has_evidence_reference());
        c.fragment_id = Some("frag-1".into());
        assert!(c.has_evidence_reference());
    }

    #[test]
    fn serializes_with_wire_field_names() {
        let c = candidate(CandidateState::Validated);
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["codigo"], "Liderazgo");
        assert_eq!(json["estado"], "validado");
        assert_eq!(json["fuente_origen"], "manual");
        assert!(json["fusionado_a"].is_null());
    }
}
