use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ValidationError;

/// Maximum identifier length in bytes.
pub const MAX_ID_LEN: usize = 512;

/// Default number of results returned by a query.
pub const DEFAULT_K: usize = 10;

/// Version counter of the Embedding Store. Zero is the empty store.
pub type Generation = u64;

// =============================================================================
// Identifiers
// =============================================================================

/// Stable, unique document identifier.
///
/// Accepts either a JSON string or a JSON unsigned integer on input; integers
/// are kept as their decimal string so ordering is always byte-wise.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawDocId", into = "String")]
pub struct DocId(String);

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDocId {
    Text(String),
    Number(u64),
}

impl DocId {
    pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
        let id = id.into();
        if id.is_empty() {
            return Err(ValidationError::MalformedId("identifier is empty".to_string()));
        }
        if id.len() > MAX_ID_LEN {
            return Err(ValidationError::MalformedId(format!(
                "identifier is {} bytes, limit is {}",
                id.len(),
                MAX_ID_LEN
            )));
        }
        if id.chars().any(char::is_control) {
            return Err(ValidationError::MalformedId(
                "identifier contains control characters".to_string(),
            ));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<RawDocId> for DocId {
    type Error = ValidationError;

    fn try_from(raw: RawDocId) -> Result<Self, Self::Error> {
        match raw {
            RawDocId::Text(s) => DocId::new(s),
            RawDocId::Number(n) => DocId::new(n.to_string()),
        }
    }
}

impl From<DocId> for String {
    fn from(id: DocId) -> Self {
        id.0
    }
}

impl FromStr for DocId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DocId::new(s)
    }
}

impl Borrow<str> for DocId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Documents
// =============================================================================

/// Opaque payload carried alongside an embedding.
///
/// The named fields are the ones the ingestion producer always sends; any
/// other keys are preserved in `extra` and written back out unchanged.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DocumentMetadata {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }
}

/// The authoritative stored form of a document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: DocId,
    pub embedding: Vec<f32>,
    pub metadata: DocumentMetadata,
    /// Generation in which this version of the record was written.
    pub generation: Generation,
}

/// A document as delivered by the ingestion producer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IncomingDocument {
    pub id: DocId,
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub metadata: DocumentMetadata,
}

impl IncomingDocument {
    pub fn new(id: DocId, embedding: Vec<f32>, metadata: DocumentMetadata) -> Self {
        Self {
            id,
            embedding,
            metadata,
        }
    }
}

// =============================================================================
// Queries
// =============================================================================

/// How the Query Engine generates candidates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    /// Probe the partitioned index, then re-rank exactly.
    #[default]
    Approximate,
    /// Scan the whole Embedding Store.
    Exact,
    /// Exact below the configured corpus-size threshold, approximate above it.
    Auto,
}

impl FromStr for SearchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "approximate" | "approx" => Ok(SearchMode::Approximate),
            "exact" => Ok(SearchMode::Exact),
            "auto" => Ok(SearchMode::Auto),
            other => Err(format!("unknown search mode: {}", other)),
        }
    }
}

fn default_k() -> usize {
    DEFAULT_K
}

/// A similarity query against the store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub embedding: Vec<f32>,
    #[serde(default = "default_k")]
    pub k: usize,
    /// `None` uses the configured default mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<SearchMode>,
}

impl QueryRequest {
    pub fn new(embedding: Vec<f32>, k: usize) -> Self {
        Self {
            embedding,
            k,
            mode: None,
        }
    }

    pub fn with_mode(mut self, mode: SearchMode) -> Self {
        self.mode = Some(mode);
        self
    }
}

/// One ranked query result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScoredDocument {
    pub id: DocId,
    /// Exact cosine similarity in [-1, 1].
    pub score: f64,
    pub metadata: DocumentMetadata,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doc_id_validation() {
        assert!(DocId::new("article-1").is_ok());
        assert!(matches!(
            DocId::new(""),
            Err(ValidationError::MalformedId(_))
        ));
        assert!(matches!(
            DocId::new("bad\nid"),
            Err(ValidationError::MalformedId(_))
        ));
        assert!(DocId::new("x".repeat(MAX_ID_LEN)).is_ok());
        assert!(DocId::new("x".repeat(MAX_ID_LEN + 1)).is_err());
    }

    #[test]
    fn test_doc_id_accepts_integer_json() {
        let id: DocId = serde_json::from_str("42").unwrap();
        assert_eq!(id.as_str(), "42");
        let id: DocId = serde_json::from_str("\"abc\"").unwrap();
        assert_eq!(id.as_str(), "abc");
        assert!(serde_json::from_str::<DocId>("\"\"").is_err());
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc\"");
    }

    #[test]
    fn test_doc_id_orders_bytewise() {
        let mut ids: Vec<DocId> = ["b", "a", "10", "9"]
            .iter()
            .map(|s| DocId::new(*s).unwrap())
            .collect();
        ids.sort();
        let ordered: Vec<&str> = ids.iter().map(DocId::as_str).collect();
        assert_eq!(ordered, vec!["10", "9", "a", "b"]);
    }

    #[test]
    fn test_metadata_preserves_unknown_keys() {
        let json = r#"{
            "title": "Printing press",
            "summary": "Gutenberg",
            "category": "history",
            "timestamp": "2024-03-01T12:00:00Z",
            "url": "https://example.org/press"
        }"#;
        let meta: DocumentMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(meta.title, "Printing press");
        assert_eq!(meta.category, "history");
        assert!(meta.timestamp.is_some());
        assert_eq!(
            meta.extra.get("url").and_then(|v| v.as_str()),
            Some("https://example.org/press")
        );

        let back = serde_json::to_value(&meta).unwrap();
        assert_eq!(back["url"], "https://example.org/press");
    }

    #[test]
    fn test_metadata_defaults_when_missing() {
        let meta: DocumentMetadata = serde_json::from_str("{}").unwrap();
        assert_eq!(meta, DocumentMetadata::default());
    }

    #[test]
    fn test_incoming_document_without_metadata() {
        let doc: IncomingDocument =
            serde_json::from_str(r#"{"id": 7, "embedding": [1.0, 0.0]}"#).unwrap();
        assert_eq!(doc.id.as_str(), "7");
        assert_eq!(doc.embedding, vec![1.0, 0.0]);
        assert_eq!(doc.metadata, DocumentMetadata::default());
    }

    #[test]
    fn test_query_request_defaults() {
        let req: QueryRequest = serde_json::from_str(r#"{"embedding": [0.5]}"#).unwrap();
        assert_eq!(req.k, DEFAULT_K);
        assert!(req.mode.is_none());

        let req: QueryRequest =
            serde_json::from_str(r#"{"embedding": [0.5], "k": 3, "mode": "exact"}"#).unwrap();
        assert_eq!(req.k, 3);
        assert_eq!(req.mode, Some(SearchMode::Exact));
    }

    #[test]
    fn test_search_mode_from_str() {
        assert_eq!("exact".parse::<SearchMode>(), Ok(SearchMode::Exact));
        assert_eq!("Approx".parse::<SearchMode>(), Ok(SearchMode::Approximate));
        assert_eq!("auto".parse::<SearchMode>(), Ok(SearchMode::Auto));
        assert!("fuzzy".parse::<SearchMode>().is_err());
    }
}
