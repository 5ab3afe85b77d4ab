//! Core data models shared across the crate.
//!
//! These types represent the projects, records, index metadata, and query
//! results that flow through ingestion and retrieval. The data lifecycle is:
//!
//! ```text
//! ContentAPI → FaqRecord / KbRecord → Storage
//!                                        ↓
//!                           Indexer → IndexVersionMeta (artifacts)
//!                                        ↓
//!                           Retriever → Source → QueryResponse
//! ```
//!
//! # Identity
//!
//! - A **[`FaqRecord`]** id is minted deterministically from
//!   `("faq", project_id, question)`, so identical questions upsert in place.
//! - A **[`KbRecord`]** id is minted from
//!   `("kb", project_id, article_title, chunk_index)`. All chunks of one
//!   uploaded document share `parent_document_id` and `attachment_id`.
//! - An **[`Attachment`]** outlives every KB record that references it and is
//!   reclaimed when the last referrer is deleted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A tenant namespace owning FAQs, KB records, attachments, and indexes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    /// Soft-delete flag. Deactivated projects are invisible to queries.
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Provenance of a record: entered by hand or produced by a document upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordSource {
    Manual,
    Upload,
}

/// A question/answer pair indexed as a single unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaqRecord {
    pub id: String,
    pub project_id: String,
    pub question: String,
    pub answer: String,
    pub source: RecordSource,
    pub created_at: DateTime<Utc>,
}

/// A titled text fragment, possibly one chunk of an uploaded document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KbRecord {
    pub id: String,
    pub project_id: String,
    pub article_title: String,
    pub content: String,
    pub source: RecordSource,
    /// Zero-based position within the parent document, if chunked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<u32>,
    /// Shared by all chunks of one uploaded document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_document_id: Option<String>,
    /// Points at the preserved original upload bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Metadata for preserved original upload bytes.
///
/// The bytes themselves live in the Storage backend; this struct is what
/// callers get alongside them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub project_id: String,
    pub mime: String,
    pub original_name: String,
    pub created_at: DateTime<Utc>,
}

/// The four artifact kinds an index version may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Dense,
    Sparse,
    Basic,
    Meta,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Dense => "dense",
            ArtifactKind::Sparse => "sparse",
            ArtifactKind::Basic => "basic",
            ArtifactKind::Meta => "meta",
        }
    }
}

/// Published metadata for one immutable index version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexVersionMeta {
    pub project_id: String,
    /// Monotonic version counter; artifacts live under `index/v<version>/`.
    pub version: u64,
    pub built_at: DateTime<Utc>,
    /// SHA-256 over the ordered `(id, content_hash)` pairs of all indexable
    /// records. Equality means a rebuild may be skipped.
    pub record_fingerprint: String,
    pub dense_available: bool,
    pub sparse_available: bool,
    pub item_count: usize,
}

/// Per-project build tracking. Invariant: `current_version <= target_version`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BuildState {
    pub current_version: u64,
    pub target_version: u64,
    pub building: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Count of completed build passes, including fingerprint skips.
    pub builds_run: u64,
}

/// Which store a retrieval result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Faq,
    Kb,
}

/// A citation entry in a query response.
#[derive(Debug, Clone, Serialize)]
pub struct Source {
    pub id: String,
    pub kind: SourceKind,
    pub title: String,
    pub excerpt: String,
    /// Best individual (pre-fusion) score, kept for display.
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment_url: Option<String>,
}

/// Orchestrated query input.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    pub project_id: String,
    pub question: String,
    #[serde(default = "default_max_sources")]
    pub max_sources: usize,
    #[serde(default = "default_use_tools")]
    pub use_tools: bool,
}

fn default_max_sources() -> usize {
    5
}

fn default_use_tools() -> bool {
    true
}

/// One tool invocation recorded in a query response.
#[derive(Debug, Clone, Serialize)]
pub struct ToolUsage {
    pub tool: String,
    pub parameters: Value,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub execution_ms: u64,
}

/// Orchestrated query output.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub answer: String,
    pub sources: Vec<Source>,
    pub tools_used: Vec<ToolUsage>,
    pub project_id: String,
    pub timestamp: DateTime<Utc>,
    /// Model identifier, or `None` when the deterministic fallback answered.
    pub model: Option<String>,
    pub processing_time_ms: u64,
}

/// A bearer-token session persisted in the metadata store.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    pub token_jti: String,
    pub client_name: String,
    pub scopes: Vec<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub disabled: bool,
}

/// One request trace. Headers are scrubbed before construction and the body
/// is represented only by its SHA-256.
#[derive(Debug, Clone, Serialize)]
pub struct Trace {
    pub id: String,
    pub ts: DateTime<Utc>,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub latency_ms: f64,
    pub ip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    pub headers_scrubbed: Value,
    pub query_params: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_sha256: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
