//! Index artifact construction.
//!
//! Given a project's ordered record set, the indexer produces up to three
//! artifacts:
//!
//! | Artifact | Contents | Required |
//! |----------|----------|----------|
//! | **basic** | Per-record lowercased `title + "\n" + body` plus display metadata | always |
//! | **sparse** | Inverted index over lowercased, stop-word-filtered tokens with tf/df stats for BM25 | best effort |
//! | **dense** | `(id, embedding)` pairs from the configured embedder | only with an embedder |
//!
//! Embedder absence or failure never fails a build; the dense artifact is
//! simply omitted and retrieval degrades down the ladder.
//!
//! The indexer is pure: identical records and identical embedder outputs
//! yield byte-identical serialized artifacts (`BTreeMap`s keep the postings
//! in a deterministic order), which is what makes the
//! `record_fingerprint`-based rebuild skip sound.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

use crate::embedding::Embedder;
use crate::ident;
use crate::models::{FaqRecord, KbRecord, SourceKind};

/// Terms excluded from the sparse index and from query tokenization.
pub const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "from", "how", "i", "in",
    "is", "it", "of", "on", "or", "that", "the", "this", "to", "was", "were", "what", "when",
    "where", "which", "who", "why", "will", "with", "you", "your",
];

/// Excerpt length stored in the basic artifact for display.
const EXCERPT_CHARS: usize = 240;

/// One record flattened for indexing, FAQ or KB.
#[derive(Debug, Clone)]
pub struct IndexableRecord {
    pub id: String,
    pub kind: SourceKind,
    pub title: String,
    pub body: String,
    pub chunk_index: Option<u32>,
    pub parent_document_id: Option<String>,
    pub attachment_id: Option<String>,
}

/// Display and substring-match table. Always present; also serves as the
/// record metadata source for results found via the other artifacts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BasicArtifact {
    pub entries: Vec<BasicEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasicEntry {
    pub id: String,
    pub kind: SourceKind,
    pub title: String,
    /// Lowercased `title + "\n" + body`, matched by substring search.
    pub text_lower: String,
    /// Original-case excerpt for display.
    pub excerpt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_document_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_id: Option<String>,
}

impl BasicArtifact {
    pub fn entry(&self, id: &str) -> Option<&BasicEntry> {
        self.entries.iter().find(|e| e.id == id)
    }
}

/// Inverted index with the statistics BM25 scoring needs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SparseArtifact {
    pub doc_count: usize,
    pub avg_doc_len: f64,
    /// Token count per record id.
    pub doc_len: BTreeMap<String, u32>,
    /// term → postings; document frequency is the posting list length.
    pub postings: BTreeMap<String, Vec<Posting>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Posting {
    pub id: String,
    pub tf: u32,
}

/// Embedding vectors per record id, in record order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenseArtifact {
    pub model: String,
    pub dims: usize,
    pub entries: Vec<DenseEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenseEntry {
    pub id: String,
    pub vector: Vec<f32>,
}

/// The output of one build pass.
pub struct BuildOutput {
    pub basic: BasicArtifact,
    pub sparse: Option<SparseArtifact>,
    pub dense: Option<DenseArtifact>,
}

/// Flatten a project's FAQ and KB records into the ordered indexable set.
/// FAQs first, then KB records, both in storage (insertion) order.
pub fn collect_records(faqs: &[FaqRecord], kb: &[KbRecord]) -> Vec<IndexableRecord> {
    let mut records = Vec::with_capacity(faqs.len() + kb.len());
    for faq in faqs {
        records.push(IndexableRecord {
            id: faq.id.clone(),
            kind: SourceKind::Faq,
            title: faq.question.clone(),
            body: faq.answer.clone(),
            chunk_index: None,
            parent_document_id: None,
            attachment_id: None,
        });
    }
    for record in kb {
        records.push(IndexableRecord {
            id: record.id.clone(),
            kind: SourceKind::Kb,
            title: record.article_title.clone(),
            body: record.content.clone(),
            chunk_index: record.chunk_index,
            parent_document_id: record.parent_document_id.clone(),
            attachment_id: record.attachment_id.clone(),
        });
    }
    records
}

/// Fingerprint of the ordered record set; equality means the artifacts a
/// build would produce are identical to the published ones.
pub fn fingerprint(records: &[IndexableRecord]) -> String {
    let hashes: Vec<(String, String)> = records
        .iter()
        .map(|r| {
            let content = format!("{}\n{}", r.title, r.body);
            (r.id.clone(), ident::content_hash(&content))
        })
        .collect();
    ident::record_fingerprint(hashes.iter().map(|(id, h)| (id.as_str(), h.as_str())))
}

/// Split text into lowercased tokens with stop words removed.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .filter(|t| !STOP_WORDS.contains(&t.as_str()))
        .collect()
}

/// Build all artifacts for a record set.
///
/// The dense pass is attempted only when an embedder is available, and its
/// failure is logged and swallowed.
pub async fn build_artifacts(
    records: &[IndexableRecord],
    embedder: Option<&dyn Embedder>,
) -> BuildOutput {
    let basic = build_basic(records);
    let sparse = Some(build_sparse(records));
    let dense = match embedder {
        Some(embedder) => match build_dense(records, embedder).await {
            Ok(artifact) => Some(artifact),
            Err(e) => {
                warn!(error = %e, "dense index build failed; continuing without it");
                None
            }
        },
        None => None,
    };
    BuildOutput {
        basic,
        sparse,
        dense,
    }
}

fn excerpt_of(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= EXCERPT_CHARS {
        trimmed.to_string()
    } else {
        trimmed.chars().take(EXCERPT_CHARS).collect()
    }
}

fn build_basic(records: &[IndexableRecord]) -> BasicArtifact {
    let entries = records
        .iter()
        .map(|r| BasicEntry {
            id: r.id.clone(),
            kind: r.kind,
            title: r.title.clone(),
            text_lower: format!("{}\n{}", r.title, r.body).to_lowercase(),
            excerpt: excerpt_of(&r.body),
            chunk_index: r.chunk_index,
            parent_document_id: r.parent_document_id.clone(),
            attachment_id: r.attachment_id.clone(),
        })
        .collect();
    BasicArtifact { entries }
}

fn build_sparse(records: &[IndexableRecord]) -> SparseArtifact {
    let mut doc_len: BTreeMap<String, u32> = BTreeMap::new();
    let mut postings: BTreeMap<String, Vec<Posting>> = BTreeMap::new();
    let mut total_len: u64 = 0;

    for record in records {
        let tokens = tokenize(&format!("{} {}", record.title, record.body));
        total_len += tokens.len() as u64;
        doc_len.insert(record.id.clone(), tokens.len() as u32);

        let mut tf: BTreeMap<String, u32> = BTreeMap::new();
        for token in tokens {
            *tf.entry(token).or_insert(0) += 1;
        }
        for (term, count) in tf {
            postings.entry(term).or_default().push(Posting {
                id: record.id.clone(),
                tf: count,
            });
        }
    }

    let doc_count = records.len();
    let avg_doc_len = if doc_count == 0 {
        0.0
    } else {
        total_len as f64 / doc_count as f64
    };
    SparseArtifact {
        doc_count,
        avg_doc_len,
        doc_len,
        postings,
    }
}

async fn build_dense(
    records: &[IndexableRecord],
    embedder: &dyn Embedder,
) -> anyhow::Result<DenseArtifact> {
    let texts: Vec<String> = records
        .iter()
        .map(|r| format!("{}\n{}", r.title, r.body))
        .collect();
    if texts.is_empty() {
        return Ok(DenseArtifact {
            model: embedder.model_name().to_string(),
            dims: 0,
            entries: Vec::new(),
        });
    }
    let vectors = embedder.embed(&texts).await?;
    anyhow::ensure!(
        vectors.len() == records.len(),
        "embedder returned {} vectors for {} records",
        vectors.len(),
        records.len()
    );
    let dims = vectors.first().map(|v| v.len()).unwrap_or(0);
    let entries = records
        .iter()
        .zip(vectors)
        .map(|(r, vector)| DenseEntry {
            id: r.id.clone(),
            vector,
        })
        .collect();
    Ok(DenseArtifact {
        model: embedder.model_name().to_string(),
        dims,
        entries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::testing::HashEmbedder;
    use crate::models::RecordSource;
    use chrono::Utc;

    fn sample_faq(question: &str, answer: &str) -> FaqRecord {
        FaqRecord {
            id: ident::mint("faq", &["95", question]),
            project_id: "95".to_string(),
            question: question.to_string(),
            answer: answer.to_string(),
            source: RecordSource::Manual,
            created_at: Utc::now(),
        }
    }

    fn sample_kb(title: &str, content: &str, chunk: u32) -> KbRecord {
        KbRecord {
            id: ident::mint("kb", &["95", title, &chunk.to_string()]),
            project_id: "95".to_string(),
            article_title: title.to_string(),
            content: content.to_string(),
            source: RecordSource::Upload,
            chunk_index: Some(chunk),
            parent_document_id: Some("doc".to_string()),
            attachment_id: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn tokenize_lowercases_and_filters_stop_words() {
        let tokens = tokenize("What is the Refund Policy?");
        assert_eq!(tokens, vec!["refund", "policy"]);
    }

    #[test]
    fn fingerprint_changes_with_content_and_returns_on_delete() {
        let faqs = vec![sample_faq("q1", "a1"), sample_faq("q2", "a2")];
        let fp_two = fingerprint(&collect_records(&faqs, &[]));
        let fp_one = fingerprint(&collect_records(&faqs[..1], &[]));
        assert_ne!(fp_two, fp_one);

        // Removing and re-adding the same record restores the fingerprint.
        let fp_two_again = fingerprint(&collect_records(&faqs, &[]));
        assert_eq!(fp_two, fp_two_again);
    }

    #[test]
    fn sparse_build_is_deterministic() {
        let records = collect_records(
            &[sample_faq("refund policy", "thirty day refunds")],
            &[sample_kb("shipping", "orders ship within two days", 0)],
        );
        let a = serde_json::to_vec(&build_sparse(&records)).unwrap();
        let b = serde_json::to_vec(&build_sparse(&records)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn sparse_stats_cover_all_records() {
        let records = collect_records(
            &[sample_faq("refund policy", "thirty day refunds")],
            &[sample_kb("shipping", "orders ship fast", 0)],
        );
        let sparse = build_sparse(&records);
        assert_eq!(sparse.doc_count, 2);
        assert_eq!(sparse.doc_len.len(), 2);
        // "refund" appears in title and body of the FAQ.
        let refund = &sparse.postings["refund"];
        assert_eq!(refund.len(), 1);
        assert_eq!(refund[0].tf, 1);
        let refunds = &sparse.postings["refunds"];
        assert_eq!(refunds[0].tf, 1);
    }

    #[test]
    fn basic_entries_keep_display_metadata() {
        let records = collect_records(&[], &[sample_kb("Policies", "Full policy text.", 3)]);
        let basic = build_basic(&records);
        assert_eq!(basic.entries.len(), 1);
        let entry = &basic.entries[0];
        assert_eq!(entry.kind, SourceKind::Kb);
        assert_eq!(entry.chunk_index, Some(3));
        assert_eq!(entry.parent_document_id.as_deref(), Some("doc"));
        assert!(entry.text_lower.starts_with("policies\n"));
        assert_eq!(entry.excerpt, "Full policy text.");
    }

    #[tokio::test]
    async fn dense_build_uses_embedder_and_failure_is_non_fatal() {
        let records = collect_records(&[sample_faq("q", "a")], &[]);

        let out = build_artifacts(&records, Some(&HashEmbedder { dims: 8 })).await;
        let dense = out.dense.expect("dense artifact");
        assert_eq!(dense.entries.len(), 1);
        assert_eq!(dense.dims, 8);

        let out = build_artifacts(&records, None).await;
        assert!(out.dense.is_none());
        assert!(out.sparse.is_some());
        assert_eq!(out.basic.entries.len(), 1);
    }
}
