//! Hybrid retrieval over a published index snapshot.
//!
//! A query fans out over the providers that exist — dense cosine similarity,
//! sparse BM25, and the always-available basic substring table — and the
//! ranked lists are merged with reciprocal-rank fusion:
//!
//! ```text
//! fused(id) = Σ over lists containing id of 1 / (60 + rank)
//! ```
//!
//! The fusion code never branches on which providers are configured beyond
//! "include the lists that produced results", which is what makes the
//! fallback ladder (dense+sparse+basic → sparse+basic → basic) free of
//! special cases. Chunks sharing a `parent_document_id` are collapsed into
//! the highest-ranked chunk. Results below the score floor are dropped and
//! the list is truncated to `k`.
//!
//! When a project has no published index yet, a transient basic table is
//! built from the live records so freshly-created projects are queryable.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use crate::embedding::{cosine_similarity, Embedder};
use crate::error::Result;
use crate::index::{self, BasicArtifact, SparseArtifact};
use crate::index_manager::IndexManager;
use crate::models::{Source, SourceKind};
use crate::storage::Storage;

/// BM25 term-frequency saturation.
const BM25_K1: f64 = 1.2;
/// BM25 length normalization.
const BM25_B: f64 = 0.75;
/// Reciprocal-rank fusion constant.
const RRF_K: f64 = 60.0;
/// Results with a fused score below this are dropped.
const SCORE_FLOOR: f64 = 1.0 / 120.0;

pub struct Retriever {
    storage: Arc<dyn Storage>,
    index: IndexManager,
    embedder: Option<Arc<dyn Embedder>>,
}

/// One (id, score) list from a single provider, ranked best-first.
type RankedList = Vec<(String, f64)>;

/// Fused retrieval output.
///
/// `top_fused` carries the best post-fusion score, which the orchestrator
/// compares against its sufficiency floor when deciding whether a web
/// search is warranted.
pub struct Retrieval {
    pub sources: Vec<Source>,
    pub top_fused: Option<f64>,
}

impl Retriever {
    pub fn new(
        storage: Arc<dyn Storage>,
        index: IndexManager,
        embedder: Option<Arc<dyn Embedder>>,
    ) -> Self {
        Self {
            storage,
            index,
            embedder,
        }
    }

    /// Top-`k` sources for a query, fused and deduplicated.
    pub async fn search(&self, project_id: &str, query: &str, k: usize) -> Result<Retrieval> {
        if k == 0 || query.trim().is_empty() {
            return Ok(Retrieval {
                sources: Vec::new(),
                top_fused: None,
            });
        }
        let candidate_n = (k * 4).max(20);

        // Snapshot pins the artifacts for the duration of the query.
        let snapshot = self.index.snapshot(project_id).await?;
        let (basic, sparse, dense) = match &snapshot {
            Some(s) => (
                std::borrow::Cow::Borrowed(&s.basic),
                s.sparse.as_ref(),
                s.dense.as_ref(),
            ),
            None => {
                let faqs = self.storage.list_faqs(project_id).await?;
                let kb = self.storage.list_kb(project_id).await?;
                let records = index::collect_records(&faqs, &kb);
                let output = index::build_artifacts(&records, None).await;
                (std::borrow::Cow::Owned(output.basic), None, None)
            }
        };

        let mut lists: Vec<RankedList> = Vec::new();

        if let (Some(dense), Some(embedder)) = (dense, self.embedder.as_ref()) {
            match embedder.embed(&[query.to_string()]).await {
                Ok(vectors) => {
                    if let Some(query_vec) = vectors.first() {
                        lists.push(dense_list(dense, query_vec, candidate_n));
                    }
                }
                Err(e) => {
                    warn!(error = %e, "query embedding failed; skipping dense retrieval");
                }
            }
        }
        if let Some(sparse) = sparse {
            lists.push(sparse_list(sparse, query, candidate_n));
        }
        lists.push(basic_list(&basic, query, candidate_n));

        let fused = fuse(&lists);
        Ok(assemble(project_id, &basic, fused, k))
    }
}

fn dense_list(
    dense: &crate::index::DenseArtifact,
    query_vec: &[f32],
    n: usize,
) -> RankedList {
    let mut scored: RankedList = dense
        .entries
        .iter()
        .map(|e| (e.id.clone(), cosine_similarity(query_vec, &e.vector) as f64))
        .collect();
    sort_ranked(&mut scored);
    scored.truncate(n);
    scored
}

fn sparse_list(sparse: &SparseArtifact, query: &str, n: usize) -> RankedList {
    let terms = index::tokenize(query);
    if terms.is_empty() || sparse.doc_count == 0 {
        return Vec::new();
    }

    let mut scores: HashMap<&str, f64> = HashMap::new();
    for term in &terms {
        let postings = match sparse.postings.get(term) {
            Some(p) => p,
            None => continue,
        };
        let df = postings.len() as f64;
        let idf = (1.0 + (sparse.doc_count as f64 - df + 0.5) / (df + 0.5)).ln();
        for posting in postings {
            let len = *sparse.doc_len.get(&posting.id).unwrap_or(&0) as f64;
            let norm = 1.0 - BM25_B + BM25_B * len / sparse.avg_doc_len.max(1.0);
            let tf = posting.tf as f64;
            let term_score = idf * tf / (tf + BM25_K1 * norm);
            *scores.entry(posting.id.as_str()).or_insert(0.0) += term_score;
        }
    }

    let mut scored: RankedList = scores
        .into_iter()
        .filter(|(_, s)| *s > 0.0)
        .map(|(id, s)| (id.to_string(), s))
        .collect();
    sort_ranked(&mut scored);
    scored.truncate(n);
    scored
}

fn basic_list(basic: &BasicArtifact, query: &str, n: usize) -> RankedList {
    let tokens: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect();
    if tokens.is_empty() {
        return Vec::new();
    }

    let mut scored: RankedList = basic
        .entries
        .iter()
        .filter_map(|entry| {
            let matched = tokens
                .iter()
                .filter(|t| entry.text_lower.contains(t.as_str()))
                .count();
            if matched == 0 {
                return None;
            }
            Some((entry.id.clone(), matched as f64 / tokens.len() as f64))
        })
        .collect();
    sort_ranked(&mut scored);
    scored.truncate(n);
    scored
}

fn sort_ranked(list: &mut RankedList) {
    list.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
}

struct FusedCandidate {
    id: String,
    fused: f64,
    best_individual: f64,
}

/// Reciprocal-rank fusion across the available lists.
fn fuse(lists: &[RankedList]) -> Vec<FusedCandidate> {
    let mut by_id: HashMap<&str, (f64, f64)> = HashMap::new();
    for list in lists {
        for (rank0, (id, score)) in list.iter().enumerate() {
            let rrf = 1.0 / (RRF_K + (rank0 + 1) as f64);
            let entry = by_id.entry(id.as_str()).or_insert((0.0, f64::MIN));
            entry.0 += rrf;
            entry.1 = entry.1.max(*score);
        }
    }
    by_id
        .into_iter()
        .map(|(id, (fused, best))| FusedCandidate {
            id: id.to_string(),
            fused,
            best_individual: best,
        })
        .collect()
}

/// Dedup by parent document, order, apply the floor, truncate, and resolve
/// display metadata from the basic table.
fn assemble(
    project_id: &str,
    basic: &BasicArtifact,
    candidates: Vec<FusedCandidate>,
    k: usize,
) -> Retrieval {
    // Collapse chunks of the same document into the best-ranked chunk.
    let mut best_per_group: HashMap<String, FusedCandidate> = HashMap::new();
    for candidate in candidates {
        let entry = match basic.entry(&candidate.id) {
            Some(e) => e,
            None => continue,
        };
        let group_key = entry
            .parent_document_id
            .clone()
            .unwrap_or_else(|| candidate.id.clone());
        match best_per_group.get_mut(&group_key) {
            Some(existing) if existing.fused >= candidate.fused => {}
            _ => {
                best_per_group.insert(group_key, candidate);
            }
        }
    }

    let mut winners: Vec<FusedCandidate> = best_per_group.into_values().collect();
    winners.retain(|c| c.fused >= SCORE_FLOOR);
    winners.sort_by(|a, b| {
        b.fused
            .partial_cmp(&a.fused)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                let chunk_a = basic.entry(&a.id).and_then(|e| e.chunk_index).unwrap_or(0);
                let chunk_b = basic.entry(&b.id).and_then(|e| e.chunk_index).unwrap_or(0);
                chunk_a.cmp(&chunk_b)
            })
            .then_with(|| a.id.cmp(&b.id))
    });
    winners.truncate(k);
    let top_fused = winners.first().map(|c| c.fused);

    let sources = winners
        .into_iter()
        .filter_map(|candidate| {
            let entry = basic.entry(&candidate.id)?;
            let attachment_url = entry
                .attachment_id
                .as_ref()
                .map(|_| format!("/v1/projects/{}/kb/{}", project_id, entry.id));
            Some(Source {
                id: entry.id.clone(),
                kind: entry.kind,
                title: match entry.kind {
                    SourceKind::Faq => format!("FAQ: {}", entry.title),
                    SourceKind::Kb => entry.title.clone(),
                },
                excerpt: entry.excerpt.clone(),
                score: candidate.best_individual,
                attachment_url,
            })
        })
        .collect();
    Retrieval { sources, top_fused }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{BasicEntry, Posting};
    use std::collections::BTreeMap;

    fn entry(id: &str, title: &str, body: &str) -> BasicEntry {
        BasicEntry {
            id: id.to_string(),
            kind: SourceKind::Kb,
            title: title.to_string(),
            text_lower: format!("{}\n{}", title, body).to_lowercase(),
            excerpt: body.to_string(),
            chunk_index: None,
            parent_document_id: None,
            attachment_id: None,
        }
    }

    #[test]
    fn basic_scoring_is_token_coverage() {
        let basic = BasicArtifact {
            entries: vec![
                entry("a", "Refund policy", "Thirty day refunds."),
                entry("b", "Shipping", "Orders ship in two days."),
            ],
        };
        let list = basic_list(&basic, "refund policy", 20);
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].0, "a");
        assert!((list[0].1 - 1.0).abs() < 1e-9);

        let partial = basic_list(&basic, "refund shipping", 20);
        assert_eq!(partial.len(), 2);
        assert!((partial[0].1 - 0.5).abs() < 1e-9);
    }

    #[test]
    fn bm25_prefers_rarer_terms() {
        let mut postings: BTreeMap<String, Vec<Posting>> = BTreeMap::new();
        postings.insert(
            "common".to_string(),
            vec![
                Posting { id: "a".into(), tf: 1 },
                Posting { id: "b".into(), tf: 1 },
                Posting { id: "c".into(), tf: 1 },
            ],
        );
        postings.insert(
            "rare".to_string(),
            vec![Posting { id: "b".into(), tf: 1 }],
        );
        let mut doc_len = BTreeMap::new();
        for id in ["a", "b", "c"] {
            doc_len.insert(id.to_string(), 10);
        }
        let sparse = SparseArtifact {
            doc_count: 3,
            avg_doc_len: 10.0,
            doc_len,
            postings,
        };

        let list = sparse_list(&sparse, "common rare", 20);
        assert_eq!(list[0].0, "b");
        assert!(list[0].1 > list[1].1);
    }

    #[test]
    fn fusion_sums_reciprocal_ranks() {
        let lists = vec![
            vec![("a".to_string(), 0.9), ("b".to_string(), 0.5)],
            vec![("b".to_string(), 3.0), ("a".to_string(), 1.0)],
        ];
        let fused = fuse(&lists);
        let a = fused.iter().find(|c| c.id == "a").unwrap();
        let b = fused.iter().find(|c| c.id == "b").unwrap();
        // Both appear at ranks 1 and 2 across the two lists.
        let expected = 1.0 / 61.0 + 1.0 / 62.0;
        assert!((a.fused - expected).abs() < 1e-12);
        assert!((b.fused - expected).abs() < 1e-12);
        assert!((a.best_individual - 1.0).abs() < 1e-12);
        assert!((b.best_individual - 3.0).abs() < 1e-12);
    }

    #[test]
    fn assemble_dedups_chunks_of_one_document() {
        let mut chunk0 = entry("c0", "Doc", "chunk zero");
        chunk0.chunk_index = Some(0);
        chunk0.parent_document_id = Some("doc".to_string());
        let mut chunk1 = entry("c1", "Doc", "chunk one");
        chunk1.chunk_index = Some(1);
        chunk1.parent_document_id = Some("doc".to_string());
        let basic = BasicArtifact {
            entries: vec![chunk0, chunk1],
        };

        let candidates = vec![
            FusedCandidate {
                id: "c0".into(),
                fused: 0.02,
                best_individual: 0.4,
            },
            FusedCandidate {
                id: "c1".into(),
                fused: 0.05,
                best_individual: 0.9,
            },
        ];
        let retrieval = assemble("95", &basic, candidates, 5);
        assert_eq!(retrieval.sources.len(), 1);
        assert_eq!(retrieval.sources[0].id, "c1");
        assert_eq!(retrieval.sources[0].excerpt, "chunk one");
        assert!((retrieval.top_fused.unwrap() - 0.05).abs() < 1e-12);
    }

    #[test]
    fn assemble_applies_floor_and_truncation() {
        let basic = BasicArtifact {
            entries: vec![entry("a", "A", "a"), entry("b", "B", "b"), entry("c", "C", "c")],
        };
        let candidates = vec![
            FusedCandidate { id: "a".into(), fused: 0.05, best_individual: 1.0 },
            FusedCandidate { id: "b".into(), fused: 0.02, best_individual: 1.0 },
            FusedCandidate { id: "c".into(), fused: 0.001, best_individual: 1.0 },
        ];
        let retrieval = assemble("95", &basic, candidates, 1);
        assert_eq!(retrieval.sources.len(), 1);
        assert_eq!(retrieval.sources[0].id, "a");

        let candidates = vec![FusedCandidate {
            id: "c".into(),
            fused: 0.001, // below 1/120
            best_individual: 1.0,
        }];
        let retrieval = assemble("95", &basic, candidates, 5);
        assert!(retrieval.sources.is_empty());
        assert!(retrieval.top_fused.is_none());
    }

    #[test]
    fn ties_break_on_chunk_index_then_id() {
        let mut e1 = entry("zz", "Doc A", "text");
        e1.chunk_index = Some(0);
        let mut e2 = entry("aa", "Doc B", "text");
        e2.chunk_index = Some(0);
        let basic = BasicArtifact {
            entries: vec![e1, e2],
        };
        let candidates = vec![
            FusedCandidate { id: "zz".into(), fused: 0.05, best_individual: 1.0 },
            FusedCandidate { id: "aa".into(), fused: 0.05, best_individual: 1.0 },
        ];
        let sources = assemble("95", &basic, candidates, 5).sources;
        assert_eq!(sources[0].id, "aa");
        assert_eq!(sources[1].id, "zz");
    }
}
