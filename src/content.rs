//! Content lifecycle operations.
//!
//! [`ContentApi`] is the single write path for projects, FAQs, KB records,
//! and uploaded documents. Every mutation that changes the indexable record
//! set marks the project's index dirty, so a background rebuild follows:
//!
//! | Operation | Effect | Index effect |
//! |-----------|--------|--------------|
//! | `create_or_update_project` | upsert project row | none |
//! | `deactivate_project` | clear `active` | none |
//! | `add_faq` | upsert FAQ by minted id | mark dirty |
//! | `delete_faq` | remove if present | mark dirty if removed |
//! | `add_kb` | single-chunk KB upsert | mark dirty |
//! | `delete_kb` | remove; reclaim orphaned attachment | mark dirty if removed |
//! | `upload_document` | extract → N chunks + attachment, one atomic batch | mark dirty |
//! | `get_kb` | attachment bytes when present, else the record | none |

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::error::{Result, ServiceError};
use crate::extract::Extractor;
use crate::ident;
use crate::index_manager::IndexManager;
use crate::models::{Attachment, FaqRecord, KbRecord, Project, RecordSource};
use crate::storage::Storage;

/// Result of a document upload.
#[derive(Debug, Clone, Serialize)]
pub struct UploadOutcome {
    pub document_id: String,
    pub attachment_id: String,
    pub chunks_created: usize,
    pub index_build_started: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_count: Option<usize>,
    pub word_count: usize,
}

/// What `get_kb` resolved to.
pub enum KbFetch {
    /// The record came from an upload; the original bytes are preserved.
    Attachment {
        meta: Attachment,
        bytes: Vec<u8>,
        record: KbRecord,
    },
    /// A manual record with no attachment.
    Record(KbRecord),
}

pub struct ContentApi {
    storage: Arc<dyn Storage>,
    extractor: Arc<dyn Extractor>,
    index: IndexManager,
}

impl ContentApi {
    pub fn new(
        storage: Arc<dyn Storage>,
        extractor: Arc<dyn Extractor>,
        index: IndexManager,
    ) -> Self {
        Self {
            storage,
            extractor,
            index,
        }
    }

    // ---- projects ----

    pub async fn list_projects(&self) -> Result<Vec<Project>> {
        self.storage.list_projects().await
    }

    pub async fn create_or_update_project(
        &self,
        id: &str,
        name: &str,
        active: bool,
    ) -> Result<Project> {
        let now = Utc::now();
        let project = match self.storage.get_project(id).await? {
            Some(mut existing) => {
                existing.name = name.to_string();
                existing.active = active;
                existing.updated_at = now;
                existing
            }
            None => Project {
                id: id.to_string(),
                name: name.to_string(),
                active,
                created_at: now,
                updated_at: now,
            },
        };
        self.storage.put_project(&project).await?;
        Ok(project)
    }

    pub async fn deactivate_project(&self, id: &str) -> Result<()> {
        let mut project = self
            .storage
            .get_project(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("project '{}' not found", id)))?;
        project.active = false;
        project.updated_at = Utc::now();
        self.storage.put_project(&project).await
    }

    /// Project row, or `NotFound`. Used by handlers that require existence.
    pub async fn require_project(&self, id: &str) -> Result<Project> {
        self.storage
            .get_project(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("project '{}' not found", id)))
    }

    // ---- FAQs ----

    pub async fn list_faqs(&self, project_id: &str) -> Result<Vec<FaqRecord>> {
        self.require_project(project_id).await?;
        self.storage.list_faqs(project_id).await
    }

    /// Upsert a FAQ. Identical `(project, question)` pairs mint the same id
    /// and overwrite in place.
    pub async fn add_faq(&self, project_id: &str, question: &str, answer: &str) -> Result<FaqRecord> {
        let question = question.trim();
        let answer = answer.trim();
        if question.is_empty() || answer.is_empty() {
            return Err(ServiceError::BadRequest(
                "question and answer must not be empty".to_string(),
            ));
        }
        self.require_project(project_id).await?;

        let faq = FaqRecord {
            id: ident::mint("faq", &[project_id, question]),
            project_id: project_id.to_string(),
            question: question.to_string(),
            answer: answer.to_string(),
            source: RecordSource::Manual,
            created_at: Utc::now(),
        };
        self.storage.put_faq(project_id, faq.clone()).await?;
        self.index.mark_dirty(project_id).await?;
        Ok(faq)
    }

    pub async fn get_faq(&self, project_id: &str, id: &str) -> Result<FaqRecord> {
        let faqs = self.storage.list_faqs(project_id).await?;
        faqs.into_iter()
            .find(|f| f.id == id)
            .ok_or_else(|| ServiceError::NotFound(format!("FAQ '{}' not found", id)))
    }

    pub async fn delete_faq(&self, project_id: &str, id: &str) -> Result<bool> {
        self.require_project(project_id).await?;
        let removed = self.storage.delete_faq(project_id, id).await?;
        if removed {
            self.index.mark_dirty(project_id).await?;
        }
        Ok(removed)
    }

    // ---- KB ----

    pub async fn list_kb(&self, project_id: &str) -> Result<Vec<KbRecord>> {
        self.require_project(project_id).await?;
        self.storage.list_kb(project_id).await
    }

    /// Upsert a manual single-chunk KB article.
    pub async fn add_kb(&self, project_id: &str, title: &str, content: &str) -> Result<KbRecord> {
        let title = title.trim();
        if title.is_empty() || content.trim().is_empty() {
            return Err(ServiceError::BadRequest(
                "title and content must not be empty".to_string(),
            ));
        }
        self.require_project(project_id).await?;

        let record = KbRecord {
            id: ident::mint("kb", &[project_id, title, "0"]),
            project_id: project_id.to_string(),
            article_title: title.to_string(),
            content: content.to_string(),
            source: RecordSource::Manual,
            chunk_index: Some(0),
            parent_document_id: None,
            attachment_id: None,
            created_at: Utc::now(),
        };
        self.storage.put_kb(project_id, record.clone()).await?;
        self.index.mark_dirty(project_id).await?;
        Ok(record)
    }

    /// Fetch a KB record, preferring the preserved original upload bytes.
    pub async fn get_kb(&self, project_id: &str, id: &str) -> Result<KbFetch> {
        let kb = self.storage.list_kb(project_id).await?;
        let record = kb
            .into_iter()
            .find(|r| r.id == id)
            .ok_or_else(|| ServiceError::NotFound(format!("KB record '{}' not found", id)))?;

        if let Some(attachment_id) = &record.attachment_id {
            if let Some((meta, bytes)) = self.storage.get_attachment(project_id, attachment_id).await? {
                return Ok(KbFetch::Attachment {
                    meta,
                    bytes,
                    record,
                });
            }
        }
        Ok(KbFetch::Record(record))
    }

    pub async fn delete_kb(&self, project_id: &str, id: &str) -> Result<bool> {
        self.require_project(project_id).await?;
        let removed = self.storage.delete_kb(project_id, id).await?;
        if removed {
            self.index.mark_dirty(project_id).await?;
        }
        Ok(removed)
    }

    // ---- documents ----

    /// Extract an uploaded document into KB chunks sharing one parent
    /// document id and one preserved attachment, applied as a single atomic
    /// batch, then kick off a rebuild. Re-uploading a title replaces the
    /// document wholesale: chunks beyond the new count are removed and the
    /// superseded attachment is reclaimed.
    pub async fn upload_document(
        &self,
        project_id: &str,
        bytes: &[u8],
        mime: &str,
        title: &str,
    ) -> Result<UploadOutcome> {
        self.require_project(project_id).await?;
        if bytes.is_empty() {
            return Err(ServiceError::EmptyContent);
        }
        let title = if title.trim().is_empty() {
            "Untitled Document"
        } else {
            title.trim()
        };

        let (chunks, meta) = self.extractor.extract(bytes, mime, title)?;

        let attachment = self
            .storage
            .put_attachment(project_id, bytes, mime, title)
            .await?;
        let document_id = ident::mint("doc", &[project_id, title]);

        let now = Utc::now();
        let records: Vec<KbRecord> = chunks
            .iter()
            .map(|chunk| KbRecord {
                id: ident::mint(
                    "kb",
                    &[project_id, title, &chunk.chunk_index.to_string()],
                ),
                project_id: project_id.to_string(),
                article_title: title.to_string(),
                content: chunk.text.clone(),
                source: RecordSource::Upload,
                chunk_index: Some(chunk.chunk_index),
                parent_document_id: Some(document_id.clone()),
                attachment_id: Some(attachment.id.clone()),
                created_at: now,
            })
            .collect();
        let chunks_created = records.len();

        self.storage.put_kb_batch(project_id, records).await?;
        self.index.mark_dirty(project_id).await?;
        info!(
            project = project_id,
            document = %document_id,
            chunks = chunks_created,
            "document ingested"
        );

        Ok(UploadOutcome {
            document_id,
            attachment_id: attachment.id,
            chunks_created,
            index_build_started: true,
            page_count: meta.page_count,
            word_count: meta.word_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::{DefaultExtractor, ExtractedChunk, ExtractionMeta};
    use crate::storage_memory::MemoryStorage;
    use uuid::Uuid;

    async fn api() -> (ContentApi, Arc<dyn Storage>) {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let index = IndexManager::new(storage.clone(), None);
        let api = ContentApi::new(storage.clone(), Arc::new(DefaultExtractor), index);
        api.create_or_update_project("95", "ASPCA", true).await.unwrap();
        (api, storage)
    }

    /// One chunk per paragraph, regardless of length. Lets tests control
    /// the chunk count of an upload precisely.
    struct ParagraphExtractor;

    impl crate::extract::Extractor for ParagraphExtractor {
        fn extract(
            &self,
            bytes: &[u8],
            _mime: &str,
            _title: &str,
        ) -> crate::error::Result<(Vec<ExtractedChunk>, ExtractionMeta)> {
            let text = String::from_utf8_lossy(bytes);
            let chunks: Vec<ExtractedChunk> = text
                .split("\n\n")
                .filter(|p| !p.trim().is_empty())
                .enumerate()
                .map(|(i, p)| ExtractedChunk {
                    chunk_index: i as u32,
                    text: p.trim().to_string(),
                })
                .collect();
            if chunks.is_empty() {
                return Err(ServiceError::EmptyContent);
            }
            let meta = ExtractionMeta {
                page_count: None,
                word_count: text.split_whitespace().count(),
            };
            Ok((chunks, meta))
        }
    }

    async fn api_with_paragraph_extractor() -> (ContentApi, Arc<dyn Storage>) {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let index = IndexManager::new(storage.clone(), None);
        let api = ContentApi::new(storage.clone(), Arc::new(ParagraphExtractor), index);
        api.create_or_update_project("95", "ASPCA", true).await.unwrap();
        (api, storage)
    }

    #[tokio::test]
    async fn faq_id_is_minted_deterministically() {
        let (api, _storage) = api().await;
        let faq = api
            .add_faq("95", "What does ASPCA stand for?", "American Society.")
            .await
            .unwrap();
        let expected = Uuid::new_v5(
            &Uuid::NAMESPACE_URL,
            b"faq|95|What does ASPCA stand for?",
        )
        .to_string();
        assert_eq!(faq.id, expected);
    }

    #[tokio::test]
    async fn duplicate_faq_upserts_in_place() {
        let (api, _storage) = api().await;
        let first = api.add_faq("95", "q?", "first answer").await.unwrap();
        let second = api.add_faq("95", "q?", "second answer").await.unwrap();
        assert_eq!(first.id, second.id);

        let faqs = api.list_faqs("95").await.unwrap();
        assert_eq!(faqs.len(), 1);
        assert_eq!(faqs[0].answer, "second answer");
    }

    #[tokio::test]
    async fn unknown_project_is_not_found() {
        let (api, _storage) = api().await;
        assert!(matches!(
            api.add_faq("missing", "q", "a").await.unwrap_err(),
            ServiceError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn upload_creates_chunks_sharing_parent_and_attachment() {
        let (api, _storage) = api().await;
        let text = "Paragraph one about the shelter.\n\nParagraph two about adoptions.";
        let outcome = api
            .upload_document("95", text.as_bytes(), "text/plain", "Shelter Guide")
            .await
            .unwrap();
        assert_eq!(outcome.chunks_created, 1);
        assert!(outcome.index_build_started);

        let kb = api.list_kb("95").await.unwrap();
        assert_eq!(kb.len(), 1);
        assert_eq!(kb[0].parent_document_id.as_deref(), Some(outcome.document_id.as_str()));
        assert_eq!(kb[0].attachment_id.as_deref(), Some(outcome.attachment_id.as_str()));
        assert_eq!(kb[0].source, RecordSource::Upload);
    }

    #[tokio::test]
    async fn get_kb_returns_original_bytes_for_uploads() {
        let (api, _storage) = api().await;
        let bytes = b"Original file content, byte for byte.";
        let outcome = api
            .upload_document("95", bytes, "text/plain", "Raw")
            .await
            .unwrap();
        let kb = api.list_kb("95").await.unwrap();

        match api.get_kb("95", &kb[0].id).await.unwrap() {
            KbFetch::Attachment { meta, bytes: got, .. } => {
                assert_eq!(got, bytes);
                assert_eq!(meta.mime, "text/plain");
                assert_eq!(meta.id, outcome.attachment_id);
            }
            KbFetch::Record(_) => panic!("expected attachment bytes"),
        }
    }

    #[tokio::test]
    async fn manual_kb_resolves_to_record() {
        let (api, _storage) = api().await;
        let record = api.add_kb("95", "Hours", "Open nine to five.").await.unwrap();
        match api.get_kb("95", &record.id).await.unwrap() {
            KbFetch::Record(r) => assert_eq!(r.content, "Open nine to five."),
            KbFetch::Attachment { .. } => panic!("manual record has no attachment"),
        }
    }

    #[tokio::test]
    async fn zero_byte_upload_is_empty_content() {
        let (api, _storage) = api().await;
        assert!(matches!(
            api.upload_document("95", b"", "text/plain", "t").await.unwrap_err(),
            ServiceError::EmptyContent
        ));
    }

    #[tokio::test]
    async fn reupload_same_title_replaces_chunks() {
        let (api, _storage) = api().await;
        api.upload_document("95", b"first version", "text/plain", "Doc")
            .await
            .unwrap();
        let first_att = api.list_kb("95").await.unwrap()[0]
            .attachment_id
            .clone()
            .unwrap();

        api.upload_document("95", b"second version", "text/plain", "Doc")
            .await
            .unwrap();
        let kb = api.list_kb("95").await.unwrap();
        assert_eq!(kb.len(), 1);

        // The replaced attachment was reclaimed.
        match api.get_kb("95", &kb[0].id).await.unwrap() {
            KbFetch::Attachment { meta, bytes, .. } => {
                assert_ne!(meta.id, first_att);
                assert_eq!(bytes, b"second version");
            }
            KbFetch::Record(_) => panic!("expected attachment"),
        }
    }

    #[tokio::test]
    async fn shrinking_reupload_removes_stale_chunks_and_attachment() {
        let (api, storage) = api_with_paragraph_extractor().await;

        let outcome = api
            .upload_document(
                "95",
                b"Chunk one.\n\nChunk two.\n\nChunk three.",
                "text/plain",
                "Doc",
            )
            .await
            .unwrap();
        assert_eq!(outcome.chunks_created, 3);
        let first_att = outcome.attachment_id.clone();

        let outcome = api
            .upload_document("95", b"Only chunk.", "text/plain", "Doc")
            .await
            .unwrap();
        assert_eq!(outcome.chunks_created, 1);

        // The old tail chunks are gone, not stranded.
        let kb = storage.list_kb("95").await.unwrap();
        assert_eq!(kb.len(), 1);
        assert_eq!(kb[0].chunk_index, Some(0));
        assert_eq!(kb[0].content, "Only chunk.");
        assert_eq!(
            kb[0].attachment_id.as_deref(),
            Some(outcome.attachment_id.as_str())
        );

        // With no referrers left, the superseded attachment was reclaimed.
        assert!(storage.get_attachment("95", &first_att).await.unwrap().is_none());
        assert!(storage
            .get_attachment("95", &outcome.attachment_id)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn deactivate_then_delete_roundtrip() {
        let (api, _storage) = api().await;
        let faq = api.add_faq("95", "q", "a").await.unwrap();
        assert!(api.delete_faq("95", &faq.id).await.unwrap());
        assert!(!api.delete_faq("95", &faq.id).await.unwrap());

        api.deactivate_project("95").await.unwrap();
        let project = api.require_project("95").await.unwrap();
        assert!(!project.active);
    }
}
