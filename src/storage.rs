//! Storage abstraction.
//!
//! The [`Storage`] trait defines all per-project persistence the service
//! needs: FAQ and KB records, preserved attachment bytes, and versioned
//! index artifacts. Backends are selected once at construction; everything
//! above this trait is backend-agnostic.
//!
//! | Backend | `STORAGE_TYPE` | Module |
//! |---------|---------------|--------|
//! | Local filesystem | `file` | [`crate::storage_file`] |
//! | In-memory (tests) | — | [`crate::storage_memory`] |
//! | File share / blob / document DB | `fileshare` / `blob` / `doc_db` | external adapters |
//!
//! # Guarantees
//!
//! - Each operation is atomic with respect to single-record readers.
//! - No cross-project visibility.
//! - Per-project writes are serialized; reads are concurrent.
//! - List operations return records in insertion order; upserts keep the
//!   original position.
//! - Deleting the last KB record that references an attachment also deletes
//!   the attachment.

use anyhow::bail;
use async_trait::async_trait;
use std::sync::Arc;

use crate::config::{Config, StorageType};
use crate::error::Result;
use crate::models::{Attachment, ArtifactKind, FaqRecord, IndexVersionMeta, KbRecord, Project};
use crate::storage_file::FileStorage;

/// Abstract per-project persistence backend.
#[async_trait]
pub trait Storage: Send + Sync {
    // Projects
    async fn list_projects(&self) -> Result<Vec<Project>>;
    async fn get_project(&self, project_id: &str) -> Result<Option<Project>>;
    async fn put_project(&self, project: &Project) -> Result<()>;

    // Records
    async fn list_faqs(&self, project_id: &str) -> Result<Vec<FaqRecord>>;
    async fn list_kb(&self, project_id: &str) -> Result<Vec<KbRecord>>;

    /// Upsert by id. Returns the prior record if one was replaced.
    async fn put_faq(&self, project_id: &str, faq: FaqRecord) -> Result<Option<FaqRecord>>;

    /// Upsert by id. Returns the prior record if one was replaced.
    async fn put_kb(&self, project_id: &str, record: KbRecord) -> Result<Option<KbRecord>>;

    /// Atomically upsert a batch of KB records: either all are applied or
    /// none are. A batch replaces its documents wholesale: existing records
    /// that share a `parent_document_id` with the batch but are absent from
    /// it are removed, and attachments left without referrers are reclaimed
    /// (a re-upload with fewer chunks must not strand the old tail).
    async fn put_kb_batch(&self, project_id: &str, records: Vec<KbRecord>) -> Result<()>;

    /// Returns whether a record was removed.
    async fn delete_faq(&self, project_id: &str, id: &str) -> Result<bool>;

    /// Returns whether a record was removed. If the removed record's
    /// attachment has no other referrers, the attachment is deleted too.
    async fn delete_kb(&self, project_id: &str, id: &str) -> Result<bool>;

    // Attachments
    async fn put_attachment(
        &self,
        project_id: &str,
        bytes: &[u8],
        mime: &str,
        original_name: &str,
    ) -> Result<Attachment>;

    async fn get_attachment(
        &self,
        project_id: &str,
        id: &str,
    ) -> Result<Option<(Attachment, Vec<u8>)>>;

    // Index artifacts
    async fn put_index_artifact(
        &self,
        project_id: &str,
        version: u64,
        kind: ArtifactKind,
        bytes: &[u8],
    ) -> Result<()>;

    async fn get_index_artifact(
        &self,
        project_id: &str,
        version: u64,
        kind: ArtifactKind,
    ) -> Result<Option<Vec<u8>>>;

    /// The meta record whose single store publishes a version.
    async fn get_current_index_meta(&self, project_id: &str) -> Result<Option<IndexVersionMeta>>;
    async fn set_current_index_meta(&self, project_id: &str, meta: &IndexVersionMeta)
        -> Result<()>;

    /// Versions with artifacts still on storage, ascending.
    async fn list_index_versions(&self, project_id: &str) -> Result<Vec<u64>>;
    async fn delete_index_version(&self, project_id: &str, version: u64) -> Result<()>;
}

/// Construct the configured Storage backend.
///
/// The cloud adapters (`fileshare`, `blob`, `doc_db`) live outside this
/// binary; selecting one here is a startup error so that a misconfigured
/// deployment fails immediately rather than at first write.
pub fn create_storage(config: &Config) -> anyhow::Result<Arc<dyn Storage>> {
    match config.storage_type {
        StorageType::File => Ok(Arc::new(FileStorage::new(&config.storage_root)?)),
        StorageType::FileShare | StorageType::Blob | StorageType::DocDb => {
            bail!("storage backend not built into this binary; deploy with STORAGE_TYPE=file")
        }
    }
}
