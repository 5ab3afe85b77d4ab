//! Local-filesystem Storage backend.
//!
//! Layout under the configured root:
//!
//! ```text
//! <root>/projects.json
//! <root>/projects/<pid>/faqs.json
//! <root>/projects/<pid>/kb.json
//! <root>/projects/<pid>/attachments.json
//! <root>/projects/<pid>/attachments/<att_id>.<ext>
//! <root>/projects/<pid>/index/current.json
//! <root>/projects/<pid>/index/v<version>/{dense,sparse,basic,meta}.json
//! ```
//!
//! Every JSON file is replaced atomically (write to a `.tmp` sibling, then
//! rename), so single-record readers never observe a partial write. Writes
//! within one project are serialized by a per-project async mutex; the
//! project registry has its own lock.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{Attachment, ArtifactKind, FaqRecord, IndexVersionMeta, KbRecord, Project};
use crate::storage::Storage;

pub struct FileStorage {
    root: PathBuf,
    registry_lock: Mutex<()>,
    project_locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FileStorage {
    /// Open (or initialize) a storage root. Fails if the root cannot be
    /// created or written, which the binary reports as "storage unreachable".
    pub fn new(root: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(root.join("projects"))?;
        // Probe writability up front.
        let probe = root.join(".probe");
        std::fs::write(&probe, b"ok")?;
        std::fs::remove_file(&probe)?;
        Ok(Self {
            root: root.to_path_buf(),
            registry_lock: Mutex::new(()),
            project_locks: std::sync::Mutex::new(HashMap::new()),
        })
    }

    fn project_lock(&self, project_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.project_locks.lock().unwrap();
        locks
            .entry(project_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn registry_path(&self) -> PathBuf {
        self.root.join("projects.json")
    }

    fn project_dir(&self, project_id: &str) -> PathBuf {
        self.root.join("projects").join(project_id)
    }

    fn faqs_path(&self, project_id: &str) -> PathBuf {
        self.project_dir(project_id).join("faqs.json")
    }

    fn kb_path(&self, project_id: &str) -> PathBuf {
        self.project_dir(project_id).join("kb.json")
    }

    fn attachments_meta_path(&self, project_id: &str) -> PathBuf {
        self.project_dir(project_id).join("attachments.json")
    }

    fn attachment_file(&self, project_id: &str, attachment: &Attachment) -> PathBuf {
        self.project_dir(project_id)
            .join("attachments")
            .join(format!("{}.{}", attachment.id, ext_for_mime(&attachment.mime)))
    }

    fn index_dir(&self, project_id: &str) -> PathBuf {
        self.project_dir(project_id).join("index")
    }

    fn version_dir(&self, project_id: &str, version: u64) -> PathBuf {
        self.index_dir(project_id).join(format!("v{}", version))
    }

    async fn read_json<T: serde::de::DeserializeOwned>(&self, path: &Path) -> Result<Option<T>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_json<T: serde::Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(value)?;
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn load_faqs(&self, project_id: &str) -> Result<Vec<FaqRecord>> {
        Ok(self
            .read_json(&self.faqs_path(project_id))
            .await?
            .unwrap_or_default())
    }

    async fn load_kb(&self, project_id: &str) -> Result<Vec<KbRecord>> {
        Ok(self
            .read_json(&self.kb_path(project_id))
            .await?
            .unwrap_or_default())
    }

    async fn load_attachments(&self, project_id: &str) -> Result<Vec<Attachment>> {
        Ok(self
            .read_json(&self.attachments_meta_path(project_id))
            .await?
            .unwrap_or_default())
    }

    /// Delete the attachments in `candidates` that no KB record references
    /// anymore. Must run under the project write lock.
    async fn reclaim_attachments(&self, project_id: &str, candidates: &[String]) -> Result<()> {
        if candidates.is_empty() {
            return Ok(());
        }
        let kb = self.load_kb(project_id).await?;
        let mut attachments = self.load_attachments(project_id).await?;
        let mut changed = false;
        for candidate in candidates {
            let still_referenced = kb
                .iter()
                .any(|r| r.attachment_id.as_deref() == Some(candidate.as_str()));
            if still_referenced {
                continue;
            }
            if let Some(pos) = attachments.iter().position(|a| &a.id == candidate) {
                let meta = attachments.remove(pos);
                let file = self.attachment_file(project_id, &meta);
                match tokio::fs::remove_file(&file).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                changed = true;
            }
        }
        if changed {
            self.write_json(&self.attachments_meta_path(project_id), &attachments)
                .await?;
        }
        Ok(())
    }
}

fn ext_for_mime(mime: &str) -> &'static str {
    match mime {
        "application/pdf" => "pdf",
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => "docx",
        m if m.starts_with("text/") => "txt",
        _ => "bin",
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn list_projects(&self) -> Result<Vec<Project>> {
        Ok(self.read_json(&self.registry_path()).await?.unwrap_or_default())
    }

    async fn get_project(&self, project_id: &str) -> Result<Option<Project>> {
        let projects = self.list_projects().await?;
        Ok(projects.into_iter().find(|p| p.id == project_id))
    }

    async fn put_project(&self, project: &Project) -> Result<()> {
        let _guard = self.registry_lock.lock().await;
        let mut projects: Vec<Project> =
            self.read_json(&self.registry_path()).await?.unwrap_or_default();
        match projects.iter_mut().find(|p| p.id == project.id) {
            Some(existing) => *existing = project.clone(),
            None => projects.push(project.clone()),
        }
        self.write_json(&self.registry_path(), &projects).await?;
        tokio::fs::create_dir_all(self.project_dir(&project.id).join("attachments")).await?;
        Ok(())
    }

    async fn list_faqs(&self, project_id: &str) -> Result<Vec<FaqRecord>> {
        self.load_faqs(project_id).await
    }

    async fn list_kb(&self, project_id: &str) -> Result<Vec<KbRecord>> {
        self.load_kb(project_id).await
    }

    async fn put_faq(&self, project_id: &str, faq: FaqRecord) -> Result<Option<FaqRecord>> {
        let lock = self.project_lock(project_id);
        let _guard = lock.lock().await;
        let mut faqs = self.load_faqs(project_id).await?;
        let prior = match faqs.iter_mut().find(|f| f.id == faq.id) {
            Some(existing) => Some(std::mem::replace(existing, faq)),
            None => {
                faqs.push(faq);
                None
            }
        };
        self.write_json(&self.faqs_path(project_id), &faqs).await?;
        Ok(prior)
    }

    async fn put_kb(&self, project_id: &str, record: KbRecord) -> Result<Option<KbRecord>> {
        let lock = self.project_lock(project_id);
        let _guard = lock.lock().await;
        let mut kb = self.load_kb(project_id).await?;
        let prior = match kb.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => Some(std::mem::replace(existing, record)),
            None => {
                kb.push(record);
                None
            }
        };
        self.write_json(&self.kb_path(project_id), &kb).await?;
        if let Some(prior_attachment) = prior.as_ref().and_then(|p| p.attachment_id.clone()) {
            self.reclaim_attachments(project_id, &[prior_attachment])
                .await?;
        }
        Ok(prior)
    }

    async fn put_kb_batch(&self, project_id: &str, records: Vec<KbRecord>) -> Result<()> {
        let lock = self.project_lock(project_id);
        let _guard = lock.lock().await;
        let mut kb = self.load_kb(project_id).await?;
        let mut replaced_attachments: Vec<String> = Vec::new();

        // The batch replaces its documents wholesale: drop existing chunks
        // of the batch's parent documents that the batch no longer carries.
        let batch_ids: HashSet<String> = records.iter().map(|r| r.id.clone()).collect();
        let parents: HashSet<String> = records
            .iter()
            .filter_map(|r| r.parent_document_id.clone())
            .collect();
        kb.retain(|r| {
            let stale = r
                .parent_document_id
                .as_ref()
                .map(|p| parents.contains(p))
                .unwrap_or(false)
                && !batch_ids.contains(&r.id);
            if stale {
                if let Some(att) = &r.attachment_id {
                    replaced_attachments.push(att.clone());
                }
            }
            !stale
        });

        for record in records {
            match kb.iter_mut().find(|r| r.id == record.id) {
                Some(existing) => {
                    let prior = std::mem::replace(existing, record);
                    if let Some(att) = prior.attachment_id {
                        replaced_attachments.push(att);
                    }
                }
                None => kb.push(record),
            }
        }
        // The single rename below is what makes the batch atomic.
        self.write_json(&self.kb_path(project_id), &kb).await?;
        self.reclaim_attachments(project_id, &replaced_attachments)
            .await?;
        Ok(())
    }

    async fn delete_faq(&self, project_id: &str, id: &str) -> Result<bool> {
        let lock = self.project_lock(project_id);
        let _guard = lock.lock().await;
        let mut faqs = self.load_faqs(project_id).await?;
        let before = faqs.len();
        faqs.retain(|f| f.id != id);
        if faqs.len() == before {
            return Ok(false);
        }
        self.write_json(&self.faqs_path(project_id), &faqs).await?;
        Ok(true)
    }

    async fn delete_kb(&self, project_id: &str, id: &str) -> Result<bool> {
        let lock = self.project_lock(project_id);
        let _guard = lock.lock().await;
        let mut kb = self.load_kb(project_id).await?;
        let removed = match kb.iter().position(|r| r.id == id) {
            Some(pos) => kb.remove(pos),
            None => return Ok(false),
        };
        self.write_json(&self.kb_path(project_id), &kb).await?;
        if let Some(att) = removed.attachment_id {
            self.reclaim_attachments(project_id, &[att]).await?;
        }
        Ok(true)
    }

    async fn put_attachment(
        &self,
        project_id: &str,
        bytes: &[u8],
        mime: &str,
        original_name: &str,
    ) -> Result<Attachment> {
        let lock = self.project_lock(project_id);
        let _guard = lock.lock().await;
        let attachment = Attachment {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            mime: mime.to_string(),
            original_name: original_name.to_string(),
            created_at: Utc::now(),
        };
        let file = self.attachment_file(project_id, &attachment);
        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&file, bytes).await?;
        let mut attachments = self.load_attachments(project_id).await?;
        attachments.push(attachment.clone());
        self.write_json(&self.attachments_meta_path(project_id), &attachments)
            .await?;
        Ok(attachment)
    }

    async fn get_attachment(
        &self,
        project_id: &str,
        id: &str,
    ) -> Result<Option<(Attachment, Vec<u8>)>> {
        let attachments = self.load_attachments(project_id).await?;
        let meta = match attachments.into_iter().find(|a| a.id == id) {
            Some(m) => m,
            None => return Ok(None),
        };
        let file = self.attachment_file(project_id, &meta);
        match tokio::fs::read(&file).await {
            Ok(bytes) => Ok(Some((meta, bytes))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put_index_artifact(
        &self,
        project_id: &str,
        version: u64,
        kind: ArtifactKind,
        bytes: &[u8],
    ) -> Result<()> {
        let dir = self.version_dir(project_id, version);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{}.json", kind.as_str()));
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn get_index_artifact(
        &self,
        project_id: &str,
        version: u64,
        kind: ArtifactKind,
    ) -> Result<Option<Vec<u8>>> {
        let path = self
            .version_dir(project_id, version)
            .join(format!("{}.json", kind.as_str()));
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_current_index_meta(&self, project_id: &str) -> Result<Option<IndexVersionMeta>> {
        self.read_json(&self.index_dir(project_id).join("current.json"))
            .await
    }

    async fn set_current_index_meta(
        &self,
        project_id: &str,
        meta: &IndexVersionMeta,
    ) -> Result<()> {
        self.write_json(&self.index_dir(project_id).join("current.json"), meta)
            .await
    }

    async fn list_index_versions(&self, project_id: &str) -> Result<Vec<u64>> {
        let mut versions = Vec::new();
        let mut entries = match tokio::fs::read_dir(self.index_dir(project_id)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(versions),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(rest) = name.strip_prefix('v') {
                if let Ok(version) = rest.parse::<u64>() {
                    versions.push(version);
                }
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }

    async fn delete_index_version(&self, project_id: &str, version: u64) -> Result<()> {
        let dir = self.version_dir(project_id, version);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RecordSource;
    use tempfile::TempDir;

    fn faq(id: &str, question: &str, answer: &str) -> FaqRecord {
        FaqRecord {
            id: id.to_string(),
            project_id: "p1".to_string(),
            question: question.to_string(),
            answer: answer.to_string(),
            source: RecordSource::Manual,
            created_at: Utc::now(),
        }
    }

    fn kb(id: &str, attachment_id: Option<&str>) -> KbRecord {
        KbRecord {
            id: id.to_string(),
            project_id: "p1".to_string(),
            article_title: "Article".to_string(),
            content: "Body".to_string(),
            source: RecordSource::Upload,
            chunk_index: Some(0),
            parent_document_id: Some("doc1".to_string()),
            attachment_id: attachment_id.map(|s| s.to_string()),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn faq_upsert_preserves_insertion_order() {
        let tmp = TempDir::new().unwrap();
        let storage = FileStorage::new(tmp.path()).unwrap();

        storage.put_faq("p1", faq("a", "q1", "a1")).await.unwrap();
        storage.put_faq("p1", faq("b", "q2", "a2")).await.unwrap();
        let prior = storage.put_faq("p1", faq("a", "q1", "updated")).await.unwrap();

        assert_eq!(prior.unwrap().answer, "a1");
        let faqs = storage.list_faqs("p1").await.unwrap();
        assert_eq!(faqs.len(), 2);
        assert_eq!(faqs[0].id, "a");
        assert_eq!(faqs[0].answer, "updated");
        assert_eq!(faqs[1].id, "b");
    }

    #[tokio::test]
    async fn delete_faq_reports_removal() {
        let tmp = TempDir::new().unwrap();
        let storage = FileStorage::new(tmp.path()).unwrap();
        storage.put_faq("p1", faq("a", "q", "a")).await.unwrap();
        assert!(storage.delete_faq("p1", "a").await.unwrap());
        assert!(!storage.delete_faq("p1", "a").await.unwrap());
        assert!(storage.list_faqs("p1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn attachment_roundtrip_is_byte_exact() {
        let tmp = TempDir::new().unwrap();
        let storage = FileStorage::new(tmp.path()).unwrap();
        let bytes = vec![0u8, 159, 146, 150, 255];
        let att = storage
            .put_attachment("p1", &bytes, "application/pdf", "policy.pdf")
            .await
            .unwrap();
        let (meta, restored) = storage.get_attachment("p1", &att.id).await.unwrap().unwrap();
        assert_eq!(restored, bytes);
        assert_eq!(meta.mime, "application/pdf");
        assert_eq!(meta.original_name, "policy.pdf");
    }

    #[tokio::test]
    async fn deleting_last_referrer_reclaims_attachment() {
        let tmp = TempDir::new().unwrap();
        let storage = FileStorage::new(tmp.path()).unwrap();
        let att = storage
            .put_attachment("p1", b"pdf bytes", "application/pdf", "doc.pdf")
            .await
            .unwrap();
        storage
            .put_kb_batch(
                "p1",
                vec![kb("k1", Some(&att.id)), kb("k2", Some(&att.id))],
            )
            .await
            .unwrap();

        assert!(storage.delete_kb("p1", "k1").await.unwrap());
        // One referrer left, attachment stays.
        assert!(storage.get_attachment("p1", &att.id).await.unwrap().is_some());

        assert!(storage.delete_kb("p1", "k2").await.unwrap());
        assert!(storage.get_attachment("p1", &att.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn kb_batch_overwrite_reclaims_orphaned_attachment() {
        let tmp = TempDir::new().unwrap();
        let storage = FileStorage::new(tmp.path()).unwrap();
        let old = storage
            .put_attachment("p1", b"v1", "text/plain", "a.txt")
            .await
            .unwrap();
        storage
            .put_kb_batch("p1", vec![kb("k1", Some(&old.id))])
            .await
            .unwrap();

        let new = storage
            .put_attachment("p1", b"v2", "text/plain", "a.txt")
            .await
            .unwrap();
        storage
            .put_kb_batch("p1", vec![kb("k1", Some(&new.id))])
            .await
            .unwrap();

        assert!(storage.get_attachment("p1", &old.id).await.unwrap().is_none());
        assert!(storage.get_attachment("p1", &new.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn shrinking_kb_batch_drops_stale_sibling_chunks() {
        let tmp = TempDir::new().unwrap();
        let storage = FileStorage::new(tmp.path()).unwrap();
        let old = storage
            .put_attachment("p1", b"v1", "text/plain", "doc.txt")
            .await
            .unwrap();

        let chunk = |id: &str, index: u32, att: &str| {
            let mut record = kb(id, Some(att));
            record.chunk_index = Some(index);
            record
        };
        storage
            .put_kb_batch(
                "p1",
                vec![
                    chunk("k0", 0, &old.id),
                    chunk("k1", 1, &old.id),
                    chunk("k2", 2, &old.id),
                ],
            )
            .await
            .unwrap();

        // Re-upload of the same document with a single chunk.
        let new = storage
            .put_attachment("p1", b"v2", "text/plain", "doc.txt")
            .await
            .unwrap();
        storage
            .put_kb_batch("p1", vec![chunk("k0", 0, &new.id)])
            .await
            .unwrap();

        let remaining = storage.list_kb("p1").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "k0");
        assert_eq!(remaining[0].attachment_id.as_deref(), Some(new.id.as_str()));

        // Nothing references the old attachment anymore.
        assert!(storage.get_attachment("p1", &old.id).await.unwrap().is_none());
        assert!(storage.get_attachment("p1", &new.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn index_artifacts_are_versioned() {
        let tmp = TempDir::new().unwrap();
        let storage = FileStorage::new(tmp.path()).unwrap();
        storage
            .put_index_artifact("p1", 1, ArtifactKind::Basic, b"{\"v\":1}")
            .await
            .unwrap();
        storage
            .put_index_artifact("p1", 2, ArtifactKind::Basic, b"{\"v\":2}")
            .await
            .unwrap();

        assert_eq!(storage.list_index_versions("p1").await.unwrap(), vec![1, 2]);
        let v1 = storage
            .get_index_artifact("p1", 1, ArtifactKind::Basic)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(v1, b"{\"v\":1}");

        storage.delete_index_version("p1", 1).await.unwrap();
        assert_eq!(storage.list_index_versions("p1").await.unwrap(), vec![2]);
        assert!(storage
            .get_index_artifact("p1", 1, ArtifactKind::Basic)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn projects_registry_upserts() {
        let tmp = TempDir::new().unwrap();
        let storage = FileStorage::new(tmp.path()).unwrap();
        let mut project = Project {
            id: "95".to_string(),
            name: "ASPCA".to_string(),
            active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        storage.put_project(&project).await.unwrap();
        project.active = false;
        storage.put_project(&project).await.unwrap();

        let projects = storage.list_projects().await.unwrap();
        assert_eq!(projects.len(), 1);
        assert!(!projects[0].active);
    }
}
