//! In-memory Storage backend for tests.
//!
//! Same semantics as the file backend (insertion order, upsert-in-place,
//! orphan attachment reclamation, versioned artifacts) over `HashMap`s and
//! `Vec`s behind `std::sync::RwLock`.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{Attachment, ArtifactKind, FaqRecord, IndexVersionMeta, KbRecord, Project};
use crate::storage::Storage;

#[derive(Default)]
struct ProjectData {
    faqs: Vec<FaqRecord>,
    kb: Vec<KbRecord>,
    attachments: Vec<(Attachment, Vec<u8>)>,
    artifacts: HashMap<(u64, &'static str), Vec<u8>>,
    current_meta: Option<IndexVersionMeta>,
}

impl ProjectData {
    fn reclaim_attachments(&mut self, candidates: &[String]) {
        for candidate in candidates {
            let still_referenced = self
                .kb
                .iter()
                .any(|r| r.attachment_id.as_deref() == Some(candidate.as_str()));
            if !still_referenced {
                self.attachments.retain(|(a, _)| &a.id != candidate);
            }
        }
    }
}

/// In-memory store used by the test suites.
#[derive(Default)]
pub struct MemoryStorage {
    projects: RwLock<Vec<Project>>,
    data: RwLock<HashMap<String, ProjectData>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_project<R>(&self, project_id: &str, f: impl FnOnce(&mut ProjectData) -> R) -> R {
        let mut data = self.data.write().unwrap();
        f(data.entry(project_id.to_string()).or_default())
    }

    fn read_project<R>(&self, project_id: &str, f: impl FnOnce(Option<&ProjectData>) -> R) -> R {
        let data = self.data.read().unwrap();
        f(data.get(project_id))
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn list_projects(&self) -> Result<Vec<Project>> {
        Ok(self.projects.read().unwrap().clone())
    }

    async fn get_project(&self, project_id: &str) -> Result<Option<Project>> {
        Ok(self
            .projects
            .read()
            .unwrap()
            .iter()
            .find(|p| p.id == project_id)
            .cloned())
    }

    async fn put_project(&self, project: &Project) -> Result<()> {
        let mut projects = self.projects.write().unwrap();
        match projects.iter_mut().find(|p| p.id == project.id) {
            Some(existing) => *existing = project.clone(),
            None => projects.push(project.clone()),
        }
        Ok(())
    }

    async fn list_faqs(&self, project_id: &str) -> Result<Vec<FaqRecord>> {
        Ok(self.read_project(project_id, |d| {
            d.map(|d| d.faqs.clone()).unwrap_or_default()
        }))
    }

    async fn list_kb(&self, project_id: &str) -> Result<Vec<KbRecord>> {
        Ok(self.read_project(project_id, |d| {
            d.map(|d| d.kb.clone()).unwrap_or_default()
        }))
    }

    async fn put_faq(&self, project_id: &str, faq: FaqRecord) -> Result<Option<FaqRecord>> {
        Ok(self.with_project(project_id, |d| {
            match d.faqs.iter_mut().find(|f| f.id == faq.id) {
                Some(existing) => Some(std::mem::replace(existing, faq)),
                None => {
                    d.faqs.push(faq);
                    None
                }
            }
        }))
    }

    async fn put_kb(&self, project_id: &str, record: KbRecord) -> Result<Option<KbRecord>> {
        Ok(self.with_project(project_id, |d| {
            let prior = match d.kb.iter_mut().find(|r| r.id == record.id) {
                Some(existing) => Some(std::mem::replace(existing, record)),
                None => {
                    d.kb.push(record);
                    None
                }
            };
            if let Some(att) = prior.as_ref().and_then(|p| p.attachment_id.clone()) {
                d.reclaim_attachments(&[att]);
            }
            prior
        }))
    }

    async fn put_kb_batch(&self, project_id: &str, records: Vec<KbRecord>) -> Result<()> {
        self.with_project(project_id, |d| {
            let mut replaced = Vec::new();

            // Drop existing chunks of the batch's parent documents that the
            // batch no longer carries.
            let batch_ids: HashSet<String> = records.iter().map(|r| r.id.clone()).collect();
            let parents: HashSet<String> = records
                .iter()
                .filter_map(|r| r.parent_document_id.clone())
                .collect();
            d.kb.retain(|r| {
                let stale = r
                    .parent_document_id
                    .as_ref()
                    .map(|p| parents.contains(p))
                    .unwrap_or(false)
                    && !batch_ids.contains(&r.id);
                if stale {
                    if let Some(att) = &r.attachment_id {
                        replaced.push(att.clone());
                    }
                }
                !stale
            });

            for record in records {
                match d.kb.iter_mut().find(|r| r.id == record.id) {
                    Some(existing) => {
                        let prior = std::mem::replace(existing, record);
                        if let Some(att) = prior.attachment_id {
                            replaced.push(att);
                        }
                    }
                    None => d.kb.push(record),
                }
            }
            d.reclaim_attachments(&replaced);
        });
        Ok(())
    }

    async fn delete_faq(&self, project_id: &str, id: &str) -> Result<bool> {
        Ok(self.with_project(project_id, |d| {
            let before = d.faqs.len();
            d.faqs.retain(|f| f.id != id);
            d.faqs.len() != before
        }))
    }

    async fn delete_kb(&self, project_id: &str, id: &str) -> Result<bool> {
        Ok(self.with_project(project_id, |d| {
            let removed = match d.kb.iter().position(|r| r.id == id) {
                Some(pos) => d.kb.remove(pos),
                None => return false,
            };
            if let Some(att) = removed.attachment_id {
                d.reclaim_attachments(&[att]);
            }
            true
        }))
    }

    async fn put_attachment(
        &self,
        project_id: &str,
        bytes: &[u8],
        mime: &str,
        original_name: &str,
    ) -> Result<Attachment> {
        let attachment = Attachment {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            mime: mime.to_string(),
            original_name: original_name.to_string(),
            created_at: Utc::now(),
        };
        self.with_project(project_id, |d| {
            d.attachments.push((attachment.clone(), bytes.to_vec()));
        });
        Ok(attachment)
    }

    async fn get_attachment(
        &self,
        project_id: &str,
        id: &str,
    ) -> Result<Option<(Attachment, Vec<u8>)>> {
        Ok(self.read_project(project_id, |d| {
            d.and_then(|d| {
                d.attachments
                    .iter()
                    .find(|(a, _)| a.id == id)
                    .map(|(a, b)| (a.clone(), b.clone()))
            })
        }))
    }

    async fn put_index_artifact(
        &self,
        project_id: &str,
        version: u64,
        kind: ArtifactKind,
        bytes: &[u8],
    ) -> Result<()> {
        self.with_project(project_id, |d| {
            d.artifacts.insert((version, kind.as_str()), bytes.to_vec());
        });
        Ok(())
    }

    async fn get_index_artifact(
        &self,
        project_id: &str,
        version: u64,
        kind: ArtifactKind,
    ) -> Result<Option<Vec<u8>>> {
        Ok(self.read_project(project_id, |d| {
            d.and_then(|d| d.artifacts.get(&(version, kind.as_str())).cloned())
        }))
    }

    async fn get_current_index_meta(&self, project_id: &str) -> Result<Option<IndexVersionMeta>> {
        Ok(self.read_project(project_id, |d| d.and_then(|d| d.current_meta.clone())))
    }

    async fn set_current_index_meta(
        &self,
        project_id: &str,
        meta: &IndexVersionMeta,
    ) -> Result<()> {
        self.with_project(project_id, |d| {
            d.current_meta = Some(meta.clone());
        });
        Ok(())
    }

    async fn list_index_versions(&self, project_id: &str) -> Result<Vec<u64>> {
        Ok(self.read_project(project_id, |d| {
            let mut versions: Vec<u64> = d
                .map(|d| d.artifacts.keys().map(|(v, _)| *v).collect::<Vec<_>>())
                .unwrap_or_default();
            versions.sort_unstable();
            versions.dedup();
            versions
        }))
    }

    async fn delete_index_version(&self, project_id: &str, version: u64) -> Result<()> {
        self.with_project(project_id, |d| {
            d.artifacts.retain(|(v, _), _| *v != version);
        });
        Ok(())
    }
}
