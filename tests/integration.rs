//! Service-layer integration tests over the file storage backend.

use std::sync::Arc;

use tempfile::TempDir;

use kbserve::config::Config;
use kbserve::content::{ContentApi, KbFetch};
use kbserve::extract::DefaultExtractor;
use kbserve::index_manager::IndexManager;
use kbserve::models::{QueryRequest, SourceKind};
use kbserve::query::QueryOrchestrator;
use kbserve::retrieve::Retriever;
use kbserve::storage::{create_storage, Storage};
use kbserve::tools::ToolRegistry;
use uuid::Uuid;

struct Env {
    _tmp: TempDir,
    storage: Arc<dyn Storage>,
    index: IndexManager,
    content: ContentApi,
    orchestrator: QueryOrchestrator,
}

fn setup() -> Env {
    let tmp = TempDir::new().unwrap();
    let config = Config::for_root(tmp.path());
    let storage = create_storage(&config).unwrap();
    let index = IndexManager::new(storage.clone(), None);
    let content = ContentApi::new(storage.clone(), Arc::new(DefaultExtractor), index.clone());
    let retriever = Arc::new(Retriever::new(storage.clone(), index.clone(), None));
    let tools = Arc::new(ToolRegistry::with_builtins("http://127.0.0.1:1/search"));
    let orchestrator = QueryOrchestrator::new(storage.clone(), retriever, tools, None);
    Env {
        _tmp: tmp,
        storage,
        index,
        content,
        orchestrator,
    }
}

fn query(question: &str) -> QueryRequest {
    QueryRequest {
        project_id: "95".to_string(),
        question: question.to_string(),
        max_sources: 5,
        use_tools: true,
    }
}

#[tokio::test]
async fn faq_lifecycle_end_to_end() {
    let env = setup();
    env.content
        .create_or_update_project("95", "ASPCA", true)
        .await
        .unwrap();

    let faq = env
        .content
        .add_faq(
            "95",
            "What does ASPCA stand for?",
            "American Society for the Prevention of Cruelty to Animals.",
        )
        .await
        .unwrap();
    let expected_id =
        Uuid::new_v5(&Uuid::NAMESPACE_URL, b"faq|95|What does ASPCA stand for?").to_string();
    assert_eq!(faq.id, expected_id);

    // The add marked the index dirty; force completion and check state.
    let state = env.index.rebuild_now("95").await.unwrap();
    assert!(state.current_version >= 1);

    let response = env
        .orchestrator
        .answer(query("What does ASPCA stand for?"))
        .await
        .unwrap();
    assert_eq!(response.sources[0].id, faq.id);
    assert_eq!(response.sources[0].kind, SourceKind::Faq);
    assert!(response.answer.contains("American Society"));
    assert!(response.model.is_none());

    // Delete and verify the source disappears from identical queries.
    assert!(env.content.delete_faq("95", &faq.id).await.unwrap());
    env.index.rebuild_now("95").await.unwrap();
    let response = env
        .orchestrator
        .answer(query("What does ASPCA stand for?"))
        .await
        .unwrap();
    assert!(response.sources.iter().all(|s| s.id != faq.id));
}

#[tokio::test]
async fn fingerprint_returns_to_prior_value_after_delete() {
    let env = setup();
    env.content
        .create_or_update_project("95", "ASPCA", true)
        .await
        .unwrap();
    env.content.add_faq("95", "base question", "base answer").await.unwrap();
    env.index.rebuild_now("95").await.unwrap();
    let baseline = env.index.published_meta("95").await.unwrap().unwrap();

    let extra = env.content.add_faq("95", "extra question", "extra answer").await.unwrap();
    env.index.rebuild_now("95").await.unwrap();
    let with_extra = env.index.published_meta("95").await.unwrap().unwrap();
    assert_ne!(baseline.record_fingerprint, with_extra.record_fingerprint);

    env.content.delete_faq("95", &extra.id).await.unwrap();
    env.index.rebuild_now("95").await.unwrap();
    let restored = env.index.published_meta("95").await.unwrap().unwrap();
    assert_eq!(baseline.record_fingerprint, restored.record_fingerprint);
}

#[tokio::test]
async fn uploaded_document_round_trips_byte_for_byte() {
    let env = setup();
    env.content
        .create_or_update_project("95", "ASPCA", true)
        .await
        .unwrap();

    let body = "Adoption policy overview.\n\nAll adopters are screened.".as_bytes();
    let outcome = env
        .content
        .upload_document("95", body, "text/plain", "Adoption Policy")
        .await
        .unwrap();
    assert!(outcome.chunks_created >= 1);
    assert!(outcome.index_build_started);

    let kb = env.storage.list_kb("95").await.unwrap();
    let child = kb
        .iter()
        .find(|r| r.parent_document_id.as_deref() == Some(outcome.document_id.as_str()))
        .unwrap();
    match env.content.get_kb("95", &child.id).await.unwrap() {
        KbFetch::Attachment { meta, bytes, .. } => {
            assert_eq!(bytes, body);
            assert_eq!(meta.mime, "text/plain");
        }
        KbFetch::Record(_) => panic!("uploaded KB record should resolve to its attachment"),
    }
}

#[tokio::test]
async fn uploaded_content_is_retrievable_after_rebuild() {
    let env = setup();
    env.content
        .create_or_update_project("95", "ASPCA", true)
        .await
        .unwrap();
    env.content
        .upload_document(
            "95",
            b"The shelter opens at nine in the morning on weekdays.",
            "text/plain",
            "Shelter Hours",
        )
        .await
        .unwrap();
    env.index.rebuild_now("95").await.unwrap();

    let response = env
        .orchestrator
        .answer(query("When does the shelter open?"))
        .await
        .unwrap();
    assert!(!response.sources.is_empty());
    assert_eq!(response.sources[0].kind, SourceKind::Kb);
    assert!(response.sources[0].attachment_url.is_some());
    assert!(response.answer.contains("nine in the morning"));
}

#[tokio::test]
async fn deactivated_project_is_invisible_to_queries() {
    let env = setup();
    env.content
        .create_or_update_project("95", "ASPCA", true)
        .await
        .unwrap();
    env.content.add_faq("95", "q", "a").await.unwrap();
    env.content.deactivate_project("95").await.unwrap();

    let err = env.orchestrator.answer(query("q")).await.unwrap_err();
    assert_eq!(err.code(), "not_found");
}

#[tokio::test]
async fn index_survives_manager_restart() {
    let tmp = TempDir::new().unwrap();
    let config = Config::for_root(tmp.path());
    let storage = create_storage(&config).unwrap();

    {
        let index = IndexManager::new(storage.clone(), None);
        let content = ContentApi::new(storage.clone(), Arc::new(DefaultExtractor), index.clone());
        content
            .create_or_update_project("95", "ASPCA", true)
            .await
            .unwrap();
        content.add_faq("95", "persistent question", "persistent answer").await.unwrap();
        index.rebuild_now("95").await.unwrap();
    }

    // A fresh manager over the same root serves the published snapshot.
    let reopened = create_storage(&config).unwrap();
    let index = IndexManager::new(reopened, None);
    let snapshot = index.snapshot("95").await.unwrap().expect("published snapshot");
    assert_eq!(snapshot.basic.entries.len(), 1);
    assert!(snapshot.basic.entries[0]
        .text_lower
        .contains("persistent question"));
}
