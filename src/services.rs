//! Process-wide service aggregate.
//!
//! Everything with process lifetime — storage, the index manager, the tool
//! registry, the auth gate, the trace ring, the orchestrator — is
//! constructed once at startup from configuration and carried in a single
//! [`Services`] value that request handlers receive. There are no ambient
//! globals.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::info;

use crate::auth::AuthGate;
use crate::completer::{Completer, HttpCompleter};
use crate::config::Config;
use crate::content::ContentApi;
use crate::db;
use crate::embedding::{Embedder, HttpEmbedder};
use crate::extract::DefaultExtractor;
use crate::index_manager::IndexManager;
use crate::migrate;
use crate::query::QueryOrchestrator;
use crate::retrieve::Retriever;
use crate::storage::{self, Storage};
use crate::tools::ToolRegistry;
use crate::trace::TraceRing;

pub struct Services {
    pub config: Config,
    pub storage: Arc<dyn Storage>,
    pub pool: SqlitePool,
    pub index: IndexManager,
    pub content: Arc<ContentApi>,
    pub tools: Arc<ToolRegistry>,
    pub orchestrator: Arc<QueryOrchestrator>,
    pub auth: Arc<AuthGate>,
    pub traces: Arc<TraceRing>,
}

impl Services {
    /// Construct the full service graph. Errors here mean the storage or
    /// metadata store is unreachable (the binary exits with code 2).
    pub async fn init(config: Config) -> Result<Arc<Self>> {
        let storage = storage::create_storage(&config).context("opening storage backend")?;

        let pool = db::connect(&config.metadata_db_path)
            .await
            .context("opening metadata store")?;
        migrate::run_migrations(&pool)
            .await
            .context("migrating metadata store")?;

        let embedder: Option<Arc<dyn Embedder>> = match (&config.embedder_model, &config.model_api_key)
        {
            (Some(model), Some(key)) => {
                info!(model = %model, "embedder configured");
                Some(Arc::new(HttpEmbedder::new(
                    &config.embedder_endpoint,
                    model,
                    key,
                )?))
            }
            _ => {
                info!("no embedder configured; dense retrieval disabled");
                None
            }
        };

        let completer: Option<Arc<dyn Completer>> = match (&config.completer_model, &config.model_api_key)
        {
            (Some(model), Some(key)) => {
                info!(model = %model, "completer configured");
                Some(Arc::new(HttpCompleter::new(
                    &config.completer_endpoint,
                    model,
                    key,
                )?))
            }
            _ => {
                info!("no completer configured; queries use the deterministic fallback");
                None
            }
        };

        let index = IndexManager::new(storage.clone(), embedder.clone());
        let content = Arc::new(ContentApi::new(
            storage.clone(),
            Arc::new(DefaultExtractor),
            index.clone(),
        ));
        let retriever = Arc::new(Retriever::new(storage.clone(), index.clone(), embedder));
        let tools = Arc::new(ToolRegistry::with_builtins(&config.web_search_endpoint));
        let orchestrator = Arc::new(QueryOrchestrator::new(
            storage.clone(),
            retriever,
            tools.clone(),
            completer,
        ));
        let auth = Arc::new(AuthGate::new(
            pool.clone(),
            &config.auth_signing_key,
            config.api_key.clone(),
            config.auth_default_ttl_seconds,
        ));
        let traces = Arc::new(TraceRing::new(
            pool.clone(),
            config.trace_max_records,
            config.trace_max_age_seconds,
        ));

        Ok(Arc::new(Self {
            config,
            storage,
            pool,
            index,
            content,
            tools,
            orchestrator,
            auth,
            traces,
        }))
    }

    /// Readiness probe: the metadata store answers and storage lists.
    pub async fn ready(&self) -> bool {
        let db_ok = sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok();
        let storage_ok = self.storage.list_projects().await.is_ok();
        db_ok && storage_ok
    }
}
