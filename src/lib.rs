//! # kbserve
//!
//! **A multi-tenant knowledge-base query service.**
//!
//! Each tenant ("project") owns FAQ pairs, knowledge-base articles, and
//! uploaded documents. kbserve maintains per-project versioned search
//! indexes and answers natural-language questions by fusing dense, sparse,
//! and substring retrieval, optionally invoking auxiliary tools, and
//! composing an answer with source citations.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────────┐   ┌──────────────┐   ┌───────────┐
//! │ AuthGate │──▶│ ContentAPI │──▶│   Storage     │◀──│  Indexer  │
//! └────┬─────┘   └─────┬──────┘   │ (file/memory) │   └─────┬─────┘
//!      │               │ mark_dirty└──────────────┘         │
//!      │               ▼                                    │
//!      │        ┌──────────────┐   versioned artifacts      │
//!      │        │ IndexManager │◀───────────────────────────┘
//!      │        └──────┬───────┘
//!      ▼               ▼ snapshot
//! ┌────────────────────────────┐   ┌──────────────┐
//! │     QueryOrchestrator      │──▶│ ToolRegistry │
//! │ retrieve → tools → answer  │   │ datetime/web │
//! └─────────────┬──────────────┘   └──────────────┘
//!               ▼
//!         ┌───────────┐
//!         │ TraceRing │
//!         └───────────┘
//! ```
//!
//! ## Ingestion flow
//!
//! 1. A write lands through [`content::ContentApi`] (FAQ, KB article, or
//!    document upload run through [`extract`]).
//! 2. [`index_manager::IndexManager::mark_dirty`] bumps the project's target
//!    version and a background worker rebuilds via [`index`].
//! 3. Artifacts publish atomically; readers pin versions with refcounted
//!    snapshots.
//!
//! ## Query flow
//!
//! 1. [`auth::AuthGate`] validates the bearer token or api key.
//! 2. [`query::QueryOrchestrator`] retrieves sources through
//!    [`retrieve::Retriever`] (reciprocal-rank fusion over the available
//!    providers), heuristically invokes [`tools`], and synthesizes an answer
//!    via [`completer`] or the deterministic fallback.
//! 3. The request lands in the [`trace::TraceRing`].
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | Environment-driven configuration and validation |
//! | [`error`] | Service-wide error kinds with HTTP mappings |
//! | [`models`] | Core data types |
//! | [`ident`] | Deterministic UUIDv5 ids and SHA-256 fingerprints |
//! | [`storage`] / [`storage_file`] / [`storage_memory`] | Per-project persistence |
//! | [`extract`] | Text extraction (text/PDF/DOCX) and paragraph chunking |
//! | [`embedding`] | Embedder trait, HTTP provider, vector math |
//! | [`completer`] | Completer trait and HTTP provider |
//! | [`index`] | Dense/sparse/basic artifact construction |
//! | [`index_manager`] | Versioning, single-flight rebuilds, snapshots |
//! | [`retrieve`] | Hybrid retrieval with reciprocal-rank fusion |
//! | [`tools`] | Tool registry, datetime and web_search built-ins |
//! | [`query`] | Query orchestration and the fallback answer |
//! | [`auth`] | Bearer-token and api-key authentication |
//! | [`trace`] | Bounded request trace log |
//! | [`db`] / [`migrate`] | SQLite metadata store (sessions, traces) |
//! | [`content`] | Content CRUD with index invalidation |
//! | [`services`] | Startup wiring: the `Services` aggregate |
//! | [`server`] | Axum HTTP surface |

pub mod auth;
pub mod completer;
pub mod config;
pub mod content;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod ident;
pub mod index;
pub mod index_manager;
pub mod migrate;
pub mod models;
pub mod query;
pub mod retrieve;
pub mod server;
pub mod services;
pub mod storage;
pub mod storage_file;
pub mod storage_memory;
pub mod tools;
pub mod trace;
