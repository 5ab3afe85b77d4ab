//! Environment-driven configuration.
//!
//! All settings come from environment variables; [`load_from_env`] validates
//! them and fails fast with a descriptive error (the binary maps that to
//! exit code 1).
//!
//! | Variable | Default | Purpose |
//! |----------|---------|---------|
//! | `STORAGE_TYPE` | `file` | `file`, `fileshare`, `blob`, or `doc_db` |
//! | `STORAGE_ROOT` | `./data` | Root directory for the file backend |
//! | `METADATA_DB_PATH` | `./data/meta.sqlite` | Sessions + traces store |
//! | `BIND_ADDR` | `127.0.0.1:8080` | HTTP listen address |
//! | `AUTH_SIGNING_KEY` | (required) | HMAC key for bearer tokens |
//! | `API_KEY` | unset | Enables the `X-API-Key` credential mode |
//! | `AUTH_DEFAULT_TTL_SECONDS` | `3600` | Token lifetime |
//! | `COMPLETER_MODEL` | unset | Enables the HTTP completer |
//! | `EMBEDDER_MODEL` | unset | Enables the HTTP embedder |
//! | `COMPLETER_ENDPOINT` / `EMBEDDER_ENDPOINT` | OpenAI-compatible URLs | Provider endpoints |
//! | `MODEL_API_KEY` | unset | Credential for both providers |
//! | `WEB_SEARCH_ENDPOINT` | `https://searx.be/search` | Web-search tool backend |
//! | `MAX_REQUEST_BYTES` | `1048576` | Request body cap |
//! | `ALLOWED_ORIGINS` | `*` | CORS origins, comma-separated |
//! | `TRACE_MAX_RECORDS` | `10000` | Trace retention by count |
//! | `TRACE_MAX_AGE_SECONDS` | `86400` | Trace retention by age |

use anyhow::{bail, Result};
use std::path::{Path, PathBuf};

/// Which Storage backend to construct at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageType {
    File,
    FileShare,
    Blob,
    DocDb,
}

impl StorageType {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "file" => Ok(StorageType::File),
            "fileshare" => Ok(StorageType::FileShare),
            "blob" => Ok(StorageType::Blob),
            "doc_db" => Ok(StorageType::DocDb),
            other => bail!(
                "Unknown STORAGE_TYPE: '{}'. Must be file, fileshare, blob, or doc_db.",
                other
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub storage_type: StorageType,
    pub storage_root: PathBuf,
    pub metadata_db_path: PathBuf,
    pub bind_addr: String,
    pub auth_signing_key: String,
    pub api_key: Option<String>,
    pub auth_default_ttl_seconds: i64,
    pub completer_model: Option<String>,
    pub completer_endpoint: String,
    pub embedder_model: Option<String>,
    pub embedder_endpoint: String,
    pub model_api_key: Option<String>,
    pub web_search_endpoint: String,
    pub max_request_bytes: usize,
    /// `None` means any origin.
    pub allowed_origins: Option<Vec<String>>,
    pub trace_max_records: i64,
    pub trace_max_age_seconds: i64,
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(v) => v
            .parse()
            .map_err(|_| anyhow::anyhow!("{} must be a valid number, got '{}'", name, v)),
        Err(_) => Ok(default),
    }
}

/// Load and validate configuration from the process environment.
pub fn load_from_env() -> Result<Config> {
    let storage_type = StorageType::parse(&env_or("STORAGE_TYPE", "file"))?;

    let auth_signing_key = match env_opt("AUTH_SIGNING_KEY") {
        Some(k) => k,
        None => bail!("AUTH_SIGNING_KEY must be set"),
    };

    let allowed_origins = match env_or("ALLOWED_ORIGINS", "*").as_str() {
        "*" => None,
        list => Some(
            list.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        ),
    };

    let config = Config {
        storage_type,
        storage_root: PathBuf::from(env_or("STORAGE_ROOT", "./data")),
        metadata_db_path: PathBuf::from(env_or("METADATA_DB_PATH", "./data/meta.sqlite")),
        bind_addr: env_or("BIND_ADDR", "127.0.0.1:8080"),
        auth_signing_key,
        api_key: env_opt("API_KEY"),
        auth_default_ttl_seconds: env_parse("AUTH_DEFAULT_TTL_SECONDS", 3600)?,
        completer_model: env_opt("COMPLETER_MODEL"),
        completer_endpoint: env_or(
            "COMPLETER_ENDPOINT",
            "https://api.openai.com/v1/chat/completions",
        ),
        embedder_model: env_opt("EMBEDDER_MODEL"),
        embedder_endpoint: env_or("EMBEDDER_ENDPOINT", "https://api.openai.com/v1/embeddings"),
        model_api_key: env_opt("MODEL_API_KEY"),
        web_search_endpoint: env_or("WEB_SEARCH_ENDPOINT", "https://searx.be/search"),
        max_request_bytes: env_parse("MAX_REQUEST_BYTES", 1_048_576)?,
        allowed_origins,
        trace_max_records: env_parse("TRACE_MAX_RECORDS", 10_000)?,
        trace_max_age_seconds: env_parse("TRACE_MAX_AGE_SECONDS", 86_400)?,
    };

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.auth_signing_key.len() < 16 {
        bail!("AUTH_SIGNING_KEY must be at least 16 bytes");
    }
    if config.max_request_bytes == 0 {
        bail!("MAX_REQUEST_BYTES must be > 0");
    }
    if config.trace_max_records < 1 {
        bail!("TRACE_MAX_RECORDS must be >= 1");
    }
    if config.trace_max_age_seconds < 1 {
        bail!("TRACE_MAX_AGE_SECONDS must be >= 1");
    }
    if config.auth_default_ttl_seconds < 1 {
        bail!("AUTH_DEFAULT_TTL_SECONDS must be >= 1");
    }
    if config.embedder_model.is_some() && config.model_api_key.is_none() {
        bail!("MODEL_API_KEY must be set when EMBEDDER_MODEL is configured");
    }
    if config.completer_model.is_some() && config.model_api_key.is_none() {
        bail!("MODEL_API_KEY must be set when COMPLETER_MODEL is configured");
    }
    Ok(())
}

impl Config {
    /// A minimal configuration rooted at `root`, used by the test suites.
    /// No embedder, no completer, api-key mode enabled.
    pub fn for_root(root: &Path) -> Self {
        Config {
            storage_type: StorageType::File,
            storage_root: root.to_path_buf(),
            metadata_db_path: root.join("meta.sqlite"),
            bind_addr: "127.0.0.1:0".to_string(),
            auth_signing_key: "test-signing-key-0123456789abcdef".to_string(),
            api_key: Some("test-api-key".to_string()),
            auth_default_ttl_seconds: 3600,
            completer_model: None,
            completer_endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            embedder_model: None,
            embedder_endpoint: "https://api.openai.com/v1/embeddings".to_string(),
            model_api_key: None,
            web_search_endpoint: "https://searx.be/search".to_string(),
            max_request_bytes: 1_048_576,
            allowed_origins: None,
            trace_max_records: 1_000,
            trace_max_age_seconds: 86_400,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_type_rejects_unknown() {
        assert!(StorageType::parse("s3").is_err());
        assert_eq!(StorageType::parse("file").unwrap(), StorageType::File);
        assert_eq!(StorageType::parse("doc_db").unwrap(), StorageType::DocDb);
    }

    #[test]
    fn validate_rejects_short_signing_key() {
        let mut config = Config::for_root(Path::new("/tmp"));
        config.auth_signing_key = "short".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn validate_requires_model_api_key_for_embedder() {
        let mut config = Config::for_root(Path::new("/tmp"));
        config.embedder_model = Some("text-embedding-3-small".to_string());
        assert!(validate(&config).is_err());
        config.model_api_key = Some("sk-test".to_string());
        assert!(validate(&config).is_ok());
    }
}
