//! Metadata store schema.
//!
//! Creates the tables behind bearer-token sessions and the request trace
//! ring. All statements are idempotent; running the migration repeatedly is
//! safe.
//!
//! | Table | Purpose |
//! |-------|---------|
//! | `sessions` | Bearer-token sessions (jti, scopes, expiry, disabled flag) |
//! | `traces` | Bounded request trace log |

use anyhow::Result;
use sqlx::SqlitePool;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            token_jti TEXT NOT NULL UNIQUE,
            client_name TEXT NOT NULL,
            scopes TEXT NOT NULL DEFAULT '',
            issued_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL,
            disabled INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS traces (
            id TEXT PRIMARY KEY,
            ts INTEGER NOT NULL,
            method TEXT NOT NULL,
            path TEXT NOT NULL,
            status INTEGER NOT NULL,
            latency_ms REAL NOT NULL,
            ip TEXT NOT NULL,
            user_agent TEXT,
            headers_scrubbed TEXT NOT NULL DEFAULT '{}',
            query_params TEXT NOT NULL DEFAULT '{}',
            body_sha256 TEXT,
            session_id TEXT,
            error TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_traces_ts ON traces(ts DESC)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_sessions_jti ON sessions(token_jti)")
        .execute(pool)
        .await?;

    Ok(())
}
