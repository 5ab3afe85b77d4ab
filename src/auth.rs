//! Authenticated request pipeline.
//!
//! Two credential modes, checked in order:
//!
//! 1. **Bearer token** (`Authorization: Bearer <token>`) — a compact
//!    HMAC-SHA256-signed token whose `jti` must resolve to a live session in
//!    the metadata store. Scopes come from the session record, not the
//!    token, so revocation takes effect immediately.
//! 2. **Api key** (`X-API-Key`) — constant-time compare against the
//!    configured key; a match grants a synthetic full-scope session with
//!    `auth_method = "api_key"`.
//!
//! Tokens are issued by exchanging the api key at `POST /v1/auth/token`;
//! the requested scopes are persisted with the session.
//!
//! Failure modes: missing, malformed, unverifiable, or expired credentials
//! are all `Unauthenticated`; a valid credential without a required scope is
//! `Forbidden`.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::{Result, ServiceError};

type HmacSha256 = Hmac<Sha256>;

/// Scopes granted to api-key callers and to token requests that do not
/// narrow them.
pub const FULL_SCOPES: &[&str] = &["read:basic", "read:traces", "write:projects"];

/// Result of a successful authentication.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub session_id: String,
    pub scopes: Vec<String>,
    pub auth_method: &'static str,
}

impl AuthContext {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.auth_method == "api_key" || self.scopes.iter().any(|s| s == scope)
    }
}

/// Issued-token response for `POST /v1/auth/token`.
#[derive(Debug, Clone, Serialize)]
pub struct TokenGrant {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
    pub session_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    jti: String,
    client_name: String,
    scopes: Vec<String>,
    iat: i64,
    exp: i64,
}

pub struct AuthGate {
    pool: SqlitePool,
    signing_key: Vec<u8>,
    api_key: Option<String>,
    default_ttl_seconds: i64,
}

impl AuthGate {
    pub fn new(
        pool: SqlitePool,
        signing_key: &str,
        api_key: Option<String>,
        default_ttl_seconds: i64,
    ) -> Self {
        Self {
            pool,
            signing_key: signing_key.as_bytes().to_vec(),
            api_key,
            default_ttl_seconds,
        }
    }

    pub fn api_key_enabled(&self) -> bool {
        self.api_key.is_some()
    }

    /// Exchange the configured api key for a scoped bearer token.
    pub async fn issue_token(
        &self,
        presented_api_key: &str,
        client_name: &str,
        scopes: Vec<String>,
        ttl_seconds: Option<i64>,
    ) -> Result<TokenGrant> {
        if !self.api_key_matches(presented_api_key) {
            return Err(ServiceError::Unauthenticated(
                "invalid credentials".to_string(),
            ));
        }

        let scopes = if scopes.is_empty() {
            FULL_SCOPES.iter().map(|s| s.to_string()).collect()
        } else {
            scopes
        };
        let ttl = ttl_seconds.unwrap_or(self.default_ttl_seconds).max(1);
        let issued_at = Utc::now();
        let expires_at = issued_at + chrono::Duration::seconds(ttl);
        let session_id = format!("sess_{}", Uuid::new_v4().simple());
        let jti = format!("jti_{}", Uuid::new_v4().simple());

        sqlx::query(
            "INSERT INTO sessions (id, token_jti, client_name, scopes, issued_at, expires_at, disabled) \
             VALUES (?, ?, ?, ?, ?, ?, 0)",
        )
        .bind(&session_id)
        .bind(&jti)
        .bind(client_name)
        .bind(scopes.join(","))
        .bind(issued_at.timestamp())
        .bind(expires_at.timestamp())
        .execute(&self.pool)
        .await?;

        let claims = Claims {
            sub: session_id.clone(),
            jti,
            client_name: client_name.to_string(),
            scopes,
            iat: issued_at.timestamp(),
            exp: expires_at.timestamp(),
        };
        let access_token = self.encode_token(&claims)?;
        Ok(TokenGrant {
            access_token,
            expires_at,
            session_id,
        })
    }

    /// Authenticate a request from its headers. Bearer first, api key second.
    pub async fn authenticate(&self, headers: &axum::http::HeaderMap) -> Result<AuthContext> {
        if let Some(value) = headers.get(axum::http::header::AUTHORIZATION) {
            let value = value.to_str().map_err(|_| {
                ServiceError::Unauthenticated("malformed authorization header".to_string())
            })?;
            let token = value.strip_prefix("Bearer ").ok_or_else(|| {
                ServiceError::Unauthenticated("authorization header is not a bearer token".to_string())
            })?;
            return self.authenticate_bearer(token).await;
        }

        if let Some(value) = headers.get("x-api-key") {
            let presented = value.to_str().map_err(|_| {
                ServiceError::Unauthenticated("malformed api key header".to_string())
            })?;
            if self.api_key_matches(presented) {
                return Ok(AuthContext {
                    session_id: "api_key_auth".to_string(),
                    scopes: FULL_SCOPES.iter().map(|s| s.to_string()).collect(),
                    auth_method: "api_key",
                });
            }
            return Err(ServiceError::Unauthenticated("invalid api key".to_string()));
        }

        Err(ServiceError::Unauthenticated(
            "missing credential: provide a bearer token or X-API-Key header".to_string(),
        ))
    }

    /// Best-effort session identification for request tracing. Never errors.
    pub async fn identify(&self, headers: &axum::http::HeaderMap) -> Option<String> {
        self.authenticate(headers).await.ok().map(|c| c.session_id)
    }

    /// Disable a session; tokens carrying its jti stop verifying immediately.
    pub async fn revoke(&self, session_id: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE sessions SET disabled = 1 WHERE id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn authenticate_bearer(&self, token: &str) -> Result<AuthContext> {
        let claims = self.decode_token(token)?;

        if claims.exp < Utc::now().timestamp() {
            return Err(ServiceError::Unauthenticated("token expired".to_string()));
        }

        let row = sqlx::query(
            "SELECT id, scopes, expires_at, disabled FROM sessions WHERE token_jti = ?",
        )
        .bind(&claims.jti)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ServiceError::Unauthenticated("unknown session".to_string()))?;

        let disabled: i64 = row.get("disabled");
        if disabled != 0 {
            return Err(ServiceError::Unauthenticated("session disabled".to_string()));
        }
        let expires_at: i64 = row.get("expires_at");
        if expires_at < Utc::now().timestamp() {
            return Err(ServiceError::Unauthenticated("session expired".to_string()));
        }

        let scopes_csv: String = row.get("scopes");
        Ok(AuthContext {
            session_id: row.get("id"),
            scopes: scopes_csv
                .split(',')
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
                .collect(),
            auth_method: "bearer",
        })
    }

    fn api_key_matches(&self, presented: &str) -> bool {
        match &self.api_key {
            Some(configured) => constant_time_eq(configured.as_bytes(), presented.as_bytes()),
            None => false,
        }
    }

    fn encode_token(&self, claims: &Claims) -> Result<String> {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
        let signing_input = format!("{}.{}", header, payload);
        let signature = URL_SAFE_NO_PAD.encode(self.sign(signing_input.as_bytes()));
        Ok(format!("{}.{}", signing_input, signature))
    }

    fn decode_token(&self, token: &str) -> Result<Claims> {
        let invalid = || ServiceError::Unauthenticated("invalid token".to_string());

        let mut parts = token.split('.');
        let (header, payload, signature) = match (parts.next(), parts.next(), parts.next(), parts.next())
        {
            (Some(h), Some(p), Some(s), None) => (h, p, s),
            _ => return Err(invalid()),
        };

        let signing_input = format!("{}.{}", header, payload);
        let expected = self.sign(signing_input.as_bytes());
        let presented = URL_SAFE_NO_PAD.decode(signature).map_err(|_| invalid())?;
        if !constant_time_eq(&expected, &presented) {
            return Err(invalid());
        }

        let payload_bytes = URL_SAFE_NO_PAD.decode(payload).map_err(|_| invalid())?;
        serde_json::from_slice(&payload_bytes).map_err(|_| invalid())
    }

    fn sign(&self, data: &[u8]) -> Vec<u8> {
        let mut mac =
            HmacSha256::new_from_slice(&self.signing_key).expect("HMAC accepts any key length");
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }
}

/// Byte comparison without data-dependent early exit.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn gate() -> AuthGate {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::migrate::run_migrations(&pool).await.unwrap();
        AuthGate::new(pool, "test-signing-key-0123456789abcdef", Some("secret-key".into()), 3600)
    }

    fn headers_with(name: &str, value: &str) -> axum::http::HeaderMap {
        let mut headers = axum::http::HeaderMap::new();
        headers.insert(
            axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
            value.parse().unwrap(),
        );
        headers
    }

    #[tokio::test]
    async fn token_roundtrip_authenticates() {
        let gate = gate().await;
        let grant = gate
            .issue_token("secret-key", "tests", vec!["read:basic".into()], None)
            .await
            .unwrap();

        let headers = headers_with("authorization", &format!("Bearer {}", grant.access_token));
        let ctx = gate.authenticate(&headers).await.unwrap();
        assert_eq!(ctx.session_id, grant.session_id);
        assert_eq!(ctx.auth_method, "bearer");
        assert!(ctx.has_scope("read:basic"));
        assert!(!ctx.has_scope("write:projects"));
    }

    #[tokio::test]
    async fn wrong_api_key_is_rejected_at_issue_and_auth() {
        let gate = gate().await;
        assert!(matches!(
            gate.issue_token("wrong", "tests", vec![], None).await,
            Err(ServiceError::Unauthenticated(_))
        ));
        let headers = headers_with("x-api-key", "wrong");
        assert!(matches!(
            gate.authenticate(&headers).await,
            Err(ServiceError::Unauthenticated(_))
        ));
    }

    #[tokio::test]
    async fn api_key_grants_full_scope() {
        let gate = gate().await;
        let headers = headers_with("x-api-key", "secret-key");
        let ctx = gate.authenticate(&headers).await.unwrap();
        assert_eq!(ctx.auth_method, "api_key");
        assert_eq!(ctx.session_id, "api_key_auth");
        assert!(ctx.has_scope("write:projects"));
        assert!(ctx.has_scope("anything-at-all"));
    }

    #[tokio::test]
    async fn missing_credential_is_unauthenticated() {
        let gate = gate().await;
        let err = gate.authenticate(&axum::http::HeaderMap::new()).await.unwrap_err();
        assert!(matches!(err, ServiceError::Unauthenticated(_)));
    }

    #[tokio::test]
    async fn tampered_token_is_rejected() {
        let gate = gate().await;
        let grant = gate
            .issue_token("secret-key", "tests", vec![], None)
            .await
            .unwrap();
        let mut tampered = grant.access_token.clone();
        tampered.pop();
        tampered.push('A');
        let headers = headers_with("authorization", &format!("Bearer {}", tampered));
        assert!(gate.authenticate(&headers).await.is_err());
    }

    #[tokio::test]
    async fn expired_token_is_unauthenticated() {
        let gate = gate().await;
        // TTL clamps to 1 second; back-date by sleeping past expiry.
        let grant = gate
            .issue_token("secret-key", "tests", vec![], Some(1))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2_100)).await;
        let headers = headers_with("authorization", &format!("Bearer {}", grant.access_token));
        let err = gate.authenticate(&headers).await.unwrap_err();
        assert!(matches!(err, ServiceError::Unauthenticated(_)));
    }

    #[tokio::test]
    async fn revoked_session_stops_verifying() {
        let gate = gate().await;
        let grant = gate
            .issue_token("secret-key", "tests", vec![], None)
            .await
            .unwrap();
        assert!(gate.revoke(&grant.session_id).await.unwrap());

        let headers = headers_with("authorization", &format!("Bearer {}", grant.access_token));
        let err = gate.authenticate(&headers).await.unwrap_err();
        assert!(matches!(err, ServiceError::Unauthenticated(_)));
    }

    #[tokio::test]
    async fn bearer_takes_precedence_over_api_key() {
        let gate = gate().await;
        let mut headers = headers_with("x-api-key", "secret-key");
        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Bearer not.a.token".parse().unwrap(),
        );
        // The invalid bearer fails even though the api key would succeed.
        assert!(gate.authenticate(&headers).await.is_err());
    }

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }
}
