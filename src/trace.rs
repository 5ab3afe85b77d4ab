//! Bounded request trace log.
//!
//! Every HTTP request produces one [`Trace`] record: method, path, status,
//! latency, client address, scrubbed headers, query parameters, and the
//! SHA-256 of the body (never the body itself). Retention is bounded by both
//! a record count and a maximum age; the oldest records are evicted first on
//! every append.
//!
//! `Authorization`, `X-API-Key`, and `Cookie` headers are removed before a
//! trace is constructed, so credential material can never reach storage.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use sqlx::{Row, SqlitePool};

use crate::error::Result;
use crate::models::Trace;

/// Headers removed before storage.
const SENSITIVE_HEADERS: &[&str] = &["authorization", "x-api-key", "cookie", "set-cookie"];
/// Stored header values are clipped to this length.
const MAX_HEADER_VALUE: usize = 200;

/// Filters for [`TraceRing::list`].
#[derive(Debug, Default, Clone)]
pub struct TraceFilter {
    pub since: Option<DateTime<Utc>>,
    pub status: Option<u16>,
    pub path_prefix: Option<String>,
    pub has_error: Option<bool>,
}

/// Aggregate request statistics over a recent window.
#[derive(Debug, serde::Serialize)]
pub struct MetricsSummary {
    pub window_seconds: i64,
    pub total: i64,
    pub status_2xx: i64,
    pub status_4xx: i64,
    pub status_5xx: i64,
    pub unauthorized: i64,
    pub top_paths: Vec<(String, i64)>,
    pub p95_latency_ms: Option<f64>,
}

pub struct TraceRing {
    pool: SqlitePool,
    max_records: i64,
    max_age_seconds: i64,
}

impl TraceRing {
    pub fn new(pool: SqlitePool, max_records: i64, max_age_seconds: i64) -> Self {
        Self {
            pool,
            max_records,
            max_age_seconds,
        }
    }

    /// Append one trace and evict past the retention bounds.
    pub async fn append(&self, trace: &Trace) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO traces \
             (id, ts, method, path, status, latency_ms, ip, user_agent, headers_scrubbed, \
              query_params, body_sha256, session_id, error) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&trace.id)
        .bind(trace.ts.timestamp())
        .bind(&trace.method)
        .bind(&trace.path)
        .bind(trace.status as i64)
        .bind(trace.latency_ms)
        .bind(&trace.ip)
        .bind(&trace.user_agent)
        .bind(trace.headers_scrubbed.to_string())
        .bind(trace.query_params.to_string())
        .bind(&trace.body_sha256)
        .bind(&trace.session_id)
        .bind(&trace.error)
        .execute(&self.pool)
        .await?;

        // Oldest-first eviction by age, then by count.
        let cutoff = Utc::now().timestamp() - self.max_age_seconds;
        sqlx::query("DELETE FROM traces WHERE ts < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "DELETE FROM traces WHERE id NOT IN \
             (SELECT id FROM traces ORDER BY ts DESC, id DESC LIMIT ?)",
        )
        .bind(self.max_records)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Trace>> {
        let row = sqlx::query("SELECT * FROM traces WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| row_to_trace(&r)))
    }

    pub async fn list(&self, filter: &TraceFilter, limit: i64) -> Result<Vec<Trace>> {
        let mut sql = String::from("SELECT * FROM traces WHERE 1=1");
        if filter.since.is_some() {
            sql.push_str(" AND ts >= ?");
        }
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if filter.path_prefix.is_some() {
            sql.push_str(" AND path LIKE ?");
        }
        match filter.has_error {
            Some(true) => sql.push_str(" AND error IS NOT NULL"),
            Some(false) => sql.push_str(" AND error IS NULL"),
            None => {}
        }
        sql.push_str(" ORDER BY ts DESC, id DESC LIMIT ?");

        let mut query = sqlx::query(&sql);
        if let Some(since) = filter.since {
            query = query.bind(since.timestamp());
        }
        if let Some(status) = filter.status {
            query = query.bind(status as i64);
        }
        if let Some(prefix) = &filter.path_prefix {
            query = query.bind(format!("{}%", prefix));
        }
        query = query.bind(limit.clamp(1, 1_000));

        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.iter().map(row_to_trace).collect())
    }

    /// Status, path, and latency aggregates over the last `window_seconds`.
    pub async fn metrics_summary(&self, window_seconds: i64) -> Result<MetricsSummary> {
        let since = Utc::now().timestamp() - window_seconds;
        let rows = sqlx::query("SELECT status, path, latency_ms FROM traces WHERE ts >= ?")
            .bind(since)
            .fetch_all(&self.pool)
            .await?;

        let mut summary = MetricsSummary {
            window_seconds,
            total: rows.len() as i64,
            status_2xx: 0,
            status_4xx: 0,
            status_5xx: 0,
            unauthorized: 0,
            top_paths: Vec::new(),
            p95_latency_ms: None,
        };

        let mut path_counts: std::collections::HashMap<String, i64> = std::collections::HashMap::new();
        let mut latencies: Vec<f64> = Vec::with_capacity(rows.len());
        for row in &rows {
            let status: i64 = row.get("status");
            match status {
                200..=299 => summary.status_2xx += 1,
                400..=499 => summary.status_4xx += 1,
                500..=599 => summary.status_5xx += 1,
                _ => {}
            }
            if status == 401 {
                summary.unauthorized += 1;
            }
            *path_counts.entry(row.get("path")).or_insert(0) += 1;
            latencies.push(row.get("latency_ms"));
        }

        if !latencies.is_empty() {
            latencies.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let idx = ((latencies.len() - 1) as f64 * 0.95) as usize;
            summary.p95_latency_ms = Some(latencies[idx]);
        }

        let mut top: Vec<(String, i64)> = path_counts.into_iter().collect();
        top.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top.truncate(10);
        summary.top_paths = top;
        Ok(summary)
    }
}

/// Drop credential headers and clip long values before storage.
pub fn scrub_headers(headers: &axum::http::HeaderMap) -> Value {
    let mut out = Map::new();
    for (name, value) in headers.iter() {
        let name_lower = name.as_str().to_lowercase();
        if SENSITIVE_HEADERS.contains(&name_lower.as_str()) {
            continue;
        }
        let value = value.to_str().unwrap_or("<binary>");
        let clipped = if value.len() > MAX_HEADER_VALUE {
            format!("{}...", &value[..MAX_HEADER_VALUE])
        } else {
            value.to_string()
        };
        out.insert(name_lower, Value::String(clipped));
    }
    Value::Object(out)
}

fn row_to_trace(row: &sqlx::sqlite::SqliteRow) -> Trace {
    let ts: i64 = row.get("ts");
    let headers: String = row.get("headers_scrubbed");
    let query_params: String = row.get("query_params");
    let status: i64 = row.get("status");
    Trace {
        id: row.get("id"),
        ts: Utc.timestamp_opt(ts, 0).single().unwrap_or_else(Utc::now),
        method: row.get("method"),
        path: row.get("path"),
        status: status as u16,
        latency_ms: row.get("latency_ms"),
        ip: row.get("ip"),
        user_agent: row.get("user_agent"),
        headers_scrubbed: serde_json::from_str(&headers).unwrap_or(Value::Null),
        query_params: serde_json::from_str(&query_params).unwrap_or(Value::Null),
        body_sha256: row.get("body_sha256"),
        session_id: row.get("session_id"),
        error: row.get("error"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn ring(max_records: i64, max_age: i64) -> TraceRing {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::migrate::run_migrations(&pool).await.unwrap();
        TraceRing::new(pool, max_records, max_age)
    }

    fn trace(id: &str, status: u16, path: &str) -> Trace {
        Trace {
            id: id.to_string(),
            ts: Utc::now(),
            method: "GET".to_string(),
            path: path.to_string(),
            status,
            latency_ms: 12.5,
            ip: "127.0.0.1".to_string(),
            user_agent: Some("tests".to_string()),
            headers_scrubbed: serde_json::json!({"accept": "application/json"}),
            query_params: serde_json::json!({}),
            body_sha256: None,
            session_id: None,
            error: if status >= 500 { Some("boom".to_string()) } else { None },
        }
    }

    #[tokio::test]
    async fn append_and_get_roundtrip() {
        let ring = ring(100, 3600).await;
        ring.append(&trace("t1", 200, "/v1/query")).await.unwrap();
        let got = ring.get("t1").await.unwrap().unwrap();
        assert_eq!(got.status, 200);
        assert_eq!(got.path, "/v1/query");
        assert_eq!(got.headers_scrubbed["accept"], "application/json");
        assert!(ring.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn retention_caps_record_count() {
        let ring = ring(5, 3600).await;
        for i in 0..20 {
            ring.append(&trace(&format!("t{:02}", i), 200, "/p")).await.unwrap();
        }
        let all = ring.list(&TraceFilter::default(), 100).await.unwrap();
        assert_eq!(all.len(), 5);
        // Newest survive.
        assert!(all.iter().any(|t| t.id == "t19"));
        assert!(!all.iter().any(|t| t.id == "t00"));
    }

    #[tokio::test]
    async fn filters_narrow_results() {
        let ring = ring(100, 3600).await;
        ring.append(&trace("a", 200, "/v1/query")).await.unwrap();
        ring.append(&trace("b", 500, "/v1/query")).await.unwrap();
        ring.append(&trace("c", 200, "/healthz")).await.unwrap();

        let errors = ring
            .list(
                &TraceFilter {
                    has_error: Some(true),
                    ..Default::default()
                },
                100,
            )
            .await
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].id, "b");

        let by_path = ring
            .list(
                &TraceFilter {
                    path_prefix: Some("/v1/".to_string()),
                    ..Default::default()
                },
                100,
            )
            .await
            .unwrap();
        assert_eq!(by_path.len(), 2);

        let by_status = ring
            .list(
                &TraceFilter {
                    status: Some(500),
                    ..Default::default()
                },
                100,
            )
            .await
            .unwrap();
        assert_eq!(by_status.len(), 1);
    }

    #[tokio::test]
    async fn metrics_summary_aggregates() {
        let ring = ring(100, 3600).await;
        ring.append(&trace("a", 200, "/v1/query")).await.unwrap();
        ring.append(&trace("b", 200, "/v1/query")).await.unwrap();
        ring.append(&trace("c", 401, "/v1/projects")).await.unwrap();
        ring.append(&trace("d", 500, "/v1/query")).await.unwrap();

        let summary = ring.metrics_summary(3600).await.unwrap();
        assert_eq!(summary.total, 4);
        assert_eq!(summary.status_2xx, 2);
        assert_eq!(summary.status_4xx, 1);
        assert_eq!(summary.status_5xx, 1);
        assert_eq!(summary.unauthorized, 1);
        assert_eq!(summary.top_paths[0].0, "/v1/query");
        assert!(summary.p95_latency_ms.is_some());
    }

    #[test]
    fn scrub_removes_credentials_and_clips() {
        let mut headers = axum::http::HeaderMap::new();
        headers.insert("authorization", "Bearer secret-token".parse().unwrap());
        headers.insert("x-api-key", "secret-key".parse().unwrap());
        headers.insert("cookie", "session=abc".parse().unwrap());
        headers.insert("user-agent", "tests".parse().unwrap());
        headers.insert("x-long", "v".repeat(300).parse().unwrap());

        let scrubbed = scrub_headers(&headers);
        let text = scrubbed.to_string();
        assert!(!text.contains("Bearer "));
        assert!(!text.contains("secret-key"));
        assert!(!text.contains("session=abc"));
        assert_eq!(scrubbed["user-agent"], "tests");
        assert!(scrubbed["x-long"].as_str().unwrap().len() <= MAX_HEADER_VALUE + 3);
    }
}
