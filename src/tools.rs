//! Auxiliary tool registry.
//!
//! Tools are stateless capabilities registered at startup and invoked by the
//! query orchestrator or directly via `POST /v1/tools/{name}`. Each tool
//! declares a parameter schema (name, type, required, default); the registry
//! validates and normalizes parameters before dispatch, so tools only ever
//! see well-formed input.
//!
//! | Tool | Purpose | Failure modes |
//! |------|---------|---------------|
//! | `datetime` | Current date/time, optional strftime format | invalid format |
//! | `web_search` | Web search via a Searx-compatible endpoint | network errors |
//!
//! Executions are capped at 10 seconds; a timeout is reported as a failed
//! [`ToolUsage`], never as a handler failure.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::error::{Result, ServiceError};
use crate::models::ToolUsage;

/// Hard cap on a single tool execution.
pub const TOOL_TIMEOUT: Duration = Duration::from_secs(10);

/// Declared type of one tool parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    String,
    Integer,
    Boolean,
}

impl ParamKind {
    fn as_str(&self) -> &'static str {
        match self {
            ParamKind::String => "string",
            ParamKind::Integer => "integer",
            ParamKind::Boolean => "boolean",
        }
    }

    fn matches(&self, value: &Value) -> bool {
        match self {
            ParamKind::String => value.is_string(),
            ParamKind::Integer => value.is_i64() || value.is_u64(),
            ParamKind::Boolean => value.is_boolean(),
        }
    }
}

/// One declared tool parameter.
#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub required: bool,
    pub default: Option<Value>,
    pub description: &'static str,
}

/// A registered auxiliary capability.
///
/// Implementations must be stateless and safe to invoke concurrently.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters(&self) -> Vec<ParamSpec>;

    /// Execute with parameters already validated against [`Tool::parameters`].
    async fn execute(&self, params: &Value) -> Result<Value>;
}

/// Registry of tools available to the orchestrator and the HTTP surface.
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// Registry pre-loaded with the built-in tools.
    pub fn with_builtins(web_search_endpoint: &str) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(DatetimeTool));
        registry.register(Arc::new(WebSearchTool::new(web_search_endpoint)));
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn find(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name)
    }

    /// Tool descriptors for `GET /v1/tools`, JSON-Schema shaped.
    pub fn list(&self) -> Vec<Value> {
        self.tools
            .iter()
            .map(|tool| {
                let mut properties = Map::new();
                let mut required = Vec::new();
                for spec in tool.parameters() {
                    let mut prop = Map::new();
                    prop.insert("type".to_string(), json!(spec.kind.as_str()));
                    prop.insert("description".to_string(), json!(spec.description));
                    if let Some(default) = &spec.default {
                        prop.insert("default".to_string(), default.clone());
                    }
                    properties.insert(spec.name.to_string(), Value::Object(prop));
                    if spec.required {
                        required.push(spec.name);
                    }
                }
                json!({
                    "name": tool.name(),
                    "description": tool.description(),
                    "parameters": {
                        "type": "object",
                        "properties": properties,
                        "required": required,
                    },
                })
            })
            .collect()
    }

    /// Validate, dispatch with the execution cap, and record the outcome.
    ///
    /// Execution trouble (tool error, timeout) is folded into the returned
    /// [`ToolUsage`]; only an unknown tool or invalid parameters error out.
    pub async fn execute(&self, name: &str, params: Value) -> Result<ToolUsage> {
        let tool = self
            .find(name)
            .ok_or_else(|| ServiceError::NotFound(format!("tool '{}' is not registered", name)))?;
        let normalized = validate_params(&tool.parameters(), params)?;

        let started = Instant::now();
        let outcome = tokio::time::timeout(TOOL_TIMEOUT, tool.execute(&normalized)).await;
        let execution_ms = started.elapsed().as_millis() as u64;

        let usage = match outcome {
            Ok(Ok(data)) => ToolUsage {
                tool: name.to_string(),
                parameters: normalized,
                success: true,
                data: Some(data),
                error: None,
                execution_ms,
            },
            // Invalid arguments surface to the caller; execution trouble is
            // recorded as a failed usage.
            Ok(Err(e @ ServiceError::BadRequest(_))) => return Err(e),
            Ok(Err(e)) => {
                warn!(tool = name, error = %e, "tool execution failed");
                ToolUsage {
                    tool: name.to_string(),
                    parameters: normalized,
                    success: false,
                    data: None,
                    error: Some(e.to_string()),
                    execution_ms,
                }
            }
            Err(_) => ToolUsage {
                tool: name.to_string(),
                parameters: normalized,
                success: false,
                data: None,
                error: Some(format!("tool timed out after {:?}", TOOL_TIMEOUT)),
                execution_ms,
            },
        };
        Ok(usage)
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Check a parameter object against the declared specs, filling defaults.
///
/// Rejects non-object input, unknown parameters, missing required
/// parameters, and type mismatches.
pub fn validate_params(specs: &[ParamSpec], params: Value) -> Result<Value> {
    let map = match params {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            return Err(ServiceError::BadRequest(format!(
                "tool parameters must be an object, got {}",
                type_name(&other)
            )))
        }
    };

    for key in map.keys() {
        if !specs.iter().any(|s| s.name == key) {
            return Err(ServiceError::BadRequest(format!(
                "unknown tool parameter '{}'",
                key
            )));
        }
    }

    let mut normalized = Map::new();
    for spec in specs {
        match map.get(spec.name) {
            Some(value) if !value.is_null() => {
                if !spec.kind.matches(value) {
                    return Err(ServiceError::BadRequest(format!(
                        "parameter '{}' must be a {}",
                        spec.name,
                        spec.kind.as_str()
                    )));
                }
                normalized.insert(spec.name.to_string(), value.clone());
            }
            _ => {
                if let Some(default) = &spec.default {
                    normalized.insert(spec.name.to_string(), default.clone());
                } else if spec.required {
                    return Err(ServiceError::BadRequest(format!(
                        "missing required tool parameter '{}'",
                        spec.name
                    )));
                }
            }
        }
    }
    Ok(Value::Object(normalized))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ============ datetime ============

/// Reports the current UTC date and time.
pub struct DatetimeTool;

#[async_trait]
impl Tool for DatetimeTool {
    fn name(&self) -> &str {
        "datetime"
    }

    fn description(&self) -> &str {
        "Get the current date, time, and weekday (UTC)"
    }

    fn parameters(&self) -> Vec<ParamSpec> {
        vec![ParamSpec {
            name: "format",
            kind: ParamKind::String,
            required: false,
            default: None,
            description: "Optional strftime format string (default RFC 3339)",
        }]
    }

    async fn execute(&self, params: &Value) -> Result<Value> {
        let now = Utc::now();
        let formatted = match params.get("format").and_then(|f| f.as_str()) {
            Some(format) => {
                // chrono reports bad specifiers as error items at parse time.
                let items: Vec<_> = chrono::format::StrftimeItems::new(format).collect();
                if items.iter().any(|i| matches!(i, chrono::format::Item::Error)) {
                    return Err(ServiceError::BadRequest(format!(
                        "invalid datetime format: '{}'",
                        format
                    )));
                }
                now.format_with_items(items.into_iter()).to_string()
            }
            None => now.to_rfc3339(),
        };

        Ok(json!({
            "current_datetime": formatted,
            "iso_format": now.to_rfc3339(),
            "timestamp": now.timestamp(),
            "year": now.format("%Y").to_string(),
            "month": now.format("%m").to_string(),
            "day": now.format("%d").to_string(),
            "weekday": now.format("%A").to_string(),
            "timezone": "UTC",
        }))
    }
}

// ============ web_search ============

/// Web search against a Searx-compatible JSON endpoint.
pub struct WebSearchTool {
    endpoint: String,
    client: reqwest::Client,
}

impl WebSearchTool {
    pub fn new(endpoint: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(TOOL_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            endpoint: endpoint.to_string(),
            client,
        }
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web for current information"
    }

    fn parameters(&self) -> Vec<ParamSpec> {
        vec![
            ParamSpec {
                name: "query",
                kind: ParamKind::String,
                required: true,
                default: None,
                description: "The search query string",
            },
            ParamSpec {
                name: "max_results",
                kind: ParamKind::Integer,
                required: false,
                default: Some(json!(5)),
                description: "Maximum number of results (1-10)",
            },
        ]
    }

    async fn execute(&self, params: &Value) -> Result<Value> {
        let query = params
            .get("query")
            .and_then(|q| q.as_str())
            .unwrap_or_default();
        if query.trim().is_empty() {
            return Err(ServiceError::BadRequest(
                "search query must not be empty".to_string(),
            ));
        }
        let max_results = params
            .get("max_results")
            .and_then(|m| m.as_u64())
            .unwrap_or(5)
            .clamp(1, 10) as usize;

        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("q", query), ("format", "json"), ("language", "en")])
            .send()
            .await
            .map_err(|e| ServiceError::ToolFailure(format!("web search unreachable: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ServiceError::ToolFailure(format!(
                "web search returned status {}",
                status
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ServiceError::ToolFailure(format!("invalid search response: {}", e)))?;

        let results: Vec<Value> = body
            .get("results")
            .and_then(|r| r.as_array())
            .map(|items| {
                items
                    .iter()
                    .take(max_results)
                    .map(|item| {
                        json!({
                            "title": item.get("title").and_then(|v| v.as_str()).unwrap_or(""),
                            "snippet": item.get("content").and_then(|v| v.as_str()).unwrap_or(""),
                            "url": item.get("url").and_then(|v| v.as_str()).unwrap_or(""),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(json!({
            "query": query,
            "results": results,
            "total_results": results.len(),
        }))
    }
}
