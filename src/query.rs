//! Query orchestration.
//!
//! Fuses retrieval, tool invocation, and answer synthesis into one response:
//!
//! 1. Validate that the project exists and is active.
//! 2. Retrieve the top sources.
//! 3. Select tools by keyword heuristic: datetime keywords always trigger
//!    the `datetime` tool; web-search keywords trigger `web_search` only
//!    when no retrieved source clears the sufficiency floor.
//! 4. Compose a capped prompt (8,000 characters; earliest source excerpts
//!    are truncated first, sources are dropped only as a last resort).
//! 5. Call the Completer, falling back to a deterministic answer assembled
//!    from the top excerpts when it is absent, fails, or times out.
//!
//! Tool and Completer trouble is demoted to partial results; only retrieval
//! and project validation can fail a query. Repeated identical queries
//! against an unchanged index return identical source orderings.

use chrono::Utc;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::completer::{Completer, COMPLETER_TIMEOUT};
use crate::error::{Result, ServiceError};
use crate::models::{QueryRequest, QueryResponse, Source, ToolUsage};
use crate::retrieve::Retriever;
use crate::storage::Storage;
use crate::tools::ToolRegistry;

/// Keywords that trigger the datetime tool.
const DATETIME_KEYWORDS: &[&str] = &["time", "date", "today", "now", "current"];
/// Keywords that suggest the knowledge base may be stale or insufficient.
const WEB_SEARCH_KEYWORDS: &[&str] = &["latest", "news", "search", "web"];
/// A multi-word trigger checked against the whole question.
const WEB_SEARCH_PHRASE: &str = "current events";

/// web_search is suppressed when the top fused score exceeds this.
const SUFFICIENCY_FLOOR: f64 = 1.0 / 30.0;
/// Composed prompt cap in characters.
const PROMPT_CAP: usize = 8_000;
/// Excerpts shrink to this length when the prompt exceeds the cap.
const TRUNCATED_EXCERPT: usize = 120;

pub struct QueryOrchestrator {
    storage: Arc<dyn Storage>,
    retriever: Arc<Retriever>,
    tools: Arc<ToolRegistry>,
    completer: Option<Arc<dyn Completer>>,
}

impl QueryOrchestrator {
    pub fn new(
        storage: Arc<dyn Storage>,
        retriever: Arc<Retriever>,
        tools: Arc<ToolRegistry>,
        completer: Option<Arc<dyn Completer>>,
    ) -> Self {
        Self {
            storage,
            retriever,
            tools,
            completer,
        }
    }

    pub async fn answer(&self, request: QueryRequest) -> Result<QueryResponse> {
        let project = self
            .storage
            .get_project(&request.project_id)
            .await?
            .filter(|p| p.active)
            .ok_or_else(|| {
                ServiceError::NotFound(format!("project '{}' not found", request.project_id))
            })?;

        let started = Instant::now();

        let retrieval = self
            .retriever
            .search(&request.project_id, &request.question, request.max_sources)
            .await?;

        let mut tools_used: Vec<ToolUsage> = Vec::new();
        if request.use_tools {
            let tokens: HashSet<String> = request
                .question
                .split(|c: char| !c.is_alphanumeric())
                .filter(|t| !t.is_empty())
                .map(|t| t.to_lowercase())
                .collect();

            if DATETIME_KEYWORDS.iter().any(|k| tokens.contains(*k)) {
                self.invoke_tool("datetime", json!({}), &mut tools_used).await;
            }

            let wants_web = WEB_SEARCH_KEYWORDS.iter().any(|k| tokens.contains(*k))
                || request.question.to_lowercase().contains(WEB_SEARCH_PHRASE);
            let sufficient = retrieval
                .top_fused
                .map(|s| s > SUFFICIENCY_FLOOR)
                .unwrap_or(false);
            if wants_web && !sufficient {
                self.invoke_tool(
                    "web_search",
                    json!({"query": request.question}),
                    &mut tools_used,
                )
                .await;
            }
        }

        let (answer, model) = self
            .synthesize(&project.name, &request.question, &retrieval.sources, &tools_used)
            .await;

        let processing_time_ms = started.elapsed().as_millis() as u64;
        info!(
            project = %request.project_id,
            sources = retrieval.sources.len(),
            tools = tools_used.len(),
            elapsed_ms = processing_time_ms,
            "query answered"
        );

        Ok(QueryResponse {
            answer,
            sources: retrieval.sources,
            tools_used,
            project_id: request.project_id,
            timestamp: Utc::now(),
            model,
            processing_time_ms,
        })
    }

    /// Run one tool and record the outcome. Failures never abort the query.
    async fn invoke_tool(&self, name: &str, params: serde_json::Value, log: &mut Vec<ToolUsage>) {
        match self.tools.execute(name, params.clone()).await {
            Ok(usage) => log.push(usage),
            Err(e) => {
                warn!(tool = name, error = %e, "tool invocation rejected");
                log.push(ToolUsage {
                    tool: name.to_string(),
                    parameters: params,
                    success: false,
                    data: None,
                    error: Some(e.to_string()),
                    execution_ms: 0,
                });
            }
        }
    }

    /// Completer call with fallback. Returns `(answer, model)`.
    async fn synthesize(
        &self,
        project_name: &str,
        question: &str,
        sources: &[Source],
        tools_used: &[ToolUsage],
    ) -> (String, Option<String>) {
        if let Some(completer) = &self.completer {
            let system = system_prompt(project_name);
            let user = compose_prompt(question, sources, tools_used);
            match tokio::time::timeout(COMPLETER_TIMEOUT, completer.complete(&system, &user)).await
            {
                Ok(Ok(answer)) if !answer.trim().is_empty() => {
                    return (answer, Some(completer.model_name().to_string()));
                }
                Ok(Ok(_)) => {
                    warn!("completer returned an empty answer; falling back");
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "completer failed; falling back");
                }
                Err(_) => {
                    warn!(timeout = ?COMPLETER_TIMEOUT, "completer timed out; falling back");
                }
            }
        }
        (fallback_answer(project_name, sources, tools_used), None)
    }
}

fn system_prompt(project_name: &str) -> String {
    format!(
        "You are the knowledge-base assistant for {}. Answer using only the \
         numbered references provided; cite the reference numbers you relied \
         on, and say so plainly when the references do not contain the answer.",
        project_name
    )
}

/// Build the numbered-reference prompt, enforcing the character cap.
///
/// When the composed prompt exceeds the cap, the earliest source excerpts
/// are truncated first; whole sources are dropped (earliest first) only if
/// truncation alone is not enough.
pub fn compose_prompt(question: &str, sources: &[Source], tools_used: &[ToolUsage]) -> String {
    let mut excerpts: Vec<String> = sources.iter().map(|s| s.excerpt.clone()).collect();
    let mut dropped = 0usize;

    loop {
        let prompt = render_prompt(question, sources, &excerpts, dropped, tools_used);
        if prompt.chars().count() <= PROMPT_CAP {
            return prompt;
        }
        // Truncate the earliest still-full excerpt.
        if let Some(excerpt) = excerpts
            .iter_mut()
            .skip(dropped)
            .find(|e| e.chars().count() > TRUNCATED_EXCERPT)
        {
            *excerpt = excerpt.chars().take(TRUNCATED_EXCERPT).collect();
            continue;
        }
        // All excerpts already minimal: drop the earliest source.
        if dropped < sources.len() {
            dropped += 1;
            continue;
        }
        return prompt;
    }
}

fn render_prompt(
    question: &str,
    sources: &[Source],
    excerpts: &[String],
    dropped: usize,
    tools_used: &[ToolUsage],
) -> String {
    let mut out = String::new();
    let mut n = 0usize;
    for (source, excerpt) in sources.iter().zip(excerpts.iter()).skip(dropped) {
        n += 1;
        out.push_str(&format!("{}. {}\n   {}\n", n, source.title, excerpt));
    }
    for usage in tools_used {
        if !usage.success {
            continue;
        }
        n += 1;
        let data = usage
            .data
            .as_ref()
            .map(|d| d.to_string())
            .unwrap_or_default();
        out.push_str(&format!("{}. Tool result ({}): {}\n", n, usage.tool, data));
    }
    if out.is_empty() {
        out.push_str("(no references available)\n");
    }
    out.push_str("\nQuestion: ");
    out.push_str(question);
    out
}

/// Deterministic answer used when no Completer is configured or it fails.
fn fallback_answer(project_name: &str, sources: &[Source], tools_used: &[ToolUsage]) -> String {
    let datetime = tools_used
        .iter()
        .find(|t| t.tool == "datetime" && t.success)
        .and_then(|t| t.data.as_ref())
        .and_then(|d| d.get("current_datetime"))
        .and_then(|v| v.as_str());

    if sources.is_empty() {
        return match datetime {
            Some(now) => format!(
                "The current date and time is {}. No matching content was found \
                 in the {} knowledge base for this question.",
                now, project_name
            ),
            None => format!(
                "No matching content was found in the {} knowledge base for this \
                 question.",
                project_name
            ),
        };
    }

    let mut answer = match datetime {
        Some(now) => format!(
            "The current date and time is {}. Here is the most relevant \
             information from the {} knowledge base:",
            now, project_name
        ),
        None => format!(
            "Here is the most relevant information from the {} knowledge base:",
            project_name
        ),
    };
    for source in sources {
        answer.push('\n');
        answer.push_str(&source.excerpt);
    }
    answer
}
