//! The visitor chat turn: retrieval-augmented answering.
//!
//! One synchronous pipeline per widget message: resolve the session,
//! persist the user's turn, count it, embed it, retrieve the site's
//! closest chunks, assemble the prompt with recent history, and complete:
//! with the tenant's own provider when fully configured, otherwise the
//! shared fallback chain. Every completion attempt leaves an
//! `ai_usage_logs` row behind on a detached task.
//!
//! Failure shape: an embedding or completion failure aborts the turn as
//! an [`UpstreamError`] (the HTTP layer answers 502) and persists no
//! assistant message, leaving only the user's turn recorded so the
//! visitor can simply retry.

use anyhow::{bail, Context, Result};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::completion::{CompletionClient, CompletionOptions, TokenUsage};
use crate::config::Config;
use crate::embedding::EmbeddingClient;
use crate::models::{ChatRole, PromptMessage, SiteAiConfig, SourceRef};
use crate::search::search_chunks;
use crate::sites::load_site_config;
use crate::usage::{
    current_month, estimate_cost, increment_monthly_usage, spawn_usage_log, LogStatus,
    UsageLogEntry,
};

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful knowledge base assistant. \
Answer the user's question based ONLY on the provided context. \
If the context doesn't contain enough information, say so honestly. \
Be concise and helpful. Always respond in the same language as the user's question.";

const NO_CONTEXT_TEXT: &str = "No relevant context found.";
const CONTEXT_DELIMITER: &str = "\n\n---\n\n";
const EMPTY_ANSWER_TEXT: &str = "Sorry, I could not generate a response.";
const DEFAULT_PROVIDER: &str = "openrouter";

/// Upstream provider failure (embedding or completion). Carried inside
/// `anyhow::Error` so the HTTP layer can map it to 502 by downcast.
#[derive(Debug)]
pub struct UpstreamError(pub String);

impl std::fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AI request failed: {}", self.0)
    }
}

impl std::error::Error for UpstreamError {}

#[derive(Debug, Clone)]
pub struct WidgetRequest {
    pub site_id: String,
    pub session_id: Option<String>,
    pub message: String,
    pub visitor_id: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct WidgetResponse {
    pub answer: String,
    pub sources: Vec<SourceRef>,
    pub session_id: String,
}

/// Run one full chat turn.
pub async fn answer_turn(
    pool: &SqlitePool,
    config: &Config,
    embedder: &EmbeddingClient,
    shared_completion: &CompletionClient,
    req: WidgetRequest,
) -> Result<WidgetResponse> {
    if req.site_id.is_empty() || req.message.is_empty() {
        bail!("site_id and message are required");
    }

    let session_id = resolve_session(pool, &req).await?;
    insert_message(pool, &session_id, &req.site_id, ChatRole::User, &req.message, None).await?;

    // Best-effort counter; a failed increment never fails the turn.
    if let Err(e) = increment_monthly_usage(pool, &req.site_id, &current_month()).await {
        tracing::warn!(site_id = %req.site_id, error = %e, "usage counter increment failed");
    }

    let site_config = load_site_config(pool, &req.site_id).await?;

    let query_vector = match embedder.embed_query(&req.message).await {
        Ok(vector) => vector,
        Err(e) => {
            log_failed_attempt(pool, &req, &session_id, &site_config, 0, &e);
            return Err(e.context(UpstreamError("query embedding failed".to_string())));
        }
    };

    let retrieved = search_chunks(
        pool,
        &req.site_id,
        &query_vector,
        config.retrieval.similarity_threshold,
        config.retrieval.top_k,
    )
    .await?;

    let context: String = retrieved
        .iter()
        .map(|c| c.content.as_str())
        .collect::<Vec<_>>()
        .join(CONTEXT_DELIMITER);

    let sources: Vec<SourceRef> = retrieved
        .iter()
        .map(|c| SourceRef {
            content: truncate_chars(&c.content, config.retrieval.source_excerpt_chars).to_string(),
            document_title: c.title.clone(),
            similarity: c.similarity,
        })
        .collect();

    let history = load_recent_history(pool, &session_id, config.retrieval.history_limit).await?;
    let messages = build_messages(
        site_config.system_prompt.as_deref(),
        &context,
        &history,
        &req.message,
        config.retrieval.history_window,
    );

    let opts = CompletionOptions {
        temperature: site_config.temperature.unwrap_or(config.completion.temperature),
        max_tokens: site_config.max_tokens.unwrap_or(config.completion.max_tokens),
    };

    let custom = site_config.custom_completion();
    let provider = site_config
        .provider
        .clone()
        .unwrap_or_else(|| DEFAULT_PROVIDER.to_string());

    let started = std::time::Instant::now();
    let result = match &custom {
        Some((key, url, model)) => {
            tracing::debug!(%model, base_url = %url, "using tenant completion config");
            let client = CompletionClient::custom(key, url, model, config.completion.timeout_secs)?;
            client.complete(&messages, &opts).await
        }
        None => shared_completion.complete(&messages, &opts).await,
    };
    let latency_ms = started.elapsed().as_millis() as i64;

    let completion = match result {
        Ok(completion) => completion,
        Err(e) => {
            log_failed_attempt(pool, &req, &session_id, &site_config, latency_ms, &e);
            return Err(e.context(UpstreamError("completion failed".to_string())));
        }
    };

    let cost = estimate_cost(
        &completion.usage,
        site_config.input_price,
        site_config.output_price,
    );
    spawn_usage_log(
        pool.clone(),
        UsageLogEntry {
            site_id: req.site_id.clone(),
            session_id: Some(session_id.clone()),
            model: completion.model.clone(),
            provider,
            usage: completion.usage,
            latency_ms,
            estimated_cost: cost,
            status: LogStatus::Success,
            error_message: None,
        },
    );

    let answer = if completion.text.is_empty() {
        EMPTY_ANSWER_TEXT.to_string()
    } else {
        completion.text
    };

    let sources_json = serde_json::to_string(&sources)?;
    insert_message(
        pool,
        &session_id,
        &req.site_id,
        ChatRole::Assistant,
        &answer,
        Some(&sources_json),
    )
    .await?;

    Ok(WidgetResponse {
        answer,
        sources,
        session_id,
    })
}

/// Error-path usage log: zero token and cost fields, status `error`.
fn log_failed_attempt(
    pool: &SqlitePool,
    req: &WidgetRequest,
    session_id: &str,
    site_config: &SiteAiConfig,
    latency_ms: i64,
    error: &anyhow::Error,
) {
    spawn_usage_log(
        pool.clone(),
        UsageLogEntry {
            site_id: req.site_id.clone(),
            session_id: Some(session_id.to_string()),
            model: site_config
                .model
                .clone()
                .unwrap_or_else(|| "default".to_string()),
            provider: site_config
                .provider
                .clone()
                .unwrap_or_else(|| DEFAULT_PROVIDER.to_string()),
            usage: TokenUsage::default(),
            latency_ms,
            estimated_cost: 0.0,
            status: LogStatus::Error,
            error_message: Some(error.to_string()),
        },
    );
}

/// Use the supplied session when present, otherwise create one lazily.
async fn resolve_session(pool: &SqlitePool, req: &WidgetRequest) -> Result<String> {
    if let Some(session_id) = &req.session_id {
        let exists: Option<String> =
            sqlx::query_scalar("SELECT id FROM chat_sessions WHERE id = ? AND site_id = ?")
                .bind(session_id)
                .bind(&req.site_id)
                .fetch_optional(pool)
                .await?;
        return exists.with_context(|| format!("unknown session: {}", session_id));
    }

    let session_id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO chat_sessions (id, site_id, visitor_id, created_at) VALUES (?, ?, ?, ?)",
    )
    .bind(&session_id)
    .bind(&req.site_id)
    .bind(req.visitor_id.as_deref().unwrap_or("anonymous"))
    .bind(chrono::Utc::now().timestamp())
    .execute(pool)
    .await?;

    Ok(session_id)
}

async fn insert_message(
    pool: &SqlitePool,
    session_id: &str,
    site_id: &str,
    role: ChatRole,
    content: &str,
    sources_json: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO chat_messages (id, session_id, site_id, role, content, sources_json, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(session_id)
    .bind(site_id)
    .bind(role.as_str())
    .bind(content)
    .bind(sources_json)
    .bind(chrono::Utc::now().timestamp())
    .execute(pool)
    .await?;

    Ok(())
}

/// Most recent `limit` turns, returned oldest first.
async fn load_recent_history(
    pool: &SqlitePool,
    session_id: &str,
    limit: i64,
) -> Result<Vec<PromptMessage>> {
    let rows = sqlx::query(
        r#"
        SELECT role, content FROM chat_messages
        WHERE session_id = ?
        ORDER BY created_at DESC, rowid DESC
        LIMIT ?
        "#,
    )
    .bind(session_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    let mut history = Vec::with_capacity(rows.len());
    for row in rows.iter().rev() {
        let role: String = row.get("role");
        history.push(PromptMessage {
            role: ChatRole::parse(&role)?,
            content: row.get("content"),
        });
    }
    Ok(history)
}

/// Assemble the prompt: system message (custom or default instruction,
/// plus the context block), the trimmed recent history, and the current
/// user message, unless the history already ends with that exact turn.
fn build_messages(
    custom_system_prompt: Option<&str>,
    context: &str,
    history: &[PromptMessage],
    user_message: &str,
    history_window: usize,
) -> Vec<PromptMessage> {
    let context_block = if context.is_empty() {
        NO_CONTEXT_TEXT
    } else {
        context
    };

    let instruction = custom_system_prompt.unwrap_or(DEFAULT_SYSTEM_PROMPT);
    let system = format!(
        "{}\n\nContext from knowledge base:\n{}",
        instruction, context_block
    );

    let mut messages = vec![PromptMessage::system(system)];
    let start = history.len().saturating_sub(history_window);
    messages.extend(history[start..].iter().cloned());

    let duplicate = matches!(
        messages.last(),
        Some(last) if last.role == ChatRole::User && last.content == user_message
    );
    if !duplicate {
        messages.push(PromptMessage::user(user_message));
    }

    messages
}

fn truncate_chars(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
