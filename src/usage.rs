//! Usage accounting: monthly message counters and per-completion logs.
//!
//! Counter increments are read-then-write with no locking; concurrent
//! turns in the same month can under-count. That is acceptable for the
//! approximate billing view these feed, and is documented rather than
//! hidden. Completion logs are append-only and written on a spawned
//! task with its own error boundary: a failed insert is traced and
//! dropped, never surfaced to the visitor.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::completion::TokenUsage;

/// Flat fallback rate when a site has not declared per-token prices.
const FLAT_COST_PER_TOKEN: f64 = 0.000_001;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStatus {
    Success,
    Error,
}

impl LogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStatus::Success => "success",
            LogStatus::Error => "error",
        }
    }
}

/// One completion attempt, success or failure.
#[derive(Debug, Clone)]
pub struct UsageLogEntry {
    pub site_id: String,
    pub session_id: Option<String>,
    pub model: String,
    pub provider: String,
    pub usage: TokenUsage,
    pub latency_ms: i64,
    pub estimated_cost: f64,
    pub status: LogStatus,
    pub error_message: Option<String>,
}

/// Current calendar month key, e.g. `2026-08`.
pub fn current_month() -> String {
    chrono::Utc::now().format("%Y-%m").to_string()
}

/// Increment the site's counter for `month`, creating the row on first
/// use. Best-effort; not transactionally linked to message persistence.
pub async fn increment_monthly_usage(pool: &SqlitePool, site_id: &str, month: &str) -> Result<()> {
    let existing: Option<i64> =
        sqlx::query_scalar("SELECT message_count FROM usage WHERE site_id = ? AND month = ?")
            .bind(site_id)
            .bind(month)
            .fetch_optional(pool)
            .await?;

    match existing {
        Some(count) => {
            sqlx::query("UPDATE usage SET message_count = ? WHERE site_id = ? AND month = ?")
                .bind(count + 1)
                .bind(site_id)
                .bind(month)
                .execute(pool)
                .await?;
        }
        None => {
            sqlx::query("INSERT INTO usage (site_id, month, message_count) VALUES (?, ?, 1)")
                .bind(site_id)
                .bind(month)
                .execute(pool)
                .await?;
        }
    }

    Ok(())
}

/// Estimated cost in USD for one completion.
///
/// Uses the site's per-million-token prices when both are declared,
/// otherwise a flat approximate per-token rate.
pub fn estimate_cost(
    usage: &TokenUsage,
    input_price: Option<f64>,
    output_price: Option<f64>,
) -> f64 {
    match (input_price, output_price) {
        (Some(input), Some(output)) => {
            usage.prompt_tokens as f64 * input / 1_000_000.0
                + usage.completion_tokens as f64 * output / 1_000_000.0
        }
        _ => usage.total_tokens as f64 * FLAT_COST_PER_TOKEN,
    }
}

/// Hand the log write to a background task. The response path never
/// waits on it and never observes its failure.
pub fn spawn_usage_log(pool: SqlitePool, entry: UsageLogEntry) {
    tokio::spawn(async move {
        if let Err(e) = insert_usage_log(&pool, &entry).await {
            tracing::warn!(site_id = %entry.site_id, error = %e, "usage log write failed");
        }
    });
}

pub async fn insert_usage_log(pool: &SqlitePool, entry: &UsageLogEntry) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO ai_usage_logs
            (site_id, session_id, model, provider, prompt_tokens, completion_tokens,
             total_tokens, latency_ms, estimated_cost, status, error_message, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&entry.site_id)
    .bind(&entry.session_id)
    .bind(&entry.model)
    .bind(&entry.provider)
    .bind(entry.usage.prompt_tokens as i64)
    .bind(entry.usage.completion_tokens as i64)
    .bind(entry.usage.total_tokens as i64)
    .bind(entry.latency_ms)
    .bind(entry.estimated_cost)
    .bind(entry.status.as_str())
    .bind(&entry.error_message)
    .bind(chrono::Utc::now().timestamp())
    .execute(pool)
    .await?;

    Ok(())
}
