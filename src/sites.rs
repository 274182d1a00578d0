//! Per-site AI configuration storage.
//!
//! The full config (including provider credentials and pricing) is only
//! ever written and read server-side; the widget-facing endpoint exposes
//! the display subset and nothing else.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::models::SiteAiConfig;

/// Load a site's AI config, defaulting everything when none was stored.
pub async fn load_site_config(pool: &SqlitePool, site_id: &str) -> Result<SiteAiConfig> {
    let row: Option<String> =
        sqlx::query_scalar("SELECT config_json FROM site_configs WHERE site_id = ?")
            .bind(site_id)
            .fetch_optional(pool)
            .await?;

    match row {
        Some(json) => serde_json::from_str(&json)
            .with_context(|| format!("corrupt ai config for site {}", site_id)),
        None => Ok(SiteAiConfig::default()),
    }
}

/// Store the full config object for a site, replacing any previous one.
pub async fn save_site_config(
    pool: &SqlitePool,
    site_id: &str,
    config: &SiteAiConfig,
) -> Result<()> {
    let json = serde_json::to_string(config)?;
    sqlx::query(
        r#"
        INSERT INTO site_configs (site_id, config_json, updated_at) VALUES (?, ?, ?)
        ON CONFLICT(site_id) DO UPDATE SET
            config_json = excluded.config_json,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(site_id)
    .bind(json)
    .bind(chrono::Utc::now().timestamp())
    .execute(pool)
    .await?;

    Ok(())
}
