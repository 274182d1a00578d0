//! Document ingestion pipeline.
//!
//! Per document: insert a row in `processing` status so it is visible
//! immediately, chunk the text, batch-embed the chunks, then write the
//! chunk rows and the final `ready` status inside one transaction. Any
//! failure after the insert flips the document to `error` and leaves
//! zero chunk rows behind; re-submitting (or `reembed`) is the only way
//! out of that state.

use anyhow::{bail, Context, Result};
use sqlx::sqlite::SqliteConnection;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::chunker::{chunk_text, estimate_tokens};
use crate::config::Config;
use crate::embedding::{vec_to_blob, EmbeddingClient};
use crate::models::{Document, DocumentStatus, TextChunk};

/// Stored document text is capped; `char_count` still reflects the full
/// extracted length.
const CONTENT_STORE_LIMIT: usize = 50_000;

#[derive(Debug, Clone)]
pub struct NewDocument {
    pub site_id: String,
    pub title: String,
    pub content: String,
    pub source_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub document_id: String,
    pub status: DocumentStatus,
    pub chunk_count: usize,
    pub char_count: usize,
}

/// Run the full pipeline for one submitted document.
pub async fn ingest_document(
    pool: &SqlitePool,
    config: &Config,
    embedder: &EmbeddingClient,
    doc: NewDocument,
) -> Result<IngestOutcome> {
    if doc.site_id.is_empty() || doc.title.is_empty() {
        bail!("site_id and title are required");
    }

    let document_id = Uuid::new_v4().to_string();
    let char_count = doc.content.chars().count();
    let now = chrono::Utc::now().timestamp();

    sqlx::query(
        r#"
        INSERT INTO documents (id, site_id, title, content, source_url, char_count, chunk_count, status, created_at)
        VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?)
        "#,
    )
    .bind(&document_id)
    .bind(&doc.site_id)
    .bind(&doc.title)
    .bind(truncate_chars(&doc.content, CONTENT_STORE_LIMIT))
    .bind(&doc.source_url)
    .bind(char_count as i64)
    .bind(DocumentStatus::Processing.as_str())
    .bind(now)
    .execute(pool)
    .await?;

    match chunk_and_embed(pool, config, embedder, &document_id, &doc).await {
        Ok(chunk_count) => {
            tracing::info!(%document_id, chunk_count, "document ingested");
            Ok(IngestOutcome {
                document_id,
                status: DocumentStatus::Ready,
                chunk_count,
                char_count,
            })
        }
        Err(e) => {
            tracing::warn!(%document_id, error = %e, "ingestion failed");
            let mut conn = pool.acquire().await?;
            transition_status(&mut conn, &document_id, DocumentStatus::Error, None).await?;
            Err(e.context(format!("ingestion failed for document {}", document_id)))
        }
    }
}

/// Steps 2-6: chunk, embed, persist. Returns the chunk count.
async fn chunk_and_embed(
    pool: &SqlitePool,
    config: &Config,
    embedder: &EmbeddingClient,
    document_id: &str,
    doc: &NewDocument,
) -> Result<usize> {
    let chunks = chunk_text(&doc.content, &config.chunking);

    // Zero chunks is success: the document is ready with nothing to
    // retrieve, and the provider is never called on an empty batch.
    if chunks.is_empty() {
        let mut conn = pool.acquire().await?;
        transition_status(&mut conn, document_id, DocumentStatus::Ready, Some(0)).await?;
        return Ok(0);
    }

    let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
    let embeddings = embedder.embed_passages(&texts).await?;

    if embeddings.len() != chunks.len() {
        bail!(
            "embedding count mismatch: {} chunks, {} vectors",
            chunks.len(),
            embeddings.len()
        );
    }

    persist_chunks(pool, config, document_id, doc, &chunks, &embeddings).await?;
    Ok(chunks.len())
}

/// Writes all chunk rows and the `ready` status update in one
/// transaction, so a document is never visible as ready with missing or
/// partial chunks.
async fn persist_chunks(
    pool: &SqlitePool,
    config: &Config,
    document_id: &str,
    doc: &NewDocument,
    chunks: &[TextChunk],
    embeddings: &[Vec<f32>],
) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    let mut tx = pool.begin().await?;

    // Re-ingestion replaces any previous chunk set.
    sqlx::query("DELETE FROM chunks WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;

    for (chunk, embedding) in chunks.iter().zip(embeddings.iter()) {
        sqlx::query(
            r#"
            INSERT INTO chunks (id, document_id, site_id, chunk_index, content, token_count, title, embedding, dims, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(document_id)
        .bind(&doc.site_id)
        .bind(chunk.index)
        .bind(&chunk.content)
        .bind(estimate_tokens(&chunk.content))
        .bind(&doc.title)
        .bind(vec_to_blob(embedding))
        .bind(config.embedding.dims as i64)
        .bind(now)
        .execute(&mut *tx)
        .await?;
    }

    transition_status(
        &mut tx,
        document_id,
        DocumentStatus::Ready,
        Some(chunks.len() as i64),
    )
    .await?;

    tx.commit().await?;
    Ok(())
}

/// Re-run chunking and embedding for an existing document, using the
/// retrying batch variant. The normal path for documents stuck in
/// `error` after a provider outage.
pub async fn reembed_document(
    pool: &SqlitePool,
    config: &Config,
    embedder: &EmbeddingClient,
    document_id: &str,
) -> Result<IngestOutcome> {
    let row = sqlx::query("SELECT site_id, title, content, source_url FROM documents WHERE id = ?")
        .bind(document_id)
        .fetch_optional(pool)
        .await?
        .with_context(|| format!("document not found: {}", document_id))?;

    let doc = NewDocument {
        site_id: row.get("site_id"),
        title: row.get("title"),
        content: row.get("content"),
        source_url: row.get("source_url"),
    };

    {
        let mut conn = pool.acquire().await?;
        transition_status(&mut conn, document_id, DocumentStatus::Processing, None).await?;
    }

    let chunks = chunk_text(&doc.content, &config.chunking);
    if chunks.is_empty() {
        let mut conn = pool.acquire().await?;
        transition_status(&mut conn, document_id, DocumentStatus::Ready, Some(0)).await?;
        return Ok(IngestOutcome {
            document_id: document_id.to_string(),
            status: DocumentStatus::Ready,
            chunk_count: 0,
            char_count: doc.content.chars().count(),
        });
    }

    let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
    match embedder.embed_passages_with_retry(&texts).await {
        Ok(embeddings) => {
            persist_chunks(pool, config, document_id, &doc, &chunks, &embeddings).await?;
            Ok(IngestOutcome {
                document_id: document_id.to_string(),
                status: DocumentStatus::Ready,
                chunk_count: chunks.len(),
                char_count: doc.content.chars().count(),
            })
        }
        Err(e) => {
            let mut conn = pool.acquire().await?;
            transition_status(&mut conn, document_id, DocumentStatus::Error, None).await?;
            Err(e)
        }
    }
}

/// List a site's documents, newest first.
pub async fn list_documents(pool: &SqlitePool, site_id: &str) -> Result<Vec<Document>> {
    let rows = sqlx::query(
        r#"
        SELECT id, site_id, title, source_url, char_count, chunk_count, status, created_at
        FROM documents
        WHERE site_id = ?
        ORDER BY created_at DESC, id
        "#,
    )
    .bind(site_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| Document {
            id: row.get("id"),
            site_id: row.get("site_id"),
            title: row.get("title"),
            source_url: row.get("source_url"),
            char_count: row.get("char_count"),
            chunk_count: row.get("chunk_count"),
            status: row.get("status"),
            created_at: row.get("created_at"),
        })
        .collect())
}

/// Delete a document and its chunks. Returns false when the id is
/// unknown.
pub async fn delete_document(pool: &SqlitePool, document_id: &str) -> Result<bool> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM chunks WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;
    let result = sqlx::query("DELETE FROM documents WHERE id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(result.rows_affected() > 0)
}

/// Status update with legal-transition enforcement.
async fn transition_status(
    conn: &mut SqliteConnection,
    document_id: &str,
    next: DocumentStatus,
    chunk_count: Option<i64>,
) -> Result<()> {
    let current: Option<String> = sqlx::query_scalar("SELECT status FROM documents WHERE id = ?")
        .bind(document_id)
        .fetch_optional(&mut *conn)
        .await?;
    let current = current.with_context(|| format!("document not found: {}", document_id))?;
    let current = DocumentStatus::parse(&current)?;

    if !current.can_transition_to(next) {
        bail!(
            "illegal document status transition: {} -> {}",
            current.as_str(),
            next.as_str()
        );
    }

    match chunk_count {
        Some(count) => {
            sqlx::query("UPDATE documents SET status = ?, chunk_count = ? WHERE id = ?")
                .bind(next.as_str())
                .bind(count)
                .bind(document_id)
                .execute(&mut *conn)
                .await?;
        }
        None => {
            sqlx::query("UPDATE documents SET status = ? WHERE id = ?")
                .bind(next.as_str())
                .bind(document_id)
                .execute(&mut *conn)
                .await?;
        }
    }

    Ok(())
}

fn truncate_chars(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
