//! Site-scoped nearest-neighbor search over stored chunk vectors.
//!
//! Loads the tenant's chunk embeddings, ranks them by cosine similarity
//! against the query vector, drops everything below the similarity
//! threshold, and caps the result at top-K. Ties keep the scan's
//! natural ordering.

use anyhow::{bail, Result};
use sqlx::{Row, SqlitePool};

use crate::embedding::{blob_to_vec, cosine_similarity};
use crate::models::RetrievedChunk;

pub async fn search_chunks(
    pool: &SqlitePool,
    site_id: &str,
    query_vector: &[f32],
    threshold: f32,
    top_k: usize,
) -> Result<Vec<RetrievedChunk>> {
    if query_vector.is_empty() {
        bail!("query vector must not be empty");
    }

    let rows = sqlx::query(
        r#"
        SELECT id, document_id, content, title, embedding, dims
        FROM chunks
        WHERE site_id = ?
        "#,
    )
    .bind(site_id)
    .fetch_all(pool)
    .await?;

    let mut results = Vec::new();
    for row in &rows {
        let dims: i64 = row.get("dims");
        if dims as usize != query_vector.len() {
            bail!(
                "stored chunk dimensionality {} does not match query dimensionality {}",
                dims,
                query_vector.len()
            );
        }

        let blob: Vec<u8> = row.get("embedding");
        let similarity = cosine_similarity(query_vector, &blob_to_vec(&blob));
        if similarity > threshold {
            results.push(RetrievedChunk {
                chunk_id: row.get("id"),
                document_id: row.get("document_id"),
                content: row.get("content"),
                title: row.get("title"),
                similarity,
            });
        }
    }

    results.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    results.truncate(top_k);

    Ok(results)
}
