//! Document rows and the query-time access-control overlay.
//!
//! Creating a document saves the raw bytes to the blob store, inserts the
//! row, and synchronously enqueues the ingestion job — the create → enqueue
//! dependency is explicit here, not hidden behind an event bus. Deletion is
//! a soft delete: `deleted_at` is set and the document drops out of every
//! listing and search scope, but its vectors stay in the store (known gap).

use anyhow::{bail, Context, Result};
use sqlx::{Row, SqlitePool};
use tracing::info;
use uuid::Uuid;

use crate::blob::BlobStore;
use crate::jobs;
use crate::models::{Document, ProcessingStatus};

/// Create a document from uploaded bytes and enqueue its ingestion.
///
/// A missing display name defaults to the file name. Returns the new
/// document with `processing_status = NotStarted`.
pub async fn create_document(
    pool: &SqlitePool,
    blobs: &BlobStore,
    user_id: &str,
    file_name: &str,
    bytes: &[u8],
    name: Option<String>,
    description: String,
    embedding_model_id: &str,
) -> Result<Document> {
    let blob_ref = blobs.save(user_id, file_name, bytes)?;

    let doc = Document {
        id: Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        name: name.unwrap_or_else(|| file_name.to_string()),
        description,
        blob_ref,
        embedding_model_id: embedding_model_id.to_string(),
        processing_status: ProcessingStatus::NotStarted,
        created_at: chrono::Utc::now().timestamp(),
        deleted_at: None,
    };

    sqlx::query(
        r#"
        INSERT INTO documents (id, user_id, name, description, blob_ref, embedding_model_id, processing_status, created_at, deleted_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, NULL)
        "#,
    )
    .bind(&doc.id)
    .bind(&doc.user_id)
    .bind(&doc.name)
    .bind(&doc.description)
    .bind(&doc.blob_ref)
    .bind(&doc.embedding_model_id)
    .bind(doc.processing_status.as_str())
    .bind(doc.created_at)
    .execute(pool)
    .await?;

    // Post-create hook: vectorization runs asynchronously, the caller only
    // ever polls processing_status.
    info!(document_id = %doc.id, "Enqueueing ingestion for new document");
    jobs::enqueue(pool, &doc.id).await?;

    Ok(doc)
}

/// Fetch a document by id, including soft-deleted ones.
pub async fn get_document(pool: &SqlitePool, document_id: &str) -> Result<Option<Document>> {
    let row = sqlx::query(
        r#"
        SELECT id, user_id, name, description, blob_ref, embedding_model_id,
               processing_status, created_at, deleted_at
        FROM documents WHERE id = ?
        "#,
    )
    .bind(document_id)
    .fetch_optional(pool)
    .await?;

    row.map(row_to_document).transpose()
}

/// Non-deleted documents visible to `user_id`, newest first.
pub async fn list_documents(pool: &SqlitePool, user_id: &str) -> Result<Vec<Document>> {
    let rows = if user_has_full_access(pool, user_id).await? {
        sqlx::query(
            r#"
            SELECT id, user_id, name, description, blob_ref, embedding_model_id,
                   processing_status, created_at, deleted_at
            FROM documents
            WHERE deleted_at IS NULL
            ORDER BY created_at DESC
            "#,
        )
        .fetch_all(pool)
        .await?
    } else {
        sqlx::query(
            r#"
            SELECT DISTINCT d.id, d.user_id, d.name, d.description, d.blob_ref,
                   d.embedding_model_id, d.processing_status, d.created_at, d.deleted_at
            FROM documents d
            LEFT JOIN document_grants g ON g.document_id = d.id AND g.user_id = ?
            WHERE d.deleted_at IS NULL
              AND (d.user_id = ? OR g.user_id IS NOT NULL)
            ORDER BY d.created_at DESC
            "#,
        )
        .bind(user_id)
        .bind(user_id)
        .fetch_all(pool)
        .await?
    };

    rows.into_iter().map(row_to_document).collect()
}

/// Soft-delete: sets `deleted_at`. Vector store cleanup is intentionally
/// not cascaded.
pub async fn soft_delete_document(pool: &SqlitePool, document_id: &str) -> Result<()> {
    let result = sqlx::query(
        "UPDATE documents SET deleted_at = ? WHERE id = ? AND deleted_at IS NULL",
    )
    .bind(chrono::Utc::now().timestamp())
    .bind(document_id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        bail!("Document not found: {}", document_id);
    }
    Ok(())
}

/// Persist a processing-status transition.
pub async fn set_status(
    pool: &SqlitePool,
    document_id: &str,
    status: ProcessingStatus,
) -> Result<()> {
    sqlx::query("UPDATE documents SET processing_status = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(document_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Grant `grantee_id` read access to a document (`available_for`).
pub async fn add_grant(pool: &SqlitePool, document_id: &str, grantee_id: &str) -> Result<()> {
    sqlx::query(
        "INSERT OR IGNORE INTO document_grants (document_id, user_id) VALUES (?, ?)",
    )
    .bind(document_id)
    .bind(grantee_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn user_has_full_access(pool: &SqlitePool, user_id: &str) -> Result<bool> {
    let full: Option<i64> = sqlx::query_scalar("SELECT has_full_access FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(pool)
        .await?;
    Ok(full == Some(1))
}

/// Resolve the requested document set down to the ids `user_id` may search:
/// documents they own, documents granted to them, or — with full access —
/// any non-deleted document. Unknown, deleted, and out-of-scope ids are
/// silently dropped (absence, not failure). An empty result means an empty
/// search.
pub async fn resolve_scope(
    pool: &SqlitePool,
    user_id: &str,
    requested_ids: &[String],
) -> Result<Vec<String>> {
    if requested_ids.is_empty() {
        return Ok(Vec::new());
    }

    let placeholders = vec!["?"; requested_ids.len()].join(", ");

    let query = if user_has_full_access(pool, user_id).await? {
        let sql = format!(
            "SELECT id FROM documents WHERE deleted_at IS NULL AND id IN ({})",
            placeholders
        );
        let mut q = sqlx::query(&sql);
        for id in requested_ids {
            q = q.bind(id);
        }
        q.fetch_all(pool).await?
    } else {
        let sql = format!(
            r#"
            SELECT DISTINCT d.id
            FROM documents d
            LEFT JOIN document_grants g ON g.document_id = d.id AND g.user_id = ?
            WHERE d.deleted_at IS NULL
              AND (d.user_id = ? OR g.user_id IS NOT NULL)
              AND d.id IN ({})
            "#,
            placeholders
        );
        let mut q = sqlx::query(&sql).bind(user_id).bind(user_id);
        for id in requested_ids {
            q = q.bind(id);
        }
        q.fetch_all(pool).await?
    };

    Ok(query.iter().map(|row| row.get("id")).collect())
}

fn row_to_document(row: sqlx::sqlite::SqliteRow) -> Result<Document> {
    let status: String = row.get("processing_status");
    Ok(Document {
        id: row.get("id"),
        user_id: row.get("user_id"),
        name: row.get("name"),
        description: row.get("description"),
        blob_ref: row.get("blob_ref"),
        embedding_model_id: row.get("embedding_model_id"),
        processing_status: ProcessingStatus::parse(&status)
            .context("Corrupt processing_status on document row")?,
        created_at: row.get("created_at"),
        deleted_at: row.get("deleted_at"),
    })
}
