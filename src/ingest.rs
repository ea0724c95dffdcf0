//! Document ingestion pipeline.
//!
//! One run takes a document from raw uploaded bytes to verified vectors:
//!
//! 1. skip if already `Done` (idempotence check, first thing after claim)
//! 2. persist `InProgress` before any network I/O
//! 3. read the blob and materialize it to a scoped temp path
//!    (extraction wants a file, not a byte stream)
//! 4. extract plain text via the remote extraction service
//! 5. chunk per the document's embedding model
//! 6. embed in batches
//! 7. upsert into the vector store, tagged with the document id
//! 8. verify with `exists`; only then transition to `Done`
//!
//! Any error propagates to the job dispatcher, whose failure handler
//! forces the status to `Error`.

use anyhow::{bail, Context, Result};
use serde_json::json;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{error, info};

use crate::blob::BlobStore;
use crate::catalog;
use crate::chunk::chunk_text;
use crate::documents;
use crate::embedding::Embedder;
use crate::extract::TextExtractor;
use crate::models::ProcessingStatus;
use crate::store::{ChunkVector, VectorStore};

/// Chunks per embedding request.
const EMBED_BATCH_SIZE: usize = 64;

/// Everything an ingestion run needs beyond the database.
#[derive(Clone)]
pub struct IngestContext {
    pub blobs: BlobStore,
    pub extractor: Arc<dyn TextExtractor>,
    pub embedder: Arc<dyn Embedder>,
    pub store: Arc<dyn VectorStore>,
}

/// Run the ingestion pipeline for one document.
pub async fn run_ingestion(
    pool: &SqlitePool,
    ctx: &IngestContext,
    document_id: &str,
) -> Result<()> {
    let doc = documents::get_document(pool, document_id)
        .await?
        .with_context(|| format!("Document not found: {}", document_id))?;

    if doc.processing_status == ProcessingStatus::Done {
        info!(document_id = %doc.id, "Document already has embeddings");
        return Ok(());
    }

    info!(document_id = %doc.id, name = %doc.name, "Adding embedding for document");
    documents::set_status(pool, &doc.id, ProcessingStatus::InProgress).await?;

    let model = catalog::get_embedding_model(pool, &doc.embedding_model_id)
        .await?
        .with_context(|| format!("Embedding model not found: {}", doc.embedding_model_id))?;

    // Materialize the blob under its original file name; the extraction
    // service keys format detection off the extension.
    let bytes = ctx.blobs.open(&doc.blob_ref)?;
    let dir = tempfile::tempdir()?;
    let file_name = BlobStore::file_name(&doc.blob_ref);
    let file_path = dir.path().join(file_name);
    tokio::fs::write(&file_path, &bytes).await?;

    let text = ctx.extractor.extract(&file_path).await?;

    let chunks = chunk_text(&doc.id, &text, model.chunk_size, model.chunk_overlap);

    let mut vectors = Vec::with_capacity(chunks.len());
    let mut embedding_tokens = 0u64;
    for batch in chunks.chunks(EMBED_BATCH_SIZE) {
        let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
        let result = ctx.embedder.embed(&model, &texts).await?;
        if result.vectors.len() != batch.len() {
            bail!(
                "Embedding provider returned {} vectors for {} chunks",
                result.vectors.len(),
                batch.len()
            );
        }
        vectors.extend(result.vectors);
        embedding_tokens += result.total_tokens;
    }

    let points: Vec<ChunkVector> = chunks
        .iter()
        .zip(vectors)
        .map(|(chunk, vector)| ChunkVector {
            id: chunk.id.clone(),
            vector,
            text: chunk.text.clone(),
            payload: json!({
                "doc_id": doc.id,
                "file_name": file_name,
                "description": doc.description,
                "chunk_index": chunk.chunk_index,
                "hash": chunk.hash,
            }),
        })
        .collect();

    ctx.store.upsert(&doc.id, &points).await?;

    // Post-write verification: a partial remote write must never become DONE
    if !ctx.store.exists(&doc.id).await? {
        error!(document_id = %doc.id, "Failed to add embedding for document");
        bail!("Vector store verification failed for document {}", doc.id);
    }

    documents::set_status(pool, &doc.id, ProcessingStatus::Done).await?;
    info!(
        document_id = %doc.id,
        chunks = chunks.len(),
        embedding_tokens,
        "Successfully added embedding for document"
    );

    Ok(())
}
