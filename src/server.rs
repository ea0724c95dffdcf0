//! HTTP API server.
//!
//! Exposes document upload, document management, and the two search
//! endpoints as a JSON API. Authentication and session handling live in
//! front of this service; the only identity contract here is the
//! `X-User-Id` header naming an existing user.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/documents` | Upload a document (multipart), triggers async ingestion |
//! | `GET`  | `/documents` | List accessible documents |
//! | `GET`  | `/documents/{id}` | Fetch one document (poll `processing_status`) |
//! | `DELETE` | `/documents/{id}` | Soft-delete a document |
//! | `POST` | `/documents/{id}/grants` | Grant another user read access |
//! | `GET`  | `/knowledge-models` | List active embedding models |
//! | `GET`  | `/search-models` | List active search models |
//! | `POST` | `/search/quick` | Retrieval + generated answer |
//! | `POST` | `/search/nodes` | Retrieval only |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `unauthorized` (401), `not_found`
//! (404), `internal` (500).

use anyhow::Result;
use axum::{
    extract::{Multipart, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::blob::BlobStore;
use crate::catalog;
use crate::config::Config;
use crate::db;
use crate::documents;
use crate::embedding::ProviderEmbedder;
use crate::extract::RemoteExtractor;
use crate::ingest::IngestContext;
use crate::jobs::{self, RetryPolicy};
use crate::llm::ProviderGenerator;
use crate::migrate;
use crate::models::{Document, EmbeddingModel, SearchModel};
use crate::search::{self, NodesSearchRequest, QuickSearchRequest, SearchDeps};
use crate::store::memory::MemoryStore;
use crate::store::qdrant::QdrantStore;
use crate::store::{HandleCache, VectorStore};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    pool: SqlitePool,
    config: Arc<Config>,
    blobs: BlobStore,
    deps: SearchDeps,
    /// Per-user vector store handles; capped and time-bounded, torn down
    /// with the server.
    handles: Arc<HandleCache>,
    base_store: Arc<dyn VectorStore>,
    /// Shared store configuration new per-user handles are built from.
    /// `None` for the memory backend, whose state is process-local.
    qdrant_template: Option<QdrantStore>,
}

impl AppState {
    /// Vector store handle for a user, via the capped/TTL cache. Each user
    /// gets their own handle onto the shared store configuration.
    fn store_for(&self, user_id: &str) -> Arc<dyn VectorStore> {
        match &self.qdrant_template {
            Some(template) => {
                let template = template.clone();
                self.handles
                    .get_or_insert_with(user_id, move || Arc::new(template))
            }
            // The memory backend holds the data itself; every caller must
            // share the one instance.
            None => Arc::clone(&self.base_store),
        }
    }
}

/// Build the configured vector store backend.
pub fn build_store(config: &Config) -> Result<Arc<dyn VectorStore>> {
    match config.vector_store.backend.as_str() {
        "memory" => Ok(Arc::new(MemoryStore::new())),
        _ => Ok(Arc::new(QdrantStore::new(&config.vector_store)?)),
    }
}

/// Start the HTTP server and the background ingestion workers.
pub async fn run_server(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::run_migrations(&pool).await?;

    let config = Arc::new(config.clone());
    let blobs = BlobStore::new(&config.blobs.root);

    let (store, qdrant_template): (Arc<dyn VectorStore>, Option<QdrantStore>) =
        match config.vector_store.backend.as_str() {
            "memory" => (Arc::new(MemoryStore::new()), None),
            _ => {
                let qdrant = QdrantStore::new(&config.vector_store)?;
                (Arc::new(qdrant.clone()), Some(qdrant))
            }
        };

    let deps = SearchDeps {
        embedder: Arc::new(ProviderEmbedder::new()?),
        generator: Arc::new(ProviderGenerator::new()?),
        store: Arc::clone(&store),
    };

    // Ingestion workers share the pool and the store with the request side
    let ingest_ctx = IngestContext {
        blobs: blobs.clone(),
        extractor: Arc::new(RemoteExtractor::new(&config.extraction)?),
        embedder: Arc::clone(&deps.embedder),
        store: Arc::clone(&store),
    };
    let policy = RetryPolicy::from_config(&config.jobs);
    let poll_interval = Duration::from_secs(config.jobs.poll_interval_secs);
    for _ in 0..config.jobs.workers.max(1) {
        tokio::spawn(jobs::run_worker(
            pool.clone(),
            ingest_ctx.clone(),
            policy.clone(),
            poll_interval,
        ));
    }

    let handles = Arc::new(HandleCache::new(
        config.vector_store.handle_cache_size,
        Duration::from_secs(config.vector_store.handle_cache_ttl_secs),
    ));

    let state = AppState {
        pool,
        config: Arc::clone(&config),
        blobs,
        deps,
        handles,
        base_store: store,
        qdrant_template,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/documents", post(handle_create_document).get(handle_list_documents))
        .route("/documents/{id}", get(handle_get_document))
        .route("/documents/{id}", delete(handle_delete_document))
        .route("/documents/{id}/grants", post(handle_add_grant))
        .route("/knowledge-models", get(handle_list_embedding_models))
        .route("/search-models", get(handle_list_search_models))
        .route("/search/quick", post(handle_quick_search))
        .route("/search/nodes", post(handle_nodes_search))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    let bind_addr = &config.server.bind;
    info!(bind = %bind_addr, "HTTP server listening");

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl AppError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "bad_request",
            message: message.into(),
        }
    }

    fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            code: "unauthorized",
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "not_found",
            message: message.into(),
        }
    }

    fn internal(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal",
            message: err.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

/// Identity contract: the authenticating proxy sets `X-User-Id`.
async fn require_user(state: &AppState, headers: &HeaderMap) -> Result<String, AppError> {
    let user_id = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| AppError::unauthorized("X-User-Id header required"))?;

    let known: Option<i64> = sqlx::query_scalar("SELECT 1 FROM users WHERE id = ?")
        .bind(&user_id)
        .fetch_optional(&state.pool)
        .await
        .map_err(|e| AppError::internal(e.into()))?;

    if known.is_none() {
        return Err(AppError::unauthorized(format!("Unknown user: {}", user_id)));
    }
    Ok(user_id)
}

// ============ Documents ============

#[derive(Serialize)]
struct DocumentBody {
    id: String,
    name: String,
    description: String,
    knowledge_model: String,
    processing_status: String,
}

impl From<Document> for DocumentBody {
    fn from(doc: Document) -> Self {
        Self {
            id: doc.id,
            name: doc.name,
            description: doc.description,
            knowledge_model: doc.embedding_model_id,
            processing_status: doc.processing_status.as_str().to_string(),
        }
    }
}

async fn handle_create_document(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<DocumentBody>, AppError> {
    let user_id = require_user(&state, &headers).await?;

    let mut file: Option<(String, Vec<u8>)> = None;
    let mut name: Option<String> = None;
    let mut description = String::new();
    let mut knowledge_model: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::bad_request(e.to_string()))?
    {
        match field.name().unwrap_or_default() {
            "file" => {
                let file_name = field.file_name().unwrap_or("upload.bin").to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::bad_request(e.to_string()))?;
                file = Some((file_name, bytes.to_vec()));
            }
            "name" => {
                name = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| AppError::bad_request(e.to_string()))?,
                )
            }
            "description" => {
                description = field
                    .text()
                    .await
                    .map_err(|e| AppError::bad_request(e.to_string()))?
            }
            "knowledge_model" => {
                knowledge_model = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| AppError::bad_request(e.to_string()))?,
                )
            }
            _ => {}
        }
    }

    let (file_name, bytes) =
        file.ok_or_else(|| AppError::bad_request("multipart field 'file' is required"))?;
    let selector = knowledge_model
        .ok_or_else(|| AppError::bad_request("multipart field 'knowledge_model' is required"))?;

    let model = resolve_embedding_model(&state.pool, &selector).await?;

    let doc = documents::create_document(
        &state.pool,
        &state.blobs,
        &user_id,
        &file_name,
        &bytes,
        name.filter(|n| !n.is_empty()),
        description,
        &model.id,
    )
    .await
    .map_err(AppError::internal)?;

    Ok(Json(doc.into()))
}

async fn handle_list_documents(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<DocumentBody>>, AppError> {
    let user_id = require_user(&state, &headers).await?;
    let docs = documents::list_documents(&state.pool, &user_id)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(docs.into_iter().map(Into::into).collect()))
}

async fn handle_get_document(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<DocumentBody>, AppError> {
    let user_id = require_user(&state, &headers).await?;
    let doc = visible_document(&state.pool, &user_id, &id).await?;
    Ok(Json(doc.into()))
}

async fn handle_delete_document(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let user_id = require_user(&state, &headers).await?;
    visible_document(&state.pool, &user_id, &id).await?;

    documents::soft_delete_document(&state.pool, &id)
        .await
        .map_err(AppError::internal)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct GrantBody {
    user_id: String,
}

async fn handle_add_grant(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<GrantBody>,
) -> Result<StatusCode, AppError> {
    let user_id = require_user(&state, &headers).await?;
    let doc = visible_document(&state.pool, &user_id, &id).await?;

    let full = documents::user_has_full_access(&state.pool, &user_id)
        .await
        .map_err(AppError::internal)?;
    if doc.user_id != user_id && !full {
        return Err(AppError::not_found(format!("Document not found: {}", id)));
    }

    documents::add_grant(&state.pool, &id, &body.user_id)
        .await
        .map_err(AppError::internal)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Fetch a document if it is inside the caller's scope; out-of-scope and
/// deleted documents are indistinguishable from missing ones.
async fn visible_document(
    pool: &SqlitePool,
    user_id: &str,
    document_id: &str,
) -> Result<Document, AppError> {
    let scope = documents::resolve_scope(pool, user_id, &[document_id.to_string()])
        .await
        .map_err(AppError::internal)?;

    if scope.is_empty() {
        return Err(AppError::not_found(format!(
            "Document not found: {}",
            document_id
        )));
    }

    documents::get_document(pool, document_id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("Document not found: {}", document_id)))
}

// ============ Model catalog ============

#[derive(Serialize)]
struct ModelBody {
    id: String,
    display_name: String,
}

async fn handle_list_embedding_models(
    State(state): State<AppState>,
) -> Result<Json<Vec<ModelBody>>, AppError> {
    let models = catalog::list_embedding_models(&state.pool)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(
        models
            .into_iter()
            .map(|m| ModelBody {
                id: m.id,
                display_name: m.display_name,
            })
            .collect(),
    ))
}

async fn handle_list_search_models(
    State(state): State<AppState>,
) -> Result<Json<Vec<ModelBody>>, AppError> {
    let models = catalog::list_search_models(&state.pool)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(
        models
            .into_iter()
            .map(|m| ModelBody {
                id: m.id,
                display_name: m.display_name,
            })
            .collect(),
    ))
}

async fn resolve_embedding_model(
    pool: &SqlitePool,
    selector: &str,
) -> Result<EmbeddingModel, AppError> {
    catalog::lookup_embedding_model(pool, selector)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::bad_request(format!("Unknown embedding model: {}", selector)))
}

async fn resolve_search_model(pool: &SqlitePool, selector: &str) -> Result<SearchModel, AppError> {
    catalog::lookup_search_model(pool, selector)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::bad_request(format!("Unknown search model: {}", selector)))
}

// ============ Search ============

async fn handle_quick_search(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<QuickSearchRequest>,
) -> Result<Json<search::QuickSearchResponse>, AppError> {
    let user_id = require_user(&state, &headers).await?;
    request
        .validate()
        .map_err(|e| AppError::bad_request(e.to_string()))?;

    let embedding_model = resolve_embedding_model(&state.pool, &request.knowledge_model).await?;
    let search_model = resolve_search_model(&state.pool, &request.search_model).await?;

    let deps = SearchDeps {
        store: state.store_for(&user_id),
        ..state.deps.clone()
    };

    let response = search::quick_search(
        &state.pool,
        &deps,
        &user_id,
        &embedding_model,
        &search_model,
        &request,
        state.config.search.similarity_top_k,
        state.config.search.similarity_cutoff,
    )
    .await
    .map_err(AppError::internal)?;

    Ok(Json(response))
}

async fn handle_nodes_search(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<NodesSearchRequest>,
) -> Result<Json<search::NodesSearchResponse>, AppError> {
    let user_id = require_user(&state, &headers).await?;
    request
        .validate()
        .map_err(|e| AppError::bad_request(e.to_string()))?;

    let embedding_model = resolve_embedding_model(&state.pool, &request.knowledge_model).await?;

    let deps = SearchDeps {
        store: state.store_for(&user_id),
        ..state.deps.clone()
    };

    let response = search::nodes_search(
        &state.pool,
        &deps,
        &user_id,
        &embedding_model,
        &request,
        state.config.search.similarity_top_k,
        state.config.search.similarity_cutoff,
    )
    .await
    .map_err(AppError::internal)?;

    Ok(Json(response))
}

// ============ Health ============

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    version: &'static str,
}

async fn handle_health() -> Json<HealthBody> {
    Json(HealthBody {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[db]
path = "/tmp/docsearch.sqlite"

[blobs]
root = "/tmp/blobs"

[extraction]
url = "http://localhost:9000/file-to-string"

[server]
bind = "127.0.0.1:7420"
"#;

    async fn test_state(qdrant_template: Option<QdrantStore>) -> (AppState, tempfile::TempDir) {
        let pool = db::connect_memory().await.unwrap();
        let config: Config = toml::from_str(MINIMAL).unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let base_store: Arc<dyn VectorStore> = Arc::new(MemoryStore::new());

        let state = AppState {
            pool,
            config: Arc::new(config),
            blobs: BlobStore::new(tmp.path()),
            deps: SearchDeps {
                embedder: Arc::new(ProviderEmbedder::new().unwrap()),
                generator: Arc::new(ProviderGenerator::new().unwrap()),
                store: Arc::clone(&base_store),
            },
            handles: Arc::new(HandleCache::new(4, Duration::from_secs(60))),
            base_store,
            qdrant_template,
        };
        (state, tmp)
    }

    #[tokio::test]
    async fn test_store_handles_are_per_user() {
        let config: Config = toml::from_str(MINIMAL).unwrap();
        let template = QdrantStore::new(&config.vector_store).unwrap();
        let (state, _tmp) = test_state(Some(template)).await;

        let u1_first = state.store_for("u1");
        let u1_second = state.store_for("u1");
        let u2 = state.store_for("u2");

        // Same user reuses the cached handle; different users get their own
        assert!(Arc::ptr_eq(&u1_first, &u1_second));
        assert!(!Arc::ptr_eq(&u1_first, &u2));
    }

    #[tokio::test]
    async fn test_memory_backend_is_shared() {
        let (state, _tmp) = test_state(None).await;

        let u1 = state.store_for("u1");
        let u2 = state.store_for("u2");
        assert!(Arc::ptr_eq(&u1, &u2));
        assert!(Arc::ptr_eq(&u1, &state.base_store));
    }
}
