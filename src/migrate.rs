use anyhow::Result;
use sqlx::SqlitePool;

/// Create all tables and indexes. Idempotent — safe to run on every start.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            has_full_access INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS embedding_models (
            id TEXT PRIMARY KEY,
            display_name TEXT NOT NULL UNIQUE,
            provider TEXT NOT NULL DEFAULT 'openai',
            api_key TEXT NOT NULL,
            model_name TEXT NOT NULL DEFAULT '',
            chunk_size INTEGER NOT NULL DEFAULT 100,
            chunk_overlap INTEGER NOT NULL DEFAULT 10,
            is_active INTEGER NOT NULL DEFAULT 1
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS search_models (
            id TEXT PRIMARY KEY,
            display_name TEXT NOT NULL UNIQUE,
            provider TEXT NOT NULL DEFAULT 'openai',
            api_key TEXT NOT NULL,
            model_name TEXT NOT NULL DEFAULT '',
            price_per_1k_input_tokens REAL NOT NULL DEFAULT 0.0015,
            price_per_1k_output_tokens REAL NOT NULL DEFAULT 0.002,
            is_active INTEGER NOT NULL DEFAULT 1
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            name TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            blob_ref TEXT NOT NULL,
            embedding_model_id TEXT NOT NULL,
            processing_status TEXT NOT NULL DEFAULT 'not_started',
            created_at INTEGER NOT NULL,
            deleted_at INTEGER,
            FOREIGN KEY (user_id) REFERENCES users(id),
            FOREIGN KEY (embedding_model_id) REFERENCES embedding_models(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // available_for: read grants beyond the owning user
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS document_grants (
            document_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            PRIMARY KEY (document_id, user_id),
            FOREIGN KEY (document_id) REFERENCES documents(id),
            FOREIGN KEY (user_id) REFERENCES users(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS prompts (
            id TEXT PRIMARY KEY,
            language TEXT NOT NULL DEFAULT 'ru',
            system_prompt TEXT NOT NULL DEFAULT '',
            user_prompt TEXT NOT NULL DEFAULT '',
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS usages (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            user_id TEXT NOT NULL,
            prompt_llm_token_count INTEGER NOT NULL DEFAULT 0,
            completion_llm_token_count INTEGER NOT NULL DEFAULT 0,
            total_llm_token_count INTEGER NOT NULL DEFAULT 0,
            total_embedding_token_count INTEGER NOT NULL DEFAULT 0,
            query TEXT NOT NULL DEFAULT '',
            prompt TEXT NOT NULL DEFAULT '',
            response TEXT NOT NULL DEFAULT '',
            created_at INTEGER NOT NULL,
            FOREIGN KEY (user_id) REFERENCES users(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Ingestion job queue: one row per enqueued document run
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ingest_jobs (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            state TEXT NOT NULL DEFAULT 'queued',
            attempts INTEGER NOT NULL DEFAULT 0,
            run_at INTEGER NOT NULL,
            lease_expires_at INTEGER,
            last_error TEXT,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (document_id) REFERENCES documents(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_user_id ON documents(user_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_created_at ON documents(created_at DESC)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_grants_user_id ON document_grants(user_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_usages_user_id ON usages(user_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_state_run_at ON ingest_jobs(state, run_at)")
        .execute(pool)
        .await?;

    Ok(())
}
