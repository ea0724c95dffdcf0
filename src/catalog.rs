//! Model and prompt catalog queries.
//!
//! Embedding and search models are referenced by display name in requests.
//! Inactive models are not selectable for new operations; existing
//! documents and usage rows keep pointing at them.

use anyhow::{Context, Result};
use sqlx::{Row, SqlitePool};

use crate::models::{EmbeddingModel, Language, Prompt, Provider, SearchModel};

/// Look up an active embedding model by display name or id.
pub async fn lookup_embedding_model(
    pool: &SqlitePool,
    selector: &str,
) -> Result<Option<EmbeddingModel>> {
    let row = sqlx::query(
        r#"
        SELECT id, display_name, provider, api_key, model_name, chunk_size, chunk_overlap, is_active
        FROM embedding_models
        WHERE is_active = 1 AND (display_name = ? OR id = ?)
        "#,
    )
    .bind(selector)
    .bind(selector)
    .fetch_optional(pool)
    .await?;

    row.map(row_to_embedding_model).transpose()
}

/// Look up an embedding model by id regardless of `is_active` — ingestion
/// of an already-created document must keep working after deactivation.
pub async fn get_embedding_model(pool: &SqlitePool, id: &str) -> Result<Option<EmbeddingModel>> {
    let row = sqlx::query(
        r#"
        SELECT id, display_name, provider, api_key, model_name, chunk_size, chunk_overlap, is_active
        FROM embedding_models WHERE id = ?
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    row.map(row_to_embedding_model).transpose()
}

pub async fn list_embedding_models(pool: &SqlitePool) -> Result<Vec<EmbeddingModel>> {
    let rows = sqlx::query(
        r#"
        SELECT id, display_name, provider, api_key, model_name, chunk_size, chunk_overlap, is_active
        FROM embedding_models WHERE is_active = 1
        ORDER BY display_name
        "#,
    )
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(row_to_embedding_model).collect()
}

/// Look up an active search model by display name or id.
pub async fn lookup_search_model(pool: &SqlitePool, selector: &str) -> Result<Option<SearchModel>> {
    let row = sqlx::query(
        r#"
        SELECT id, display_name, provider, api_key, model_name,
               price_per_1k_input_tokens, price_per_1k_output_tokens, is_active
        FROM search_models
        WHERE is_active = 1 AND (display_name = ? OR id = ?)
        "#,
    )
    .bind(selector)
    .bind(selector)
    .fetch_optional(pool)
    .await?;

    row.map(row_to_search_model).transpose()
}

pub async fn list_search_models(pool: &SqlitePool) -> Result<Vec<SearchModel>> {
    let rows = sqlx::query(
        r#"
        SELECT id, display_name, provider, api_key, model_name,
               price_per_1k_input_tokens, price_per_1k_output_tokens, is_active
        FROM search_models WHERE is_active = 1
        ORDER BY display_name
        "#,
    )
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(row_to_search_model).collect()
}

/// Most recently created active prompt for a language, if any.
pub async fn latest_prompt(pool: &SqlitePool, language: Language) -> Result<Option<Prompt>> {
    let row = sqlx::query(
        r#"
        SELECT id, language, system_prompt, user_prompt, is_active, created_at
        FROM prompts
        WHERE is_active = 1 AND language = ?
        ORDER BY created_at DESC
        LIMIT 1
        "#,
    )
    .bind(language.as_str())
    .fetch_optional(pool)
    .await?;

    row.map(|row| {
        let lang: String = row.get("language");
        Ok(Prompt {
            id: row.get("id"),
            language: Language::parse(&lang).context("Corrupt language on prompt row")?,
            system_prompt: row.get("system_prompt"),
            user_prompt: row.get("user_prompt"),
            is_active: row.get::<i64, _>("is_active") == 1,
            created_at: row.get("created_at"),
        })
    })
    .transpose()
}

fn row_to_embedding_model(row: sqlx::sqlite::SqliteRow) -> Result<EmbeddingModel> {
    let provider: String = row.get("provider");
    Ok(EmbeddingModel {
        id: row.get("id"),
        display_name: row.get("display_name"),
        provider: Provider::parse(&provider).context("Corrupt provider on embedding model")?,
        api_key: row.get("api_key"),
        model_name: row.get("model_name"),
        chunk_size: row.get::<i64, _>("chunk_size") as usize,
        chunk_overlap: row.get::<i64, _>("chunk_overlap") as usize,
        is_active: row.get::<i64, _>("is_active") == 1,
    })
}

fn row_to_search_model(row: sqlx::sqlite::SqliteRow) -> Result<SearchModel> {
    let provider: String = row.get("provider");
    Ok(SearchModel {
        id: row.get("id"),
        display_name: row.get("display_name"),
        provider: Provider::parse(&provider).context("Corrupt provider on search model")?,
        api_key: row.get("api_key"),
        model_name: row.get("model_name"),
        price_per_1k_input_tokens: row.get("price_per_1k_input_tokens"),
        price_per_1k_output_tokens: row.get("price_per_1k_output_tokens"),
        is_active: row.get::<i64, _>("is_active") == 1,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::migrate;

    async fn setup() -> SqlitePool {
        let pool = db::connect_memory().await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn test_inactive_models_not_selectable_but_resolvable_by_id() {
        let pool = setup().await;
        sqlx::query(
            r#"
            INSERT INTO embedding_models (id, display_name, api_key, is_active)
            VALUES ('em1', 'ada-002', 'key', 0)
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();

        assert!(lookup_embedding_model(&pool, "ada-002")
            .await
            .unwrap()
            .is_none());
        assert!(list_embedding_models(&pool).await.unwrap().is_empty());

        // Historical documents still resolve their model
        let model = get_embedding_model(&pool, "em1").await.unwrap().unwrap();
        assert!(!model.is_active);
    }

    #[tokio::test]
    async fn test_latest_active_prompt_wins() {
        let pool = setup().await;
        for (id, text, active, ts) in [
            ("p1", "old", 1, 100),
            ("p2", "new", 1, 200),
            ("p3", "newest-inactive", 0, 300),
        ] {
            sqlx::query(
                r#"
                INSERT INTO prompts (id, language, system_prompt, user_prompt, is_active, created_at)
                VALUES (?, 'en', ?, '{context} {query}', ?, ?)
                "#,
            )
            .bind(id)
            .bind(text)
            .bind(active)
            .bind(ts)
            .execute(&pool)
            .await
            .unwrap();
        }

        let prompt = latest_prompt(&pool, Language::En).await.unwrap().unwrap();
        assert_eq!(prompt.system_prompt, "new");

        assert!(latest_prompt(&pool, Language::Ru).await.unwrap().is_none());
    }
}
