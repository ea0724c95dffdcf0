//! Usage accounting.
//!
//! Write-behind records of every search invocation. Rows are inserted
//! exactly once after the pipeline's main work completes and never touched
//! again; a failed insert surfaces to the caller as a failed search, not a
//! silently missing row.

use anyhow::Result;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::models::{TokenCounts, Usage, UsageKind};

/// Persist one search invocation's token consumption and artifacts.
pub async fn record_usage(
    pool: &SqlitePool,
    kind: UsageKind,
    user_id: &str,
    counts: TokenCounts,
    query: &str,
    prompt: &str,
    response: &str,
) -> Result<Usage> {
    let usage = Usage {
        id: Uuid::new_v4().to_string(),
        kind,
        user_id: user_id.to_string(),
        counts,
        query: query.to_string(),
        prompt: prompt.to_string(),
        response: response.to_string(),
        created_at: chrono::Utc::now().timestamp(),
    };

    sqlx::query(
        r#"
        INSERT INTO usages (
            id, kind, user_id,
            prompt_llm_token_count, completion_llm_token_count,
            total_llm_token_count, total_embedding_token_count,
            query, prompt, response, created_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&usage.id)
    .bind(usage.kind.as_str())
    .bind(&usage.user_id)
    .bind(usage.counts.prompt_llm_token_count as i64)
    .bind(usage.counts.completion_llm_token_count as i64)
    .bind(usage.counts.total_llm_token_count as i64)
    .bind(usage.counts.total_embedding_token_count as i64)
    .bind(&usage.query)
    .bind(&usage.prompt)
    .bind(&usage.response)
    .bind(usage.created_at)
    .execute(pool)
    .await?;

    Ok(usage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::migrate;

    #[tokio::test]
    async fn test_record_inserts_exactly_one_row() {
        let pool = db::connect_memory().await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        sqlx::query("INSERT INTO users (id, has_full_access) VALUES ('u1', 0)")
            .execute(&pool)
            .await
            .unwrap();

        let counts = TokenCounts {
            prompt_llm_token_count: 10,
            completion_llm_token_count: 5,
            total_llm_token_count: 15,
            total_embedding_token_count: 7,
        };
        let usage = record_usage(
            &pool,
            UsageKind::NodesSearch,
            "u1",
            counts,
            "what is rust",
            "",
            "",
        )
        .await
        .unwrap();

        let (kind, total): (String, i64) = {
            use sqlx::Row;
            let row = sqlx::query("SELECT kind, total_llm_token_count FROM usages WHERE id = ?")
                .bind(&usage.id)
                .fetch_one(&pool)
                .await
                .unwrap();
            (row.get("kind"), row.get("total_llm_token_count"))
        };
        assert_eq!(kind, "nodes_search");
        assert_eq!(total, 15);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM usages")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}
