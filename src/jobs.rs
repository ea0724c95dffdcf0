//! Ingestion job dispatch.
//!
//! A narrow, at-least-once dispatcher for exactly one job kind: vectorize a
//! document. `enqueue` is called synchronously from document creation;
//! workers poll the `ingest_jobs` table, run the pipeline, and reschedule
//! failed runs per an explicit [`RetryPolicy`].
//!
//! The failure handler is unconditional: any error from the pipeline
//! forces the document to `Error` before the retry decision is made, so a
//! document never stays `InProgress` after a failed attempt.

use anyhow::Result;
use rand::Rng;
use sqlx::{Row, SqlitePool};
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::JobsConfig;
use crate::documents;
use crate::ingest::{self, IngestContext};
use crate::models::ProcessingStatus;

/// Bounded-retry backoff configuration, passed to the dispatcher
/// explicitly rather than inherited from some task base.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub interval_start: Duration,
    pub interval_step: Duration,
    pub interval_max: Duration,
    pub jitter_max: Duration,
    /// A claimed job holds a lease for this long; once it expires the job
    /// is treated as abandoned and goes back in the queue.
    pub lease: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &JobsConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            interval_start: Duration::from_secs(config.interval_start_secs),
            interval_step: Duration::from_secs(config.interval_step_secs),
            interval_max: Duration::from_secs(config.interval_max_secs),
            jitter_max: Duration::from_secs(config.jitter_max_secs),
            lease: Duration::from_secs(config.lease_secs),
        }
    }

    /// Delay before retry number `attempt` (1-based): linear backoff capped
    /// at `interval_max`, plus uniform jitter in `[0, jitter_max]`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self
            .interval_start
            .saturating_add(self.interval_step.saturating_mul(attempt))
            .min(self.interval_max);

        let jitter_max = self.jitter_max.as_secs();
        if jitter_max == 0 {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0..=jitter_max);
        base + Duration::from_secs(jitter)
    }
}

/// A claimed job row.
#[derive(Debug, Clone)]
struct Job {
    id: String,
    document_id: String,
    attempts: i64,
}

/// Enqueue an ingestion run for a document. At-least-once: duplicate
/// enqueues are tolerated because the job itself is idempotent.
pub async fn enqueue(pool: &SqlitePool, document_id: &str) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        r#"
        INSERT INTO ingest_jobs (id, document_id, state, attempts, run_at, created_at)
        VALUES (?, ?, 'queued', 0, ?, ?)
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(document_id)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

/// Claim the next due job, if any. Optimistic: the UPDATE only wins if the
/// row is still queued, so concurrent workers never double-claim. Claiming
/// takes a lease; a row whose worker died is re-delivered once its lease
/// expires.
async fn claim_next(pool: &SqlitePool, lease: Duration) -> Result<Option<Job>> {
    let now = chrono::Utc::now().timestamp();

    let reclaimed = sqlx::query(
        "UPDATE ingest_jobs SET state = 'queued', lease_expires_at = NULL \
         WHERE state = 'running' AND lease_expires_at <= ?",
    )
    .bind(now)
    .execute(pool)
    .await?;
    if reclaimed.rows_affected() > 0 {
        warn!(
            count = reclaimed.rows_affected(),
            "Requeued abandoned ingestion jobs with expired leases"
        );
    }

    let candidate = sqlx::query(
        r#"
        SELECT id, document_id, attempts FROM ingest_jobs
        WHERE state = 'queued' AND run_at <= ?
        ORDER BY run_at
        LIMIT 1
        "#,
    )
    .bind(now)
    .fetch_optional(pool)
    .await?;

    let Some(row) = candidate else {
        return Ok(None);
    };

    let job = Job {
        id: row.get("id"),
        document_id: row.get("document_id"),
        attempts: row.get("attempts"),
    };

    let claimed = sqlx::query(
        "UPDATE ingest_jobs SET state = 'running', lease_expires_at = ? \
         WHERE id = ? AND state = 'queued'",
    )
    .bind(now + lease.as_secs() as i64)
    .bind(&job.id)
    .execute(pool)
    .await?;

    if claimed.rows_affected() == 1 {
        Ok(Some(job))
    } else {
        Ok(None)
    }
}

/// Claim and process a single job. Returns `Ok(true)` if a job was
/// processed (successfully or not), `Ok(false)` if the queue was empty.
pub async fn process_one(
    pool: &SqlitePool,
    ctx: &IngestContext,
    policy: &RetryPolicy,
) -> Result<bool> {
    let Some(job) = claim_next(pool, policy.lease).await? else {
        return Ok(false);
    };

    info!(job_id = %job.id, document_id = %job.document_id, attempt = job.attempts, "Running ingestion job");

    match ingest::run_ingestion(pool, ctx, &job.document_id).await {
        Ok(()) => {
            sqlx::query("UPDATE ingest_jobs SET state = 'done' WHERE id = ?")
                .bind(&job.id)
                .execute(pool)
                .await?;
        }
        Err(e) => {
            // Failure handler: the document must never remain InProgress
            // after a failed attempt, whatever the root cause was.
            error!(document_id = %job.document_id, error = %e, "Failed to add embedding for document");
            if let Err(status_err) =
                documents::set_status(pool, &job.document_id, ProcessingStatus::Error).await
            {
                // The retry decision below still has to run, or the job
                // row stays claimed forever.
                error!(
                    document_id = %job.document_id,
                    error = %status_err,
                    "Failed to record error status for document"
                );
            }

            let attempts = job.attempts + 1;
            if attempts <= policy.max_retries as i64 {
                let run_at =
                    chrono::Utc::now().timestamp() + policy.delay(attempts as u32).as_secs() as i64;
                warn!(job_id = %job.id, attempts, run_at, "Rescheduling ingestion job");
                sqlx::query(
                    r#"
                    UPDATE ingest_jobs
                    SET state = 'queued', attempts = ?, run_at = ?, last_error = ?
                    WHERE id = ?
                    "#,
                )
                .bind(attempts)
                .bind(run_at)
                .bind(e.to_string())
                .bind(&job.id)
                .execute(pool)
                .await?;
            } else {
                warn!(job_id = %job.id, attempts, "Ingestion job exhausted retries");
                sqlx::query(
                    "UPDATE ingest_jobs SET state = 'failed', attempts = ?, last_error = ? WHERE id = ?",
                )
                .bind(attempts)
                .bind(e.to_string())
                .bind(&job.id)
                .execute(pool)
                .await?;
            }
        }
    }

    Ok(true)
}

/// Worker loop: poll for due jobs until the process shuts down.
pub async fn run_worker(
    pool: SqlitePool,
    ctx: IngestContext,
    policy: RetryPolicy,
    poll_interval: Duration,
) {
    loop {
        match process_one(&pool, &ctx, &policy).await {
            Ok(true) => {}
            Ok(false) => tokio::time::sleep(poll_interval).await,
            Err(e) => {
                error!(error = %e, "Job worker iteration failed");
                tokio::time::sleep(poll_interval).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::BlobStore;
    use crate::db;
    use crate::embedding::{Embedder, EmbeddingBatch};
    use crate::extract::TextExtractor;
    use crate::migrate;
    use crate::models::EmbeddingModel;
    use crate::store::memory::MemoryStore;
    use anyhow::bail;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Arc;

    struct FailingExtractor;

    #[async_trait]
    impl TextExtractor for FailingExtractor {
        async fn extract(&self, _path: &Path) -> Result<String> {
            bail!("extraction service returned 502")
        }
    }

    struct StubEmbedder;

    #[async_trait]
    impl Embedder for StubEmbedder {
        async fn embed(&self, _model: &EmbeddingModel, texts: &[String]) -> Result<EmbeddingBatch> {
            Ok(EmbeddingBatch {
                vectors: texts.iter().map(|_| vec![1.0, 0.0]).collect(),
                total_tokens: texts.len() as u64,
            })
        }
    }

    async fn setup() -> (SqlitePool, tempfile::TempDir, IngestContext) {
        let pool = db::connect_memory().await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();

        sqlx::query("INSERT INTO users (id, has_full_access) VALUES ('u1', 0)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO embedding_models (id, display_name, api_key) VALUES ('em1', 'ada', 'key')",
        )
        .execute(&pool)
        .await
        .unwrap();

        let tmp = tempfile::tempdir().unwrap();
        let ctx = IngestContext {
            blobs: BlobStore::new(tmp.path()),
            extractor: Arc::new(FailingExtractor),
            embedder: Arc::new(StubEmbedder),
            store: Arc::new(MemoryStore::new()),
        };
        (pool, tmp, ctx)
    }

    fn zero_jitter_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            interval_start: Duration::from_secs(0),
            interval_step: Duration::from_secs(0),
            interval_max: Duration::from_secs(0),
            jitter_max: Duration::from_secs(0),
            lease: Duration::from_secs(600),
        }
    }

    async fn create_doc(pool: &SqlitePool, blobs: &BlobStore) -> String {
        let doc = documents::create_document(
            pool,
            blobs,
            "u1",
            "a.txt",
            b"hello",
            None,
            String::new(),
            "em1",
        )
        .await
        .unwrap();
        doc.id
    }

    #[test]
    fn test_delay_bounds() {
        let policy = RetryPolicy {
            max_retries: 5,
            interval_start: Duration::from_secs(0),
            interval_step: Duration::from_secs(2),
            interval_max: Duration::from_secs(60),
            jitter_max: Duration::from_secs(10),
            lease: Duration::from_secs(600),
        };
        for attempt in 1..=100 {
            let d = policy.delay(attempt);
            assert!(d <= Duration::from_secs(70), "delay too long: {:?}", d);
        }
        // Backoff grows linearly before the cap
        let no_jitter = zero_jitter_policy(5);
        assert_eq!(no_jitter.delay(3), Duration::from_secs(0));

        let grown = RetryPolicy {
            jitter_max: Duration::from_secs(0),
            ..policy
        };
        assert_eq!(grown.delay(1), Duration::from_secs(2));
        assert_eq!(grown.delay(4), Duration::from_secs(8));
        assert_eq!(grown.delay(1000), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_empty_queue_is_noop() {
        let (pool, _tmp, ctx) = setup().await;
        let policy = zero_jitter_policy(5);
        assert!(!process_one(&pool, &ctx, &policy).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_attempt_forces_error_and_requeues() {
        let (pool, _tmp, ctx) = setup().await;
        let doc_id = create_doc(&pool, &ctx.blobs).await;
        let policy = zero_jitter_policy(5);

        assert!(process_one(&pool, &ctx, &policy).await.unwrap());

        // Failure handler forced the document out of InProgress
        let doc = documents::get_document(&pool, &doc_id).await.unwrap().unwrap();
        assert_eq!(doc.processing_status, ProcessingStatus::Error);

        let (state, attempts): (String, i64) = {
            let row = sqlx::query("SELECT state, attempts FROM ingest_jobs WHERE document_id = ?")
                .bind(&doc_id)
                .fetch_one(&pool)
                .await
                .unwrap();
            (row.get("state"), row.get("attempts"))
        };
        assert_eq!(state, "queued");
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn test_retries_exhaust_to_failed() {
        let (pool, _tmp, ctx) = setup().await;
        let doc_id = create_doc(&pool, &ctx.blobs).await;
        let policy = zero_jitter_policy(1);

        // attempt 0 -> requeued, attempt 1 -> requeued? no: max_retries=1
        assert!(process_one(&pool, &ctx, &policy).await.unwrap());
        assert!(process_one(&pool, &ctx, &policy).await.unwrap());

        let state: String =
            sqlx::query_scalar("SELECT state FROM ingest_jobs WHERE document_id = ?")
                .bind(&doc_id)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(state, "failed");

        let doc = documents::get_document(&pool, &doc_id).await.unwrap().unwrap();
        assert_eq!(doc.processing_status, ProcessingStatus::Error);
    }

    /// Put a document's job into the state a crashed worker leaves behind:
    /// claimed row, document stuck InProgress.
    async fn simulate_crashed_worker(pool: &SqlitePool, doc_id: &str, lease_expires_at: i64) {
        sqlx::query(
            "UPDATE ingest_jobs SET state = 'running', lease_expires_at = ? WHERE document_id = ?",
        )
        .bind(lease_expires_at)
        .bind(doc_id)
        .execute(pool)
        .await
        .unwrap();
        documents::set_status(pool, doc_id, ProcessingStatus::InProgress)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_expired_lease_is_redelivered() {
        let (pool, _tmp, ctx) = setup().await;
        let doc_id = create_doc(&pool, &ctx.blobs).await;
        simulate_crashed_worker(&pool, &doc_id, chrono::Utc::now().timestamp() - 1).await;

        let policy = zero_jitter_policy(5);

        // The abandoned row is reclaimed and run; the extractor fails, so
        // the failure handler takes over from there.
        assert!(process_one(&pool, &ctx, &policy).await.unwrap());

        let doc = documents::get_document(&pool, &doc_id).await.unwrap().unwrap();
        assert_eq!(doc.processing_status, ProcessingStatus::Error);

        let state: String =
            sqlx::query_scalar("SELECT state FROM ingest_jobs WHERE document_id = ?")
                .bind(&doc_id)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(state, "queued");
    }

    #[tokio::test]
    async fn test_live_lease_is_not_reclaimed() {
        let (pool, _tmp, ctx) = setup().await;
        let doc_id = create_doc(&pool, &ctx.blobs).await;
        simulate_crashed_worker(&pool, &doc_id, chrono::Utc::now().timestamp() + 600).await;

        let policy = zero_jitter_policy(5);
        assert!(!process_one(&pool, &ctx, &policy).await.unwrap());

        let doc = documents::get_document(&pool, &doc_id).await.unwrap().unwrap();
        assert_eq!(doc.processing_status, ProcessingStatus::InProgress);
    }

    #[tokio::test]
    async fn test_status_write_failure_still_requeues() {
        let (pool, _tmp, ctx) = setup().await;
        let doc_id = create_doc(&pool, &ctx.blobs).await;

        // Make every documents write fail mid-job
        sqlx::query("ALTER TABLE documents RENAME TO documents_gone")
            .execute(&pool)
            .await
            .unwrap();

        let policy = zero_jitter_policy(5);
        assert!(process_one(&pool, &ctx, &policy).await.unwrap());

        let (state, attempts): (String, i64) = {
            let row = sqlx::query("SELECT state, attempts FROM ingest_jobs WHERE document_id = ?")
                .bind(&doc_id)
                .fetch_one(&pool)
                .await
                .unwrap();
            (row.get("state"), row.get("attempts"))
        };
        assert_eq!(state, "queued");
        assert_eq!(attempts, 1);
    }
}
