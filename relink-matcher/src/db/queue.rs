//! SQLite-backed job broker
//!
//! At-least-once delivery over two tables: `jobs` (queued / in_flight with
//! a visibility timeout) and `dead_letter_jobs` (exhausted envelopes,
//! pending manual inspection). Claims are conditional updates, so any
//! number of workers can dequeue from the same pool; a job whose worker
//! dies silently comes back after the visibility timeout with its attempt
//! counter bumped. No ordering guarantee across jobs.

use crate::models::JobEnvelope;
use async_trait::async_trait;
use relink_common::{time, uuid_utils};
use sqlx::{Row, SqlitePool};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("broker payload error: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("broker row corrupt: {0}")]
    Corrupt(String),
}

/// A claimed job; doubles as the handle for ack/nack/dead-letter
#[derive(Debug, Clone)]
pub struct DeliveredJob {
    pub envelope: JobEnvelope,
}

/// Queue abstraction the dispatcher and worker loop are written against
#[async_trait]
pub trait Broker: Send + Sync {
    /// Push an envelope, immediately available. Idempotent on `job_id`:
    /// re-enqueueing an envelope the broker already holds is a no-op.
    async fn enqueue(&self, envelope: &JobEnvelope) -> Result<(), BrokerError>;

    /// Claim the next available job, reclaiming expired in-flight jobs
    /// first. `None` when the queue is idle.
    async fn dequeue(&self) -> Result<Option<DeliveredJob>, BrokerError>;

    /// Settle a delivered job successfully; it will not be seen again.
    async fn ack(&self, job: &DeliveredJob) -> Result<(), BrokerError>;

    /// Return a delivered job to the queue after `delay`, bumping attempt.
    async fn nack(&self, job: &DeliveredJob, delay: Duration) -> Result<(), BrokerError>;

    /// Move a delivered job to the dead letter table. Idempotent on
    /// `job_id`.
    async fn dead_letter(&self, job: &DeliveredJob, error: &str) -> Result<(), BrokerError>;

    /// Jobs currently waiting for a worker
    async fn queued_depth(&self) -> Result<i64, BrokerError>;

    /// Rows in the dead letter table
    async fn dead_letter_count(&self) -> Result<i64, BrokerError>;
}

/// The production broker, sharing the daemon's SQLite pool
#[derive(Clone)]
pub struct SqliteBroker {
    pool: SqlitePool,
    visibility_timeout: Duration,
}

impl SqliteBroker {
    pub fn new(pool: SqlitePool, visibility_timeout: Duration) -> Self {
        SqliteBroker {
            pool,
            visibility_timeout,
        }
    }

    /// Requeue in-flight jobs whose lock is older than the visibility
    /// timeout. Each reclaim counts as a consumed delivery.
    async fn reclaim_expired(&self) -> Result<u64, BrokerError> {
        let cutoff = time::to_db_timestamp(
            &(time::now() - chrono::Duration::seconds(self.visibility_timeout.as_secs() as i64)),
        );
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'queued', attempt = attempt + 1, locked_at = NULL, available_at = ?
            WHERE status = 'in_flight' AND locked_at < ?
            "#,
        )
        .bind(time::now_db_timestamp())
        .bind(&cutoff)
        .execute(&self.pool)
        .await?;

        let reclaimed = result.rows_affected();
        if reclaimed > 0 {
            warn!(count = reclaimed, "Reclaimed expired in-flight jobs");
        }
        Ok(reclaimed)
    }
}

fn envelope_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<JobEnvelope, BrokerError> {
    let id: String = row.get("id");
    let payload: String = row.get("payload");
    let created_at: String = row.get("created_at");

    Ok(JobEnvelope {
        job_id: uuid_utils::parse(&id).map_err(|e| BrokerError::Corrupt(e.to_string()))?,
        attempt: row.get::<i64, _>("attempt") as u32,
        max_attempts: row.get::<i64, _>("max_attempts") as u32,
        payload: serde_json::from_str(&payload)?,
        created_at: time::parse_db_timestamp(&created_at)
            .map_err(|e| BrokerError::Corrupt(e.to_string()))?,
    })
}

#[async_trait]
impl Broker for SqliteBroker {
    async fn enqueue(&self, envelope: &JobEnvelope) -> Result<(), BrokerError> {
        let payload = serde_json::to_string(&envelope.payload)?;
        let now_str = time::now_db_timestamp();

        sqlx::query(
            r#"
            INSERT OR IGNORE INTO jobs
                (id, job_type, payload, attempt, max_attempts, status, available_at, locked_at, created_at)
            VALUES (?, ?, ?, ?, ?, 'queued', ?, NULL, ?)
            "#,
        )
        .bind(envelope.job_id.to_string())
        .bind(envelope.job_type())
        .bind(&payload)
        .bind(envelope.attempt as i64)
        .bind(envelope.max_attempts as i64)
        .bind(&now_str)
        .bind(time::to_db_timestamp(&envelope.created_at))
        .execute(&self.pool)
        .await?;

        debug!(job_id = %envelope.job_id, job_type = envelope.job_type(), "Enqueued job");
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<DeliveredJob>, BrokerError> {
        self.reclaim_expired().await?;

        // a few claim attempts ride out races with sibling workers
        for _ in 0..3 {
            let now_str = time::now_db_timestamp();
            let row = sqlx::query(
                r#"
                SELECT * FROM jobs
                WHERE status = 'queued' AND available_at <= ?
                ORDER BY available_at, created_at
                LIMIT 1
                "#,
            )
            .bind(&now_str)
            .fetch_optional(&self.pool)
            .await?;

            let Some(row) = row else {
                return Ok(None);
            };
            let id: String = row.get("id");

            let claimed = sqlx::query(
                "UPDATE jobs SET status = 'in_flight', locked_at = ? WHERE id = ? AND status = 'queued'",
            )
            .bind(&now_str)
            .bind(&id)
            .execute(&self.pool)
            .await?;

            if claimed.rows_affected() == 1 {
                let envelope = envelope_from_row(&row)?;
                debug!(job_id = %envelope.job_id, attempt = envelope.attempt, "Dequeued job");
                return Ok(Some(DeliveredJob { envelope }));
            }
            // lost the claim race; look at the next candidate row
        }
        Ok(None)
    }

    async fn ack(&self, job: &DeliveredJob) -> Result<(), BrokerError> {
        sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(job.envelope.job_id.to_string())
            .execute(&self.pool)
            .await?;
        debug!(job_id = %job.envelope.job_id, "Acked job");
        Ok(())
    }

    async fn nack(&self, job: &DeliveredJob, delay: Duration) -> Result<(), BrokerError> {
        let available_at =
            time::to_db_timestamp(&(time::now() + chrono::Duration::seconds(delay.as_secs() as i64)));

        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'queued', attempt = attempt + 1, available_at = ?, locked_at = NULL
            WHERE id = ?
            "#,
        )
        .bind(&available_at)
        .bind(job.envelope.job_id.to_string())
        .execute(&self.pool)
        .await?;

        debug!(
            job_id = %job.envelope.job_id,
            delay_secs = delay.as_secs(),
            "Nacked job for retry"
        );
        Ok(())
    }

    async fn dead_letter(&self, job: &DeliveredJob, error: &str) -> Result<(), BrokerError> {
        let payload = serde_json::to_string(&job.envelope.payload)?;
        let job_id_str = job.envelope.job_id.to_string();
        // delivered attempts including the fatal one
        let attempts = job.envelope.attempt as i64 + 1;

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO dead_letter_jobs
                (id, job_id, job_type, payload, attempts, error_message, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(uuid_utils::generate().to_string())
        .bind(&job_id_str)
        .bind(job.envelope.job_type())
        .bind(&payload)
        .bind(attempts)
        .bind(error)
        .bind(time::now_db_timestamp())
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(&job_id_str)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        warn!(
            job_id = %job.envelope.job_id,
            job_type = job.envelope.job_type(),
            attempts,
            error,
            "Job moved to dead letter table"
        );
        Ok(())
    }

    async fn queued_depth(&self) -> Result<i64, BrokerError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE status = 'queued'")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn dead_letter_count(&self) -> Result<i64, BrokerError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dead_letter_jobs")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::models::JobPayload;
    use uuid::Uuid;

    fn coordinator_envelope() -> JobEnvelope {
        JobEnvelope::new(
            JobPayload::Coordinator {
                project_id: Uuid::new_v4(),
                task_ids: None,
            },
            3,
        )
    }

    async fn broker() -> SqliteBroker {
        SqliteBroker::new(test_pool().await, Duration::from_secs(120))
    }

    #[tokio::test]
    async fn test_enqueue_dequeue_round_trip() {
        let broker = broker().await;
        let envelope = coordinator_envelope();
        broker.enqueue(&envelope).await.unwrap();

        let job = broker.dequeue().await.unwrap().unwrap();
        assert_eq!(job.envelope.job_id, envelope.job_id);
        assert_eq!(job.envelope.payload, envelope.payload);
        assert_eq!(job.envelope.attempt, 0);

        // claimed: nothing else to deliver
        assert!(broker.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent_on_job_id() {
        let broker = broker().await;
        let envelope = coordinator_envelope();
        broker.enqueue(&envelope).await.unwrap();
        broker.enqueue(&envelope).await.unwrap();
        assert_eq!(broker.queued_depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_ack_removes_job() {
        let broker = broker().await;
        broker.enqueue(&coordinator_envelope()).await.unwrap();

        let job = broker.dequeue().await.unwrap().unwrap();
        broker.ack(&job).await.unwrap();

        assert!(broker.dequeue().await.unwrap().is_none());
        assert_eq!(broker.queued_depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_nack_delays_and_bumps_attempt() {
        let broker = broker().await;
        broker.enqueue(&coordinator_envelope()).await.unwrap();

        let job = broker.dequeue().await.unwrap().unwrap();
        broker.nack(&job, Duration::from_secs(60)).await.unwrap();

        // not yet available
        assert!(broker.dequeue().await.unwrap().is_none());

        // a second job enqueued now is delivered ahead of the delayed one
        let second = coordinator_envelope();
        broker.enqueue(&second).await.unwrap();
        let delivered = broker.dequeue().await.unwrap().unwrap();
        assert_eq!(delivered.envelope.job_id, second.job_id);
    }

    #[tokio::test]
    async fn test_nack_zero_delay_redelivers_with_attempt() {
        let broker = broker().await;
        broker.enqueue(&coordinator_envelope()).await.unwrap();

        let job = broker.dequeue().await.unwrap().unwrap();
        broker.nack(&job, Duration::ZERO).await.unwrap();

        let redelivered = broker.dequeue().await.unwrap().unwrap();
        assert_eq!(redelivered.envelope.job_id, job.envelope.job_id);
        assert_eq!(redelivered.envelope.attempt, 1);
    }

    #[tokio::test]
    async fn test_visibility_timeout_reclaims_abandoned_job() {
        let broker = SqliteBroker::new(test_pool().await, Duration::ZERO);
        broker.enqueue(&coordinator_envelope()).await.unwrap();

        let job = broker.dequeue().await.unwrap().unwrap();
        assert_eq!(job.envelope.attempt, 0);
        // no ack: the claim expires immediately with a zero timeout

        let reclaimed = broker.dequeue().await.unwrap().unwrap();
        assert_eq!(reclaimed.envelope.job_id, job.envelope.job_id);
        assert_eq!(reclaimed.envelope.attempt, 1);
    }

    #[tokio::test]
    async fn test_dead_letter_moves_job_once() {
        let broker = broker().await;
        broker.enqueue(&coordinator_envelope()).await.unwrap();

        let job = broker.dequeue().await.unwrap().unwrap();
        broker.dead_letter(&job, "search timed out").await.unwrap();
        // duplicate routing of the same envelope is a no-op
        broker.dead_letter(&job, "search timed out").await.unwrap();

        assert_eq!(broker.dead_letter_count().await.unwrap(), 1);
        assert_eq!(broker.queued_depth().await.unwrap(), 0);
        assert!(broker.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_queue_yields_none() {
        let broker = broker().await;
        assert!(broker.dequeue().await.unwrap().is_none());
    }
}
