//! Job dispatch helpers
//!
//! Builds envelopes and pushes them to the broker; never blocks on worker
//! execution. Payloads carry Entity Store ids only. If a broker write
//! fails after the task rows already committed, the tasks stay
//! `queued_for_processing` until the sweeper re-enqueues them.

use crate::db::queue::{Broker, BrokerError};
use crate::models::{JobEnvelope, JobPayload};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

#[derive(Clone)]
pub struct JobDispatcher {
    broker: Arc<dyn Broker>,
    max_attempts: u32,
}

impl JobDispatcher {
    pub fn new(broker: Arc<dyn Broker>, max_attempts: u32) -> Self {
        JobDispatcher {
            broker,
            max_attempts,
        }
    }

    /// Enqueue a coordinator job; `task_ids` carries an explicit rerun
    /// selection.
    pub async fn enqueue_coordinator(
        &self,
        project_id: Uuid,
        task_ids: Option<Vec<Uuid>>,
    ) -> Result<Uuid, BrokerError> {
        let envelope = JobEnvelope::new(
            JobPayload::Coordinator {
                project_id,
                task_ids,
            },
            self.max_attempts,
        );
        let job_id = envelope.job_id;
        self.broker.enqueue(&envelope).await?;
        debug!("enqueued coordinator job {} for project {}", job_id, project_id);
        Ok(job_id)
    }

    /// Enqueue one chunk of tasks to match
    pub async fn enqueue_match_batch(
        &self,
        project_id: Uuid,
        task_ids: Vec<Uuid>,
    ) -> Result<Uuid, BrokerError> {
        let batch_len = task_ids.len();
        let envelope = JobEnvelope::new(
            JobPayload::MatchEntry {
                project_id,
                task_ids,
            },
            self.max_attempts,
        );
        let job_id = envelope.job_id;
        self.broker.enqueue(&envelope).await?;
        debug!(
            "enqueued match batch {} ({} tasks) for project {}",
            job_id, batch_len, project_id
        );
        Ok(job_id)
    }

    pub async fn queued_depth(&self) -> Result<i64, BrokerError> {
        self.broker.queued_depth().await
    }

    pub async fn dead_letter_count(&self) -> Result<i64, BrokerError> {
        self.broker.dead_letter_count().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::db::queue::SqliteBroker;
    use std::time::Duration;

    async fn dispatcher() -> (JobDispatcher, Arc<SqliteBroker>) {
        let pool = db::test_pool().await;
        let broker = Arc::new(SqliteBroker::new(pool, Duration::from_secs(120)));
        (JobDispatcher::new(broker.clone(), 3), broker)
    }

    #[tokio::test]
    async fn test_coordinator_job_round_trip() {
        let (dispatcher, broker) = dispatcher().await;
        let project_id = Uuid::new_v4();

        let job_id = dispatcher
            .enqueue_coordinator(project_id, None)
            .await
            .expect("enqueue");
        assert_eq!(dispatcher.queued_depth().await.expect("depth"), 1);

        let delivered = broker
            .dequeue()
            .await
            .expect("dequeue")
            .expect("job available");
        assert_eq!(delivered.envelope.job_id, job_id);
        assert_eq!(delivered.envelope.max_attempts, 3);
        match &delivered.envelope.payload {
            JobPayload::Coordinator {
                project_id: p,
                task_ids,
            } => {
                assert_eq!(*p, project_id);
                assert!(task_ids.is_none());
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_match_batch_preserves_task_order() {
        let (dispatcher, broker) = dispatcher().await;
        let project_id = Uuid::new_v4();
        let task_ids = vec![Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];

        dispatcher
            .enqueue_match_batch(project_id, task_ids.clone())
            .await
            .expect("enqueue");

        let delivered = broker
            .dequeue()
            .await
            .expect("dequeue")
            .expect("job available");
        match &delivered.envelope.payload {
            JobPayload::MatchEntry { task_ids: got, .. } => assert_eq!(*got, task_ids),
            other => panic!("unexpected payload: {:?}", other),
        }
    }
}
