use crate::error::CoreResult;
use crate::model::{DlqJob, Job, JobEvent, NewJob};
use crate::notifier::Notifier;
use crate::store::PgStore;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

/// Thin typed surface over `PgStore` for callers outside the worker loop:
/// the HTTP adapter (`api.rs`), the admin CLI, and embedders linking
/// against this crate directly. Every call here maps to one spec §6
/// operation and nothing more -- no HTML, no dashboards, no metrics.
#[derive(Clone)]
pub struct JobForge {
    store: PgStore,
    notifier: Notifier,
}

impl JobForge {
    pub fn new(store: PgStore) -> Self {
        let notifier = Notifier::new(store.pool().clone());
        Self { store, notifier }
    }

    pub fn store(&self) -> &PgStore {
        &self.store
    }

    pub async fn submit(
        &self,
        definition_key: impl Into<String>,
        definition_version: i32,
        params: Value,
        priority: i32,
        max_attempts: Option<i32>,
        scheduled_at: Option<DateTime<Utc>>,
        idempotency_key: Option<String>,
    ) -> CoreResult<Job> {
        let definition_key = definition_key.into();

        let max_attempts = match max_attempts {
            Some(n) => n,
            None => self
                .store
                .get_definition(&definition_key, definition_version)
                .await?
                .map(|d| d.default_max_attempts)
                .unwrap_or(1),
        };

        let job = self
            .store
            .insert_job(NewJob {
                definition_key,
                definition_version,
                params,
                priority,
                max_attempts,
                scheduled_at,
                idempotency_key,
            })
            .await?;

        if let Err(e) = self.notifier.notify_job_submitted().await {
            tracing::warn!(error = %e, "failed to publish submission notification");
        }

        Ok(job)
    }

    pub async fn cancel(&self, job_id: Uuid) -> CoreResult<()> {
        self.store.request_cancel(job_id).await
    }

    pub async fn get_job(&self, job_id: Uuid) -> CoreResult<Option<Job>> {
        self.store.get_job(job_id).await
    }

    pub async fn list_jobs(&self, status: Option<&str>, limit: i64) -> CoreResult<Vec<Job>> {
        self.store.list_jobs(status, limit).await
    }

    pub async fn get_events(&self, job_id: Uuid) -> CoreResult<Vec<JobEvent>> {
        self.store.get_events(job_id).await
    }

    pub async fn list_dlq(&self, limit: i64) -> CoreResult<Vec<DlqJob>> {
        self.store.list_dlq(limit).await
    }

    pub async fn get_dlq(&self, dlq_id: Uuid) -> CoreResult<Option<DlqJob>> {
        self.store.get_dlq(dlq_id).await
    }

    pub async fn retry_dlq(&self, dlq_id: Uuid, max_attempts_override: Option<i32>) -> CoreResult<Uuid> {
        let job_id = self.store.retry_dlq(dlq_id, max_attempts_override).await?;
        if let Err(e) = self.notifier.notify_job_submitted().await {
            tracing::warn!(error = %e, "failed to publish submission notification");
        }
        Ok(job_id)
    }
}
