use crate::config::Config;
use crate::definitions::{DefinitionRegistry, Handler, JobContext};
use crate::executor::{run_with_deadline, AbortToken, ExecutionUnit};
use crate::model::{truncate_error_summary, Job, JobStatus};
use crate::notifier::Notifier;
use crate::retry::{next_retry_at, should_retry};
use crate::store::PgStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tracing::{error, info, warn};

/// Bounded worker pool: claims jobs, enforces the process-wide and
/// per-definition concurrency caps, and drives each claimed job through
/// execution to a terminal or retry outcome (spec §4.3).
pub struct Supervisor {
    store: PgStore,
    registry: DefinitionRegistry,
    config: Config,
    unit: Arc<dyn ExecutionUnit>,
    semaphore: Arc<Semaphore>,
    claiming: AtomicBool,
}

impl Supervisor {
    pub fn new(
        store: PgStore,
        registry: DefinitionRegistry,
        config: Config,
        unit: Arc<dyn ExecutionUnit>,
    ) -> Arc<Self> {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent));
        Arc::new(Self {
            store,
            registry,
            config,
            unit,
            semaphore,
            claiming: AtomicBool::new(false),
        })
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let notifier = Notifier::new(self.store.pool().clone());
        let (wake_tx, mut wake_rx) = tokio::sync::mpsc::channel::<()>(16);

        let listen_task = {
            let wake_tx = wake_tx.clone();
            let listen_shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = notifier
                    .listen_job_submitted(move || { let _ = wake_tx.try_send(()); }, listen_shutdown)
                    .await
                {
                    warn!(error = %e, "job-submitted listener exited");
                }
            })
        };

        let mut poll_ticker = tokio::time::interval(Duration::from_secs(self.config.poll_interval_seconds));

        loop {
            tokio::select! {
                _ = poll_ticker.tick() => self.clone().spawn_claim_pass(),
                _ = wake_rx.recv() => self.clone().spawn_claim_pass(),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        listen_task.abort();
    }

    fn spawn_claim_pass(self: Arc<Self>) {
        if self.claiming.swap(true, Ordering::SeqCst) {
            // A claim pass is already draining the queue; this wakeup is
            // redundant, not lost -- the in-flight pass will keep claiming
            // until the queue (or concurrency budget) is exhausted.
            return;
        }
        tokio::spawn(async move {
            self.claim_loop().await;
            self.claiming.store(false, Ordering::SeqCst);
        });
    }

    async fn claim_loop(self: &Arc<Self>) {
        loop {
            let permit = match self.semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => return,
            };

            match self
                .store
                .claim_one(&self.config.worker_id, self.config.lease_duration_seconds)
                .await
            {
                Ok(Some(job)) => {
                    let this = self.clone();
                    tokio::spawn(async move { this.execute_claimed_job(job, permit).await });
                }
                Ok(None) => return,
                Err(e) => {
                    error!(error = %e, "claim pass failed");
                    return;
                }
            }
        }
    }

    async fn execute_claimed_job(
        self: Arc<Self>,
        job: Job,
        _permit: tokio::sync::OwnedSemaphorePermit,
    ) {
        let Some(handler) = self.registry.lookup(&job.definition_key, job.definition_version) else {
            let summary = format!("unknown definition {}@{}", job.definition_key, job.definition_version);
            warn!(job_id = %job.id, definition = %job.definition_key, "no handler registered for definition, failing");
            let _ = self.store.set_status(job.id, JobStatus::Failed, Some(&summary)).await;
            let _ = self
                .store
                .append_event(job.id, "failed", Some(serde_json::json!({ "error": summary })))
                .await;
            return;
        };

        if let Ok(Some(def)) = self
            .store
            .get_definition(&job.definition_key, job.definition_version)
            .await
        {
            if def.concurrency_limit > 0 {
                match self
                    .store
                    .running_count_for_definition(&job.definition_key, job.definition_version)
                    .await
                {
                    Ok(running) if running > def.concurrency_limit as i64 => {
                        // We already flipped this job to `running` when we
                        // claimed it; another in-flight job for the same
                        // definition pushed us over the cap. Bounce it back
                        // rather than burn the lease.
                        let _ = self
                            .store
                            .schedule_retry(
                                job.id,
                                chrono::Utc::now() + chrono::Duration::milliseconds(200),
                            )
                            .await;
                        return;
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "concurrency check failed, proceeding anyway"),
                }
            }
        }

        let abort = AbortToken::new();
        let watchdog = self.clone().spawn_watchdog(job.id, abort.clone());

        let ctx = JobContext {
            job_id: job.id,
            attempt: job.attempts + 1,
            cancel: abort.clone(),
            store: self.store.clone(),
        };

        let _ = self.store.append_event(job.id, "started", None).await;
        handler.on_start(&ctx).await;

        let timeout = Duration::from_secs(self.config.lease_duration_seconds.max(1) as u64);
        let outcome = run_with_deadline(
            self.unit.as_ref(),
            handler.clone(),
            ctx.clone(),
            job.params.clone(),
            timeout,
        )
        .await;

        watchdog.abort();

        self.finish_job(job, ctx, handler, outcome).await;
    }

    /// Heartbeats the lease and watches for an external cancel request or
    /// lease loss, triggering the abort token either way.
    fn spawn_watchdog(
        self: Arc<Self>,
        job_id: uuid::Uuid,
        abort: AbortToken,
    ) -> tokio::task::JoinHandle<()> {
        let interval = Duration::from_millis(self.config.cancel_check_interval_ms.max(50));
        let heartbeat_every = (self.config.heartbeat_interval_seconds.max(1) as u64 * 1000)
            / interval.as_millis().max(1) as u64;
        let heartbeat_every = heartbeat_every.max(1);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut tick_count: u64 = 0;
            loop {
                ticker.tick().await;
                tick_count += 1;

                match self.store.is_cancel_requested(job_id).await {
                    Ok(true) => {
                        abort.trigger();
                        break;
                    }
                    Ok(false) => {}
                    Err(e) => warn!(error = %e, "cancel check failed"),
                }

                if tick_count % heartbeat_every == 0 {
                    match self
                        .store
                        .heartbeat_checked(job_id, self.config.lease_duration_seconds)
                        .await
                    {
                        Ok(true) => {
                            let _ = self.store.append_event(job_id, "heartbeat", None).await;
                        }
                        Ok(false) => {
                            warn!(job_id = %job_id, "lease lost, aborting handler");
                            abort.trigger();
                            break;
                        }
                        Err(e) => warn!(error = %e, "heartbeat failed"),
                    }
                }
            }
        })
    }

    async fn finish_job(
        &self,
        job: Job,
        ctx: JobContext,
        handler: Arc<dyn Handler>,
        outcome: Result<serde_json::Value, crate::error::CoreError>,
    ) {
        match outcome {
            Ok(result) => {
                let _ = self.store.set_status(job.id, JobStatus::Succeeded, None).await;
                let _ = self
                    .store
                    .append_event(job.id, "succeeded", None)
                    .await;
                handler.on_success(&ctx, &result).await;
                handler.on_end(&ctx).await;
                info!(job_id = %job.id, "job succeeded");
            }
            Err(crate::error::CoreError::Cancellation) => {
                let was_cancel_requested = self.store.is_cancel_requested(job.id).await.unwrap_or(true);
                if was_cancel_requested {
                    let _ = self.store.set_status(job.id, JobStatus::Cancelled, None).await;
                    let _ = self.store.append_event(job.id, "cancelled", None).await;
                    info!(job_id = %job.id, "job cancelled");
                } else {
                    // Lease lost mid-flight; the reclaimer already requeued
                    // it (or will shortly). Nothing more to do here.
                    warn!(job_id = %job.id, "execution aborted without explicit cancel, assuming lease loss");
                }
            }
            Err(e) => {
                let summary = truncate_error_summary(&e.to_string());
                let attempts = self.store.increment_attempts(job.id).await.unwrap_or(job.attempts + 1);

                if should_retry(attempts, job.max_attempts, false) {
                    let at = next_retry_at(
                        chrono::Utc::now(),
                        attempts,
                        self.config.backoff_base_seconds,
                        self.config.backoff_max_seconds,
                        self.config.backoff_jitter,
                    );
                    let _ = self.store.schedule_retry(job.id, at).await;
                    let _ = self
                        .store
                        .append_event(
                            job.id,
                            "failed",
                            Some(serde_json::json!({
                                "error": summary,
                                "retry_scheduled_at": at,
                                "attempts": attempts,
                            })),
                        )
                        .await;
                    warn!(job_id = %job.id, attempts, error = %summary, "job failed, retry scheduled");
                } else {
                    let _ = self.store.set_status(job.id, JobStatus::Failed, Some(&summary)).await;
                    let _ = self
                        .store
                        .append_event(
                            job.id,
                            "failed",
                            Some(serde_json::json!({ "error": summary, "attempts": attempts })),
                        )
                        .await;
                    handler.on_fail(&ctx, &e).await;
                    handler.on_end(&ctx).await;

                    match self.store.move_to_dlq(job.id, &summary).await {
                        Ok(dlq) => {
                            warn!(job_id = %job.id, dlq_id = %dlq.id, "job exhausted retries, moved to dlq");
                        }
                        Err(e) => error!(job_id = %job.id, error = %e, "failed to move job to dlq"),
                    }
                }
            }
        }
    }
}
