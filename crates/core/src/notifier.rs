use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tracing::{debug, warn};

pub const JOB_SUBMITTED_CHANNEL: &str = "jobforge_job_submitted";

/// Wakes idle workers as soon as a job is submitted instead of waiting out a
/// poll interval. Purely a latency optimization: the claim loop's
/// `FOR UPDATE SKIP LOCKED` pass is still the only thing that actually hands
/// out work, so a missed or coalesced notification just means a worker waits
/// for its next poll tick rather than losing the job (spec §4.2).
#[derive(Clone)]
pub struct Notifier {
    pool: PgPool,
}

impl Notifier {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn notify_job_submitted(&self) -> sqlx::Result<()> {
        sqlx::query("SELECT pg_notify($1, '')")
            .bind(JOB_SUBMITTED_CHANNEL)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Subscribes to the submission channel and calls `on_notify` for every
    /// payload received. Runs until the listener's connection drops or the
    /// shutdown signal fires; reconnection is the caller's responsibility
    /// since a dropped `PgListener` can't resubscribe itself.
    pub async fn listen_job_submitted<F>(
        &self,
        mut on_notify: F,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> sqlx::Result<()>
    where
        F: FnMut(),
    {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(JOB_SUBMITTED_CHANNEL).await?;

        loop {
            tokio::select! {
                notification = listener.try_recv() => {
                    match notification {
                        Ok(Some(_)) => {
                            debug!("job submission notification received");
                            on_notify();
                        }
                        Ok(None) => {
                            warn!("notification listener connection closed");
                            break;
                        }
                        Err(e) => {
                            warn!(error = %e, "notification listener error");
                            break;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}
