use crate::error::CoreResult;
use crate::model::{NewJob, Schedule};
use crate::notifier::Notifier;
use crate::store::PgStore;
use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Arbitrary but stable key for the single session-level advisory lock that
/// elects the cron leader. Any i64 works as long as every instance agrees
/// on it; this one just spells something recognizable in hex.
const LEADER_LOCK_KEY: i64 = 0x4a4f_4246_4f52_4745;

/// Single-leader cron scheduler (spec §4.7). Every worker process runs one
/// of these; at most one of them ever holds the advisory lock and actually
/// enqueues anything, so schedules don't fire once per process.
pub struct Scheduler {
    store: PgStore,
    notifier: Notifier,
    pool: PgPool,
    tick_interval: Duration,
}

impl Scheduler {
    pub fn new(store: PgStore, pool: PgPool, tick_interval: Duration) -> Self {
        let notifier = Notifier::new(pool.clone());
        Self {
            store,
            notifier,
            pool,
            tick_interval,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }

            match self.try_become_leader().await {
                Ok(Some(mut conn)) => {
                    info!("acquired scheduler leadership");
                    self.lead(&mut shutdown).await;
                    if let Err(e) = PgStore::advisory_unlock(&mut conn, LEADER_LOCK_KEY).await {
                        warn!(error = %e, "failed to release leader lock cleanly");
                    }
                }
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.tick_interval) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "leader election attempt failed");
                    tokio::time::sleep(self.tick_interval).await;
                }
            }
        }
    }

    async fn try_become_leader(&self) -> CoreResult<Option<PoolConnection<Postgres>>> {
        let mut conn = self.pool.acquire().await?;
        let acquired = PgStore::try_advisory_lock(&mut conn, LEADER_LOCK_KEY).await?;
        Ok(if acquired { Some(conn) } else { None })
    }

    /// Runs the cron tick loop for as long as leadership holds. Leadership
    /// is held by a single dedicated connection (session-level advisory
    /// locks are connection-scoped); if that connection dies the lock is
    /// released automatically by Postgres and another instance takes over.
    async fn lead(&self, shutdown: &mut watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!(error = %e, "scheduler tick failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Runs a single tick outside the leader-election loop. Exposed for
    /// callers (tests, one-off admin invocations) that want deterministic
    /// control over when a tick happens instead of waiting on the interval.
    pub async fn tick_once(&self) -> CoreResult<()> {
        self.tick().await
    }

    async fn tick(&self) -> CoreResult<()> {
        let now = Utc::now();
        for schedule in self.store.list_enabled_schedules().await? {
            if self.is_due(&schedule, now) {
                self.fire(&schedule, now).await?;
            }
        }
        Ok(())
    }

    fn is_due(&self, schedule: &Schedule, now: DateTime<Utc>) -> bool {
        match schedule_is_due(&schedule.cron_expression, schedule.last_enqueued_at, now) {
            Ok(due) => due,
            Err(e) => {
                warn!(
                    schedule_id = %schedule.id,
                    expr = %schedule.cron_expression,
                    error = %e,
                    "invalid cron expression, skipping"
                );
                false
            }
        }
    }

    async fn fire(&self, schedule: &Schedule, now: DateTime<Utc>) -> CoreResult<()> {
        let max_attempts = self
            .store
            .get_definition(&schedule.definition_key, schedule.definition_version)
            .await?
            .map(|def| def.default_max_attempts)
            .unwrap_or(1);

        let job = self
            .store
            .insert_job(NewJob {
                definition_key: schedule.definition_key.clone(),
                definition_version: schedule.definition_version,
                params: schedule.params.clone(),
                priority: schedule.priority,
                max_attempts,
                scheduled_at: None,
                idempotency_key: None,
            })
            .await?;

        self.store.mark_schedule_enqueued(schedule.id, now).await?;
        info!(
            schedule_id = %schedule.id,
            job_id = %job.id,
            definition = %schedule.definition_key,
            "cron schedule fired"
        );
        if let Err(e) = self.notifier.notify_job_submitted().await {
            warn!(error = %e, "failed to publish scheduler notification");
        }
        Ok(())
    }
}

/// A schedule is due once per tick at most: look for the earliest cron
/// occurrence strictly after the last enqueue and fire if it has already
/// passed. Stamping the *current* time (not the occurrence time) as
/// `last_enqueued_at` on fire is what makes a backlog of missed ticks
/// collapse into a single firing instead of flooding the queue once the
/// scheduler comes back from downtime.
fn schedule_is_due(
    cron_expression: &str,
    last_enqueued_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<bool, cron::error::Error> {
    let cron_schedule = CronSchedule::from_str(cron_expression)?;
    let baseline = last_enqueued_at.unwrap_or_else(|| now - chrono::Duration::seconds(1));
    Ok(matches!(cron_schedule.after(&baseline).next(), Some(next_fire) if next_fire <= now))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn fires_once_baseline_passes_the_next_minute_boundary() {
        let expr = "0 * * * * *"; // every minute, on the minute
        let last = at(2024, 1, 1, 12, 0, 0);

        let just_before = at(2024, 1, 1, 12, 0, 59);
        assert!(!schedule_is_due(expr, Some(last), just_before).unwrap());

        let just_after = at(2024, 1, 1, 12, 1, 0);
        assert!(schedule_is_due(expr, Some(last), just_after).unwrap());
    }

    #[test]
    fn a_long_backlog_still_only_fires_once() {
        let expr = "0 * * * * *";
        // last fired an hour ago; many ticks have been missed.
        let last = at(2024, 1, 1, 12, 0, 0);
        let now = at(2024, 1, 1, 13, 0, 0);
        assert!(schedule_is_due(expr, Some(last), now).unwrap());
        // stamping `now` (not the occurrence time) as last_enqueued_at is
        // the caller's job; verify that doing so skips the rest of the
        // backlog instead of firing again on the very next check.
        assert!(!schedule_is_due(expr, Some(now), now).unwrap());
    }

    #[test]
    fn invalid_expression_is_rejected() {
        assert!(schedule_is_due("not a cron expression", None, Utc::now()).is_err());
    }

    #[test]
    fn never_fired_schedule_fires_on_its_first_due_tick() {
        let expr = "0 * * * * *";
        let now = at(2024, 1, 1, 12, 1, 0);
        assert!(schedule_is_due(expr, None, now).unwrap());
    }
}
