use crate::notifier::Notifier;
use crate::store::PgStore;
use std::time::Duration;
use tracing::{info, warn};

/// Periodically requeues jobs whose lease has expired without a heartbeat
/// (spec §4.6: a worker that crashed or was killed -9 mid-job never gets to
/// mark its own job failed, so someone else has to notice).
pub struct Reclaimer {
    store: PgStore,
    notifier: Notifier,
    poll_interval: Duration,
}

impl Reclaimer {
    pub fn new(store: PgStore, poll_interval: Duration) -> Self {
        let notifier = Notifier::new(store.pool().clone());
        Self {
            store,
            notifier,
            poll_interval,
        }
    }

    pub async fn run(self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.store.reclaim_orphans().await {
                        Ok(0) => {}
                        Ok(n) => {
                            info!(reclaimed = n, "requeued orphaned jobs");
                            if let Err(e) = self.notifier.notify_job_submitted().await {
                                warn!(error = %e, "failed to publish reclaim notification");
                            }
                        }
                        Err(e) => warn!(error = %e, "orphan reclaim pass failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}
