pub mod unit;

use crate::definitions::{Handler, JobContext};
use crate::error::CoreError;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

pub use unit::{ChildProcessUnit, InProcessUnit};

/// Cooperative cancellation signal threaded into a running handler.
///
/// Triggering it does two things: flips a flag a handler can poll via
/// `JobContext::is_cancelled`, and wakes anyone waiting on `cancelled()` so
/// the executor can race it against the handler future.
#[derive(Clone, Default)]
pub struct AbortToken {
    triggered: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl AbortToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.triggered.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Resolves once `trigger()` has been called, immediately if it already
    /// has. Safe to race in a `select!` arm.
    pub async fn cancelled(&self) {
        if self.is_triggered() {
            return;
        }
        self.notify.notified().await;
    }
}

/// Abstracts where a handler's code actually runs. The dispatch loop doesn't
/// care whether a job executes in-process or in a child process; it only
/// needs a future that resolves to the handler's outcome and respects
/// cancellation (spec §4.4).
#[async_trait::async_trait]
pub trait ExecutionUnit: Send + Sync {
    async fn run(
        &self,
        handler: Arc<dyn Handler>,
        ctx: JobContext,
        params: Value,
    ) -> Result<Value, CoreError>;
}

/// Runs a handler to completion, a timeout, or a cancellation signal,
/// whichever happens first.
pub async fn run_with_deadline(
    unit: &dyn ExecutionUnit,
    handler: Arc<dyn Handler>,
    ctx: JobContext,
    params: Value,
    timeout: Duration,
) -> Result<Value, CoreError> {
    let cancel = ctx.cancel.clone();
    tokio::select! {
        res = unit.run(handler, ctx, params) => res,
        _ = tokio::time::sleep(timeout) => Err(CoreError::Handler("handler timed out".to_string())),
        _ = cancel.cancelled() => Err(CoreError::Cancellation),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancelled_resolves_immediately_if_already_triggered() {
        let token = AbortToken::new();
        token.trigger();
        tokio::time::timeout(Duration::from_millis(50), token.cancelled())
            .await
            .expect("cancelled() must not block once triggered");
    }

    #[tokio::test]
    async fn cancelled_wakes_a_waiter_on_trigger() {
        let token = AbortToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!handle.is_finished());

        token.trigger();
        tokio::time::timeout(Duration::from_millis(200), handle)
            .await
            .expect("waiter should wake up shortly after trigger")
            .unwrap();
    }

    #[tokio::test]
    async fn run_with_deadline_times_out_slow_handlers() {
        struct SlowUnit;
        #[async_trait::async_trait]
        impl ExecutionUnit for SlowUnit {
            async fn run(
                &self,
                _handler: Arc<dyn Handler>,
                _ctx: JobContext,
                _params: Value,
            ) -> Result<Value, CoreError> {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(Value::Null)
            }
        }

        struct NoopHandler;
        #[async_trait::async_trait]
        impl Handler for NoopHandler {
            async fn call(&self, _ctx: JobContext, _params: Value) -> Result<Value, CoreError> {
                Ok(Value::Null)
            }
        }

        let pool = sqlx::PgPool::connect_lazy("postgres://localhost/nonexistent")
            .expect("lazy pool construction does not touch the network");
        let ctx = JobContext {
            job_id: uuid::Uuid::nil(),
            attempt: 1,
            cancel: AbortToken::new(),
            store: crate::store::PgStore::new(pool),
        };

        let result = run_with_deadline(
            &SlowUnit,
            Arc::new(NoopHandler),
            ctx,
            Value::Null,
            Duration::from_millis(20),
        )
        .await;

        assert!(matches!(result, Err(CoreError::Handler(_))));
    }
}
