use super::ExecutionUnit;
use crate::definitions::{Handler, JobContext};
use crate::error::CoreError;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

/// Default unit: runs the handler on a `tokio::spawn`ed task so a panicking
/// handler can't take the worker process down with it.
#[derive(Default)]
pub struct InProcessUnit;

#[async_trait]
impl ExecutionUnit for InProcessUnit {
    async fn run(
        &self,
        handler: Arc<dyn Handler>,
        ctx: JobContext,
        params: Value,
    ) -> Result<Value, CoreError> {
        let task = tokio::spawn(async move { handler.call(ctx, params).await });
        match task.await {
            Ok(result) => result,
            Err(join_err) if join_err.is_panic() => {
                Err(CoreError::Handler("handler panicked".to_string()))
            }
            Err(_) => Err(CoreError::Cancellation),
        }
    }
}

/// Runs the job definition's command as a child process instead of inline
/// Rust code. `params` must contain an `args` array of strings; they are
/// passed verbatim to `program`. Intended for definitions that wrap an
/// external script or binary where fault isolation matters more than
/// low dispatch latency.
///
/// Cancellation here is best-effort: the workspace stack has no signal crate
/// for a graceful SIGTERM, so a cancelled child is given `grace` to exit on
/// its own (in case it's already draining) and then killed outright.
pub struct ChildProcessUnit {
    program: String,
    grace: Duration,
}

impl ChildProcessUnit {
    pub fn new(program: impl Into<String>, grace: Duration) -> Self {
        Self {
            program: program.into(),
            grace,
        }
    }
}

#[async_trait]
impl ExecutionUnit for ChildProcessUnit {
    async fn run(
        &self,
        _handler: Arc<dyn Handler>,
        ctx: JobContext,
        params: Value,
    ) -> Result<Value, CoreError> {
        let args: Vec<String> = params
            .get("args")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let mut child = Command::new(&self.program)
            .args(&args)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CoreError::Handler(format!("failed to spawn child process: {e}")))?;

        let cancel = ctx.cancel.clone();
        tokio::select! {
            status = child.wait() => {
                let status = status.map_err(|e| CoreError::Handler(e.to_string()))?;
                if status.success() {
                    Ok(Value::Null)
                } else {
                    Err(CoreError::Handler(format!(
                        "child process exited with status {status}"
                    )))
                }
            }
            _ = cancel.cancelled() => {
                tokio::select! {
                    _ = child.wait() => {}
                    _ = tokio::time::sleep(self.grace) => {
                        let _ = child.kill().await;
                    }
                }
                Err(CoreError::Cancellation)
            }
        }
    }
}
