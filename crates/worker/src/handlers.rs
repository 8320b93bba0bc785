use serde::Deserialize;
use serde_json::{json, Value};
use taskforge_core::{CoreError, DefinitionRegistry, JobContext};
use tokio::time::{sleep, Duration};

#[derive(Deserialize)]
struct EmailSendPayload {
    user_id: i64,
    template: Option<String>,
}

fn parse_payload<T: for<'de> Deserialize<'de>>(params: &Value) -> Result<T, CoreError> {
    serde_json::from_value(params.clone()).map_err(|e| CoreError::Handler(e.to_string()))
}

/// Demo handlers wired up so a fresh checkout has something to submit jobs
/// against. Real deployments register their own definitions here.
pub fn build_registry() -> DefinitionRegistry {
    let mut registry = DefinitionRegistry::new();

    registry.register("demo.ok", 1, |_ctx: JobContext, _params: Value| async move {
        sleep(Duration::from_millis(300)).await;
        Ok(json!({ "status": "ok" }))
    });

    registry.register("demo.fail", 1, |_ctx: JobContext, _params: Value| async move {
        sleep(Duration::from_millis(300)).await;
        Err(CoreError::Handler("simulated failure".to_string()))
    });

    registry.register("email.send", 1, |ctx: JobContext, params: Value| async move {
        let payload: EmailSendPayload = parse_payload(&params)?;
        if ctx.is_cancelled() {
            return Err(CoreError::Cancellation);
        }
        Ok(json!({ "sent_to_user": payload.user_id, "template": payload.template }))
    });

    registry
}
