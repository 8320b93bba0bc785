use crate::error::CoreError;
use crate::store::PgStore;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Per-attempt context handed to a `Handler`. Carries the cancellation
/// signal so long-running handlers can check it between units of work
/// instead of relying solely on the executor killing the task, and a
/// handle back to the store so a handler can emit its own events
/// (spec §4.4 step 4: `EmitEvent` proxies `AppendEvent`).
#[derive(Clone)]
pub struct JobContext {
    pub job_id: uuid::Uuid,
    pub attempt: i32,
    pub cancel: crate::executor::AbortToken,
    pub store: PgStore,
}

impl JobContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_triggered()
    }

    pub async fn emit_event(&self, event_type: &str, payload: Option<Value>) -> Result<(), CoreError> {
        self.store.append_event(self.job_id, event_type, payload).await
    }
}

/// A unit of business logic registered against a `(key, version)` pair.
///
/// Handlers never see the store directly; they take params in and return a
/// result or an error. The executor decides what happens next. The `on_*`
/// hooks are optional lifecycle callbacks (spec §4.4 steps 1/6/7); most
/// handlers never override them.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, ctx: JobContext, params: Value) -> Result<Value, CoreError>;

    async fn on_start(&self, _ctx: &JobContext) {}
    async fn on_success(&self, _ctx: &JobContext, _result: &Value) {}
    async fn on_fail(&self, _ctx: &JobContext, _error: &CoreError) {}
    async fn on_end(&self, _ctx: &JobContext) {}
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(JobContext, Value) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Value, CoreError>> + Send + 'static,
{
    async fn call(&self, ctx: JobContext, params: Value) -> Result<Value, CoreError> {
        (self)(ctx, params).await
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
struct DefinitionRef {
    key: &'static str,
    version: i32,
}

/// Process-local mapping from `(key, version)` to handler implementation.
///
/// Registration is an in-process concern only (spec §4.8): the
/// `job_definitions` table tracks policy (attempts, timeout, concurrency),
/// this registry tracks code. A worker process that doesn't register a
/// handler for a definition simply never claims jobs of that type.
#[derive(Clone, Default)]
pub struct DefinitionRegistry {
    handlers: HashMap<DefinitionRef, Arc<dyn Handler>>,
}

impl DefinitionRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register<H>(&mut self, key: &'static str, version: i32, handler: H)
    where
        H: Handler + 'static,
    {
        self.handlers
            .insert(DefinitionRef { key, version }, Arc::new(handler));
    }

    pub fn lookup(&self, key: &str, version: i32) -> Option<Arc<dyn Handler>> {
        self.handlers
            .iter()
            .find(|(def_ref, _)| def_ref.key == key && def_ref.version == version)
            .map(|(_, handler)| handler.clone())
    }

    pub fn known_keys(&self) -> Vec<(&'static str, i32)> {
        self.handlers.keys().map(|d| (d.key, d.version)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lookup_distinguishes_by_version() {
        let mut registry = DefinitionRegistry::new();
        registry.register("report.generate", 1, |_ctx: JobContext, _p: Value| async move {
            Ok(serde_json::json!({ "version": 1 }))
        });
        registry.register("report.generate", 2, |_ctx: JobContext, _p: Value| async move {
            Ok(serde_json::json!({ "version": 2 }))
        });

        assert!(registry.lookup("report.generate", 1).is_some());
        assert!(registry.lookup("report.generate", 2).is_some());
        assert!(registry.lookup("report.generate", 3).is_none());
        assert!(registry.lookup("unknown.key", 1).is_none());
    }

    #[test]
    fn known_keys_reports_everything_registered() {
        let mut registry = DefinitionRegistry::new();
        registry.register("a", 1, |_ctx: JobContext, _p: Value| async move { Ok(Value::Null) });
        registry.register("b", 1, |_ctx: JobContext, _p: Value| async move { Ok(Value::Null) });

        let mut keys = registry.known_keys();
        keys.sort();
        assert_eq!(keys, vec![("a", 1), ("b", 1)]);
    }
}
