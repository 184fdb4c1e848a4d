use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::jobs::handler::{HandlerError, HandlerResult, JobContext, JobHandler, JobTask};

/// Explicit mapping from handler type to implementation, built at startup
#[derive(Default, Clone)]
pub struct JobHandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl JobHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a dynamic handler, replacing any previous one of the same type
    pub fn register_handler(&mut self, handler: Arc<dyn JobHandler>) -> &mut Self {
        let handler_type = handler.handler_type().to_string();
        if self.handlers.insert(handler_type.clone(), handler).is_some() {
            tracing::warn!(handler_type = %handler_type, "Replaced existing job handler registration");
        }
        self
    }

    /// Register a typed task whose configuration is deserialized from JSON
    pub fn register<T>(&mut self) -> &mut Self
    where
        T: JobTask + DeserializeOwned + 'static,
    {
        self.register_handler(Arc::new(TaskHandler::<T>::new()))
    }

    pub fn lookup(&self, handler_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(handler_type).cloned()
    }

    pub fn contains(&self, handler_type: &str) -> bool {
        self.handlers.contains_key(handler_type)
    }

    pub fn handler_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }
}

impl std::fmt::Debug for JobHandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandlerRegistry")
            .field("handler_types", &self.handler_types())
            .finish()
    }
}

/// Adapts a [`JobTask`] to the dynamic [`JobHandler`] contract
struct TaskHandler<T> {
    _task: PhantomData<fn() -> T>,
}

impl<T> TaskHandler<T> {
    fn new() -> Self {
        Self { _task: PhantomData }
    }
}

#[async_trait]
impl<T> JobHandler for TaskHandler<T>
where
    T: JobTask + DeserializeOwned + 'static,
{
    fn handler_type(&self) -> &str {
        T::task_type()
    }

    async fn execute(&self, ctx: JobContext) -> HandlerResult {
        let raw = ctx.configuration().unwrap_or("{}");
        let task: T = serde_json::from_str(raw).map_err(|e| {
            HandlerError::configuration(format!("{} configuration: {}", T::task_type(), e))
        })?;
        if let Some(description) = task.description() {
            tracing::debug!(description = %description, "Executing job task");
        }
        task.execute(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::jobs::handler::HandlerOutcome;
    use crate::jobs::types::{JobState, NewJob};
    use crate::repositories::MemoryJobRepository;
    use jiff::Timestamp;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    static DESCRIBED: AtomicUsize = AtomicUsize::new(0);

    #[derive(Debug, Deserialize)]
    struct Described {
        target: String,
    }

    #[async_trait]
    impl JobTask for Described {
        fn task_type() -> &'static str {
            "described"
        }

        async fn execute(&self, _ctx: JobContext) -> HandlerResult {
            Ok(HandlerOutcome::done())
        }

        fn description(&self) -> Option<String> {
            DESCRIBED.fetch_add(1, Ordering::SeqCst);
            Some(format!("Notify {}", self.target))
        }
    }

    #[derive(Debug, Deserialize)]
    struct Echo {
        #[allow(dead_code)]
        message: String,
    }

    #[async_trait]
    impl JobTask for Echo {
        fn task_type() -> &'static str {
            "echo"
        }

        async fn execute(&self, _ctx: JobContext) -> HandlerResult {
            Ok(HandlerOutcome::done())
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = JobHandlerRegistry::new();
        registry.register::<Echo>();

        assert!(registry.contains("echo"));
        assert!(registry.lookup("missing").is_none());
        assert_eq!(registry.handler_types(), vec!["echo".to_string()]);
        assert_eq!(registry.lookup("echo").unwrap().handler_type(), "echo");
    }

    #[tokio::test]
    async fn test_task_description_is_read_on_execution() {
        let mut registry = JobHandlerRegistry::new();
        registry.register::<Described>();
        let clock = ManualClock::new(Timestamp::from_second(1_700_000_000).unwrap());
        let job = NewJob::new("described")
            .with_configuration(r#"{"target": "billing"}"#)
            .into_job("d1".to_string(), JobState::Ready, 3, clock.now());
        let ctx = JobContext {
            job,
            lock_owner: "node-a".to_string(),
            clock: Arc::new(clock),
            repository: Arc::new(MemoryJobRepository::new()),
            cancellation_token: CancellationToken::new(),
        };

        let before = DESCRIBED.load(Ordering::SeqCst);
        registry.lookup("described").unwrap().execute(ctx).await.unwrap();
        assert_eq!(DESCRIBED.load(Ordering::SeqCst), before + 1);
    }
}
