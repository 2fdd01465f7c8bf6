//! Job registry for deserializing and executing jobs.
//!
//! The registry maps job type strings (e.g., "sync_chapters") to handlers
//! that reconstruct the typed command from JSON and run the domain logic.
//! The runner claims jobs from the database and dispatches through here
//! without knowing any concrete command type.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde::de::DeserializeOwned;
use uuid::Uuid;

use super::queue::{ClaimedJob, CommandMeta};
use crate::kernel::ServerDeps;

/// Execution context a handler receives alongside its payload.
///
/// Carries the claim's fence token so transactional writes can verify the
/// lease is still theirs immediately before commit.
#[derive(Debug, Clone, Copy)]
pub struct JobContext {
    pub job_id: Uuid,
    pub fence: i64,
    pub attempt: i32,
}

impl JobContext {
    /// Context for code paths that run outside the queue (tests, one-off
    /// CLI invocations). The fence of an unqueued run never expires.
    pub fn detached() -> Self {
        Self {
            job_id: Uuid::nil(),
            fence: 0,
            attempt: 1,
        }
    }
}

/// Type alias for the async handler function.
///
/// Handlers take the deserialized payload, the job context, and ServerDeps.
type BoxedHandler = Box<
    dyn Fn(
            serde_json::Value,
            JobContext,
            Arc<ServerDeps>,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send>>
        + Send
        + Sync,
>;

struct JobRegistration {
    handler: BoxedHandler,
}

/// Registry that maps job type strings to handlers.
///
/// Each domain registers its job types at startup.
#[derive(Default)]
pub struct JobRegistry {
    registrations: HashMap<&'static str, JobRegistration>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            registrations: HashMap::new(),
        }
    }

    /// Register a job type with its handler.
    pub fn register<J, F, Fut>(&mut self, job_type: &'static str, handler: F)
    where
        J: CommandMeta + DeserializeOwned + Send + Sync + 'static,
        F: Fn(J, JobContext, Arc<ServerDeps>) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let boxed_handler: BoxedHandler = Box::new(move |value, ctx, deps| {
            let handler = handler.clone();
            Box::pin(async move {
                let job: J = serde_json::from_value(value)
                    .map_err(|e| anyhow!("failed to deserialize {}: {}", job_type, e))?;
                handler(job, ctx, deps).await
            })
        });

        self.registrations.insert(
            job_type,
            JobRegistration {
                handler: boxed_handler,
            },
        );
    }

    /// Execute a claimed job using its registered handler.
    ///
    /// Returns an error if the job type is unknown, the payload does not
    /// deserialize, or the handler fails.
    pub async fn execute(&self, job: &ClaimedJob, deps: Arc<ServerDeps>) -> Result<()> {
        let job_type = job.job_type();
        let registration = self
            .registrations
            .get(job_type)
            .ok_or_else(|| anyhow!("unknown job type: {}", job_type))?;

        let args = job
            .job
            .args
            .clone()
            .ok_or_else(|| anyhow!("job {} has no args", job.id))?;

        let ctx = JobContext {
            job_id: job.id,
            fence: job.job.fence,
            attempt: job.job.attempt,
        };

        (registration.handler)(args, ctx, deps).await
    }

    pub fn is_registered(&self, job_type: &str) -> bool {
        self.registrations.contains_key(job_type)
    }

    pub fn registered_types(&self) -> Vec<&'static str> {
        self.registrations.keys().copied().collect()
    }
}

/// Thread-safe registry wrapped in Arc.
pub type SharedJobRegistry = Arc<JobRegistry>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct TestJob {
        pub id: Uuid,
    }

    impl CommandMeta for TestJob {
        fn command_type(&self) -> &'static str {
            "test_job"
        }
    }

    #[test]
    fn register_and_check() {
        let mut registry = JobRegistry::new();
        registry.register::<TestJob, _, _>("test_job", |_job, _ctx, _deps| async move { Ok(()) });

        assert!(registry.is_registered("test_job"));
        assert!(!registry.is_registered("unknown_job"));
    }

    #[test]
    fn registered_types_lists_all() {
        let mut registry = JobRegistry::new();
        registry.register::<TestJob, _, _>("test_job", |_job, _ctx, _deps| async move { Ok(()) });

        let types = registry.registered_types();
        assert!(types.contains(&"test_job"));
    }

    #[test]
    fn detached_context_has_nil_job() {
        let ctx = JobContext::detached();
        assert!(ctx.job_id.is_nil());
        assert_eq!(ctx.attempt, 1);
    }
}
