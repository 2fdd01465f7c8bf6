//! End-to-end behavior of the queue + runner against the in-memory queue:
//! idempotent enqueue collapses to one execution, failures dead-letter with
//! history, and a failing source opens its circuit breaker.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use tracker_core::kernel::jobs::testing::InMemoryJobQueue;
use tracker_core::kernel::jobs::{
    CommandMeta, JobPriority, JobRegistry, JobRunner, JobRunnerConfig, JobSpec, JobStatus, JobQueue,
};
use tracker_core::kernel::{
    BreakerRegistry, BreakerState, ServerDeps, StaticSourceClient, SyncSettings,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProbeJob {
    target: Uuid,
    succeed: bool,
}

impl CommandMeta for ProbeJob {
    fn command_type(&self) -> &'static str {
        "probe"
    }

    fn idempotency_key(&self) -> Option<String> {
        Some(format!("probe:{}", self.target))
    }

    fn source_name(&self) -> Option<String> {
        Some("mangahost".to_string())
    }

    fn priority(&self) -> JobPriority {
        JobPriority::Normal
    }

    fn max_retries(&self) -> i32 {
        1
    }
}

/// ServerDeps whose pool is lazily connected and never used by the probe
/// handlers. Breaker threshold of 1 so a single failure opens it.
fn test_deps(queue: Arc<InMemoryJobQueue>) -> Arc<ServerDeps> {
    let pool = PgPoolOptions::new()
        .connect_lazy("postgres://localhost:1/never_connected")
        .expect("lazy pool");
    Arc::new(ServerDeps::new(
        pool,
        Arc::new(StaticSourceClient::new()),
        Arc::new(BreakerRegistry::new(1, chrono::Duration::seconds(300))),
        queue,
        SyncSettings::default(),
    ))
}

fn test_registry(executions: Arc<AtomicUsize>) -> JobRegistry {
    let mut registry = JobRegistry::new();
    registry.register::<ProbeJob, _, _>("probe", move |job, _ctx, _deps| {
        let executions = executions.clone();
        async move {
            executions.fetch_add(1, Ordering::SeqCst);
            if job.succeed {
                Ok(())
            } else {
                Err(anyhow::anyhow!("upstream connection reset"))
            }
        }
    });
    registry
}

fn runner_config() -> JobRunnerConfig {
    JobRunnerConfig {
        poll_interval: Duration::from_millis(20),
        heartbeat_interval: Duration::from_secs(5),
        drain_timeout: Duration::from_secs(2),
        ..JobRunnerConfig::with_worker_id("test-worker")
    }
}

async fn run_until_idle(
    queue: Arc<InMemoryJobQueue>,
    registry: JobRegistry,
    deps: Arc<ServerDeps>,
) {
    let shutdown = CancellationToken::new();
    let runner = JobRunner::with_config(queue, Arc::new(registry), deps, runner_config());
    let handle = tokio::spawn(runner.run(shutdown.clone()));
    tokio::time::sleep(Duration::from_millis(400)).await;
    shutdown.cancel();
    handle.await.expect("runner task").expect("runner result");
}

#[tokio::test]
async fn duplicate_enqueues_execute_exactly_once() {
    let queue = Arc::new(InMemoryJobQueue::new());
    let executions = Arc::new(AtomicUsize::new(0));
    let deps = test_deps(queue.clone());

    let job = ProbeJob {
        target: Uuid::new_v4(),
        succeed: true,
    };
    let first = queue.enqueue(JobSpec::for_command(&job).unwrap()).await.unwrap();
    let second = queue.enqueue(JobSpec::for_command(&job).unwrap()).await.unwrap();
    assert!(first.is_created());
    assert!(!second.is_created());

    run_until_idle(queue.clone(), test_registry(executions.clone()), deps).await;

    assert_eq!(executions.load(Ordering::SeqCst), 1);
    assert_eq!(
        queue.job(first.job_id()).unwrap().status,
        JobStatus::Succeeded
    );
}

#[tokio::test]
async fn completed_key_can_be_enqueued_and_executed_again() {
    let queue = Arc::new(InMemoryJobQueue::new());
    let executions = Arc::new(AtomicUsize::new(0));
    let deps = test_deps(queue.clone());

    let job = ProbeJob {
        target: Uuid::new_v4(),
        succeed: true,
    };
    queue.enqueue(JobSpec::for_command(&job).unwrap()).await.unwrap();
    run_until_idle(queue.clone(), test_registry(executions.clone()), deps.clone()).await;

    let again = queue.enqueue(JobSpec::for_command(&job).unwrap()).await.unwrap();
    assert!(again.is_created());
    run_until_idle(queue.clone(), test_registry(executions.clone()), deps).await;

    assert_eq!(executions.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn exhausted_job_dead_letters_and_opens_the_breaker() {
    let queue = Arc::new(InMemoryJobQueue::new());
    let executions = Arc::new(AtomicUsize::new(0));
    let deps = test_deps(queue.clone());

    let job = ProbeJob {
        target: Uuid::new_v4(),
        succeed: false,
    };
    let result = queue.enqueue(JobSpec::for_command(&job).unwrap()).await.unwrap();

    run_until_idle(queue.clone(), test_registry(executions.clone()), deps.clone()).await;

    // max_retries = 1: the single failed attempt exhausts the job.
    assert_eq!(executions.load(Ordering::SeqCst), 1);

    let dead = queue.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, result.job_id());
    assert!(dead[0].error_message.is_some());
    assert!(dead[0].dead_lettered_at.is_some());

    let history = queue.attempt_history(result.job_id());
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].attempt, 1);

    // The failing source's breaker tripped.
    assert_eq!(
        deps.breakers.snapshot().get("mangahost"),
        Some(&BreakerState::Open)
    );
}

#[tokio::test]
async fn open_breaker_holds_jobs_back_instead_of_failing_them() {
    let queue = Arc::new(InMemoryJobQueue::new());
    let executions = Arc::new(AtomicUsize::new(0));
    let deps = test_deps(queue.clone());

    // Trip the breaker before the runner ever sees the job.
    deps.breakers.record_failure("mangahost");
    assert_eq!(
        deps.breakers.snapshot().get("mangahost"),
        Some(&BreakerState::Open)
    );

    let job = ProbeJob {
        target: Uuid::new_v4(),
        succeed: true,
    };
    let result = queue.enqueue(JobSpec::for_command(&job).unwrap()).await.unwrap();

    run_until_idle(queue.clone(), test_registry(executions.clone()), deps).await;

    // Never executed, not failed: parked as pending for a later claim.
    assert_eq!(executions.load(Ordering::SeqCst), 0);
    let parked = queue.job(result.job_id()).unwrap();
    assert_eq!(parked.status, JobStatus::Pending);
    assert_eq!(parked.attempt, 1);
    assert!(parked.next_run_at.is_some());
}
