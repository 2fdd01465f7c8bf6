//! Job infrastructure for background command execution.
//!
//! - [`PostgresJobQueue`] - database-backed durable queue with
//!   idempotency-key dedup, lease + fence ownership, and dead-lettering
//! - [`JobRegistry`] - maps job type strings to typed handlers
//! - [`JobRunner`] - long-running service that claims and executes jobs
//!   under global / per-type / per-source concurrency caps
//! - [`Job`] - job model with CRUD operations
//!
//! # Architecture
//!
//! ```text
//! Scheduler / domain code builds a command, JobSpec::for_command(&cmd)
//!     │
//!     └─► JobQueue.enqueue()  (idempotency key dedup, DB index backstop)
//!
//! JobRunner
//!     │
//!     ├─► Poll DB (claim jobs, FOR UPDATE SKIP LOCKED, fence bump)
//!     ├─► Execute via JobRegistry (deserialize + call domain handler)
//!     └─► Mark succeeded/failed (queue schedules retries / dead-letters)
//! ```
//!
//! Business logic stays in domains; this module only provides the
//! infrastructure.

mod job;
mod queue;
mod registry;
mod runner;
pub mod testing;

pub use job::{retry_delay, ErrorKind, Job, JobPriority, JobStatus};
pub use queue::{
    ClaimedJob, CommandMeta, EnqueueResult, JobQueue, JobSpec, PostgresJobQueue,
};
pub use registry::{JobContext, JobRegistry, SharedJobRegistry};
pub use runner::{JobRunner, JobRunnerConfig};
