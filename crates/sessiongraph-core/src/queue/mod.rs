//! Daemon job queue
//!
//! Jobs move `pending → running → completed | failed`. A running job is held
//! by a lease (`worker_id` plus `locked_until`); an expired lease makes the
//! job claimable again, so a crashed worker never strands its job.

mod job;
mod store;

pub use job::{Job, JobStatus, JobType, NewJob, PRIORITY_FORK, PRIORITY_USER};
pub use store::{Enqueued, JobQueue, QueueConfig, QueueStats};
