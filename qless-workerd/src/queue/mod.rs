// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

//! The queue as seen by a worker.
//!
//! The supervisor never talks to the queue; only worker units do, through
//! `QueueClient`. `SpoolClient` keeps the queue in a shared directory so a
//! pool can run without a remote engine.

use std::collections::BTreeMap;

use crate::error::QueueError;

pub mod job;
pub mod spool;

pub use job::{Failure, Job, JobState, NewJob, QueueCounts, WorkerCounts};
pub use spool::SpoolClient;

pub trait QueueClient: Send {
    /// Enqueue a job (or move it, if the jid exists) and return its jid.
    fn put(&self, queue: &str, job: NewJob) -> Result<String, QueueError>;

    /// Claim the next job of `queue` for `worker`.
    fn pop(&self, queue: &str, worker: &str) -> Result<Option<Job>, QueueError>;

    /// The next `count` jobs of `queue`, without claiming them.
    fn peek(&self, queue: &str, count: usize) -> Result<Vec<Job>, QueueError>;

    fn get(&self, jid: &str) -> Result<Option<Job>, QueueError>;

    /// Renew `worker`'s claim on a running job. Also used to take over a job
    /// from a worker that died, when resuming.
    fn heartbeat(&self, job: &Job, worker: &str) -> Result<Job, QueueError>;

    fn complete(&self, job: &Job, worker: &str) -> Result<(), QueueError>;

    /// Move a running job into the failure `group`.
    fn fail(&self, job: &Job, worker: &str, group: &str, message: &str) -> Result<(), QueueError>;

    /// Put a running job back into its queue while retries remain, otherwise
    /// fail it into `group`. Returns the retries left.
    fn retry(&self, job: &Job, worker: &str, group: &str, message: &str) -> Result<u32, QueueError>;

    /// Move up to `count` jobs of a failure group back into `queue`.
    fn unfail(&self, group: &str, queue: &str, count: usize) -> Result<usize, QueueError>;

    fn length(&self, queue: &str) -> Result<usize, QueueError>;

    fn queue_counts(&self) -> Result<Vec<QueueCounts>, QueueError>;

    fn worker_counts(&self) -> Result<Vec<WorkerCounts>, QueueError>;

    /// Jids of the running jobs held by `worker`.
    fn worker_jobs(&self, worker: &str) -> Result<Vec<String>, QueueError>;

    fn track(&self, jid: &str) -> Result<(), QueueError>;

    fn untrack(&self, jid: &str) -> Result<(), QueueError>;

    fn tracked(&self) -> Result<Vec<Job>, QueueError>;

    fn tag(&self, jid: &str, tags: &[String]) -> Result<Vec<String>, QueueError>;

    fn untag(&self, jid: &str, tags: &[String]) -> Result<Vec<String>, QueueError>;

    fn tagged(&self, tag: &str) -> Result<Vec<String>, QueueError>;

    /// Failure groups and how many jobs each holds.
    fn failed_groups(&self) -> Result<BTreeMap<String, usize>, QueueError>;
}
