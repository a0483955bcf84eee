// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

//! A queue kept in a directory shared by all workers of a host.
//!
//! ```text
//! <root>/queues/<queue>/pending/<jid>.json
//! <root>/running/<jid>.json
//! <root>/complete/<jid>.json
//! <root>/failed/<group>/<jid>.json
//! ```
//!
//! Mutations hold an exclusive flock on `<root>/.lock`. Records are
//! rewritten through a temp file and a rename, and jobs change state by
//! being renamed into another directory.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use log::debug;
use nix::fcntl::{Flock, FlockArg};

use super::job::{Failure, Job, JobState, NewJob, QueueCounts, WorkerCounts};
use super::QueueClient;
use crate::error::QueueError;

static JID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> QueueError + '_ {
    move |source| QueueError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn now_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

fn generate_jid() -> String {
    let count = JID_COUNTER.fetch_add(1, Ordering::SeqCst);
    format!(
        "{:x}{:06x}{:04x}",
        now_nanos(),
        std::process::id(),
        count & 0xffff
    )
}

fn validate_name(name: &str) -> Result<(), QueueError> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\0']) {
        return Err(QueueError::InvalidName(name.to_string()));
    }
    Ok(())
}

fn queue_order(a: &Job, b: &Job) -> std::cmp::Ordering {
    (a.priority, a.created, &a.jid).cmp(&(b.priority, b.created, &b.jid))
}

#[derive(Debug, Clone)]
pub struct SpoolClient {
    root: PathBuf,
}

impl SpoolClient {
    /// Open (and if needed create) a spool rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, QueueError> {
        let client = Self { root: root.into() };
        for dir in ["queues", "running", "complete", "failed", "tmp"] {
            let path = client.root.join(dir);
            fs::create_dir_all(&path).map_err(io_error(&path))?;
        }
        Ok(client)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn pending_dir(&self, queue: &str) -> PathBuf {
        self.root.join("queues").join(queue).join("pending")
    }

    fn running_dir(&self) -> PathBuf {
        self.root.join("running")
    }

    fn complete_dir(&self) -> PathBuf {
        self.root.join("complete")
    }

    fn failed_dir(&self, group: &str) -> PathBuf {
        self.root.join("failed").join(group)
    }

    fn lock(&self) -> Result<Flock<File>, QueueError> {
        let path = self.root.join(".lock");
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(io_error(&path))?;
        Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| QueueError::Io {
            path,
            source: errno.into(),
        })
    }

    fn read_job(path: &Path) -> Result<Job, QueueError> {
        let raw = fs::read(path).map_err(io_error(path))?;
        serde_json::from_slice(&raw).map_err(|source| QueueError::Decode {
            path: path.to_path_buf(),
            source,
        })
    }

    fn write_job(&self, path: &Path, job: &Job) -> Result<(), QueueError> {
        let tmp = self.root.join("tmp").join(format!(
            "{}.{}.{}.tmp",
            job.jid,
            std::process::id(),
            JID_COUNTER.fetch_add(1, Ordering::SeqCst)
        ));
        let raw = serde_json::to_vec_pretty(job).map_err(|source| QueueError::Decode {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(&tmp, raw).map_err(io_error(&tmp))?;
        fs::rename(&tmp, path).map_err(io_error(path))
    }

    /// Rewrite the record at `from` and rename it into `to_dir`.
    fn relocate(&self, from: &Path, to_dir: &Path, job: &Job) -> Result<(), QueueError> {
        fs::create_dir_all(to_dir).map_err(io_error(to_dir))?;
        self.write_job(from, job)?;
        let to = to_dir.join(format!("{}.json", job.jid));
        fs::rename(from, &to).map_err(io_error(&to))
    }

    fn list_jobs(dir: &Path) -> Result<Vec<(PathBuf, Job)>, QueueError> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(dir)(e)),
        };
        let mut jobs = Vec::new();
        for entry in entries {
            let path = entry.map_err(io_error(dir))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            jobs.push((path.clone(), Self::read_job(&path)?));
        }
        Ok(jobs)
    }

    fn list_subdirs(dir: &Path) -> Result<Vec<String>, QueueError> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(dir)(e)),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(io_error(dir))?;
            if entry.file_type().map_err(io_error(dir))?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn all_jobs(&self) -> Result<Vec<(PathBuf, Job)>, QueueError> {
        let mut jobs = Vec::new();
        for queue in Self::list_subdirs(&self.root.join("queues"))? {
            jobs.extend(Self::list_jobs(&self.pending_dir(&queue))?);
        }
        jobs.extend(Self::list_jobs(&self.running_dir())?);
        jobs.extend(Self::list_jobs(&self.complete_dir())?);
        for group in Self::list_subdirs(&self.root.join("failed"))? {
            jobs.extend(Self::list_jobs(&self.failed_dir(&group))?);
        }
        Ok(jobs)
    }

    fn locate(&self, jid: &str) -> Result<Option<(PathBuf, Job)>, QueueError> {
        validate_name(jid)?;
        let file = format!("{}.json", jid);
        let mut candidates = vec![self.running_dir().join(&file), self.complete_dir().join(&file)];
        for queue in Self::list_subdirs(&self.root.join("queues"))? {
            candidates.push(self.pending_dir(&queue).join(&file));
        }
        for group in Self::list_subdirs(&self.root.join("failed"))? {
            candidates.push(self.failed_dir(&group).join(&file));
        }
        for path in candidates {
            if path.exists() {
                let job = Self::read_job(&path)?;
                return Ok(Some((path, job)));
            }
        }
        Ok(None)
    }

    /// The running record of `job`, if `worker` holds it.
    fn held(&self, job: &Job, worker: &str) -> Result<(PathBuf, Job), QueueError> {
        let path = self.running_dir().join(format!("{}.json", job.jid));
        let lost = || QueueError::LostLock {
            jid: job.jid.clone(),
            worker: worker.to_string(),
        };
        if !path.exists() {
            return Err(lost());
        }
        let current = Self::read_job(&path)?;
        if current.worker.as_deref() != Some(worker) {
            return Err(lost());
        }
        Ok((path, current))
    }

    fn fail_locked(
        &self,
        path: &Path,
        mut job: Job,
        worker: &str,
        group: &str,
        message: &str,
    ) -> Result<(), QueueError> {
        validate_name(group)?;
        job.state = JobState::Failed;
        job.worker = None;
        job.failure = Some(Failure {
            group: group.to_string(),
            message: message.to_string(),
            worker: Some(worker.to_string()),
        });
        self.relocate(path, &self.failed_dir(group), &job)
    }

    fn update<F>(&self, jid: &str, change: F) -> Result<Job, QueueError>
    where
        F: FnOnce(&mut Job),
    {
        let _lock = self.lock()?;
        let (path, mut job) = self
            .locate(jid)?
            .ok_or_else(|| QueueError::UnknownJob(jid.to_string()))?;
        change(&mut job);
        self.write_job(&path, &job)?;
        Ok(job)
    }
}

impl QueueClient for SpoolClient {
    fn put(&self, queue: &str, new_job: NewJob) -> Result<String, QueueError> {
        validate_name(queue)?;
        let jid = match new_job.jid {
            Some(jid) => jid,
            None => generate_jid(),
        };
        validate_name(&jid)?;

        let _lock = self.lock()?;
        // putting an existing jid moves the job
        let previous = self.locate(&jid)?;
        let job = Job {
            jid: jid.clone(),
            klass: new_job.klass,
            queue: queue.to_string(),
            data: new_job.data,
            priority: new_job.priority,
            tags: new_job.tags,
            retries: new_job.retries,
            remaining: new_job.retries,
            state: JobState::Waiting,
            worker: None,
            tracked: previous.as_ref().is_some_and(|(_, job)| job.tracked),
            failure: None,
            created: now_nanos(),
        };
        let dir = self.pending_dir(queue);
        fs::create_dir_all(&dir).map_err(io_error(&dir))?;
        match previous {
            Some((path, _)) => self.relocate(&path, &dir, &job)?,
            None => self.write_job(&dir.join(format!("{}.json", jid)), &job)?,
        }
        debug!("put {} into {}", jid, queue);
        Ok(jid)
    }

    fn pop(&self, queue: &str, worker: &str) -> Result<Option<Job>, QueueError> {
        validate_name(queue)?;
        let _lock = self.lock()?;
        let mut pending = Self::list_jobs(&self.pending_dir(queue))?;
        pending.sort_by(|(_, a), (_, b)| queue_order(a, b));
        let Some((path, mut job)) = pending.into_iter().next() else {
            return Ok(None);
        };
        job.state = JobState::Running;
        job.worker = Some(worker.to_string());
        self.relocate(&path, &self.running_dir(), &job)?;
        Ok(Some(job))
    }

    fn peek(&self, queue: &str, count: usize) -> Result<Vec<Job>, QueueError> {
        validate_name(queue)?;
        let mut pending: Vec<Job> = Self::list_jobs(&self.pending_dir(queue))?
            .into_iter()
            .map(|(_, job)| job)
            .collect();
        pending.sort_by(queue_order);
        pending.truncate(count);
        Ok(pending)
    }

    fn get(&self, jid: &str) -> Result<Option<Job>, QueueError> {
        Ok(self.locate(jid)?.map(|(_, job)| job))
    }

    fn heartbeat(&self, job: &Job, worker: &str) -> Result<Job, QueueError> {
        let _lock = self.lock()?;
        let path = self.running_dir().join(format!("{}.json", job.jid));
        if !path.exists() {
            return Err(QueueError::LostLock {
                jid: job.jid.clone(),
                worker: worker.to_string(),
            });
        }
        let mut current = Self::read_job(&path)?;
        current.worker = Some(worker.to_string());
        self.write_job(&path, &current)?;
        Ok(current)
    }

    fn complete(&self, job: &Job, worker: &str) -> Result<(), QueueError> {
        let _lock = self.lock()?;
        let (path, mut current) = self.held(job, worker)?;
        current.state = JobState::Complete;
        current.worker = None;
        self.relocate(&path, &self.complete_dir(), &current)
    }

    fn fail(&self, job: &Job, worker: &str, group: &str, message: &str) -> Result<(), QueueError> {
        let _lock = self.lock()?;
        let (path, current) = self.held(job, worker)?;
        self.fail_locked(&path, current, worker, group, message)
    }

    fn retry(&self, job: &Job, worker: &str, group: &str, message: &str) -> Result<u32, QueueError> {
        let _lock = self.lock()?;
        let (path, mut current) = self.held(job, worker)?;
        if current.remaining == 0 {
            self.fail_locked(&path, current, worker, group, message)?;
            return Ok(0);
        }
        current.remaining -= 1;
        current.state = JobState::Waiting;
        current.worker = None;
        current.failure = Some(Failure {
            group: group.to_string(),
            message: message.to_string(),
            worker: Some(worker.to_string()),
        });
        let remaining = current.remaining;
        let dir = self.pending_dir(&current.queue);
        self.relocate(&path, &dir, &current)?;
        Ok(remaining)
    }

    fn unfail(&self, group: &str, queue: &str, count: usize) -> Result<usize, QueueError> {
        validate_name(group)?;
        validate_name(queue)?;
        let _lock = self.lock()?;
        let mut failed = Self::list_jobs(&self.failed_dir(group))?;
        failed.sort_by(|(_, a), (_, b)| (a.created, &a.jid).cmp(&(b.created, &b.jid)));
        let dir = self.pending_dir(queue);
        let mut moved = 0;
        for (path, mut job) in failed.into_iter().take(count) {
            job.state = JobState::Waiting;
            job.queue = queue.to_string();
            job.failure = None;
            job.remaining = job.retries;
            self.relocate(&path, &dir, &job)?;
            moved += 1;
        }
        Ok(moved)
    }

    fn length(&self, queue: &str) -> Result<usize, QueueError> {
        validate_name(queue)?;
        let waiting = Self::list_jobs(&self.pending_dir(queue))?.len();
        let running = Self::list_jobs(&self.running_dir())?
            .iter()
            .filter(|(_, job)| job.queue == queue)
            .count();
        Ok(waiting + running)
    }

    fn queue_counts(&self) -> Result<Vec<QueueCounts>, QueueError> {
        let running = Self::list_jobs(&self.running_dir())?;
        let mut counts = Vec::new();
        for name in Self::list_subdirs(&self.root.join("queues"))? {
            counts.push(QueueCounts {
                waiting: Self::list_jobs(&self.pending_dir(&name))?.len(),
                running: running.iter().filter(|(_, job)| job.queue == name).count(),
                name,
            });
        }
        Ok(counts)
    }

    fn worker_counts(&self) -> Result<Vec<WorkerCounts>, QueueError> {
        let mut per_worker: BTreeMap<String, usize> = BTreeMap::new();
        for (_, job) in Self::list_jobs(&self.running_dir())? {
            if let Some(worker) = job.worker {
                *per_worker.entry(worker).or_default() += 1;
            }
        }
        Ok(per_worker
            .into_iter()
            .map(|(name, jobs)| WorkerCounts { name, jobs })
            .collect())
    }

    fn worker_jobs(&self, worker: &str) -> Result<Vec<String>, QueueError> {
        let mut held: Vec<Job> = Self::list_jobs(&self.running_dir())?
            .into_iter()
            .map(|(_, job)| job)
            .filter(|job| job.worker.as_deref() == Some(worker))
            .collect();
        held.sort_by(queue_order);
        Ok(held.into_iter().map(|job| job.jid).collect())
    }

    fn track(&self, jid: &str) -> Result<(), QueueError> {
        self.update(jid, |job| job.tracked = true).map(|_| ())
    }

    fn untrack(&self, jid: &str) -> Result<(), QueueError> {
        self.update(jid, |job| job.tracked = false).map(|_| ())
    }

    fn tracked(&self) -> Result<Vec<Job>, QueueError> {
        let mut jobs: Vec<Job> = self
            .all_jobs()?
            .into_iter()
            .map(|(_, job)| job)
            .filter(|job| job.tracked)
            .collect();
        jobs.sort_by(|a, b| a.jid.cmp(&b.jid));
        Ok(jobs)
    }

    fn tag(&self, jid: &str, tags: &[String]) -> Result<Vec<String>, QueueError> {
        self.update(jid, |job| {
            for tag in tags {
                if !job.tags.contains(tag) {
                    job.tags.push(tag.clone());
                }
            }
        })
        .map(|job| job.tags)
    }

    fn untag(&self, jid: &str, tags: &[String]) -> Result<Vec<String>, QueueError> {
        self.update(jid, |job| job.tags.retain(|tag| !tags.contains(tag)))
            .map(|job| job.tags)
    }

    fn tagged(&self, tag: &str) -> Result<Vec<String>, QueueError> {
        let mut jids: Vec<String> = self
            .all_jobs()?
            .into_iter()
            .filter(|(_, job)| job.tags.iter().any(|t| t == tag))
            .map(|(_, job)| job.jid)
            .collect();
        jids.sort();
        Ok(jids)
    }

    fn failed_groups(&self) -> Result<BTreeMap<String, usize>, QueueError> {
        let mut groups = BTreeMap::new();
        for group in Self::list_subdirs(&self.root.join("failed"))? {
            let count = Self::list_jobs(&self.failed_dir(&group))?.len();
            if count > 0 {
                groups.insert(group, count);
            }
        }
        Ok(groups)
    }
}
