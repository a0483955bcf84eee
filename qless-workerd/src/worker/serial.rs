// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

//! The built-in worker: one job at a time, each handled by a shell command.
//!
//! Options:
//! - `job-command` (required): run with `sh -c` inside the sandbox. The job
//!   data arrives as JSON on stdin, jid, queue, klass and worker name in
//!   `QLESS_JID`, `QLESS_QUEUE`, `QLESS_KLASS` and `QLESS_WORKER`.
//! - `interval`: seconds to sleep when all queues are empty (default 5).
//! - `max-jobs`: stop after this many jobs.
//! - `exit-when-idle`: stop instead of sleeping when all queues are empty.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context};
use log::{debug, info, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::error::QueueError;
use crate::global_config::SandboxPolicy;
use crate::logging;
use crate::partition::WorkAssignment;
use crate::queue::{Job, JobState, QueueClient};
use crate::sandbox;
use crate::signals;
use crate::worker::{Worker, WorkerFactory, WorkerSpec};

pub const KIND: &str = "serial";

const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq)]
struct SerialOptions {
    job_command: String,
    interval: Duration,
    max_jobs: Option<usize>,
    exit_when_idle: bool,
}

impl SerialOptions {
    fn parse(options: &BTreeMap<String, String>) -> anyhow::Result<Self> {
        for key in options.keys() {
            if !["job-command", "interval", "max-jobs", "exit-when-idle"].contains(&key.as_str()) {
                bail!("unknown option {key:?} for the {KIND} worker");
            }
        }

        let job_command = options
            .get("job-command")
            .filter(|command| !command.trim().is_empty())
            .ok_or_else(|| anyhow!("the {KIND} worker needs a job-command"))?
            .clone();

        let interval = match options.get("interval") {
            Some(raw) => {
                let secs: f64 = raw
                    .parse()
                    .with_context(|| format!("interval {raw:?} is not a number"))?;
                Duration::try_from_secs_f64(secs)
                    .with_context(|| format!("interval {raw:?} is out of range"))?
            }
            None => DEFAULT_INTERVAL,
        };

        let max_jobs = options
            .get("max-jobs")
            .map(|raw| {
                raw.parse::<usize>()
                    .with_context(|| format!("max-jobs {raw:?} is not a count"))
            })
            .transpose()?;

        let exit_when_idle = match options.get("exit-when-idle").map(String::as_str) {
            None | Some("false") | Some("0") | Some("no") => false,
            Some("true") | Some("1") | Some("yes") => true,
            Some(other) => bail!("exit-when-idle {other:?} is not a boolean"),
        };

        Ok(Self {
            job_command,
            interval,
            max_jobs,
            exit_when_idle,
        })
    }
}

pub struct SerialFactory;

impl WorkerFactory for SerialFactory {
    fn validate(&self, options: &BTreeMap<String, String>) -> anyhow::Result<()> {
        SerialOptions::parse(options).map(|_| ())
    }

    fn create(
        &self,
        spec: &WorkerSpec,
        client: Box<dyn QueueClient>,
    ) -> anyhow::Result<Box<dyn Worker>> {
        Ok(Box::new(SerialWorker::new(spec, client)?))
    }
}

enum Outcome {
    Succeeded,
    Failed(String),
    /// The worker was asked to stop while the command was running.
    Interrupted,
}

pub struct SerialWorker {
    desc: String,
    name: String,
    queues: Vec<String>,
    sandbox: PathBuf,
    policy: SandboxPolicy,
    resume: Option<WorkAssignment>,
    options: SerialOptions,
    client: Box<dyn QueueClient>,
    processed: usize,
}

impl SerialWorker {
    pub fn new(spec: &WorkerSpec, client: Box<dyn QueueClient>) -> anyhow::Result<Self> {
        if spec.queues.is_empty() {
            bail!("the {KIND} worker needs at least one queue");
        }
        let name = spec.worker_name();
        Ok(Self {
            desc: format!("{KIND} worker {name}"),
            name,
            queues: spec.queues.clone(),
            sandbox: spec.sandbox.clone(),
            policy: spec.sandbox_policy,
            resume: spec.resume.clone(),
            options: SerialOptions::parse(&spec.options)?,
            client,
            processed: 0,
        })
    }

    /// Jobs handled so far, resumed ones included.
    pub fn processed(&self) -> usize {
        self.processed
    }

    fn should_stop(&self) -> bool {
        signals::stop_requested()
            || self
                .options
                .max_jobs
                .is_some_and(|max| self.processed >= max)
    }

    fn reload_logging_if_requested(&self) {
        if signals::take_reload_request() {
            if let Err(e) = logging::reconfigure() {
                warn!("{e:#}");
            }
        }
    }

    /// Take over the jobs a previous worker left running.
    fn resume_jobs(&mut self) -> anyhow::Result<()> {
        let Some(assignment) = self.resume.take() else {
            return Ok(());
        };
        info!("{}: resuming {} job(s)", self.name, assignment.len());
        for jid in assignment.jids() {
            if self.should_stop() {
                break;
            }
            match self.client.get(jid)? {
                Some(job) if job.state == JobState::Running => {
                    let job = self.client.heartbeat(&job, &self.name)?;
                    self.process(job)?;
                }
                _ => debug!("{jid} is no longer running, not resuming it"),
            }
        }
        Ok(())
    }

    fn next_job(&self) -> Result<Option<Job>, QueueError> {
        for queue in &self.queues {
            if let Some(job) = self.client.pop(queue, &self.name)? {
                return Ok(Some(job));
            }
        }
        Ok(None)
    }

    /// Sleep for the interval, waking early for a stop request.
    fn idle(&self) {
        let deadline = Instant::now() + self.options.interval;
        while !signals::stop_requested() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(POLL_INTERVAL));
        }
    }

    fn process(&mut self, job: Job) -> anyhow::Result<()> {
        info!("{}: processing {} from {}", self.name, job.jid, job.queue);
        match self.run_command(&job)? {
            Outcome::Succeeded => match self.client.complete(&job, &self.name) {
                Ok(()) => info!("{}: completed {}", self.name, job.jid),
                Err(e @ QueueError::LostLock { .. }) => warn!("{e}"),
                Err(e) => return Err(e.into()),
            },
            Outcome::Failed(message) => {
                let group = format!("{}-job-command-failed", job.queue);
                match self.client.retry(&job, &self.name, &group, &message) {
                    Ok(0) => warn!("{}: {} failed: {message}", self.name, job.jid),
                    Ok(left) => warn!("{}: {} failed, {left} retries left: {message}", self.name, job.jid),
                    Err(e @ QueueError::LostLock { .. }) => warn!("{e}"),
                    Err(e) => return Err(e.into()),
                }
            }
            Outcome::Interrupted => {
                info!("{}: stopped during {}, leaving it for resume", self.name, job.jid);
            }
        }
        self.processed += 1;

        if self.policy == SandboxPolicy::Purge {
            sandbox::purge(&self.sandbox)?;
        }
        Ok(())
    }

    fn spawn_command(&self, job: &Job) -> anyhow::Result<Child> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.options.job_command)
            .current_dir(&self.sandbox)
            .env("QLESS_JID", &job.jid)
            .env("QLESS_QUEUE", &job.queue)
            .env("QLESS_KLASS", &job.klass)
            .env("QLESS_WORKER", &self.name)
            .stdin(Stdio::piped())
            .spawn()
            .with_context(|| format!("could not start job command for {}", job.jid))?;

        if let Some(mut stdin) = child.stdin.take() {
            let data = serde_json::to_vec(&job.data)?;
            let jid = job.jid.clone();
            // written off the polling thread, so a command that never reads
            // its input cannot hold up a stop request
            thread::Builder::new()
                .name(format!("stdin-{jid}"))
                .spawn(move || match stdin.write_all(&data) {
                    // the command does not have to read its input
                    Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {}
                    Err(e) => warn!("could not pass data of {jid}: {e}"),
                    Ok(()) => {}
                })
                .with_context(|| format!("could not start stdin writer for {}", job.jid))?;
        }
        Ok(child)
    }

    fn run_command(&self, job: &Job) -> anyhow::Result<Outcome> {
        let mut child = self.spawn_command(job)?;
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(outcome(status));
            }
            if signals::stop_requested() {
                let pid = Pid::from_raw(child.id() as i32);
                if let Err(e) = kill(pid, Signal::SIGTERM) {
                    debug!("job command {pid} already gone: {e}");
                }
                child.wait()?;
                return Ok(Outcome::Interrupted);
            }
            self.reload_logging_if_requested();
            thread::sleep(POLL_INTERVAL);
        }
    }
}

fn outcome(status: ExitStatus) -> Outcome {
    if status.success() {
        Outcome::Succeeded
    } else {
        Outcome::Failed(format!("job command ended with {status}"))
    }
}

impl Worker for SerialWorker {
    fn desc(&self) -> &str {
        &self.desc
    }

    fn run(&mut self) -> anyhow::Result<()> {
        self.resume_jobs()?;
        while !self.should_stop() {
            self.reload_logging_if_requested();
            match self.next_job()? {
                Some(job) => self.process(job)?,
                None if self.options.exit_when_idle => {
                    info!("{}: queues are empty, stopping", self.name);
                    break;
                }
                None => self.idle(),
            }
        }
        info!("{}: stopping after {} job(s)", self.name, self.processed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use serial_test::serial;

    use super::*;
    use crate::queue::{NewJob, SpoolClient};
    use crate::worker::test_support;

    fn worker(spec: &WorkerSpec) -> (SpoolClient, SerialWorker) {
        std::fs::create_dir_all(&spec.sandbox).unwrap();
        let spool = SpoolClient::open(&spec.client.spool).unwrap();
        let client = Box::new(SpoolClient::open(&spec.client.spool).unwrap());
        (spool, SerialWorker::new(spec, client).unwrap())
    }

    #[test]
    fn options_need_a_command() {
        let factory = SerialFactory;
        assert!(factory.validate(&BTreeMap::new()).is_err());

        let mut options = BTreeMap::new();
        options.insert("job-command".to_string(), "true".to_string());
        assert!(factory.validate(&options).is_ok());

        options.insert("interval".to_string(), "soon".to_string());
        assert!(factory.validate(&options).is_err());
        options.insert("interval".to_string(), "0.5".to_string());
        options.insert("colour".to_string(), "red".to_string());
        assert!(factory.validate(&options).is_err());
    }

    #[test]
    fn options_are_parsed() {
        let options: BTreeMap<String, String> = [
            ("job-command", "true"),
            ("interval", "0.25"),
            ("max-jobs", "3"),
            ("exit-when-idle", "true"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let parsed = SerialOptions::parse(&options).unwrap();
        assert_eq!(parsed.interval, Duration::from_millis(250));
        assert_eq!(parsed.max_jobs, Some(3));
        assert!(parsed.exit_when_idle);
    }

    #[test]
    #[serial]
    fn successful_commands_complete_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let spec = test_support::spec(
            dir.path(),
            &[("job-command", "true"), ("exit-when-idle", "true")],
        );
        let (spool, mut worker) = worker(&spec);
        let a = spool.put("q", NewJob::new("a", json!({}))).unwrap();
        let b = spool.put("q", NewJob::new("b", json!({}))).unwrap();

        worker.run().unwrap();
        assert_eq!(worker.processed(), 2);
        for jid in [a, b] {
            assert_eq!(spool.get(&jid).unwrap().unwrap().state, JobState::Complete);
        }
    }

    #[test]
    #[serial]
    fn failing_command_fails_the_job() {
        let dir = tempfile::tempdir().unwrap();
        let spec = test_support::spec(
            dir.path(),
            &[("job-command", "exit 3"), ("exit-when-idle", "true")],
        );
        let (spool, mut worker) = worker(&spec);
        let jid = spool
            .put("q", NewJob::new("a", json!({})).retries(0))
            .unwrap();

        worker.run().unwrap();
        let job = spool.get(&jid).unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.failure.unwrap().group, "q-job-command-failed");
    }

    #[test]
    #[serial]
    fn command_sees_data_and_environment() {
        let dir = tempfile::tempdir().unwrap();
        let mut spec = test_support::spec(
            dir.path(),
            &[
                ("job-command", r#"cat > "$QLESS_JID.json"; echo "$QLESS_QUEUE $QLESS_KLASS" > env.txt"#),
                ("exit-when-idle", "true"),
            ],
        );
        spec.sandbox_policy = SandboxPolicy::Inherit;
        let (spool, mut worker) = worker(&spec);
        let jid = spool
            .put("q", NewJob::new("Resize", json!({"width": 640})).jid("img-1"))
            .unwrap();

        worker.run().unwrap();
        let data = std::fs::read_to_string(spec.sandbox.join(format!("{jid}.json"))).unwrap();
        assert_eq!(serde_json::from_str::<serde_json::Value>(&data).unwrap(), json!({"width": 640}));
        let env = std::fs::read_to_string(spec.sandbox.join("env.txt")).unwrap();
        assert_eq!(env.trim(), "q Resize");
    }

    #[test]
    #[serial]
    fn purge_policy_cleans_up_after_each_job() {
        let dir = tempfile::tempdir().unwrap();
        let spec = test_support::spec(
            dir.path(),
            &[("job-command", "touch leftover"), ("exit-when-idle", "true")],
        );
        let (spool, mut worker) = worker(&spec);
        spool.put("q", NewJob::new("a", json!({}))).unwrap();

        worker.run().unwrap();
        assert!(spec.sandbox.is_dir());
        assert!(!spec.sandbox.join("leftover").exists());
    }

    #[test]
    #[serial]
    fn max_jobs_limits_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let spec = test_support::spec(dir.path(), &[("job-command", "true"), ("max-jobs", "1")]);
        let (spool, mut worker) = worker(&spec);
        for klass in ["a", "b", "c"] {
            spool.put("q", NewJob::new(klass, json!({}))).unwrap();
        }

        worker.run().unwrap();
        assert_eq!(worker.processed(), 1);
        assert_eq!(spool.length("q").unwrap(), 2);
    }

    #[test]
    #[serial]
    fn resumed_jobs_are_taken_over_first() {
        let dir = tempfile::tempdir().unwrap();
        let mut spec = test_support::spec(
            dir.path(),
            &[("job-command", "true"), ("max-jobs", "1")],
        );
        let spool = SpoolClient::open(&spec.client.spool).unwrap();
        let orphan = spool.put("q", NewJob::new("a", json!({}))).unwrap();
        spool.put("q", NewJob::new("b", json!({}))).unwrap();
        // claimed by a worker that died since
        spool.pop("q", "test-host-1").unwrap().unwrap();
        spec.resume = Some(WorkAssignment::new(vec![orphan.clone()]));

        let (_, mut worker) = worker(&spec);
        worker.run().unwrap();
        assert_eq!(spool.get(&orphan).unwrap().unwrap().state, JobState::Complete);
        assert_eq!(spool.length("q").unwrap(), 1);
    }

    #[test]
    fn needs_a_queue() {
        let dir = tempfile::tempdir().unwrap();
        let mut spec = test_support::spec(dir.path(), &[("job-command", "true")]);
        spec.queues.clear();
        let client = Box::new(SpoolClient::open(&spec.client.spool).unwrap());
        assert!(SerialWorker::new(&spec, client).is_err());
    }

    #[test]
    #[serial]
    fn stop_request_is_seen_while_stdin_is_full() {
        signals::install_worker_handlers().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let spec = test_support::spec(dir.path(), &[("job-command", "sleep 30")]);
        let (spool, mut worker) = worker(&spec);
        // far more than a pipe buffer holds
        let blob = "x".repeat(1 << 20);
        let jid = spool.put("q", NewJob::new("big", json!({ "blob": blob }))).unwrap();

        let watcher = SpoolClient::open(&spec.client.spool).unwrap();
        let watched = jid.clone();
        let stopper = thread::spawn(move || {
            let running = || {
                let job = watcher.get(&watched).ok().flatten();
                job.is_some_and(|job| job.state == JobState::Running)
            };
            while !running() {
                thread::sleep(Duration::from_millis(20));
            }
            // give the command time to fill its stdin pipe
            thread::sleep(Duration::from_millis(200));
            nix::sys::signal::raise(Signal::SIGTERM).unwrap();
        });
        let started = Instant::now();
        worker.run().unwrap();
        stopper.join().unwrap();

        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(worker.processed(), 1);
        assert_eq!(spool.get(&jid).unwrap().unwrap().state, JobState::Running);
        // clear the stop request for the other tests
        signals::install_worker_handlers().unwrap();
    }
}
