// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

//! Glue between a resolved `PoolConfig` and the supervisor. Shared by the
//! `qless-workerd` binary and anything embedding the pool with its own
//! worker kinds.

use std::sync::Arc;

use anyhow::Context;
use log::{info, warn};

use crate::global_config::PoolConfig;
use crate::partition::WorkAssignment;
use crate::queue::{QueueClient, SpoolClient};
use crate::sandbox::SandboxManager;
use crate::supervisor::{NixHost, Supervisor};
use crate::worker::{run_worker_process, WorkerRegistry, WorkerSpec};
use crate::logging;

/// Jobs still held by workers of this pool, from a previous run.
///
/// Matches the bare worker name and `<worker_name>-<anything>`, which is how
/// worker processes name themselves.
pub fn resume_assignment(
    client: &dyn QueueClient,
    worker_name: &str,
) -> anyhow::Result<Option<WorkAssignment>> {
    let prefix = format!("{worker_name}-");
    let mut jids = Vec::new();
    for counts in client.worker_counts()? {
        if counts.name == worker_name || counts.name.starts_with(&prefix) {
            jids.extend(client.worker_jobs(&counts.name)?);
        }
    }
    if jids.is_empty() {
        return Ok(None);
    }
    Ok(Some(WorkAssignment::new(jids)))
}

/// The spec every slot starts from. Slot, sandbox and assignment are set per
/// launch.
fn template(config: &PoolConfig, sandboxes: &SandboxManager) -> WorkerSpec {
    WorkerSpec {
        slot: 0,
        sandbox: sandboxes.path_for(0),
        sandbox_policy: config.sandbox_policy,
        resume: None,
        queues: config.queues.clone(),
        kind: config.worker_kind.clone(),
        options: config.options.clone(),
        client: config.client.clone(),
        log: config.log.clone(),
    }
}

/// Validate the worker kind, collect resumable jobs and supervise the pool
/// until it is shut down.
pub fn run_pool(registry: &WorkerRegistry, config: &PoolConfig) -> anyhow::Result<()> {
    let factory = registry.resolve(&config.worker_kind)?;
    factory
        .validate(&config.options)
        .with_context(|| format!("invalid options for the {} worker", config.worker_kind))?;

    let resume = if config.resume {
        let client = SpoolClient::open(&config.client.spool)?;
        let assignment = resume_assignment(&client, &config.client.worker_name)?;
        match &assignment {
            Some(assignment) => info!("Resuming {} job(s)", assignment.len()),
            None => warn!("--resume given, but no jobs of {} are running", config.client.worker_name),
        }
        assignment
    } else {
        None
    };

    let sandboxes = SandboxManager::new(config.sandbox_root()?, config.sandbox_policy);
    let host = NixHost::new(
        Arc::clone(&factory),
        template(config, &sandboxes),
        config.launch_mode,
    )?;
    let mut supervisor = Supervisor::new(host, sandboxes, config.workers, config.shutdown_timeout)?;

    info!(
        "Starting {} {} worker(s) on {} in {}",
        config.workers,
        config.worker_kind,
        config.queues.join(", "),
        config.pool_name
    );
    supervisor.run(resume)?;
    Ok(())
}

/// Entry of a worker process started with `--launch-mode exec`. Returns the
/// exit code.
pub fn worker_main(registry: &WorkerRegistry, spec_base64: &str) -> i32 {
    let spec = match WorkerSpec::decode(spec_base64) {
        Ok(spec) => spec,
        Err(e) => {
            eprintln!("Error: {e:#}");
            return 2;
        }
    };
    if let Err(e) = logging::init(spec.log.clone()) {
        eprintln!("Error: {e:#}");
        return 2;
    }
    match registry.resolve(&spec.kind) {
        Ok(factory) => run_worker_process(factory.as_ref(), &spec),
        Err(e) => {
            log::error!("{e:#}");
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::queue::NewJob;

    #[test]
    fn resume_collects_jobs_of_this_pool_only() {
        let dir = tempfile::tempdir().unwrap();
        let client = SpoolClient::open(dir.path()).unwrap();
        for _ in 0..4 {
            client.put("q", NewJob::new("k", json!({}))).unwrap();
        }
        let a = client.pop("q", "host-a-10").unwrap().unwrap();
        let b = client.pop("q", "host-a").unwrap().unwrap();
        client.pop("q", "host-ab-11").unwrap().unwrap();
        client.pop("q", "other-12").unwrap().unwrap();

        let assignment = resume_assignment(&client, "host-a").unwrap().unwrap();
        let mut jids = assignment.jids().to_vec();
        jids.sort();
        let mut expected = vec![a.jid, b.jid];
        expected.sort();
        assert_eq!(jids, expected);
    }

    #[test]
    fn nothing_to_resume() {
        let dir = tempfile::tempdir().unwrap();
        let client = SpoolClient::open(dir.path()).unwrap();
        assert_eq!(resume_assignment(&client, "host-a").unwrap(), None);
    }

    #[test]
    fn unknown_worker_kind_fails_before_launching() {
        let dir = tempfile::tempdir().unwrap();
        let config = PoolConfig {
            pool_name: dir.path().join("pool").display().to_string(),
            workers: 1,
            queues: vec!["q".into()],
            worker_kind: "nope".into(),
            options: Default::default(),
            client: crate::global_config::ClientConfig {
                spool: dir.path().join("spool"),
                worker_name: "host".into(),
            },
            sandbox_policy: Default::default(),
            launch_mode: Default::default(),
            shutdown_timeout: std::time::Duration::from_secs(1),
            resume: false,
            log: Default::default(),
        };
        let err = run_pool(&WorkerRegistry::with_builtins(), &config).unwrap_err();
        assert!(err.to_string().contains("nope"));
        assert!(!dir.path().join("pool").exists());
    }
}
