// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

//! Worker units: what runs inside each process of the pool.
//!
//! The supervisor only knows a worker by the name of its kind. The name is
//! looked up once per process in a `WorkerRegistry`: by the supervisor to
//! validate the options before anything is launched, and by each worker
//! process right after it starts.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use base64::prelude::BASE64_STANDARD;
use base64::Engine as _;
use log::{error, info};
use serde::{Deserialize, Serialize};

use crate::global_config::{ClientConfig, SandboxPolicy};
use crate::logging::LogConfig;
use crate::partition::WorkAssignment;
use crate::queue::{QueueClient, SpoolClient};
use crate::{sandbox, signals};

pub mod closure_worker;
pub mod serial;

/// Exit code of a worker process whose worker panicked.
pub const PANIC_EXIT_CODE: i32 = 101;

pub trait Worker {
    /// Free-form description, used for logging
    fn desc(&self) -> &str;

    /// Claim and execute jobs until the worker decides to stop.
    fn run(&mut self) -> anyhow::Result<()>;
}

impl std::fmt::Debug for dyn Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker").field("desc", &self.desc()).finish()
    }
}

pub trait WorkerFactory: Send + Sync {
    /// Reject unusable options before any process is launched.
    fn validate(&self, _options: &BTreeMap<String, String>) -> anyhow::Result<()> {
        Ok(())
    }

    fn create(
        &self,
        spec: &WorkerSpec,
        client: Box<dyn QueueClient>,
    ) -> anyhow::Result<Box<dyn Worker>>;
}

impl std::fmt::Debug for dyn WorkerFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerFactory").finish_non_exhaustive()
    }
}

/// Everything a worker process needs to build its worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub slot: usize,
    pub sandbox: PathBuf,
    pub sandbox_policy: SandboxPolicy,
    pub resume: Option<WorkAssignment>,
    pub queues: Vec<String>,
    pub kind: String,
    pub options: BTreeMap<String, String>,
    pub client: ClientConfig,
    pub log: LogConfig,
}

impl WorkerSpec {
    /// Name this process reports to the queue: `<prefix>-<pid>`.
    pub fn worker_name(&self) -> String {
        format!("{}-{}", self.client.worker_name, std::process::id())
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    pub fn encode(&self) -> anyhow::Result<String> {
        let json = serde_json::to_vec(self).context("could not serialize worker spec")?;
        Ok(BASE64_STANDARD.encode(json))
    }

    pub fn decode(encoded: &str) -> anyhow::Result<Self> {
        let json = BASE64_STANDARD
            .decode(encoded)
            .context("worker spec is not valid base64")?;
        serde_json::from_slice(&json).context("worker spec is not valid JSON")
    }
}

/// Known worker kinds by name.
#[derive(Clone)]
pub struct WorkerRegistry {
    factories: BTreeMap<String, Arc<dyn WorkerFactory>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// A registry holding the workers shipped with this crate.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(serial::KIND, serial::SerialFactory);
        registry
    }

    /// Add a worker kind, replacing one of the same name.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        factory: impl WorkerFactory + 'static,
    ) -> Option<Arc<dyn WorkerFactory>> {
        self.factories.insert(name.into(), Arc::new(factory))
    }

    pub fn resolve(&self, name: &str) -> anyhow::Result<Arc<dyn WorkerFactory>> {
        self.factories.get(name).cloned().ok_or_else(|| {
            anyhow!(
                "unknown worker kind {:?} (known: {})",
                name,
                self.names().join(", ")
            )
        })
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Body of a worker process: set up signals, move into the sandbox, build
/// the worker and run it. Returns the exit code for the process.
///
/// A sandbox that cannot be set up ends the process before any job runs.
pub fn run_worker_process(factory: &dyn WorkerFactory, spec: &WorkerSpec) -> i32 {
    if let Err(e) = signals::install_worker_handlers() {
        error!("could not install worker signal handlers: {e}");
        return 1;
    }
    if let Err(e) = sandbox::enter(&spec.sandbox, spec.sandbox_policy) {
        error!("{e}");
        return 1;
    }

    let result = panic::catch_unwind(AssertUnwindSafe(|| -> anyhow::Result<()> {
        let client = SpoolClient::open(&spec.client.spool)
            .with_context(|| format!("could not open spool {}", spec.client.spool.display()))?;
        let mut worker = factory.create(spec, Box::new(client))?;
        info!(
            "{} started in {} (slot {})",
            worker.desc(),
            spec.sandbox.display(),
            spec.slot
        );
        worker.run()
    }));

    let code = match result {
        Ok(Ok(())) => 0,
        Ok(Err(e)) => {
            error!("worker in slot {} failed: {e:#}", spec.slot);
            1
        }
        Err(_) => {
            error!("worker in slot {} panicked", spec.slot);
            PANIC_EXIT_CODE
        }
    };
    log::logger().flush();
    code
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn spec(root: &std::path::Path, options: &[(&str, &str)]) -> WorkerSpec {
        WorkerSpec {
            slot: 0,
            sandbox: root.join("pool").join("sandbox-0"),
            sandbox_policy: SandboxPolicy::Purge,
            resume: None,
            queues: vec!["q".to_string()],
            kind: serial::KIND.to_string(),
            options: options
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            client: ClientConfig {
                spool: root.join("spool"),
                worker_name: "test-host".to_string(),
            },
            log: LogConfig::default(),
        }
    }
}
