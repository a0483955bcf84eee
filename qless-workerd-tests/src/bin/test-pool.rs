// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

//! A pool of `pidfile` workers, started by the end-to-end tests.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use qless_workerd::global_config::{ClientConfig, LaunchMode, PoolConfig, SandboxPolicy};
use qless_workerd::logging::{self, LogConfig};
use qless_workerd::pool;
use qless_workerd::worker::WorkerRegistry;
use qless_workerd_tests::pidfile_worker;

#[derive(Debug, Parser)]
struct Args {
    #[arg(long, default_value_t = 3)]
    workers: usize,

    /// Sandbox root (absolute)
    #[arg(long = "pool-dir")]
    pool_dir: Option<PathBuf>,

    #[arg(long)]
    spool: Option<PathBuf>,

    #[arg(long = "launch-mode", value_enum, default_value_t)]
    launch_mode: LaunchMode,

    #[arg(long = "shutdown-timeout", default_value_t = 5.0)]
    shutdown_timeout: f64,

    /// Workers keep running after TERM, INT and QUIT
    #[arg(long = "ignore-stop")]
    ignore_stop: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Entry of exec-mode worker processes
    Worker {
        #[arg(long = "spec-base64")]
        spec_base64: String,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut registry = WorkerRegistry::with_builtins();
    registry.register(pidfile_worker::KIND, pidfile_worker::factory());

    if let Some(Command::Worker { spec_base64 }) = &args.command {
        std::process::exit(pool::worker_main(&registry, spec_base64));
    }

    let (Some(pool_dir), Some(spool)) = (args.pool_dir, args.spool) else {
        anyhow::bail!("--pool-dir and --spool are required");
    };

    let log = LogConfig {
        filter: Some("debug".to_string()),
        file: None,
    };
    logging::init(log.clone())?;

    let mut options = std::collections::BTreeMap::new();
    if args.ignore_stop {
        options.insert("ignore-stop".to_string(), "true".to_string());
    }

    let shutdown_timeout = Duration::try_from_secs_f64(args.shutdown_timeout)
        .map_err(|e| anyhow::anyhow!("--shutdown-timeout: {e}"))?;
    let config = PoolConfig {
        pool_name: pool_dir.display().to_string(),
        workers: args.workers,
        queues: vec!["test".to_string()],
        worker_kind: pidfile_worker::KIND.to_string(),
        options,
        client: ClientConfig {
            spool,
            worker_name: "test-pool".to_string(),
        },
        sandbox_policy: SandboxPolicy::Purge,
        launch_mode: args.launch_mode,
        shutdown_timeout,
        resume: false,
        log,
    };
    pool::run_pool(&registry, &config)
}
