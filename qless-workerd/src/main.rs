// SPDX-License-Identifier: MIT
// qless-workerd: supervisor for a local pool of qless-style worker processes
//
// - Forks one worker per slot, each in its own sandbox directory.
// - Replaces workers that die, forwards TERM/INT/QUIT and HUP to all of them.
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use log::info;

use qless_workerd::global_config::{
    self, ClientConfig, LaunchMode, PoolConfig, SandboxPolicy, DEFAULT_POOL_NAME,
    DEFAULT_WORKER_KIND,
};
use qless_workerd::logging::{self, LogConfig};
use qless_workerd::pool;
use qless_workerd::queue::{NewJob, QueueClient, SpoolClient};
use qless_workerd::worker::WorkerRegistry;

const DEFAULT_SPOOL: &str = "qless-spool";

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    /// Directory holding the queues
    #[arg(long, global = true, value_name = "DIR", default_value = DEFAULT_SPOOL)]
    spool: PathBuf,

    /// Log filter in env_logger syntax (defaults to RUST_LOG, then "info")
    #[arg(long = "log-filter", global = true, value_name = "FILTER")]
    log_filter: Option<String>,

    /// Append log records to this file instead of stderr. Reopened on SIGHUP.
    #[arg(long = "log-file", global = true, value_name = "PATH")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a pool of workers until it receives TERM, INT or QUIT
    Run(RunArgs),

    /// Put a job into a queue and print its jid
    Put(PutArgs),

    /// Print job counts per queue, per worker and per failure group
    Counts,

    /// Move failed jobs of a group back into a queue
    Unfail(UnfailArgs),

    /// Run a single worker process (used by --launch-mode exec)
    #[command(hide = true)]
    Worker {
        /// WorkerSpec (base64-encoded JSON)
        #[arg(long = "spec-base64", value_name = "BASE64")]
        spec_base64: String,
    },
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Queue to pop jobs from, in order of preference. May be repeated.
    #[arg(short, long = "queue", value_name = "QUEUE")]
    queues: Vec<String>,

    /// Number of worker processes (0 means one per CPU)
    #[arg(short, long, default_value_t = 0)]
    workers: usize,

    /// Name of the pool; sandboxes live in <cwd>/<pool-name>/sandbox-<slot>
    #[arg(long = "pool-name", default_value = DEFAULT_POOL_NAME)]
    pool_name: String,

    /// Kind of worker each process runs
    #[arg(long = "worker-kind", default_value = DEFAULT_WORKER_KIND)]
    worker_kind: String,

    /// Shell command that handles one job (serial worker)
    #[arg(long = "job-command", value_name = "COMMAND")]
    job_command: Option<String>,

    /// Worker option as key=value. May be repeated.
    #[arg(short, long = "option", value_name = "KEY=VALUE")]
    options: Vec<String>,

    /// Re-claim the jobs that workers of this name left running
    #[arg(long)]
    resume: bool,

    /// Prefix of the worker names reported to the queue (defaults to the host name)
    #[arg(long = "worker-name")]
    worker_name: Option<String>,

    /// What happens to files left in a sandbox by the previous worker
    #[arg(long = "sandbox-policy", value_enum, default_value_t)]
    sandbox_policy: SandboxPolicy,

    /// How worker processes are started
    #[arg(long = "launch-mode", value_enum, default_value_t)]
    launch_mode: LaunchMode,

    /// Seconds workers get to stop before they are killed
    #[arg(long = "shutdown-timeout", value_name = "SECONDS", default_value_t = 10.0)]
    shutdown_timeout: f64,
}

#[derive(Debug, Args)]
struct PutArgs {
    #[arg(short, long)]
    queue: String,

    /// Job class, passed to the job command as QLESS_KLASS
    #[arg(short, long)]
    klass: String,

    /// Job data (JSON)
    #[arg(short, long, value_name = "JSON", default_value = "{}")]
    data: String,

    /// Lower runs first
    #[arg(long, default_value_t = 0)]
    priority: i64,

    #[arg(short, long = "tag")]
    tags: Vec<String>,

    #[arg(long, default_value_t = 5)]
    retries: u32,

    /// Use this jid instead of a generated one; moves the job if it exists
    #[arg(long)]
    jid: Option<String>,
}

#[derive(Debug, Args)]
struct UnfailArgs {
    #[arg(short, long)]
    group: String,

    #[arg(short, long)]
    queue: String,

    #[arg(short, long, default_value_t = 25)]
    count: usize,
}

fn validate_args(cli: &Cli) -> Result<(), String> {
    match &cli.command {
        Command::Run(args) => {
            if args.queues.is_empty() {
                return Err("run needs at least one --queue".into());
            }
            shutdown_timeout(args)?;
            if args.pool_name.trim().is_empty() {
                return Err("--pool-name must not be empty".into());
            }
            global_config::parse_options(&args.options)?;
        }
        Command::Put(args) => {
            serde_json::from_str::<serde_json::Value>(&args.data)
                .map_err(|e| format!("--data is not valid JSON: {e}"))?;
        }
        Command::Counts | Command::Unfail(_) | Command::Worker { .. } => {}
    }
    Ok(())
}

fn shutdown_timeout(args: &RunArgs) -> Result<Duration, String> {
    Duration::try_from_secs_f64(args.shutdown_timeout)
        .map_err(|e| format!("--shutdown-timeout {}: {e}", args.shutdown_timeout))
}

fn pool_config(cli: &Cli, args: &RunArgs) -> Result<PoolConfig, String> {
    let mut options = global_config::parse_options(&args.options)?;
    if let Some(command) = &args.job_command {
        options.insert("job-command".to_string(), command.clone());
    }
    let workers = match args.workers {
        0 => num_cpus::get(),
        n => n,
    };

    Ok(PoolConfig {
        pool_name: args.pool_name.clone(),
        workers,
        queues: args.queues.clone(),
        worker_kind: args.worker_kind.clone(),
        options,
        client: ClientConfig {
            spool: cli.spool.clone(),
            worker_name: args
                .worker_name
                .clone()
                .unwrap_or_else(global_config::default_worker_name),
        },
        sandbox_policy: args.sandbox_policy,
        launch_mode: args.launch_mode,
        shutdown_timeout: shutdown_timeout(args)?,
        resume: args.resume,
        log: log_config(cli),
    })
}

fn log_config(cli: &Cli) -> LogConfig {
    LogConfig {
        filter: cli.log_filter.clone(),
        file: cli.log_file.clone(),
    }
}

fn put(client: &dyn QueueClient, args: &PutArgs) -> anyhow::Result<()> {
    let data = serde_json::from_str(&args.data).context("--data is not valid JSON")?;
    let mut job = NewJob::new(args.klass.clone(), data)
        .priority(args.priority)
        .tags(args.tags.clone())
        .retries(args.retries);
    if let Some(jid) = &args.jid {
        job = job.jid(jid.clone());
    }
    let jid = client.put(&args.queue, job)?;
    println!("{jid}");
    Ok(())
}

fn counts(client: &dyn QueueClient) -> anyhow::Result<()> {
    let report = serde_json::json!({
        "queues": client.queue_counts()?,
        "workers": client.worker_counts()?,
        "failed": client.failed_groups()?,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Err(e) = validate_args(&cli) {
        eprintln!("Error: {e}");
        std::process::exit(2);
    }

    let registry = WorkerRegistry::with_builtins();

    // a worker process sets up logging from its spec
    if let Command::Worker { spec_base64 } = &cli.command {
        std::process::exit(pool::worker_main(&registry, spec_base64));
    }

    logging::init(log_config(&cli))?;

    match &cli.command {
        Command::Run(args) => {
            let config = pool_config(&cli, args).map_err(anyhow::Error::msg)?;
            info!("Starting qless-workerd");
            pool::run_pool(&registry, &config)?;
        }
        Command::Put(args) => put(&SpoolClient::open(&cli.spool)?, args)?,
        Command::Counts => counts(&SpoolClient::open(&cli.spool)?)?,
        Command::Unfail(args) => {
            let client = SpoolClient::open(&cli.spool)?;
            let moved = client.unfail(&args.group, &args.queue, args.count)?;
            println!("{moved}");
        }
        Command::Worker { .. } => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("qless-workerd").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn run_needs_a_queue() {
        assert!(validate_args(&parse(&["run"])).is_err());
        assert!(validate_args(&parse(&["run", "-q", "a"])).is_ok());
    }

    #[test]
    fn job_command_becomes_an_option() {
        let cli = parse(&[
            "run",
            "-q",
            "a",
            "-q",
            "b",
            "-w",
            "3",
            "--job-command",
            "make it",
            "-o",
            "max-jobs=2",
            "--sandbox-policy",
            "inherit",
            "--worker-name",
            "box",
        ]);
        let Command::Run(args) = &cli.command else {
            panic!("expected run");
        };
        let config = pool_config(&cli, args).unwrap();
        assert_eq!(config.queues, vec!["a", "b"]);
        assert_eq!(config.workers, 3);
        assert_eq!(config.options["job-command"], "make it");
        assert_eq!(config.options["max-jobs"], "2");
        assert_eq!(config.sandbox_policy, SandboxPolicy::Inherit);
        assert_eq!(config.launch_mode, LaunchMode::Fork);
        assert_eq!(config.client.worker_name, "box");
        assert_eq!(config.pool_name, DEFAULT_POOL_NAME);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(10));
    }

    #[test]
    fn zero_workers_means_one_per_cpu() {
        let cli = parse(&["run", "-q", "a"]);
        let Command::Run(args) = &cli.command else {
            panic!("expected run");
        };
        assert_eq!(pool_config(&cli, args).unwrap().workers, num_cpus::get());
    }

    #[test]
    fn shutdown_timeout_must_fit_a_duration() {
        for bad in ["NaN", "inf", "1e20"] {
            let cli = parse(&["run", "-q", "a", "--shutdown-timeout", bad]);
            assert!(validate_args(&cli).is_err(), "{bad} was accepted");
        }
        let cli = parse(&["run", "-q", "a", "--shutdown-timeout", "0.25"]);
        assert!(validate_args(&cli).is_ok());
        let Command::Run(args) = &cli.command else {
            panic!("expected run");
        };
        assert_eq!(
            pool_config(&cli, args).unwrap().shutdown_timeout,
            Duration::from_millis(250)
        );
    }

    #[test]
    fn put_data_must_be_json() {
        assert!(validate_args(&parse(&["put", "-q", "a", "-k", "K", "-d", "{"])).is_err());
        assert!(validate_args(&parse(&["put", "-q", "a", "-k", "K", "-d", "[1]"])).is_ok());
    }
}
