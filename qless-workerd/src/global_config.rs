// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::logging::LogConfig;

pub const DEFAULT_POOL_NAME: &str = "qless-workers";
pub const DEFAULT_WORKER_KIND: &str = "serial";

/// What happens to the files a previous occupant left in a sandbox.
#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum, Default, Serialize, Deserialize)]
#[clap(rename_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum SandboxPolicy {
    #[default]
    /// Default: empty the sandbox before a worker starts and after each job
    Purge,
    /// Keep whatever the previous worker left behind
    Inherit,
}

/// How a worker process is created for a slot.
#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum, Default, Serialize, Deserialize)]
#[clap(rename_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum LaunchMode {
    #[default]
    /// Default: fork the supervisor and run the worker in the copy
    Fork,
    /// Spawn this executable again and pass the worker settings as arguments
    Exec,
}

/// Settings for talking to the queue. Every process opens its own client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub spool: PathBuf,
    /// Prefix of the worker names this pool reports to the queue.
    pub worker_name: String,
}

/// Everything the supervisor needs to run a pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub pool_name: String,
    pub workers: usize,
    pub queues: Vec<String>,
    pub worker_kind: String,
    pub options: BTreeMap<String, String>,
    pub client: ClientConfig,
    pub sandbox_policy: SandboxPolicy,
    pub launch_mode: LaunchMode,
    pub shutdown_timeout: Duration,
    pub resume: bool,
    pub log: LogConfig,
}

impl PoolConfig {
    /// Root of all sandboxes: `<cwd>/<pool-name>`.
    pub fn sandbox_root(&self) -> std::io::Result<PathBuf> {
        Ok(std::env::current_dir()?.join(&self.pool_name))
    }
}

/// Parse `key=value` worker options. A bare `key` means `key=true`.
pub fn parse_options(raw: &[String]) -> Result<BTreeMap<String, String>, String> {
    let mut options = BTreeMap::new();
    for entry in raw {
        let (key, value) = match entry.split_once('=') {
            Some((key, value)) => (key.trim(), value.trim()),
            None => (entry.trim(), "true"),
        };
        if key.is_empty() {
            return Err(format!("worker option {entry:?} has no key"));
        }
        options.insert(key.to_string(), value.to_string());
    }
    Ok(options)
}

/// Host name used as worker name prefix when none is given.
pub fn default_worker_name() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_are_split_on_first_equals() {
        let options = parse_options(&[
            "job-command=echo a=b".to_string(),
            "exit-when-idle".to_string(),
            " interval = 2 ".to_string(),
        ])
        .unwrap();
        assert_eq!(options["job-command"], "echo a=b");
        assert_eq!(options["exit-when-idle"], "true");
        assert_eq!(options["interval"], "2");
    }

    #[test]
    fn options_need_a_key() {
        assert!(parse_options(&["=1".to_string()]).is_err());
    }
}
