// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

//! Process-wide logger that can be rebuilt at runtime.
//!
//! `log` only accepts one logger per process, so the installed logger is a
//! thin wrapper around an `env_logger::Logger` that `reconfigure` swaps out.
//! Reconfiguring reopens the log file, which is what logrotate expects after
//! sending HUP.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{OnceLock, RwLock};

use anyhow::{anyhow, Context};
use env_logger::{Env, Target};
use log::{info, Log, Metadata, Record};
use serde::{Deserialize, Serialize};

const DEFAULT_FILTER: &str = "info";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// env_logger filter directives. Falls back to RUST_LOG, then "info".
    pub filter: Option<String>,
    /// Append records to this file instead of stderr.
    pub file: Option<PathBuf>,
}

struct ReloadableLogger {
    config: LogConfig,
    inner: RwLock<env_logger::Logger>,
}

static LOGGER: OnceLock<ReloadableLogger> = OnceLock::new();

impl Log for ReloadableLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        match self.inner.read() {
            Ok(inner) => inner.enabled(metadata),
            Err(poisoned) => poisoned.into_inner().enabled(metadata),
        }
    }

    fn log(&self, record: &Record) {
        match self.inner.read() {
            Ok(inner) => inner.log(record),
            Err(poisoned) => poisoned.into_inner().log(record),
        }
    }

    fn flush(&self) {
        if let Ok(inner) = self.inner.read() {
            inner.flush();
        }
    }
}

fn build(config: &LogConfig) -> anyhow::Result<env_logger::Logger> {
    let mut builder = match &config.filter {
        Some(filter) => {
            let mut builder = env_logger::Builder::new();
            builder.parse_filters(filter);
            builder
        }
        None => env_logger::Builder::from_env(Env::default().default_filter_or(DEFAULT_FILTER)),
    };

    // the pid tells apart the supervisor and its workers, which share the output
    builder.format(|buf, record| {
        writeln!(
            buf,
            "{} | PID {} | [{}] {}",
            buf.timestamp_millis(),
            std::process::id(),
            record.level(),
            record.args()
        )
    });

    if let Some(path) = &config.file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("could not open log file {}", path.display()))?;
        builder.target(Target::Pipe(Box::new(file)));
    }

    Ok(builder.build())
}

/// Install the process-wide logger. Must be called once, early in main().
pub fn init(config: LogConfig) -> anyhow::Result<()> {
    let logger = build(&config)?;
    let max_level = logger.filter();
    LOGGER
        .set(ReloadableLogger {
            config,
            inner: RwLock::new(logger),
        })
        .map_err(|_| anyhow!("logging has already been initialized"))?;

    let installed = LOGGER
        .get()
        .ok_or_else(|| anyhow!("logger vanished during initialization"))?;
    log::set_logger(installed).map_err(|e| anyhow!("could not install logger: {e}"))?;
    log::set_max_level(max_level);
    Ok(())
}

/// Rebuild the logger from its configuration, reopening the log file.
pub fn reconfigure() -> anyhow::Result<()> {
    let Some(installed) = LOGGER.get() else {
        return Err(anyhow!("logging is not initialized"));
    };

    info!("Reloading logger configuration...");
    let logger = build(&installed.config)?;
    let max_level = logger.filter();
    {
        let mut inner = match installed.inner.write() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.flush();
        *inner = logger;
    }
    log::set_max_level(max_level);
    info!("Reloaded logger configuration...");
    Ok(())
}

/// Settings the logger was initialized with, if any.
pub fn current_config() -> Option<LogConfig> {
    LOGGER.get().map(|logger| logger.config.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_filter_wins() {
        let logger = build(&LogConfig {
            filter: Some("warn".to_string()),
            file: None,
        })
        .unwrap();
        assert_eq!(logger.filter(), log::LevelFilter::Warn);
    }

    #[test]
    fn log_file_is_created_on_build() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workerd.log");
        build(&LogConfig {
            filter: Some("debug".to_string()),
            file: Some(path.clone()),
        })
        .unwrap();
        assert!(path.exists());
    }

    #[test]
    fn unopenable_log_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = build(&LogConfig {
            filter: None,
            file: Some(dir.path().join("missing/dir/workerd.log")),
        });
        assert!(result.is_err());
    }
}
