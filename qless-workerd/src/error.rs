// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::io;
use std::path::PathBuf;

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("could not create sandbox {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not purge sandbox {path}: {source}")]
    Purge {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not enter sandbox {path}: {source}")]
    Enter {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Failures of the supervising process itself. Worker crashes are not errors,
/// they are handled by respawning.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("invalid pool configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("failed to launch worker for slot {slot}: {source}")]
    Launch {
        slot: usize,
        #[source]
        source: io::Error,
    },

    #[error("waiting for worker processes failed: {0}")]
    Wait(#[source] Errno),

    #[error("could not install signal handling: {0}")]
    Signals(#[source] Errno),

    #[error("sending {signal} to {pid} failed: {source}")]
    Signal {
        pid: Pid,
        signal: Signal,
        #[source]
        source: Errno,
    },
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("spool i/o error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed job record {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("job {0} does not exist")]
    UnknownJob(String),

    #[error("job {jid} is not held by worker {worker}")]
    LostLock { jid: String, worker: String },

    #[error("invalid name {0:?}")]
    InvalidName(String),
}
