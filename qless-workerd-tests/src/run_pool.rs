// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::{
    fs,
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus},
    thread,
    time::{Duration, Instant},
};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use crate::pidfile_worker::PID_FILE;

/// A running `test-pool` supervisor with its own spool and sandbox root.
pub struct PoolGuard {
    child: Child,
    dir: tempfile::TempDir,
}

impl PoolGuard {
    /// `program` is the `test-pool` binary (`CARGO_BIN_EXE_test-pool`).
    pub fn start(program: &str, workers: usize, extra_args: &[&str]) -> Self {
        let dir = tempfile::tempdir().expect("failed to create a temporary directory");
        let workers = workers.to_string();
        let pool = dir.path().join("pool");
        let spool = dir.path().join("spool");
        let child = Command::new(program)
            .arg("--workers")
            .arg(&workers)
            .arg("--pool-dir")
            .arg(&pool)
            .arg("--spool")
            .arg(&spool)
            .args(extra_args)
            .spawn()
            .expect("failed to start test-pool");
        Self { child, dir }
    }

    pub fn pid(&self) -> Pid {
        Pid::from_raw(self.child.id() as i32)
    }

    pub fn sandbox(&self, slot: usize) -> PathBuf {
        self.dir.path().join("pool").join(format!("sandbox-{slot}"))
    }

    pub fn signal(&self, signal: Signal) {
        signal::kill(self.pid(), signal).expect("failed to signal test-pool");
    }

    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Wait for the supervisor to exit on its own.
    pub fn wait_exit(&mut self, timeout: Duration) -> Option<ExitStatus> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Ok(Some(status)) = self.child.try_wait() {
                return Some(status);
            }
            thread::sleep(Duration::from_millis(50));
        }
        None
    }

    /// Pid the worker in `slot` announced, once it is not `previous`.
    pub fn worker_pid(&self, slot: usize, previous: Option<Pid>, timeout: Duration) -> Option<Pid> {
        let path = self.sandbox(slot).join(PID_FILE);
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Some(pid) = read_pid(&path) {
                if Some(pid) != previous {
                    return Some(pid);
                }
            }
            thread::sleep(Duration::from_millis(20));
        }
        None
    }
}

fn read_pid(path: &Path) -> Option<Pid> {
    let raw = fs::read_to_string(path).ok()?;
    raw.trim().parse().ok().map(Pid::from_raw)
}

/// True while `pid` exists. Children of the pool are reaped by the supervisor
/// or, once it is gone, by init, so a dead worker does not linger.
pub fn is_alive(pid: Pid) -> bool {
    signal::kill(pid, None).is_ok()
}

/// Poll until `pid` is gone.
pub fn wait_gone(pid: Pid, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if !is_alive(pid) {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    false
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        let pid = self.pid();

        // First: SIGTERM
        let _ = signal::kill(pid, Signal::SIGTERM);

        // Wait a bit
        for _ in 0..30 {
            if let Ok(Some(_)) = self.child.try_wait() {
                return;
            }
            thread::sleep(Duration::from_millis(100));
        }

        // Still alive, SIGKILL
        let _ = signal::kill(pid, Signal::SIGKILL);
        let _ = self.child.wait();
    }
}
