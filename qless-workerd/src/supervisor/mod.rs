// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

//! The process supervisor: keeps one worker process per slot alive until a
//! shutdown signal arrives, then stops all of them.
//!
//! ```text
//! Starting -> Running -> Stopping -> Stopped
//! ```
//!
//! A worker that dies while Running is replaced by a fresh one in the same
//! sandbox. Whatever way `run` is left, no tracked child outlives it.

use std::collections::HashMap;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use nix::sys::signal::Signal;
use nix::unistd::Pid;

use crate::error::SupervisorError;
use crate::partition::{self, WorkAssignment};
use crate::sandbox::{Sandbox, SandboxManager};
use crate::signals::{self, RELOAD_SIGNAL};

pub mod host;

pub use host::{ChildExit, NixHost, ProcessHost, WaitEvent};


/// Time between two checks for an exited child during a graceful stop.
const REAP_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Set by the first shutdown signal, never cleared.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownFlag(Option<Signal>);

impl ShutdownFlag {
    pub fn is_set(&self) -> bool {
        self.0.is_some()
    }

    /// The signal that started the shutdown.
    pub fn signal(&self) -> Option<Signal> {
        self.0
    }

    /// Returns false if the flag was already set.
    fn set(&mut self, signal: Signal) -> bool {
        if self.0.is_some() {
            return false;
        }
        self.0 = Some(signal);
        true
    }
}

/// Which sandbox each live child occupies.
pub type SandboxRecord = HashMap<Pid, Sandbox>;

pub struct Supervisor<H: ProcessHost> {
    host: H,
    sandboxes: SandboxManager,
    count: usize,
    grace: Duration,
    state: State,
    shutdown: ShutdownFlag,
    children: SandboxRecord,
}

impl<H: ProcessHost> Supervisor<H> {
    /// `grace` bounds how long stopping children may take before they are
    /// killed.
    pub fn new(
        host: H,
        sandboxes: SandboxManager,
        count: usize,
        grace: Duration,
    ) -> Result<Self, SupervisorError> {
        if count == 0 {
            return Err(SupervisorError::Config(
                "a pool needs at least one worker".into(),
            ));
        }
        Ok(Self {
            host,
            sandboxes,
            count,
            grace,
            state: State::Starting,
            shutdown: ShutdownFlag::default(),
            children: SandboxRecord::new(),
        })
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn shutdown_flag(&self) -> ShutdownFlag {
        self.shutdown
    }

    pub fn children(&self) -> &SandboxRecord {
        &self.children
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    /// Launch the pool and supervise it until a shutdown signal arrives.
    ///
    /// `resume` holds jobs left running by a previous pool; they are split
    /// among the first workers. Errors are returned only after every child
    /// has been killed and reaped.
    pub fn run(&mut self, resume: Option<WorkAssignment>) -> Result<(), SupervisorError> {
        let result = self.start(resume).and_then(|()| self.supervise());
        if let Err(e) = &result {
            error!("supervisor failed: {e}");
        }
        // whatever is still tracked at this point gets killed
        self.stop(Signal::SIGKILL);
        self.state = State::Stopped;
        info!("All workers stopped");
        result
    }

    fn start(&mut self, resume: Option<WorkAssignment>) -> Result<(), SupervisorError> {
        self.state = State::Starting;
        self.host.install_signal_handlers()?;

        let assignments = partition::divide(resume.as_ref(), self.count);
        for (slot, assignment) in assignments.into_iter().enumerate() {
            let sandbox = self.sandboxes.reserve(slot)?;
            let pid = self.host.launch(&sandbox, assignment)?;
            info!("Spawned worker {} in {}", pid, sandbox.path.display());
            self.children.insert(pid, sandbox);
        }
        Ok(())
    }

    fn supervise(&mut self) -> Result<(), SupervisorError> {
        self.state = State::Running;
        loop {
            self.dispatch_signals();
            if let Some(signal) = self.shutdown.signal() {
                self.stop(signal);
                return Ok(());
            }
            match self.host.wait_any()? {
                WaitEvent::Exited(exit) => self.respawn(exit)?,
                WaitEvent::Interrupted => debug!("wait interrupted"),
            }
        }
    }

    fn dispatch_signals(&mut self) {
        for signal in self.host.take_signals() {
            if signals::is_shutdown_signal(signal) {
                if self.shutdown.set(signal) {
                    warn!("Received {signal}, shutting down");
                }
            } else if signal == RELOAD_SIGNAL {
                info!("Received {signal}, reloading logging");
                self.host.reload_logging();
                self.forward(signal);
            }
        }
    }

    /// Replace a dead child with a fresh one in the same sandbox.
    fn respawn(&mut self, exit: ChildExit) -> Result<(), SupervisorError> {
        let Some(sandbox) = self.children.remove(&exit.pid) else {
            debug!("Ignoring exit of untracked process {} ({})", exit.pid, exit);
            return Ok(());
        };
        warn!("Worker {} died with {}", exit.pid, exit);

        // a shutdown signal may have arrived together with the exit
        self.dispatch_signals();
        if self.shutdown.signal().is_some() {
            info!("Not replacing worker {}, shutting down", exit.pid);
            return Ok(());
        }

        // jobs of a dead worker are not handed to its successor
        let pid = self.host.launch(&sandbox, None)?;
        info!(
            "Spawned replacement worker {} in {}",
            pid,
            sandbox.path.display()
        );
        self.children.insert(pid, sandbox);
        Ok(())
    }

    /// Tracked pids in slot order.
    fn tracked(&self) -> Vec<Pid> {
        let mut pids: Vec<(usize, Pid)> = self
            .children
            .iter()
            .map(|(pid, sandbox)| (sandbox.slot, *pid))
            .collect();
        pids.sort_by_key(|(slot, _)| *slot);
        pids.into_iter().map(|(_, pid)| pid).collect()
    }

    fn forward(&mut self, signal: Signal) {
        for pid in self.tracked() {
            debug!("Sending {signal} to {pid}");
            if let Err(e) = self.host.send_signal(pid, signal) {
                warn!("{e}");
            }
        }
    }

    /// Send `signal` to every child once and reap them. Anything other than
    /// SIGKILL gets the grace period, then the stragglers are killed.
    fn stop(&mut self, signal: Signal) {
        if self.children.is_empty() {
            return;
        }
        self.state = State::Stopping;
        self.forward(signal);
        if signal == Signal::SIGKILL {
            self.reap_all(None);
            return;
        }

        // a grace period past the end of time means waiting without a deadline
        self.reap_all(Instant::now().checked_add(self.grace));
        if !self.children.is_empty() {
            warn!(
                "{} worker(s) still running after {:?}, killing them",
                self.children.len(),
                self.grace
            );
            self.forward(Signal::SIGKILL);
            self.reap_all(None);
        }
    }

    /// Children still running at `deadline` stay tracked. A child that cannot
    /// be waited for is dropped from the record; the others are still reaped.
    fn reap_all(&mut self, deadline: Option<Instant>) {
        for pid in self.tracked() {
            info!("Waiting for {pid}...");
            match self.reap(pid, deadline) {
                Ok(Some(exit)) => {
                    info!("Worker {pid} stopped with {exit}");
                    self.children.remove(&pid);
                }
                Ok(None) => {}
                Err(e) => {
                    error!("{e}");
                    self.children.remove(&pid);
                }
            }
        }
    }

    fn reap(
        &mut self,
        pid: Pid,
        deadline: Option<Instant>,
    ) -> Result<Option<ChildExit>, SupervisorError> {
        let Some(deadline) = deadline else {
            return self.host.wait_pid(pid, true);
        };
        loop {
            if let Some(exit) = self.host.wait_pid(pid, false)? {
                return Ok(Some(exit));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            thread::sleep((deadline - now).min(REAP_POLL));
        }
    }
}

impl<H: ProcessHost> Drop for Supervisor<H> {
    fn drop(&mut self) {
        // only reached with live children if run() was left by a panic
        if !self.children.is_empty() {
            self.stop(Signal::SIGKILL);
        }
    }
}
