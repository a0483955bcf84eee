// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;

use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};

use crate::error::SupervisorError;
use crate::global_config::LaunchMode;
use crate::partition::WorkAssignment;
use crate::sandbox::Sandbox;
use crate::worker::{run_worker_process, WorkerFactory, WorkerSpec, PANIC_EXIT_CODE};
use crate::{logging, signals};

/// How a child ended: with an exit code or killed by a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildExit {
    pub pid: Pid,
    pub code: Option<i32>,
    pub signal: Option<Signal>,
}

impl ChildExit {
    pub fn exited(pid: Pid, code: i32) -> Self {
        Self {
            pid,
            code: Some(code),
            signal: None,
        }
    }

    pub fn signaled(pid: Pid, signal: Signal) -> Self {
        Self {
            pid,
            code: None,
            signal: Some(signal),
        }
    }

    /// None for statuses that are not a termination (stopped, continued).
    pub fn from_status(status: WaitStatus) -> Option<Self> {
        match status {
            WaitStatus::Exited(pid, code) => Some(Self::exited(pid, code)),
            WaitStatus::Signaled(pid, signal, _) => Some(Self::signaled(pid, signal)),
            _ => None,
        }
    }
}

impl fmt::Display for ChildExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => write!(f, "unknown status"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitEvent {
    Exited(ChildExit),
    /// A signal arrived while waiting. Dispatch it and wait again.
    Interrupted,
}

/// Everything the supervisor needs from the operating system.
pub trait ProcessHost {
    fn install_signal_handlers(&mut self) -> Result<(), SupervisorError>;

    /// Start a worker process bound to `sandbox`. Returns its pid.
    fn launch(
        &mut self,
        sandbox: &Sandbox,
        assignment: Option<WorkAssignment>,
    ) -> Result<Pid, SupervisorError>;

    /// Block until any child ends or a signal arrives.
    fn wait_any(&mut self) -> Result<WaitEvent, SupervisorError>;

    /// Wait for one child. Without `block`, returns None if it is still running.
    fn wait_pid(&mut self, pid: Pid, block: bool) -> Result<Option<ChildExit>, SupervisorError>;

    fn send_signal(&mut self, pid: Pid, signal: Signal) -> Result<(), SupervisorError>;

    /// Signals received since the last call, in no particular order.
    fn take_signals(&mut self) -> Vec<Signal>;

    fn reload_logging(&mut self);
}

/// The real thing: fork or spawn, waitpid, kill.
pub struct NixHost {
    factory: Arc<dyn WorkerFactory>,
    template: WorkerSpec,
    mode: LaunchMode,
    program: PathBuf,
}

impl NixHost {
    /// `template` is the WorkerSpec shared by all slots; slot, sandbox and
    /// assignment are filled in per launch.
    pub fn new(
        factory: Arc<dyn WorkerFactory>,
        template: WorkerSpec,
        mode: LaunchMode,
    ) -> Result<Self, SupervisorError> {
        let program = std::env::current_exe().map_err(|source| SupervisorError::Launch {
            slot: template.slot,
            source,
        })?;
        Ok(Self {
            factory,
            template,
            mode,
            program,
        })
    }

    fn spec_for(&self, sandbox: &Sandbox, assignment: Option<WorkAssignment>) -> WorkerSpec {
        WorkerSpec {
            slot: sandbox.slot,
            sandbox: sandbox.path.clone(),
            resume: assignment,
            ..self.template.clone()
        }
    }

    fn fork_worker(&self, spec: &WorkerSpec) -> Result<Pid, SupervisorError> {
        //Note: The child process is created with a single thread, the one that called fork().
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => Ok(child),
            Ok(ForkResult::Child) => {
                // never unwind back into the supervisor's frames
                let code = panic::catch_unwind(AssertUnwindSafe(|| {
                    run_worker_process(self.factory.as_ref(), spec)
                }))
                .unwrap_or(PANIC_EXIT_CODE);
                std::process::exit(code);
            }
            Err(errno) => Err(SupervisorError::Launch {
                slot: spec.slot,
                source: errno.into(),
            }),
        }
    }

    fn exec_worker(&self, spec: &WorkerSpec) -> Result<Pid, SupervisorError> {
        let encoded = spec
            .encode()
            .map_err(|e| SupervisorError::Config(format!("{e:#}")))?;
        let child = Command::new(&self.program)
            .arg("worker")
            .arg("--spec-base64")
            .arg(encoded)
            .spawn()
            .map_err(|source| SupervisorError::Launch {
                slot: spec.slot,
                source,
            })?;
        // reaped through waitpid, the handle is not needed
        Ok(Pid::from_raw(child.id() as i32))
    }
}

impl ProcessHost for NixHost {
    fn install_signal_handlers(&mut self) -> Result<(), SupervisorError> {
        signals::install_supervisor_handlers().map_err(SupervisorError::Signals)
    }

    fn launch(
        &mut self,
        sandbox: &Sandbox,
        assignment: Option<WorkAssignment>,
    ) -> Result<Pid, SupervisorError> {
        let spec = self.spec_for(sandbox, assignment);
        // buffered records would otherwise be written twice
        log::logger().flush();
        match self.mode {
            LaunchMode::Fork => self.fork_worker(&spec),
            LaunchMode::Exec => self.exec_worker(&spec),
        }
    }

    fn wait_any(&mut self) -> Result<WaitEvent, SupervisorError> {
        loop {
            match waitpid(None::<Pid>, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {
                    if signals::has_pending() {
                        return Ok(WaitEvent::Interrupted);
                    }
                    // returns after any watched signal, SIGCHLD included
                    signals::suspend();
                    if signals::has_pending() {
                        return Ok(WaitEvent::Interrupted);
                    }
                }
                Ok(status) => match ChildExit::from_status(status) {
                    Some(exit) => return Ok(WaitEvent::Exited(exit)),
                    None => debug!("ignoring wait status {status:?}"),
                },
                Err(Errno::EINTR) => return Ok(WaitEvent::Interrupted),
                Err(e) => return Err(SupervisorError::Wait(e)),
            }
        }
    }

    fn wait_pid(&mut self, pid: Pid, block: bool) -> Result<Option<ChildExit>, SupervisorError> {
        let flags = if block {
            None
        } else {
            Some(WaitPidFlag::WNOHANG)
        };
        loop {
            match waitpid(pid, flags) {
                Ok(WaitStatus::StillAlive) => return Ok(None),
                Ok(status) => match ChildExit::from_status(status) {
                    Some(exit) => return Ok(Some(exit)),
                    None if block => continue,
                    None => return Ok(None),
                },
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(SupervisorError::Wait(e)),
            }
        }
    }

    fn send_signal(&mut self, pid: Pid, signal: Signal) -> Result<(), SupervisorError> {
        kill(pid, signal).map_err(|source| SupervisorError::Signal {
            pid,
            signal,
            source,
        })
    }

    fn take_signals(&mut self) -> Vec<Signal> {
        signals::take_pending()
    }

    fn reload_logging(&mut self) {
        if let Err(e) = logging::reconfigure() {
            warn!("{e:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_map_to_exits() {
        let pid = Pid::from_raw(42);
        assert_eq!(
            ChildExit::from_status(WaitStatus::Exited(pid, 3)),
            Some(ChildExit::exited(pid, 3))
        );
        assert_eq!(
            ChildExit::from_status(WaitStatus::Signaled(pid, Signal::SIGKILL, false)),
            Some(ChildExit::signaled(pid, Signal::SIGKILL))
        );
        assert_eq!(
            ChildExit::from_status(WaitStatus::Stopped(pid, Signal::SIGSTOP)),
            None
        );
        assert_eq!(ChildExit::from_status(WaitStatus::StillAlive), None);
    }

    #[test]
    fn exits_read_well_in_logs() {
        let pid = Pid::from_raw(7);
        assert_eq!(ChildExit::exited(pid, 1).to_string(), "exit code 1");
        assert_eq!(
            ChildExit::signaled(pid, Signal::SIGTERM).to_string(),
            "signal SIGTERM"
        );
    }
}
