// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

//! Signal plumbing for the supervisor and its workers.
//!
//! Handlers only record the signal number in an atomic bit mask. Everything
//! else (forwarding, reaping, reloading the logger) happens in the main loop.
//!
//! The supervisor keeps the watched signals blocked and only lets them in
//! while it sits in `suspend`, so a signal can never arrive between checking
//! the mask and going to sleep.

use std::sync::atomic::{AtomicU64, Ordering};

use nix::errno::Errno;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal};

/// Signals that stop the whole pool.
pub const SHUTDOWN_SIGNALS: [Signal; 3] = [Signal::SIGTERM, Signal::SIGINT, Signal::SIGQUIT];

/// Signal that reloads logging and is passed on to the workers.
pub const RELOAD_SIGNAL: Signal = Signal::SIGHUP;

static PENDING: AtomicU64 = AtomicU64::new(0);

fn bit(signal: Signal) -> u64 {
    1u64 << (signal as i32)
}

fn shutdown_bits() -> u64 {
    SHUTDOWN_SIGNALS.iter().fold(0, |bits, s| bits | bit(*s))
}

/// Only performs an atomic operation: no allocation, no locks, no I/O.
extern "C" fn record_signal(signum: libc::c_int) {
    if (0..64).contains(&signum) {
        PENDING.fetch_or(1u64 << signum, Ordering::SeqCst);
    }
}

fn watched() -> SigSet {
    let mut set = SigSet::empty();
    for signal in SHUTDOWN_SIGNALS {
        set.add(signal);
    }
    set.add(RELOAD_SIGNAL);
    set.add(Signal::SIGCHLD);
    set
}

/// Install the supervisor's handlers and block the watched signals.
///
/// SA_RESTART is deliberately not set: a blocking call that gets hit by a
/// signal returns EINTR and the caller goes back to its loop.
pub fn install_supervisor_handlers() -> Result<(), Errno> {
    PENDING.store(0, Ordering::SeqCst);
    let watched = watched();
    // block first, so nothing gets lost between installing and suspending
    signal::sigprocmask(SigmaskHow::SIG_BLOCK, Some(&watched), None)?;

    let action = SigAction::new(
        SigHandler::Handler(record_signal),
        SaFlags::SA_NOCLDSTOP,
        SigSet::empty(),
    );
    for signal in watched.iter() {
        unsafe { signal::sigaction(signal, &action)? };
    }
    log::debug!("supervisor signal handlers installed");
    Ok(())
}

/// Install the handlers of a worker process and unblock what the
/// supervisor blocked. TERM, INT and QUIT ask the worker to stop, HUP asks
/// it to reload logging. SIGCHLD goes back to its default so job commands
/// can be waited for normally.
pub fn install_worker_handlers() -> Result<(), Errno> {
    PENDING.store(0, Ordering::SeqCst);
    let action = SigAction::new(
        SigHandler::Handler(record_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for signal in SHUTDOWN_SIGNALS.into_iter().chain([RELOAD_SIGNAL]) {
        unsafe { signal::sigaction(signal, &action)? };
    }
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    unsafe { signal::sigaction(Signal::SIGCHLD, &default)? };

    signal::sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&watched()), None)?;
    Ok(())
}

/// Sleep until a watched signal has been handled. Returns right away if one
/// was already waiting while blocked.
pub fn suspend() {
    let mut mask = SigSet::thread_get_mask().unwrap_or_else(|_| SigSet::empty());
    for signal in watched().iter() {
        mask.remove(signal);
    }
    // sigsuspend always returns -1/EINTR once a handler has run
    unsafe {
        libc::sigsuspend(mask.as_ref());
    }
}

/// True if a shutdown or reload signal is waiting to be taken.
pub fn has_pending() -> bool {
    PENDING.load(Ordering::SeqCst) & (shutdown_bits() | bit(RELOAD_SIGNAL)) != 0
}

/// Take the shutdown and reload signals recorded since the last call.
/// SIGCHLD is only a wake-up and is dropped.
pub fn take_pending() -> Vec<Signal> {
    let bits = PENDING.swap(0, Ordering::SeqCst);
    SHUTDOWN_SIGNALS
        .into_iter()
        .chain([RELOAD_SIGNAL])
        .filter(|s| bits & bit(*s) != 0)
        .collect()
}

/// Worker side: has a shutdown signal arrived? Stays true once set.
pub fn stop_requested() -> bool {
    PENDING.load(Ordering::SeqCst) & shutdown_bits() != 0
}

/// Worker side: consume a pending reload request.
pub fn take_reload_request() -> bool {
    PENDING.fetch_and(!bit(RELOAD_SIGNAL), Ordering::SeqCst) & bit(RELOAD_SIGNAL) != 0
}

pub fn is_shutdown_signal(signal: Signal) -> bool {
    SHUTDOWN_SIGNALS.contains(&signal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn blocked_signal_is_recorded_on_suspend() {
        install_supervisor_handlers().unwrap();
        // blocked in this thread, so it stays pending in the kernel
        signal::raise(Signal::SIGTERM).unwrap();
        assert!(!has_pending());

        suspend();
        assert!(has_pending());
        assert_eq!(take_pending(), vec![Signal::SIGTERM]);
        assert!(!has_pending());
        assert!(take_pending().is_empty());
    }

    #[test]
    #[serial]
    fn worker_handlers_split_stop_and_reload() {
        install_worker_handlers().unwrap();
        assert!(!stop_requested());

        signal::raise(Signal::SIGHUP).unwrap();
        assert!(!stop_requested());
        assert!(take_reload_request());
        assert!(!take_reload_request());

        signal::raise(Signal::SIGINT).unwrap();
        assert!(stop_requested());
        // stop requests stick
        assert!(stop_requested());
        PENDING.store(0, Ordering::SeqCst);
    }

    #[test]
    fn shutdown_classification() {
        assert!(is_shutdown_signal(Signal::SIGQUIT));
        assert!(!is_shutdown_signal(Signal::SIGHUP));
        assert!(!is_shutdown_signal(Signal::SIGCHLD));
    }
}
