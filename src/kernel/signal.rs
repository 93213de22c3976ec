//! Signal plumbing: process-group termination and async-safe shutdown flags.

use crate::config::types::Identity;
use crate::kernel::credentials::transition_to_unprivileged;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::Pid;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::Duration;

/// Global shutdown flag (async-safe atomic)
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Global signal received (async-safe atomic)
static SIGNAL_RECEIVED: AtomicI32 = AtomicI32::new(0);

const SHUTDOWN_SIGNALS: [Signal; 3] = [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP];

/// Flag-only SIGINT/SIGTERM/SIGHUP handlers, live until the guard drops.
///
/// While a guard is held the signals never kill the process: supervisors
/// stop their payloads and batch workers take no new requests, so every
/// sandbox is released before the caller checks `shutdown_exit_code`.
/// Outside a guard the default dispositions apply.
#[must_use = "handlers are removed when the guard drops"]
pub struct ShutdownGuard {
    previous: Vec<(Signal, SigAction)>,
}

pub fn install_shutdown_handlers() -> Result<ShutdownGuard, String> {
    let action = SigAction::new(
        SigHandler::Handler(on_shutdown_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    let mut guard = ShutdownGuard {
        previous: Vec::with_capacity(SHUTDOWN_SIGNALS.len()),
    };
    for sig in SHUTDOWN_SIGNALS {
        // SAFETY: the handler only touches atomics.
        let previous = unsafe { signal::sigaction(sig, &action) }
            .map_err(|e| format!("Failed to install {} handler: {}", sig, e))?;
        guard.previous.push((sig, previous));
    }
    log::debug!("Signal handlers installed (SIGINT, SIGTERM, SIGHUP)");
    Ok(guard)
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        for (sig, previous) in self.previous.drain(..) {
            // SAFETY: restores a disposition sigaction itself returned.
            if let Err(e) = unsafe { signal::sigaction(sig, &previous) } {
                log::warn!("Failed to restore {} handler: {}", sig, e);
            }
        }
    }
}

/// Only performs atomic operations - no allocations, no locks, no I/O
extern "C" fn on_shutdown_signal(signal: libc::c_int) {
    SIGNAL_RECEIVED.store(signal, Ordering::SeqCst);
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

/// Signal that requested shutdown, if any
pub fn received_signal() -> Option<Signal> {
    match SIGNAL_RECEIVED.load(Ordering::SeqCst) {
        0 => None,
        raw => Signal::try_from(raw).ok(),
    }
}

/// Shell-style exit status (128 + signal) once shutdown was requested.
pub fn shutdown_exit_code() -> Option<i32> {
    if !shutdown_requested() {
        return None;
    }
    Some(128 + received_signal().map_or(libc::SIGTERM, |sig| sig as i32))
}

/// Terminate a whole process group.
///
/// With a zero grace the group gets SIGKILL straight away; otherwise SIGTERM,
/// the grace period, then SIGKILL for whatever is left. ESRCH (group already
/// gone) is not an error.
pub fn kill_process_group(pgid: i32, grace: Duration) {
    if pgid <= 1 {
        return;
    }
    let group = Pid::from_raw(pgid);
    if !grace.is_zero() {
        if signal::killpg(group, Signal::SIGTERM).is_err() {
            return;
        }
        std::thread::sleep(grace);
    }
    match signal::killpg(group, Signal::SIGKILL) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => log::warn!("Failed to SIGKILL process group {}: {}", pgid, e),
    }
}

/// SIGKILL every process running as `identity`, wherever it is.
///
/// A helper child drops to the identity and calls kill(-1, SIGKILL), which
/// reaches exactly the processes that uid may signal, the helper included.
/// Catches descendants that left both the process group and the cgroup.
pub fn kill_all_owned_by(identity: Identity) -> Result<(), String> {
    use nix::sys::wait::{waitpid, WaitStatus};
    use nix::unistd::{fork, ForkResult};

    // SAFETY: the child only makes async-signal-safe syscalls before _exit.
    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            if transition_to_unprivileged(identity).is_ok() {
                // SAFETY: raw kill(2); the helper is one of its own targets.
                unsafe {
                    libc::kill(-1, libc::SIGKILL);
                }
            }
            // SAFETY: _exit skips atexit handlers and stdio flushing.
            unsafe { libc::_exit(1) }
        }
        Ok(ForkResult::Parent { child }) => match waitpid(child, None) {
            Ok(WaitStatus::Signaled(_, Signal::SIGKILL, _)) => Ok(()),
            Ok(status) => Err(format!(
                "reaper for uid {} did not complete: {:?}",
                identity.uid, status
            )),
            Err(e) => Err(format!("waitpid on reaper failed: {}", e)),
        },
        Err(e) => Err(format!("fork for uid {} reaper failed: {}", identity.uid, e)),
    }
}

/// True while any process in the group still exists (zombies included).
pub fn process_group_alive(pgid: i32) -> bool {
    pgid > 1 && signal::killpg(Pid::from_raw(pgid), None).is_ok()
}

/// Symbolic name for a raw signal number, e.g. 9 -> "SIGKILL".
pub fn signal_name(raw: i32) -> String {
    Signal::try_from(raw)
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|_| format!("SIG{}", raw))
}
