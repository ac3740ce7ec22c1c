//! State shared between the control thread and asynchronous signal handlers.
//!
//! Handlers only touch the atomics below and call `kill(2)`; they never
//! allocate, lock or log. The control thread reads the flags after `waitpid`
//! returns, so every access is `SeqCst`.

use nix::sys::signal::{self, SigHandler, Signal};
use nix::unistd::Pid;
use signal_hook::consts::{SIGALRM, SIGHUP, SIGINT, SIGTERM};
use std::io;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

/// Pid of the tracee that handlers may kill, 0 when there is none.
static ACTIVE_CHILD: AtomicI32 = AtomicI32::new(0);
/// Set by the timer handler when it killed the active child.
static CHILD_TIMED_OUT: AtomicBool = AtomicBool::new(false);
/// Set once the operator asked the batch to stop.
static STOP_REQUESTED: AtomicBool = AtomicBool::new(false);

static INSTALLED: OnceLock<()> = OnceLock::new();

/// Registers the cancellation and timer handlers. Idempotent.
pub fn install() -> io::Result<()> {
    if INSTALLED.get().is_some() {
        return Ok(());
    }

    for stop_signal in [SIGHUP, SIGINT, SIGTERM] {
        // SAFETY: the handler only performs atomic operations and kill(2).
        unsafe { signal_hook::low_level::register(stop_signal, on_stop_signal)? };
    }
    // SAFETY: as above.
    unsafe { signal_hook::low_level::register(SIGALRM, on_timer_expired)? };

    for ignored in [Signal::SIGTSTP, Signal::SIGPIPE] {
        // SAFETY: SIG_IGN installs no Rust code as a handler.
        unsafe { signal::signal(ignored, SigHandler::SigIgn) }.map_err(io::Error::from)?;
    }

    let _ = INSTALLED.set(());
    Ok(())
}

fn on_stop_signal() {
    STOP_REQUESTED.store(true, Ordering::SeqCst);
    kill_active_child();
}

fn on_timer_expired() {
    let pid = ACTIVE_CHILD.swap(0, Ordering::SeqCst);
    if pid > 0 {
        CHILD_TIMED_OUT.store(true, Ordering::SeqCst);
        let _ = signal::kill(Pid::from_raw(pid), Signal::SIGKILL);
    }
}

/// Kills the active child, if any, and clears the cell so nothing kills it twice.
pub fn kill_active_child() -> bool {
    let pid = ACTIVE_CHILD.swap(0, Ordering::SeqCst);
    if pid > 0 {
        let _ = signal::kill(Pid::from_raw(pid), Signal::SIGKILL);
        true
    } else {
        false
    }
}

/// Publishes the tracee handlers are allowed to kill and resets the timeout flag.
pub fn set_active_child(pid: Pid) {
    CHILD_TIMED_OUT.store(false, Ordering::SeqCst);
    ACTIVE_CHILD.store(pid.as_raw(), Ordering::SeqCst);
}

/// Withdraws `pid` from the handlers. Returns `false` if a handler already took it.
pub fn clear_active_child(pid: Pid) -> bool {
    ACTIVE_CHILD
        .compare_exchange(pid.as_raw(), 0, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
}

/// Whether `pid` is still owned by the control thread rather than killed by a handler.
pub fn is_active_child(pid: Pid) -> bool {
    ACTIVE_CHILD.load(Ordering::SeqCst) == pid.as_raw()
}

pub fn child_timed_out() -> bool {
    CHILD_TIMED_OUT.load(Ordering::SeqCst)
}

pub fn stop_requested() -> bool {
    STOP_REQUESTED.load(Ordering::SeqCst)
}

/// Requests cancellation from regular code, with the same effect as SIGINT.
pub fn request_stop() {
    on_stop_signal();
}

#[cfg(test)]
pub(crate) fn reset_for_tests() {
    STOP_REQUESTED.store(false, Ordering::SeqCst);
    CHILD_TIMED_OUT.store(false, Ordering::SeqCst);
    ACTIVE_CHILD.store(0, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn clearing_a_foreign_pid_leaves_the_cell_alone() {
        reset_for_tests();
        set_active_child(Pid::from_raw(i32::MAX - 1));
        assert!(!clear_active_child(Pid::from_raw(i32::MAX - 2)));
        assert!(is_active_child(Pid::from_raw(i32::MAX - 1)));
        assert!(clear_active_child(Pid::from_raw(i32::MAX - 1)));
        assert!(!is_active_child(Pid::from_raw(i32::MAX - 1)));
        reset_for_tests();
    }

    #[test]
    #[serial]
    fn timer_expiry_without_child_is_not_a_timeout() {
        reset_for_tests();
        on_timer_expired();
        assert!(!child_timed_out());
        assert!(!kill_active_child());
        reset_for_tests();
    }
}
