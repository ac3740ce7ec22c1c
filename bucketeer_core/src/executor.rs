use crate::arch;
use crate::config::TriageConfig;
use crate::corpus::CorpusEntry;
use crate::fingerprint::Fingerprint;
use crate::launcher::{LaunchedChild, ProcessLauncher};
use crate::oracle::{CrashOracle, KillContext, Termination};
use crate::signals;
use crate::stack::{StackHasher, TraceeMemory};
use crate::timer::{ArmedTimer, TimeoutController};
use nix::errno::Errno;
use nix::sys::ptrace::{self, Options};
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::process::Child;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Terminal classification of one traced run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunResult {
    Clean,
    TimedOut,
    Crashed(Fingerprint),
}

/// Failures of the tracing machinery itself. None of them is a property of
/// the input being replayed, so every variant is fatal to the batch.
#[derive(Error, Debug)]
pub enum TraceError {
    #[error("Failed to spawn {program:?}: {source}")]
    Spawn {
        program: PathBuf,
        source: std::io::Error,
    },
    #[error("Unable to open input {path:?} for stdin: {source}")]
    OpenInput {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("ptrace {request} on pid {pid} failed: {errno}")]
    Ptrace {
        request: &'static str,
        pid: Pid,
        errno: Errno,
    },
    #[error("Unexpected child status during {stage}: {status}")]
    UnexpectedStatus { stage: &'static str, status: String },
    #[error("Failed to {action} the run timer: {errno}")]
    Timer { action: &'static str, errno: Errno },
    #[error("A trace session is already active")]
    SessionBusy,
}

/// An `Executor` replays corpus entries against the target, one at a time.
///
/// The batch driver only talks to this trait, so the tracing backend can be
/// swapped for a scripted one in tests.
pub trait Executor {
    /// Runs the target once on `entry` and waits for it to terminate.
    ///
    /// # Arguments
    /// * `entry`: The corpus file to replay, delivered as configured (argument
    ///   slot or stdin).
    ///
    /// # Returns
    /// The classified [`RunResult`] of the run. An `Err` means the tracing
    /// machinery itself failed and the batch must stop; it is never used to
    /// report something about the input.
    fn execute(&mut self, entry: &CorpusEntry) -> Result<RunResult, TraceError>;
}

static SESSION_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Proof that no other trace session is alive in this process.
#[derive(Debug)]
struct SessionSlot;

impl SessionSlot {
    fn acquire() -> Result<Self, TraceError> {
        SESSION_ACTIVE
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| SessionSlot)
            .map_err(|_| TraceError::SessionBusy)
    }
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        SESSION_ACTIVE.store(false, Ordering::SeqCst);
    }
}

/// Live state of one traced execution.
///
/// Dropping a session that never observed its child's death kills and reaps
/// the child, so no tracee outlives the session on any path.
#[derive(Debug)]
pub struct TraceSession {
    pid: Pid,
    timer: Option<ArmedTimer>,
    fingerprint: Option<Fingerprint>,
    last_fault: Option<Signal>,
    timed_out: bool,
    reaped: bool,
    _handle: Child,
    _slot: SessionSlot,
}

impl TraceSession {
    fn start(slot: SessionSlot, child: LaunchedChild) -> Self {
        Self {
            pid: child.pid,
            timer: None,
            fingerprint: None,
            last_fault: None,
            timed_out: false,
            reaped: false,
            _handle: child._handle,
            _slot: slot,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn last_fault(&self) -> Option<Signal> {
        self.last_fault
    }

    /// A ptrace failure is only tolerated once a signal handler has killed the
    /// child, in which case ESRCH is the expected answer.
    fn check_ptrace(
        &self,
        request: &'static str,
        result: nix::Result<()>,
    ) -> Result<(), TraceError> {
        match result {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) if !signals::is_active_child(self.pid) => {
                log::debug!("{request} on {} skipped, child already killed", self.pid);
                Ok(())
            }
            Err(errno) => Err(TraceError::Ptrace {
                request,
                pid: self.pid,
                errno,
            }),
        }
    }

    fn resume(&self, signal: Option<Signal>) -> Result<(), TraceError> {
        self.check_ptrace("PTRACE_CONT", ptrace::cont(self.pid, signal))
    }

    fn record_fault(&mut self, signal: Signal, hasher: &StackHasher) -> Result<(), TraceError> {
        self.last_fault = Some(signal);
        let registers = match arch::read_registers(self.pid) {
            Ok(registers) => registers,
            Err(errno) => {
                return self.check_ptrace("PTRACE_GETREGS", Err(errno));
            }
        };

        let frame_pointer = arch::frame_pointer_of(&registers);
        let fingerprint = hasher.hash(&TraceeMemory::new(self.pid), frame_pointer);
        log::debug!(
            "{signal} stop in {}: frame pointer {frame_pointer:#x}, fingerprint {fingerprint}",
            self.pid
        );
        // Only the last fault before the child dies matters.
        self.fingerprint = Some(fingerprint);
        Ok(())
    }

    /// Marks the child reaped, withdraws it from the signal handlers and
    /// disarms the timer.
    fn finish(&mut self) -> Result<(), TraceError> {
        self.reaped = true;
        signals::clear_active_child(self.pid);
        self.timed_out = signals::child_timed_out();
        if let Some(timer) = self.timer.take() {
            timer.disarm().map_err(|errno| TraceError::Timer {
                action: "disarm",
                errno,
            })?;
        }
        Ok(())
    }

    /// Runs the tracer loop until the child exits or is killed.
    ///
    /// Signal-delivery stops are inspected and then forwarded unchanged, so
    /// targets that handle their own signals keep working while faults are
    /// still seen before any handler runs.
    fn trace_until_exit(&mut self, hasher: &StackHasher) -> Result<Termination, TraceError> {
        loop {
            let status = match waitpid(self.pid, None) {
                Ok(status) => status,
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => {
                    return Err(TraceError::UnexpectedStatus {
                        stage: "tracing",
                        status: format!("pid {} is no longer our child", self.pid),
                    });
                }
                Err(errno) => {
                    log::warn!("waitpid() on {} failed: {errno}", self.pid);
                    continue;
                }
            };

            match status {
                WaitStatus::Stopped(_, signal) => {
                    if arch::is_fault_signal(signal) {
                        self.record_fault(signal, hasher)?;
                    }
                    self.resume(Some(signal))?;
                }
                // Exec events from PTRACE_O_TRACEEXEC: nothing to forward.
                WaitStatus::PtraceEvent(..) => self.resume(None)?,
                WaitStatus::Exited(_, code) => {
                    self.finish()?;
                    return Ok(Termination::Exited(code));
                }
                WaitStatus::Signaled(_, signal, _) => {
                    self.finish()?;
                    return Ok(Termination::Signaled(signal));
                }
                other => log::debug!("Ignoring wait status {other:?}"),
            }
        }
    }
}

impl Drop for TraceSession {
    fn drop(&mut self) {
        if self.reaped {
            return;
        }
        signals::clear_active_child(self.pid);
        let _ = kill(self.pid, Signal::SIGKILL);
        loop {
            match waitpid(self.pid, None) {
                Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => break,
                Ok(_) | Err(Errno::EINTR) => continue,
                Err(errno) => {
                    log::warn!("Failed to reap traced child {}: {errno}", self.pid);
                    break;
                }
            }
        }
    }
}

/// Runs targets under ptrace, one child at a time.
#[derive(Debug, Clone)]
pub struct PtraceExecutor {
    launcher: ProcessLauncher,
    timer: TimeoutController,
    hasher: StackHasher,
    oracle: CrashOracle,
}

impl PtraceExecutor {
    pub fn new(config: &TriageConfig) -> Self {
        Self {
            launcher: ProcessLauncher::new(config),
            timer: TimeoutController::new(config.timeout_ms),
            hasher: StackHasher::new(config.frame_count),
            oracle: CrashOracle::new(config.frame_count),
        }
    }

    pub fn launcher(&self) -> &ProcessLauncher {
        &self.launcher
    }
}

impl Executor for PtraceExecutor {
    fn execute(&mut self, entry: &CorpusEntry) -> Result<RunResult, TraceError> {
        let slot = SessionSlot::acquire()?;
        let child = self.launcher.launch(entry)?;
        let mut session = TraceSession::start(slot, child);
        let pid = session.pid();

        ptrace::setoptions(pid, Options::PTRACE_O_EXITKILL | Options::PTRACE_O_TRACEEXEC)
            .map_err(|errno| TraceError::Ptrace {
                request: "PTRACE_SETOPTIONS",
                pid,
                errno,
            })?;

        signals::set_active_child(pid);
        if signals::stop_requested() {
            // Cancelled while launching; the handler had no child to kill yet.
            signals::kill_active_child();
        }

        session.timer = Some(self.timer.arm().map_err(|errno| TraceError::Timer {
            action: "arm",
            errno,
        })?);
        session.resume(None)?;

        let termination = session.trace_until_exit(&self.hasher)?;
        let context = KillContext {
            timed_out: session.timed_out,
            stop_requested: signals::stop_requested(),
        };
        log::debug!(
            "{pid} ended with {termination:?} (last fault {:?}, {context:?})",
            session.last_fault()
        );

        Ok(self
            .oracle
            .examine(termination, context, session.fingerprint.take()))
    }
}
