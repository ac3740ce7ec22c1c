use crate::config::{InputDelivery, TargetCommand, TriageConfig};
use crate::corpus::CorpusEntry;
use crate::executor::TraceError;
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::resource::{Resource, setrlimit};
use nix::sys::signal::Signal;
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{Pid, setsid};
use std::fs::File;
use std::io;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};

/// Sanitizer policy handed to targets unless the operator already set one.
pub const DEFAULT_ASAN_OPTIONS: &str =
    "abort_on_error=1:detect_leaks=0:symbolize=0:allocator_may_return_null=1";

const ASAN_OPTIONS: &str = "ASAN_OPTIONS";

/// A freshly exec'ed child, held at its initial trace stop.
#[derive(Debug)]
pub struct LaunchedChild {
    pub pid: Pid,
    // Never waited on through std; the tracer reaps the pid with waitpid.
    pub(crate) _handle: Child,
}

/// Spawns the target under ptrace for one corpus entry.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    target: TargetCommand,
    delivery: InputDelivery,
    memory_limit: Option<u64>,
    asan_options: Option<&'static str>,
}

impl ProcessLauncher {
    pub fn new(config: &TriageConfig) -> Self {
        let asan_options = std::env::var_os(ASAN_OPTIONS)
            .is_none()
            .then_some(DEFAULT_ASAN_OPTIONS);
        Self {
            target: config.target.clone(),
            delivery: config.input_delivery(),
            memory_limit: config.memory_limit_bytes(),
            asan_options,
        }
    }

    pub fn delivery(&self) -> InputDelivery {
        self.delivery
    }

    /// Builds the command for `entry` without spawning it.
    pub fn command_for(&self, entry: &CorpusEntry) -> Result<Command, TraceError> {
        let mut cmd = Command::new(&self.target.program);
        cmd.args(self.target.render_args(entry.path()));

        match self.delivery {
            InputDelivery::Stdin => {
                let input = File::open(entry.path()).map_err(|source| TraceError::OpenInput {
                    path: entry.path().to_path_buf(),
                    source,
                })?;
                cmd.stdin(Stdio::from(input));
            }
            InputDelivery::Argument(_) => {
                cmd.stdin(Stdio::null());
            }
        }
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());

        if let Some(options) = self.asan_options {
            cmd.env(ASAN_OPTIONS, options);
        }

        let memory_limit = self.memory_limit;
        // SAFETY: the hook runs between fork and exec and only issues raw
        // syscalls (ptrace, setsid, setrlimit); it neither allocates nor locks.
        unsafe {
            cmd.pre_exec(move || {
                ptrace::traceme().map_err(io::Error::from)?;
                setsid().map_err(io::Error::from)?;
                if let Some(limit) = memory_limit {
                    setrlimit(Resource::RLIMIT_AS, limit, limit).map_err(io::Error::from)?;
                }
                Ok(())
            });
        }
        Ok(cmd)
    }

    /// Forks and execs the target, returning once the child sits in the
    /// SIGTRAP stop delivered at exec.
    ///
    /// # Arguments
    /// * `entry`: The input for this run, substituted into the `@@` slot or
    ///   opened as the child's stdin.
    ///
    /// # Returns
    /// The stopped child. Spawn and exec failures, and any first status other
    /// than the exec stop, are fatal [`TraceError`]s.
    ///
    /// Every descriptor the tool opens is close-on-exec, so the locked output
    /// directory never reaches the target.
    pub fn launch(&self, entry: &CorpusEntry) -> Result<LaunchedChild, TraceError> {
        let handle = self
            .command_for(entry)?
            .spawn()
            .map_err(|source| TraceError::Spawn {
                program: self.target.program.clone(),
                source,
            })?;
        let pid = Pid::from_raw(handle.id() as i32);
        wait_for_exec_stop(pid)?;
        Ok(LaunchedChild {
            pid,
            _handle: handle,
        })
    }
}

/// Blocks until `pid` reports the SIGTRAP stop that follows its exec.
///
/// Any other status kills and reaps the child. `ECHILD` means the pid is not
/// (or no longer) our child and is fatal; other wait errors are retried.
fn wait_for_exec_stop(pid: Pid) -> Result<(), TraceError> {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Stopped(_, Signal::SIGTRAP)) => return Ok(()),
            Ok(status) => {
                // Reap whatever is left so the failed launch leaves no zombie.
                let _ = nix::sys::signal::kill(pid, Signal::SIGKILL);
                let _ = waitpid(pid, None);
                return Err(TraceError::UnexpectedStatus {
                    stage: "initial exec stop",
                    status: format!("{status:?}"),
                });
            }
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => {
                return Err(TraceError::UnexpectedStatus {
                    stage: "initial exec stop",
                    status: format!("pid {pid} is not our child"),
                });
            }
            Err(errno) => {
                log::warn!("waitpid() for initial stop of {pid} failed: {errno}");
            }
        }
    }
}
