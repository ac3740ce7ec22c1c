use crate::arch::is_fault_signal;
use crate::executor::RunResult;
use crate::fingerprint::Fingerprint;
use nix::sys::signal::Signal;

/// How a traced child ended, as observed by `waitpid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited(i32),
    Signaled(Signal),
}

/// Process-wide flags sampled when the child's death is observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KillContext {
    /// The timer handler killed the child.
    pub timed_out: bool,
    /// The operator asked the batch to stop.
    pub stop_requested: bool,
}

/// Turns the terminal state of one traced run into a [`RunResult`].
#[derive(Debug, Clone, Copy)]
pub struct CrashOracle {
    frame_count: usize,
}

impl CrashOracle {
    pub fn new(frame_count: usize) -> Self {
        Self { frame_count }
    }

    /// Classifies a finished run.
    ///
    /// Exits are clean whatever their status. Deaths by signal are clean when
    /// cancellation was requested, a timeout when SIGKILL follows timer expiry,
    /// and a crash otherwise.
    ///
    /// # Arguments
    /// * `termination`: How the child ended, from the final `waitpid` status.
    /// * `context`: Timeout and cancellation flags sampled when the death was seen.
    /// * `fingerprint`: The fingerprint computed at the last fault stop, if any.
    ///
    /// # Returns
    /// The [`RunResult`]. A crash that never passed through a fault stop gets
    /// an unresolved fingerprint of `frame_count` sentinels.
    pub fn examine(
        &self,
        termination: Termination,
        context: KillContext,
        fingerprint: Option<Fingerprint>,
    ) -> RunResult {
        let signal = match termination {
            Termination::Exited(_) => return RunResult::Clean,
            Termination::Signaled(signal) => signal,
        };

        if context.stop_requested {
            return RunResult::Clean;
        }
        if signal == Signal::SIGKILL && context.timed_out {
            return RunResult::TimedOut;
        }

        match fingerprint {
            Some(fingerprint) => RunResult::Crashed(fingerprint),
            None => {
                if is_fault_signal(signal) {
                    log::warn!("Child died by {signal} without a fault stop being traced");
                } else {
                    log::warn!(
                        "Child died by {signal} without any fault signal; bucketing under an unresolved fingerprint"
                    );
                }
                RunResult::Crashed(Fingerprint::unresolved(self.frame_count))
            }
        }
    }
}
