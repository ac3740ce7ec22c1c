use nix::errno::Errno;
use std::ptr;
use std::time::Duration;

/// Arms `ITIMER_REAL` around one traced run. Expiry raises SIGALRM, whose
/// handler (see [`crate::signals`]) kills the active child and flags the kill
/// as a timeout.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutController {
    timeout: Option<Duration>,
}

impl TimeoutController {
    /// A zero timeout disables the timer; runs may then block indefinitely.
    pub fn new(timeout_ms: u64) -> Self {
        let timeout = (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms));
        Self { timeout }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Starts the one-shot timer. The returned guard disarms it when dropped.
    pub fn arm(&self) -> Result<ArmedTimer, Errno> {
        match self.timeout {
            Some(timeout) => {
                set_real_timer(timeout)?;
                Ok(ArmedTimer { armed: true })
            }
            None => Ok(ArmedTimer { armed: false }),
        }
    }
}

#[derive(Debug)]
#[must_use = "dropping the guard disarms the timer"]
pub struct ArmedTimer {
    armed: bool,
}

impl ArmedTimer {
    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Disarms the timer, reporting failure instead of swallowing it.
    pub fn disarm(mut self) -> Result<(), Errno> {
        self.disarm_inner()
    }

    fn disarm_inner(&mut self) -> Result<(), Errno> {
        if !self.armed {
            return Ok(());
        }
        self.armed = false;
        set_real_timer(Duration::ZERO)
    }
}

impl Drop for ArmedTimer {
    fn drop(&mut self) {
        if let Err(e) = self.disarm_inner() {
            log::warn!("Failed to disarm the run timer: {e}");
        }
    }
}

fn set_real_timer(value: Duration) -> Result<(), Errno> {
    let timer = libc::itimerval {
        it_interval: libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        },
        it_value: libc::timeval {
            tv_sec: value.as_secs() as libc::time_t,
            tv_usec: value.subsec_micros() as libc::suseconds_t,
        },
    };
    // SAFETY: `timer` is a valid itimerval and the old value is not requested.
    let res = unsafe { libc::setitimer(libc::ITIMER_REAL, &timer, ptr::null_mut()) };
    Errno::result(res).map(drop)
}
