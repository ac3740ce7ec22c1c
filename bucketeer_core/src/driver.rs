use crate::bucket::{BucketError, OutputRoot};
use crate::corpus::{CorpusEntry, CorpusError};
use crate::executor::{Executor, RunResult, TraceError};
use crate::fingerprint::Fingerprint;
use crate::signals;
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error(transparent)]
    Corpus(#[from] CorpusError),
    #[error(transparent)]
    Trace(#[from] TraceError),
    #[error(transparent)]
    Bucket(#[from] BucketError),
    #[error("Fingerprint {key} has {actual} frames, expected {expected}")]
    FingerprintMismatch {
        key: String,
        expected: usize,
        actual: usize,
    },
}

/// Counters for one batch run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub processed: usize,
    pub clean: usize,
    pub timed_out: usize,
    pub crashed: usize,
    pub copy_failures: usize,
    /// Bucket names that received at least one input during this run.
    pub buckets: BTreeSet<String>,
    pub cancelled: bool,
}

impl fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} processed: {} crashed into {} bucket(s), {} timed out, {} clean, {} copy failure(s)",
            self.processed,
            self.crashed,
            self.buckets.len(),
            self.timed_out,
            self.clean,
            self.copy_failures
        )?;
        if self.cancelled {
            f.write_str(" (stopped by user)")?;
        }
        Ok(())
    }
}

/// Replays every corpus entry in order and files crashes into buckets.
pub struct BatchDriver<E: Executor> {
    executor: E,
    output: OutputRoot,
    frame_count: usize,
    should_stop: Box<dyn Fn() -> bool>,
}

impl<E: Executor> BatchDriver<E> {
    pub fn new(executor: E, output: OutputRoot, frame_count: usize) -> Self {
        Self {
            executor,
            output,
            frame_count,
            should_stop: Box::new(signals::stop_requested),
        }
    }

    /// Replaces the cancellation check, which defaults to the process-wide stop flag.
    pub fn with_stop_check(mut self, should_stop: impl Fn() -> bool + 'static) -> Self {
        self.should_stop = Box::new(should_stop);
        self
    }

    pub fn output(&self) -> &OutputRoot {
        &self.output
    }

    /// Replays `entries` in order, routing each result: clean runs and
    /// timeouts are only reported, crashes are copied into their bucket.
    ///
    /// The stop check is consulted before every run and again after it. A stop
    /// observed after a run discards that run's result; everything processed
    /// before stays in place.
    ///
    /// # Arguments
    /// * `entries`: Corpus files as returned by [`crate::corpus::scan_input_dir`].
    ///
    /// # Returns
    /// The [`BatchSummary`], with `cancelled` set if the batch was stopped.
    /// Tracing failures, bucket-creation failures and fingerprints of the
    /// wrong length end the batch with an `Err`; copy failures do not.
    pub fn run(&mut self, entries: &[CorpusEntry]) -> Result<BatchSummary, DriverError> {
        let mut summary = BatchSummary::default();

        for entry in entries {
            if (self.should_stop)() {
                summary.cancelled = true;
                break;
            }

            log::info!("Running {} ...", entry.path().display());
            let result = self.executor.execute(entry)?;

            if (self.should_stop)() {
                log::warn!("Stopped by user");
                summary.cancelled = true;
                break;
            }
            summary.processed += 1;

            match result {
                RunResult::Clean => {
                    summary.clean += 1;
                    log::warn!("Cannot get a crash from {}", entry.path().display());
                }
                RunResult::TimedOut => {
                    summary.timed_out += 1;
                    log::warn!("Timeout from {}", entry.path().display());
                }
                RunResult::Crashed(fingerprint) => {
                    summary.crashed += 1;
                    self.file_crash(&fingerprint, entry, &mut summary)?;
                }
            }
        }

        Ok(summary)
    }

    fn file_crash(
        &self,
        fingerprint: &Fingerprint,
        entry: &CorpusEntry,
        summary: &mut BatchSummary,
    ) -> Result<(), DriverError> {
        let key = fingerprint.to_key();
        if fingerprint.frame_count() != self.frame_count {
            return Err(DriverError::FingerprintMismatch {
                key,
                expected: self.frame_count,
                actual: fingerprint.frame_count(),
            });
        }

        match self.output.bucket(fingerprint, entry) {
            Ok(copy) => {
                log::info!("Crash {key}: saved {}", copy.display());
                summary.buckets.insert(key);
                Ok(())
            }
            Err(e) if e.is_recoverable() => {
                log::warn!("{e}");
                summary.copy_failures += 1;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
