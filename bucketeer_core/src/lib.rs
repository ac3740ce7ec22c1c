pub mod arch;
pub mod bucket;
pub mod config;
pub mod corpus;
pub mod driver;
pub mod executor;
pub mod fingerprint;
pub mod launcher;
pub mod oracle;
pub mod signals;
pub mod stack;
pub mod timer;

pub use bucket::{BucketError, OutputRoot};
pub use config::{ConfigError, ConfigFile, InputDelivery, TargetCommand, TriageConfig};
pub use corpus::{CorpusEntry, CorpusError, scan_input_dir};
pub use driver::{BatchDriver, BatchSummary, DriverError};
pub use executor::{Executor, PtraceExecutor, RunResult, TraceError};
pub use fingerprint::{Fingerprint, FrameId};
pub use launcher::ProcessLauncher;
pub use oracle::{CrashOracle, KillContext, Termination};
pub use stack::{FrameReader, StackHasher};
pub use timer::TimeoutController;
