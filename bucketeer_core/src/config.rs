use crate::stack::StackHasher;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Argument token replaced by the path of the input being replayed.
pub const INPUT_PLACEHOLDER: &str = "@@";

/// Smallest accepted non-zero per-run timeout.
pub const MIN_TIMEOUT_MS: u64 = 5;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file at {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse TOML from config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Missing required setting: {0}")]
    Missing(&'static str),
    #[error("Input and output directories can't be the same ({0:?})")]
    SameDirectories(PathBuf),
    #[error("Dangerously low timeout of {0} ms (minimum is 5 ms)")]
    TimeoutTooLow(u64),
    #[error("Frame count must be at least 1")]
    NoFrames,
}

/// How the current input reaches the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputDelivery {
    /// The input file is opened and becomes the child's stdin.
    Stdin,
    /// The input path replaces the argument at this index (0 is the first argument
    /// after the program).
    Argument(usize),
}

/// The program to replay inputs against, with its argument template.
#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TargetCommand {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

impl TargetCommand {
    /// Splits a command line (`program arg...`) into a target.
    pub fn from_command_line(command_line: &[String]) -> Option<Self> {
        let (program, args) = command_line.split_first()?;
        Some(Self {
            program: PathBuf::from(program),
            args: args.to_vec(),
        })
    }

    pub fn input_delivery(&self) -> InputDelivery {
        self.args
            .iter()
            .position(|arg| arg == INPUT_PLACEHOLDER)
            .map_or(InputDelivery::Stdin, InputDelivery::Argument)
    }

    /// Arguments for one run. The template is left untouched; with stdin
    /// delivery the arguments are returned as configured.
    pub fn render_args(&self, input: &Path) -> Vec<String> {
        let mut args = self.args.clone();
        if let InputDelivery::Argument(slot) = self.input_delivery() {
            args[slot] = input.to_string_lossy().into_owned();
        }
        args
    }

    pub fn display_command_line(&self) -> String {
        std::iter::once(self.program.to_string_lossy().into_owned())
            .chain(self.args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Settings as they appear in a TOML config file. Every field is optional so
/// command-line flags can fill or override them.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub input_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub timeout_ms: Option<u64>,
    pub memory_limit_mb: Option<u64>,
    pub frame_count: Option<usize>,
    pub target: Option<TargetCommand>,
}

impl ConfigFile {
    /// Reads and parses a TOML config file.
    ///
    /// # Arguments
    /// * `path`: The config file. Keys are kebab-case; unknown keys are rejected.
    ///
    /// # Returns
    /// The parsed settings, still unvalidated. Call [`ConfigFile::into_config`]
    /// once command-line overrides have been applied.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Builds and validates the run configuration.
    pub fn into_config(self) -> Result<TriageConfig, ConfigError> {
        let config = TriageConfig {
            input_dir: self.input_dir.ok_or(ConfigError::Missing("input directory"))?,
            output_dir: self
                .output_dir
                .ok_or(ConfigError::Missing("output directory"))?,
            timeout_ms: self.timeout_ms.unwrap_or(0),
            memory_limit_mb: self.memory_limit_mb,
            frame_count: self.frame_count.unwrap_or(StackHasher::DEFAULT_FRAME_COUNT),
            target: self.target.ok_or(ConfigError::Missing("target command"))?,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Immutable settings for one triage run, shared by reference with every component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriageConfig {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Per-run timeout in milliseconds, 0 for none.
    pub timeout_ms: u64,
    /// Address-space limit applied to the child, in MiB.
    pub memory_limit_mb: Option<u64>,
    pub frame_count: usize,
    pub target: TargetCommand,
}

impl TriageConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.input_dir.as_os_str().is_empty() {
            return Err(ConfigError::Missing("input directory"));
        }
        if self.output_dir.as_os_str().is_empty() {
            return Err(ConfigError::Missing("output directory"));
        }
        if self.input_dir == self.output_dir {
            return Err(ConfigError::SameDirectories(self.input_dir.clone()));
        }
        if self.target.program.as_os_str().is_empty() {
            return Err(ConfigError::Missing("target command"));
        }
        if self.timeout_ms > 0 && self.timeout_ms < MIN_TIMEOUT_MS {
            return Err(ConfigError::TimeoutTooLow(self.timeout_ms));
        }
        if self.frame_count == 0 {
            return Err(ConfigError::NoFrames);
        }
        if self.frame_count > StackHasher::RELIABLE_FRAME_COUNT {
            log::warn!(
                "Dangerously large frame count {}: deep frame-pointer walks are unreliable",
                self.frame_count
            );
        }
        Ok(())
    }

    pub fn input_delivery(&self) -> InputDelivery {
        self.target.input_delivery()
    }

    pub fn memory_limit_bytes(&self) -> Option<u64> {
        self.memory_limit_mb.map(|mb| mb.saturating_mul(1024 * 1024))
    }
}
