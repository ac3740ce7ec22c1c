use bucketeer_core::bucket::OutputRoot;
use bucketeer_core::config::{ConfigFile, InputDelivery, TargetCommand, TriageConfig};
use bucketeer_core::corpus::scan_input_dir;
use bucketeer_core::driver::BatchDriver;
use bucketeer_core::executor::PtraceExecutor;
use bucketeer_core::signals;

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::time::Instant;

const DEFAULT_CONFIG_FILE: &str = "bucketeer.toml";

/// Replays crashing inputs under ptrace and buckets them by stack fingerprint.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// TOML config file; defaults to ./bucketeer.toml when present.
    #[clap(short, long, value_parser)]
    config: Option<PathBuf>,
    /// Directory of inputs to replay.
    #[clap(short, long, value_parser)]
    input: Option<PathBuf>,
    /// Root directory for crash buckets.
    #[clap(short, long, value_parser)]
    output: Option<PathBuf>,
    /// Per-run timeout in milliseconds (0 disables it).
    #[clap(short, long)]
    timeout_ms: Option<u64>,
    /// Address-space limit for the target, in MiB.
    #[clap(short, long)]
    memory_limit_mb: Option<u64>,
    /// Number of stack frames in each fingerprint.
    #[clap(short, long)]
    frames: Option<usize>,
    /// Target command; an `@@` argument is replaced by the input path,
    /// otherwise the input is fed on stdin.
    #[clap(trailing_var_arg = true, allow_hyphen_values = true)]
    target: Vec<String>,
}

impl Cli {
    fn load_config(self) -> anyhow::Result<TriageConfig> {
        let mut file = match &self.config {
            Some(config_path) => {
                log::info!("Loading configuration from {config_path:?}");
                ConfigFile::load_from_file(config_path)?
            }
            None => {
                let default_config_path = PathBuf::from(DEFAULT_CONFIG_FILE);
                if default_config_path.exists() {
                    log::info!("Loading default configuration from {default_config_path:?}");
                    ConfigFile::load_from_file(&default_config_path)?
                } else {
                    ConfigFile::default()
                }
            }
        };

        if let Some(input) = self.input {
            file.input_dir = Some(input);
        }
        if let Some(output) = self.output {
            file.output_dir = Some(output);
        }
        if let Some(timeout_ms) = self.timeout_ms {
            file.timeout_ms = Some(timeout_ms);
        }
        if let Some(memory_limit_mb) = self.memory_limit_mb {
            file.memory_limit_mb = Some(memory_limit_mb);
        }
        if let Some(frames) = self.frames {
            file.frame_count = Some(frames);
        }
        if let Some(target) = TargetCommand::from_command_line(&self.target) {
            file.target = Some(target);
        }

        Ok(file.into_config()?)
    }
}

fn log_config(config: &TriageConfig) {
    log::info!("Input directory:  {:?}", config.input_dir);
    log::info!("Output directory: {:?}", config.output_dir);
    match config.timeout_ms {
        0 => log::info!("Timeout:          none"),
        ms => log::info!("Timeout:          {ms} ms"),
    }
    match config.memory_limit_mb {
        Some(mb) => log::info!("Memory limit:     {mb} MiB"),
        None => log::info!("Memory limit:     none"),
    }
    log::info!("Stack frames:     {}", config.frame_count);
    log::info!("Target:           {}", config.target.display_command_line());
    match config.input_delivery() {
        InputDelivery::Stdin => log::info!("Input delivery:   stdin"),
        InputDelivery::Argument(slot) => {
            log::info!("Input delivery:   argument {}", slot + 1)
        }
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Cli::parse().load_config()?;
    log_config(&config);

    signals::install().context("Failed to install signal handlers")?;
    let output = OutputRoot::create_locked(&config.output_dir)?;
    let entries = scan_input_dir(&config.input_dir)?;
    log::info!(
        "Replaying {} inputs from {:?}",
        entries.len(),
        config.input_dir
    );

    let start_time = Instant::now();
    let mut driver = BatchDriver::new(PtraceExecutor::new(&config), output, config.frame_count);
    let summary = driver.run(&entries)?;

    log::info!("Finished in {:.2?}: {summary}", start_time.elapsed());
    for bucket in &summary.buckets {
        log::info!("  {}", driver.output().path().join(bucket).display());
    }

    Ok(())
}
