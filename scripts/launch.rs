use anyhow::{Context, Result};
use clap::Parser;
use std::env;
use std::path::PathBuf;
use std::process::{exit, Command};
use tracing::info;
use tracing_subscriber::EnvFilter;

use vr::launch::{compose_args, trainer_path, Preset, DATA_DIR_ENV};

#[derive(Debug, Parser)]
#[command(author, version, about = "Launch vr-train with a preset configuration")]
struct Args {
    /// Preset flag set
    #[arg(value_enum)]
    preset: Preset,

    /// Extra trainer flags, appended after the preset defaults
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    forwarded: Vec<String>,
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let data_dir = env::var_os(DATA_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("data"));
    let launcher = env::current_exe().context("Failed to locate the launcher executable")?;
    let trainer = trainer_path(&launcher);
    let trainer_args = compose_args(args.preset, &data_dir, &args.forwarded);

    info!("Running {:?} with {} arguments", trainer, trainer_args.len());
    let status = Command::new(&trainer)
        .args(&trainer_args)
        .status()
        .with_context(|| format!("Failed to run trainer {:?}", trainer))?;

    exit(status.code().unwrap_or(1));
}
