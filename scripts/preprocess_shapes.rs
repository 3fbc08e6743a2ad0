use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use vr::datasets::shapes::{preprocess, ProgramType};

#[derive(Debug, Parser)]
#[command(author, version, about = "Convert the SHAPES dataset into training stores")]
struct Args {
    /// Path to the SHAPES dataset
    #[arg(long = "shapes_data")]
    shapes_data: PathBuf,

    /// Which version of the training set to use (e.g. `tiny`, `small`, `med`, `large`)
    #[arg(long)]
    size: String,

    /// Which programs to store with the questions
    #[arg(long, value_enum, default_value = "chain")]
    programs: ProgramType,

    /// Output directory
    #[arg(long, default_value = ".")]
    output: PathBuf,
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
    info!("Preprocessing SHAPES from {:?} into {:?}", args.shapes_data, args.output);

    let vocab = preprocess(&args.shapes_data, &args.size, args.programs, &args.output)?;
    info!("Done: {} answers", vocab.num_answers());
    Ok(())
}
