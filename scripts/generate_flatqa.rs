use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use vr::datasets::flatqa::{generate_all, FlatQaOptions, Split};

#[derive(Debug, Parser)]
#[command(author, version, about = "Generate the FlatQA dataset")]
struct Args {
    /// Size of the training set
    #[arg(long, default_value_t = 1000)]
    train: usize,

    /// Size of the development set
    #[arg(long, default_value_t = 100)]
    val: usize,

    /// Size of the test set
    #[arg(long, default_value_t = 100)]
    test: usize,

    #[arg(long = "image-size", default_value_t = 50)]
    image_size: u32,

    /// The split to use
    #[arg(long, value_enum, default_value = "none")]
    split: Split,

    /// Keep held-out objects out of training scenes (0 or 1)
    #[arg(long = "restrict-scene", default_value_t = 1)]
    restrict_scene: u8,

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
    let options = FlatQaOptions {
        train: args.train,
        val: args.val,
        test: args.test,
        image_size: args.image_size,
        split: args.split,
        restrict_scene: args.restrict_scene != 0,
    };
    info!("Generating FlatQA: {:?}", options);

    generate_all(&options, &args.output)?;
    info!("Dataset written to {:?}", args.output);
    Ok(())
}
