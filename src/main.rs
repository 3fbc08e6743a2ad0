use anyhow::Result;
use burn::backend::Autodiff;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use vr::checkpoint::list_checkpoints;
use vr::cli::{Cli, Commands, EvalArgs, ListArgs, TrainArgs};
use vr::training::{run_evaluation, run_training};

#[cfg(feature = "wgpu-backend")]
type InferenceBackend = burn_wgpu::Wgpu;
#[cfg(all(feature = "tch-backend", not(feature = "wgpu-backend")))]
type InferenceBackend = burn_tch::LibTorch<f32>;
#[cfg(not(any(feature = "wgpu-backend", feature = "tch-backend")))]
type InferenceBackend = burn_ndarray::NdArray<f32>;

type Backend = Autodiff<InferenceBackend>;

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train(args) => train_command(args),
        Commands::Eval(args) => eval_command(args),
        Commands::List(args) => list_command(args),
    }
}

fn train_command(args: TrainArgs) -> Result<()> {
    if let Some(path) = &args.config {
        info!("Loading configuration from: {:?}", path);
    }
    let config = args.into_config()?;

    // default device of the selected backend
    let device = Default::default();
    let stats = run_training::<Backend>(config, &device)?;
    info!(
        "Best val accuracy {:.4} at iteration {}",
        stats.best_val_acc, stats.best_model_t
    );
    Ok(())
}

fn eval_command(args: EvalArgs) -> Result<()> {
    let device = Default::default();
    let accuracy = run_evaluation::<InferenceBackend>(
        &args.checkpoint,
        &args.question_h5,
        &args.features_h5,
        args.num_samples,
        &device,
    )?;
    println!("{:.4}", accuracy);
    Ok(())
}

fn list_command(args: ListArgs) -> Result<()> {
    let checkpoints = list_checkpoints(&args.dir)?;
    if checkpoints.is_empty() {
        info!("No checkpoints found in {:?}", args.dir);
    }
    for (path, iteration, best_val_acc) in checkpoints {
        println!("{}\titeration={}\tbest_val_acc={:.4}", path.display(), iteration, best_val_acc);
    }
    Ok(())
}
