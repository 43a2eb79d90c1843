//! CLI entry point for aimr-train.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use aimr_common::{Backend, Generator, LatentSampler, TensorRuntime, TrainingConfig};
use aimr_train::data::ImageDataset;
use aimr_train::error::{config_error, IoResultExt, TrainError};
use aimr_train::logging::{init_console_logging, init_logging};
use aimr_train::preview::{save_png, PreviewImage};
use aimr_train::train::GanTrainer;
use anyhow::Context;
use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "aimr-train", about = "Train and sample the AiMR image GAN")]
struct Cli {
    /// Human-readable console logs instead of JSON
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train the generator and discriminator
    Train(TrainArgs),
    /// Write images sampled from a saved generator
    Generate(GenerateArgs),
}

#[derive(Args, Debug, Default)]
struct TrainArgs {
    /// TOML configuration file (CLI flags override its values)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Built-in preset: default, grayscale or tiny-cpu
    #[arg(long, default_value = "default")]
    preset: String,

    /// Binary dataset cache (read if present, written otherwise)
    #[arg(long)]
    dataset: Option<PathBuf>,

    /// Directory of .png/.jpg images used to build the dataset
    #[arg(long)]
    inputs: Option<PathBuf>,

    /// Maximum number of images in the dataset
    #[arg(long)]
    dataset_size: Option<usize>,

    /// Image channels (1 = grayscale, 3 = rgb)
    #[arg(long)]
    channels: Option<usize>,

    /// Number of epochs (omit to train until interrupted)
    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    learning_rate: Option<f64>,

    /// Seed for weights, latents and shuffling
    #[arg(long)]
    seed: Option<u64>,

    /// Directory for scalar metrics
    #[arg(long)]
    tensorboard: Option<PathBuf>,

    /// Live preview image (must end in .png)
    #[arg(long)]
    preview: Option<PathBuf>,

    /// Checkpoint directory
    #[arg(long)]
    checkpoints: Option<PathBuf>,

    /// Resume from the checkpoint directory if it holds a checkpoint
    #[arg(long)]
    recover: bool,

    /// Batches between checkpoints (0 = epoch boundaries only)
    #[arg(long)]
    checkpoint_interval: Option<usize>,

    /// Batches between log lines
    #[arg(long)]
    log_interval: Option<usize>,

    /// Device (cpu, cuda or cuda:N)
    #[arg(long, default_value = "cpu")]
    device: String,
}

#[derive(Args, Debug)]
struct GenerateArgs {
    /// Generator directory (model.json + weights.safetensors)
    #[arg(long)]
    model: PathBuf,

    /// Number of images
    #[arg(long, short = 'n', default_value = "1")]
    count: usize,

    /// Output directory
    #[arg(long, default_value = "samples")]
    output: PathBuf,

    #[arg(long)]
    seed: Option<u64>,

    /// Device (cpu, cuda or cuda:N)
    #[arg(long, default_value = "cpu")]
    device: String,
}

fn resolve_preset(name: &str) -> Option<TrainingConfig> {
    match name {
        "default" | "rgb" => Some(TrainingConfig::default()),
        "grayscale" | "gray" => Some(TrainingConfig::grayscale()),
        "tiny-cpu" | "tiny_cpu" => Some(TrainingConfig::tiny_cpu()),
        _ => None,
    }
}

fn apply_overrides(cfg: &mut TrainingConfig, args: &TrainArgs) {
    if let Some(v) = &args.dataset {
        cfg.dataset_path = Some(v.clone());
    }
    if let Some(v) = &args.inputs {
        cfg.inputs_path = Some(v.clone());
    }
    if let Some(v) = args.dataset_size {
        cfg.dataset_size = v;
    }
    if let Some(v) = args.channels {
        cfg.channels = v;
    }
    if let Some(v) = args.epochs {
        cfg.epochs = Some(v);
    }
    if let Some(v) = args.batch_size {
        cfg.batch_size = v;
    }
    if let Some(v) = args.learning_rate {
        cfg.learning_rate = v;
    }
    if let Some(v) = args.seed {
        cfg.seed = Some(v);
    }
    if let Some(v) = &args.tensorboard {
        cfg.tensorboard_path = Some(v.clone());
    }
    if let Some(v) = &args.preview {
        cfg.preview_path = Some(v.clone());
    }
    if let Some(v) = &args.checkpoints {
        cfg.checkpoint_dir = Some(v.clone());
    }
    if args.recover {
        cfg.recover = true;
    }
    if let Some(v) = args.checkpoint_interval {
        cfg.checkpoint_interval = v;
    }
    if let Some(v) = args.log_interval {
        cfg.log_interval = v;
    }
}

fn resolve_config(args: &TrainArgs) -> Result<TrainingConfig, TrainError> {
    let mut cfg = match &args.config {
        Some(path) => TrainingConfig::from_toml_file(path)?,
        None => resolve_preset(&args.preset).ok_or_else(|| {
            config_error(format!(
                "Unknown preset: {}. Use default, grayscale, or tiny-cpu.",
                args.preset
            ))
        })?,
    };
    apply_overrides(&mut cfg, args);
    cfg.validate()
        .map_err(|errors| config_error(errors.join("; ")))?;
    Ok(cfg)
}

fn resolve_runtime(device: &str) -> Result<Arc<dyn TensorRuntime>, TrainError> {
    let backend: Backend = device.parse()?;
    Ok(Arc::new(backend.runtime()?))
}

fn run_train(args: TrainArgs) -> anyhow::Result<()> {
    let cfg = resolve_config(&args)?;
    let runtime = resolve_runtime(&args.device)?;

    tracing::info!("=== aimr-train ===");
    tracing::info!("Device: {}", runtime.name());
    tracing::info!(
        "Image: {}x{}x{}, latent {}",
        cfg.image_size,
        cfg.image_size,
        cfg.channels,
        cfg.latent_size
    );
    tracing::info!("Batch size: {}", cfg.batch_size);
    match cfg.epochs {
        Some(n) => tracing::info!("Epochs: {}", n),
        None => tracing::info!("Epochs: unbounded (Ctrl-C to stop)"),
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })
    .context("installing interrupt handler")?;

    let mut trainer = GanTrainer::new(cfg, runtime)?;
    let dataset = ImageDataset::open(&trainer.config, trainer.runtime())?;
    tracing::info!("Dataset: {} samples", dataset.len());

    let summary = trainer.train(&dataset, &shutdown)?;
    if summary.interrupted {
        tracing::info!("Interrupted after {} steps", summary.steps);
    }
    Ok(())
}

fn run_generate(args: GenerateArgs) -> anyhow::Result<()> {
    if args.count == 0 {
        return Err(config_error("--count must be > 0").into());
    }
    let runtime = resolve_runtime(&args.device)?;
    let generator = Generator::load(&args.model, runtime.device()).map_err(TrainError::from)?;
    let topology = generator.topology().clone();

    let mut latents = LatentSampler::new(topology.latent_size, args.seed);
    let z = latents
        .sample(args.count, runtime.device())
        .map_err(TrainError::from)?;
    let images = generator.forward(&z, false).map_err(TrainError::from)?;

    std::fs::create_dir_all(&args.output).with_path(&args.output)?;
    for i in 0..args.count {
        let image = PreviewImage::from_tensor(&images.narrow(0, i, 1)?, topology.image_size)?;
        let path = args.output.join(format!("sample_{:04}.png", i));
        save_png(&path, &image)?;
        tracing::info!(path = %path.display(), "image written");
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    if cli.verbose {
        init_console_logging();
    } else {
        init_logging();
    }

    let result = match cli.command {
        Commands::Train(args) => run_train(args),
        Commands::Generate(args) => run_generate(args),
    };

    if let Err(err) = result {
        tracing::error!("{:#}", err);
        let code = err
            .downcast_ref::<TrainError>()
            .map(TrainError::exit_code)
            .unwrap_or(1);
        std::process::exit(code);
    }
}
