//! CLI entry point for DeepCINET training.
//!
//! Subcommands:
//!   train  -- Train one configuration and write its report and best checkpoint
//!   test   -- Score a held-out table with a saved checkpoint
//!   tune   -- Random hyperparameter search over concurrent trials

use anyhow::Context;
use cinet_core::{load_config, ExperimentConfig, LoggingConfig};
use cinet_model::{select_device, RankingNetwork};
use cinet_trainer::prelude::*;
use cinet_trainer::training::trainer::BEST_CHECKPOINT;
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "train-cinet", about = "DeepCINET pairwise drug-response ranking")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// Options shared by every subcommand.
#[derive(Args)]
struct Common {
    /// CSV table: sample id first, then the response column and features.
    #[arg(long)]
    data: PathBuf,

    /// Experiment YAML.
    #[arg(long)]
    config: PathBuf,

    /// Run on CPU even when an accelerator is available.
    #[arg(long)]
    cpu: bool,

    /// Override the number of batch assembly threads.
    #[arg(long)]
    workers: Option<usize>,

    /// Override the mini-batch size.
    #[arg(long)]
    batch_size: Option<usize>,
}

#[derive(Subcommand)]
enum Command {
    /// Train one configuration.
    Train {
        #[command(flatten)]
        common: Common,

        /// Output directory for report.json and best.safetensors.
        #[arg(long, default_value = "runs/cinet")]
        output: PathBuf,

        /// Override the maximum number of epochs.
        #[arg(long)]
        epochs: Option<usize>,

        /// Override the random seed.
        #[arg(long)]
        seed: Option<u64>,

        /// Override the pair threshold.
        #[arg(long)]
        delta: Option<f32>,
    },

    /// Score every sample of a held-out table.
    Test {
        #[command(flatten)]
        common: Common,

        /// Checkpoint written by `train`.
        #[arg(long)]
        model: PathBuf,

        /// Prediction CSV path.
        #[arg(long, default_value = "predictions.csv")]
        output: PathBuf,
    },

    /// Random hyperparameter search.
    Tune {
        #[command(flatten)]
        common: Common,

        /// Number of trials.
        #[arg(long, default_value = "20")]
        samples: usize,

        /// Trials running at the same time.
        #[arg(long, default_value = "2")]
        concurrency: usize,

        /// Output path for the trial summary.
        #[arg(long, default_value = "runs/cinet/tune.json")]
        output: PathBuf,
    },
}

fn init_logging(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    match logging.format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        _ => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

/// Load the YAML config and apply the shared CLI overrides.
fn load_experiment(common: &Common) -> anyhow::Result<ExperimentConfig> {
    let mut config = load_config(&common.config)
        .with_context(|| format!("loading {}", common.config.display()))?;
    if let Some(workers) = common.workers {
        config.training.num_workers = workers;
    }
    if let Some(batch_size) = common.batch_size {
        config.training.batch_size = batch_size;
    }
    Ok(config)
}

fn load_table(common: &Common, config: &ExperimentConfig) -> anyhow::Result<SampleTable> {
    let table = SampleTable::from_csv(&common.data, &config.training.response_column)
        .with_context(|| format!("reading {}", common.data.display()))?;
    tracing::info!(
        samples = table.len(),
        features = table.width(),
        "Loaded sample table"
    );
    Ok(table)
}

fn train(
    common: &Common,
    output: &Path,
    epochs: Option<usize>,
    seed: Option<u64>,
    delta: Option<f32>,
) -> anyhow::Result<()> {
    let mut config = load_experiment(common)?;
    init_logging(&config.logging);
    if let Some(epochs) = epochs {
        config.training.max_epochs = epochs;
    }
    if let Some(seed) = seed {
        config.training.seed = seed;
    }
    if let Some(delta) = delta {
        config.training.delta = delta;
    }
    if config.training.checkpoint_dir.is_none() {
        config.training.checkpoint_dir = Some(output.to_string_lossy().into_owned());
    }
    config.validate()?;

    let table = load_table(common, &config)?;
    let device = select_device(common.cpu);
    let outcome = run_trial(&config.network, &table, &config.training, &device)?;

    let report_path = output.join("report.json");
    outcome.report.write_json(&report_path)?;

    println!("Best val CI:   {:.4}", outcome.best_ci);
    println!("Best val loss: {:.4}", outcome.best_loss);
    println!(
        "Epochs: {} ({:?}), steps: {}",
        outcome.report.epochs, outcome.report.stop_reason, outcome.report.t_steps
    );
    println!("Report: {}", report_path.display());
    if let Some(dir) = &config.training.checkpoint_dir {
        println!("Model:  {}", Path::new(dir).join(BEST_CHECKPOINT).display());
    }
    Ok(())
}

fn test(common: &Common, model: &Path, output: &Path) -> anyhow::Result<()> {
    let config = load_experiment(common)?;
    init_logging(&config.logging);

    let table = load_table(common, &config)?;
    let device = select_device(common.cpu);
    let network = RankingNetwork::load(&config.network, model, &device)?;
    let predictions = evaluate_table(&network, &table, &config.training, &device)?;
    write_predictions_csv(output, &predictions)?;

    println!("Wrote {} predictions to {}", predictions.len(), output.display());
    Ok(())
}

async fn tune_cmd(
    common: &Common,
    samples: usize,
    concurrency: usize,
    output: &Path,
) -> anyhow::Result<()> {
    let config = load_experiment(common)?;
    init_logging(&config.logging);

    let table = Arc::new(load_table(common, &config)?);
    let base = cinet_core::NetworkConfig {
        dat_size: table.width(),
        ..config.network.clone()
    };
    let options = TuneOptions {
        samples,
        concurrency,
        seed: config.training.seed,
    };
    let device = select_device(common.cpu);
    let summary = tune(
        table,
        &base,
        &config.training,
        &SearchSpace::default(),
        &options,
        &device,
    )
    .await?;

    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(output, serde_json::to_string_pretty(&summary)?)?;

    println!(
        "{} trials, {} failed. Summary: {}",
        summary.trials.len(),
        summary.failed(),
        output.display()
    );
    match summary.best() {
        Some(best) => {
            println!(
                "Best trial {}: CI={:.4} loss={:.4}",
                best.trial,
                best.best_ci.unwrap_or_default(),
                best.best_loss.unwrap_or_default()
            );
            println!("{}", serde_yaml::to_string(&best.config)?);
        }
        None => anyhow::bail!("every trial failed"),
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match &cli.command {
        Command::Train {
            common,
            output,
            epochs,
            seed,
            delta,
        } => train(common, output, *epochs, *seed, *delta),
        Command::Test {
            common,
            model,
            output,
        } => test(common, model, output),
        Command::Tune {
            common,
            samples,
            concurrency,
            output,
        } => tune_cmd(common, *samples, *concurrency, output).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
