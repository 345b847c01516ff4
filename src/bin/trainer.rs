use anyhow::{Context, Result};
use clap::Parser;
use hybridrec::services::training::store::FileModelStore;
use hybridrec::services::training::ModelService;
use hybridrec::{init_tracing, Config, RatingSample, TrainOptions};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "config/default.toml")]
    config: String,

    /// JSON-lines file, one rating sample per line.
    #[arg(short, long)]
    input: String,

    /// Version name to save under. Defaults to a timestamp.
    #[arg(long)]
    model_version: Option<String>,

    #[arg(short, long)]
    epochs: Option<usize>,

    #[arg(short, long, default_value = "info")]
    log_level: String,
}

async fn read_samples(path: &str) -> Result<Vec<RatingSample>> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading samples from {}", path))?;

    let mut samples = Vec::new();
    for (line_no, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<RatingSample>(line) {
            Ok(sample) => samples.push(sample),
            Err(e) => warn!("Skipping line {}: {}", line_no + 1, e),
        }
    }
    Ok(samples)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    std::env::set_var("RUST_LOG", &args.log_level);
    init_tracing().await;

    let config = if std::path::Path::new(&args.config).exists() {
        Config::from_file(&args.config)?
    } else {
        info!("Config file not found, using default configuration");
        Config::default()
    };
    info!("Training configuration: {:?}", config.training);

    let samples = read_samples(&args.input).await?;
    if samples.is_empty() {
        anyhow::bail!("no usable rating samples in {}", args.input);
    }
    info!("Loaded {} rating samples", samples.len());

    let training = &config.training;
    let model = ModelService::new(training.clone()).with_store(Arc::new(FileModelStore::new(&training.model_dir)));
    model.build_default()?;

    let options = TrainOptions {
        epochs: args.epochs.unwrap_or(training.epochs),
        batch_size: training.batch_size,
        validation_split: training.validation_split,
        learning_rate: None,
    };
    let report = model.batch_train(samples, options).await?;

    for epoch in &report.epochs {
        match epoch.validation_loss {
            Some(validation) => info!(
                "Epoch {}: train loss {:.4}, validation loss {:.4}",
                epoch.epoch, epoch.train_loss, validation
            ),
            None => info!("Epoch {}: train loss {:.4}", epoch.epoch, epoch.train_loss),
        }
    }
    if report.samples_skipped > 0 {
        warn!(
            "{} samples skipped because model capacity was exhausted",
            report.samples_skipped
        );
    }

    let version = model.save(args.model_version).await?;
    let stats = model.stats();
    info!(
        "Saved model {}: {} users, {} items, {} ratings seen",
        version, stats.users, stats.items, stats.ratings_seen
    );

    Ok(())
}
