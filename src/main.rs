//! Mushroom Ensemble - CLI Entry Point
//!
//! Loads the configured backbones once, then classifies images, explains
//! predictions with Grad-CAM overlays, or reports model health. Results are
//! printed to stdout as JSON; logs go to stderr.

use anyhow::{Context, Result};
use base64::{engine::general_purpose, Engine};
use clap::{Parser, Subcommand};
use mushroom_ensemble::{
    config::{AppConfig, LoggingConfig},
    metrics::MetricsReporter,
    types::report::ErrorReport,
    EnsembleEngine, EnsembleError, EnsembleService, ImageUpload,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mushroom-ensemble", version, about = "Ensemble mushroom genus classifier")]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "config/config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Classify one image
    Predict {
        image: PathBuf,
        #[arg(long)]
        top_k: Option<usize>,
    },
    /// Classify several images, reported in input order
    Batch {
        #[arg(required = true)]
        images: Vec<PathBuf>,
        #[arg(long)]
        top_k: Option<usize>,
    },
    /// Grad-CAM overlays for one image
    Explain {
        image: PathBuf,
        /// Overlay opacity, clamped to [0, 1]
        #[arg(long)]
        alpha: Option<f32>,
        /// Restrict to one backbone
        #[arg(long)]
        model: Option<String>,
        /// Explain this class index instead of each backbone's top class
        #[arg(long)]
        target: Option<usize>,
        /// Write overlays as PNG files here instead of embedding them in the output
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
    /// Per-backbone load state
    Health,
    /// Ensemble description and class catalogue
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load_from_path(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    init_tracing(&config.logging)?;

    info!(
        config = %cli.config.display(),
        backbones = config.models.backbones.len(),
        classes = config.classes.labels.len(),
        "Starting Mushroom Ensemble"
    );

    // Weight loading is blocking I/O
    let engine = {
        let config = config.clone();
        Arc::new(tokio::task::spawn_blocking(move || EnsembleEngine::new(&config)).await?)
    };
    if !engine.is_ready() {
        warn!("No backbone loaded; predictions will fail");
    }

    let service = EnsembleService::new(engine.clone(), &config.inference);

    tokio::spawn(MetricsReporter::new(engine.metrics(), config.metrics.report_interval_secs).start());

    match cli.command {
        Command::Predict { image, top_k } => {
            let upload = read_image(&image)?;
            respond(service.predict(upload.bytes, top_k).await)
        }
        Command::Batch { images, top_k } => {
            let uploads = images
                .iter()
                .map(|path| read_image(path))
                .collect::<Result<Vec<_>>>()?;
            let result = service.predict_batch(uploads, top_k).await;
            engine.metrics().print_summary();
            respond(result)
        }
        Command::Explain {
            image,
            alpha,
            model,
            target,
            output_dir,
        } => {
            let upload = read_image(&image)?;
            let mut result = service.saliency(upload.bytes, alpha, model, target).await;
            if let (Ok(report), Some(dir)) = (&mut result, output_dir) {
                write_overlays(report, &image, &dir)?;
            }
            respond(result)
        }
        Command::Health => print_json(&engine.health()),
        Command::Info => {
            print_json(&engine.model_info())?;
            print_json(&engine.classes())
        }
    }
}

fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(format!("mushroom_ensemble={}", logging.level))
            .context("Invalid logging level")?,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

fn read_image(path: &Path) -> Result<ImageUpload> {
    ImageUpload::from_path(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print the report, or the error as JSON with a non-zero exit status
fn respond<T: Serialize>(result: std::result::Result<T, EnsembleError>) -> Result<()> {
    match result {
        Ok(report) => print_json(&report),
        Err(e) => {
            print_json(&ErrorReport::from(&e))?;
            std::process::exit(if e.is_client_error() { 2 } else { 1 });
        }
    }
}

fn write_overlays(
    report: &mut mushroom_ensemble::SaliencyReport,
    image: &Path,
    dir: &Path,
) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;
    let stem = image
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());

    for entry in report.explanations.iter_mut() {
        let Some(encoded) = entry.overlay_base64.take() else {
            continue;
        };
        let png = general_purpose::STANDARD
            .decode(encoded)
            .context("Overlay is not valid base64")?;
        let path = dir.join(format!("{}_{}.png", stem, entry.backbone));
        std::fs::write(&path, png).with_context(|| format!("Failed to write {}", path.display()))?;
        info!(backbone = %entry.backbone, path = %path.display(), "Overlay written");
    }
    Ok(())
}
