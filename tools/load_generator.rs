//! Synthetic Load Generator
//!
//! Generates random JPEG/PNG/WEBP images (plus an occasional corrupt upload)
//! and drives them through the ensemble service concurrently.

use anyhow::{Context, Result};
use clap::Parser;
use futures::StreamExt;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use mushroom_ensemble::{AppConfig, EnsembleEngine, EnsembleService};
use rand::Rng;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "load_generator", about = "Drive synthetic images through the ensemble")]
struct Args {
    #[arg(short, long, default_value = "config/config.toml")]
    config: PathBuf,
    /// Number of requests to send
    #[arg(short = 'n', long, default_value_t = 100)]
    count: usize,
    /// Requests in flight at once
    #[arg(long, default_value_t = 8)]
    concurrency: usize,
    /// Fraction of uploads replaced by random bytes
    #[arg(long, default_value_t = 0.05)]
    corrupt_rate: f64,
    /// Fraction of requests that also ask for saliency overlays
    #[arg(long, default_value_t = 0.1)]
    saliency_rate: f64,
}

/// Random image generator
struct ImageGenerator {
    rng: rand::rngs::ThreadRng,
}

impl ImageGenerator {
    fn new() -> Self {
        Self {
            rng: rand::thread_rng(),
        }
    }

    /// A blob of colour over a noisy background, encoded in a random format
    fn generate(&mut self) -> Result<Vec<u8>> {
        let width = self.rng.gen_range(96..640);
        let height = self.rng.gen_range(96..640);
        let cap: [u8; 3] = self.rng.gen();
        let ground: [u8; 3] = self.rng.gen();
        let (cx, cy) = (width as f32 / 2.0, height as f32 / 3.0);
        let radius = width.min(height) as f32 / self.rng.gen_range(2.5..5.0);

        let mut image = RgbImage::from_pixel(width, height, Rgb(ground));
        for (x, y, pixel) in image.enumerate_pixels_mut() {
            let d = ((x as f32 - cx).powi(2) + (y as f32 - cy).powi(2)).sqrt();
            if d < radius {
                *pixel = Rgb(cap);
            } else if self.rng.gen_bool(0.1) {
                *pixel = Rgb(self.rng.gen());
            }
        }

        let format = self.random_choice(&[ImageFormat::Jpeg, ImageFormat::Png, ImageFormat::WebP]);
        let mut bytes = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(image)
            .write_to(&mut bytes, format)
            .with_context(|| format!("Failed to encode {:?}", format))?;
        Ok(bytes.into_inner())
    }

    fn corrupt(&mut self) -> Vec<u8> {
        let len = self.rng.gen_range(8..256);
        (0..len).map(|_| self.rng.gen()).collect()
    }

    fn random_choice<T: Copy>(&mut self, choices: &[T]) -> T {
        choices[self.rng.gen_range(0..choices.len())]
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("load_generator=info".parse()?),
        )
        .init();

    let args = Args::parse();
    info!(
        count = args.count,
        concurrency = args.concurrency,
        corrupt_rate = args.corrupt_rate,
        saliency_rate = args.saliency_rate,
        "Starting load generator"
    );

    let config = AppConfig::load_from_path(&args.config)?;
    let engine = {
        let config = config.clone();
        Arc::new(tokio::task::spawn_blocking(move || EnsembleEngine::new(&config)).await?)
    };
    if !engine.is_ready() {
        warn!("No backbone loaded; every request will fail with no_valid_predictions");
    }
    let service = EnsembleService::new(engine.clone(), &config.inference);

    // Generate everything up front so encoding time is not measured
    let mut generator = ImageGenerator::new();
    let mut rng = rand::thread_rng();
    let mut requests = Vec::with_capacity(args.count);
    for _ in 0..args.count {
        let bytes = if rng.gen_bool(args.corrupt_rate.clamp(0.0, 1.0)) {
            generator.corrupt()
        } else {
            generator.generate()?
        };
        requests.push((bytes, rng.gen_bool(args.saliency_rate.clamp(0.0, 1.0))));
    }

    let started = Instant::now();
    let outcomes: Vec<bool> = futures::stream::iter(requests)
        .map(|(bytes, explain)| {
            let service = service.clone();
            async move {
                if explain {
                    service.saliency(bytes, None, None, None).await.is_ok()
                } else {
                    service.predict(bytes, None).await.is_ok()
                }
            }
        })
        .buffer_unordered(args.concurrency.max(1))
        .collect()
        .await;

    let elapsed = started.elapsed();
    let succeeded = outcomes.iter().filter(|ok| **ok).count();
    info!(
        sent = outcomes.len(),
        succeeded = succeeded,
        failed = outcomes.len() - succeeded,
        elapsed_ms = elapsed.as_millis() as u64,
        rate = format!("{:.1} req/s", outcomes.len() as f64 / elapsed.as_secs_f64().max(1e-9)),
        "Load generation complete"
    );

    engine.metrics().print_summary();
    Ok(())
}
