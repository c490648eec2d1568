//! Performance metrics and statistics tracking for the ensemble engine.

use crate::error::ErrorKind;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::info;

/// Metrics collector for engine performance
pub struct EngineMetrics {
    /// Successful fused predictions
    pub predictions: AtomicU64,
    /// Fused predictions whose top genus is poisonous
    pub toxic_predictions: AtomicU64,
    /// Fused predictions flagged as implausible
    pub implausible_predictions: AtomicU64,
    /// Saliency maps rendered
    pub saliency_maps: AtomicU64,
    /// Failed requests by error kind
    failures: RwLock<HashMap<ErrorKind, u64>>,
    /// Request processing times (in microseconds)
    processing_times: RwLock<Vec<u64>>,
    /// Per-backbone inference times (in microseconds)
    backbone_times: RwLock<HashMap<String, Vec<u64>>>,
    /// Fused top-confidence distribution, 10-point buckets
    confidence_buckets: RwLock<[u64; 10]>,
    /// Fraction of backbones agreeing with the fused label, per request
    agreements: RwLock<Vec<f64>>,
    start_time: Instant,
}

/// Keep the most recent half once a sample buffer exceeds `limit`
fn push_bounded<T>(samples: &mut Vec<T>, value: T, limit: usize) {
    samples.push(value);
    if samples.len() > limit {
        samples.drain(0..limit / 2);
    }
}

fn percentile(sorted: &[u64], q: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let index = ((sorted.len() as f64 * q) as usize).min(sorted.len() - 1);
    sorted[index]
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            predictions: AtomicU64::new(0),
            toxic_predictions: AtomicU64::new(0),
            implausible_predictions: AtomicU64::new(0),
            saliency_maps: AtomicU64::new(0),
            failures: RwLock::new(HashMap::new()),
            processing_times: RwLock::new(Vec::with_capacity(1000)),
            backbone_times: RwLock::new(HashMap::new()),
            confidence_buckets: RwLock::new([0; 10]),
            agreements: RwLock::new(Vec::with_capacity(1000)),
            start_time: Instant::now(),
        }
    }

    /// Record a fused prediction
    pub fn record_prediction(
        &self,
        processing_time: Duration,
        confidence: f64,
        is_poisonous: bool,
        is_likely_mushroom: bool,
    ) {
        self.predictions.fetch_add(1, Ordering::Relaxed);
        if is_poisonous {
            self.toxic_predictions.fetch_add(1, Ordering::Relaxed);
        }
        if !is_likely_mushroom {
            self.implausible_predictions.fetch_add(1, Ordering::Relaxed);
        }

        if let Ok(mut times) = self.processing_times.write() {
            push_bounded(&mut times, processing_time.as_micros() as u64, 10_000);
        }

        let bucket = ((confidence / 10.0).max(0.0) as usize).min(9);
        if let Ok(mut buckets) = self.confidence_buckets.write() {
            buckets[bucket] += 1;
        }
    }

    pub fn record_failure(&self, kind: ErrorKind) {
        if let Ok(mut failures) = self.failures.write() {
            *failures.entry(kind).or_insert(0) += 1;
        }
    }

    pub fn record_saliency(&self, maps: usize) {
        self.saliency_maps.fetch_add(maps as u64, Ordering::Relaxed);
    }

    /// Record one backbone's inference time
    pub fn record_backbone_time(&self, backbone: &str, duration: Duration) {
        if let Ok(mut times) = self.backbone_times.write() {
            let samples = times.entry(backbone.to_string()).or_default();
            push_bounded(samples, duration.as_micros() as u64, 1000);
        }
    }

    /// Record how many backbones agreed with the fused label (0.0 - 1.0)
    pub fn record_agreement(&self, agreement: f64) {
        if let Ok(mut agreements) = self.agreements.write() {
            push_bounded(&mut agreements, agreement, 1000);
        }
    }

    pub fn get_processing_stats(&self) -> ProcessingStats {
        let Ok(times) = self.processing_times.read() else {
            return ProcessingStats::default();
        };
        if times.is_empty() {
            return ProcessingStats::default();
        }

        let mut sorted = times.clone();
        sorted.sort_unstable();
        let count = sorted.len();

        ProcessingStats {
            count: count as u64,
            mean_us: sorted.iter().sum::<u64>() / count as u64,
            p50_us: percentile(&sorted, 0.5),
            p95_us: percentile(&sorted, 0.95),
            p99_us: percentile(&sorted, 0.99),
            max_us: sorted[count - 1],
        }
    }

    pub fn get_backbone_stats(&self) -> HashMap<String, BackboneStats> {
        let Ok(times) = self.backbone_times.read() else {
            return HashMap::new();
        };

        times
            .iter()
            .filter(|(_, samples)| !samples.is_empty())
            .map(|(backbone, samples)| {
                let mut sorted = samples.clone();
                sorted.sort_unstable();
                let count = sorted.len();
                (
                    backbone.clone(),
                    BackboneStats {
                        calls: count as u64,
                        mean_us: sorted.iter().sum::<u64>() / count as u64,
                        p50_us: percentile(&sorted, 0.5),
                        p99_us: percentile(&sorted, 0.99),
                    },
                )
            })
            .collect()
    }

    pub fn get_avg_agreement(&self) -> f64 {
        match self.agreements.read() {
            Ok(agreements) if !agreements.is_empty() => {
                agreements.iter().sum::<f64>() / agreements.len() as f64
            }
            _ => 0.0,
        }
    }

    /// Predictions per second since start
    pub fn get_throughput(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.predictions.load(Ordering::Relaxed) as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn get_confidence_distribution(&self) -> [u64; 10] {
        self.confidence_buckets
            .read()
            .map(|b| *b)
            .unwrap_or([0; 10])
    }

    pub fn get_failures(&self) -> HashMap<ErrorKind, u64> {
        self.failures
            .read()
            .map(|f| f.clone())
            .unwrap_or_default()
    }

    pub fn total_failures(&self) -> u64 {
        self.get_failures().values().sum()
    }

    /// Log summary statistics
    pub fn print_summary(&self) {
        let predictions = self.predictions.load(Ordering::Relaxed);
        let toxic = self.toxic_predictions.load(Ordering::Relaxed);
        let implausible = self.implausible_predictions.load(Ordering::Relaxed);
        let toxic_rate = if predictions > 0 {
            (toxic as f64 / predictions as f64) * 100.0
        } else {
            0.0
        };

        let processing = self.get_processing_stats();
        let distribution = self.get_confidence_distribution();

        info!("╔══════════════════════════════════════════════════════════════╗");
        info!("║            MUSHROOM ENSEMBLE ENGINE - METRICS SUMMARY        ║");
        info!("╠══════════════════════════════════════════════════════════════╣");
        info!(
            "║ Predictions:        {:>8}  │  Throughput: {:>6.2} img/s    ║",
            predictions,
            self.get_throughput()
        );
        info!(
            "║ Poisonous top-1:    {:>8}  │  Rate: {:>6.1}%               ║",
            toxic, toxic_rate
        );
        info!(
            "║ Implausible inputs: {:>8}  │  Saliency maps: {:>8}     ║",
            implausible,
            self.saliency_maps.load(Ordering::Relaxed)
        );
        info!("╠══════════════════════════════════════════════════════════════╣");
        info!(
            "║ Processing (ms): mean={:>6.1} p50={:>6.1} p95={:>6.1} p99={:>6.1} ║",
            processing.mean_us as f64 / 1000.0,
            processing.p50_us as f64 / 1000.0,
            processing.p95_us as f64 / 1000.0,
            processing.p99_us as f64 / 1000.0
        );
        info!(
            "║ Backbone agreement: {:>5.1}%                                   ║",
            self.get_avg_agreement() * 100.0
        );

        let failures = self.get_failures();
        if !failures.is_empty() {
            info!("╠══════════════════════════════════════════════════════════════╣");
            info!("║ Failures by kind:                                            ║");
            for (kind, count) in &failures {
                info!("║   {:22}: {:>6}                              ║", kind.as_str(), count);
            }
        }

        info!("╠══════════════════════════════════════════════════════════════╣");
        info!("║ Top Confidence Distribution:                                 ║");
        let total: u64 = distribution.iter().sum();
        for (i, &count) in distribution.iter().enumerate() {
            let pct = if total > 0 {
                (count as f64 / total as f64) * 100.0
            } else {
                0.0
            };
            let bar = "█".repeat(((pct / 2.0) as usize).min(20));
            info!(
                "║   {:>3}-{:<3}%: {:>6} ({:>5.1}%) {}",
                i * 10,
                (i + 1) * 10,
                count,
                pct,
                bar
            );
        }
        info!("╚══════════════════════════════════════════════════════════════╝");

        let backbone_stats = self.get_backbone_stats();
        if !backbone_stats.is_empty() {
            info!("Backbone Inference Times (ms):");
            for (backbone, stats) in &backbone_stats {
                info!(
                    "  {}: mean={:.1} p50={:.1} p99={:.1} (calls={})",
                    backbone,
                    stats.mean_us as f64 / 1000.0,
                    stats.p50_us as f64 / 1000.0,
                    stats.p99_us as f64 / 1000.0,
                    stats.calls
                );
            }
        }
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Processing time statistics
#[derive(Debug, Default)]
pub struct ProcessingStats {
    pub count: u64,
    pub mean_us: u64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
    pub max_us: u64,
}

/// Backbone-specific statistics
#[derive(Debug)]
pub struct BackboneStats {
    pub calls: u64,
    pub mean_us: u64,
    pub p50_us: u64,
    pub p99_us: u64,
}

/// Periodic metrics summary
pub struct MetricsReporter {
    metrics: Arc<EngineMetrics>,
    interval_secs: u64,
}

impl MetricsReporter {
    pub fn new(metrics: Arc<EngineMetrics>, interval_secs: u64) -> Self {
        Self {
            metrics,
            interval_secs,
        }
    }

    /// Log a summary every interval; returns immediately when the interval is 0
    pub async fn start(self) {
        if self.interval_secs == 0 {
            return;
        }
        let mut interval = tokio::time::interval(Duration::from_secs(self.interval_secs));
        // The first tick completes immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            self.metrics.print_summary();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording() {
        let metrics = EngineMetrics::new();

        metrics.record_prediction(Duration::from_millis(120), 91.0, true, true);
        metrics.record_prediction(Duration::from_millis(80), 22.0, false, false);
        metrics.record_failure(ErrorKind::InvalidImage);
        metrics.record_failure(ErrorKind::InvalidImage);
        metrics.record_failure(ErrorKind::ProcessingTimeout);

        assert_eq!(metrics.predictions.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.toxic_predictions.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.implausible_predictions.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.get_failures()[&ErrorKind::InvalidImage], 2);
        assert_eq!(metrics.total_failures(), 3);

        let distribution = metrics.get_confidence_distribution();
        assert_eq!(distribution[9], 1);
        assert_eq!(distribution[2], 1);

        let stats = metrics.get_processing_stats();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.max_us, 120_000);
    }

    #[test]
    fn test_full_confidence_lands_in_last_bucket() {
        let metrics = EngineMetrics::new();
        metrics.record_prediction(Duration::from_millis(1), 100.0, false, true);
        assert_eq!(metrics.get_confidence_distribution()[9], 1);
    }

    #[test]
    fn test_backbone_stats_and_agreement() {
        let metrics = EngineMetrics::new();
        metrics.record_backbone_time("resnet50", Duration::from_micros(300));
        metrics.record_backbone_time("resnet50", Duration::from_micros(100));
        metrics.record_agreement(1.0);
        metrics.record_agreement(2.0 / 3.0);

        let stats = metrics.get_backbone_stats();
        assert_eq!(stats["resnet50"].calls, 2);
        assert_eq!(stats["resnet50"].mean_us, 200);
        assert!((metrics.get_avg_agreement() - 0.8333).abs() < 1e-3);
    }
}
