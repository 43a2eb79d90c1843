//! Structured logging for GAN training with tracing.
//!
//! JSON or pretty console output, one event per batch, and automatic
//! warnings for divergence and discriminator collapse.

use tracing::{debug, error, info, span, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Realness scores closer than this to 0 or 1 on both probes mean the
/// discriminator has stopped discriminating.
const COLLAPSE_MARGIN: f64 = 0.02;

/// Initialize structured logging.
///
/// Reads log level from RUST_LOG environment variable (defaults to "info").
/// Outputs JSON-formatted logs for production monitoring.
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,aimr_train=info,aimr_common=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Structured logging initialized");
}

/// Initialize human-readable console logging.
pub fn init_console_logging() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,aimr_train=debug,aimr_common=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().pretty())
        .init();
}

/// Per-batch numbers reported by the training loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchMetrics {
    pub d_loss: f64,
    pub g_loss: f64,
    /// Mean discriminator score on a real sample.
    pub real_score: f64,
    /// Mean discriminator score on a fresh fake.
    pub fake_score: f64,
    /// Milliseconds since the previous batch was produced.
    pub elapsed_ms: u128,
}

impl BatchMetrics {
    pub fn is_finite(&self) -> bool {
        self.d_loss.is_finite() && self.g_loss.is_finite()
    }

    /// Both probes pinned to the same extreme.
    pub fn discriminator_collapsed(&self) -> bool {
        let low = self.real_score < COLLAPSE_MARGIN && self.fake_score < COLLAPSE_MARGIN;
        let high =
            self.real_score > 1.0 - COLLAPSE_MARGIN && self.fake_score > 1.0 - COLLAPSE_MARGIN;
        low || high
    }
}

/// Log one batch.
pub fn log_batch(epoch: usize, batch: usize, metrics: &BatchMetrics) {
    let span = span!(Level::INFO, "batch", epoch = epoch, batch = batch);
    let _enter = span.enter();

    if !metrics.is_finite() {
        error!(
            d_loss = metrics.d_loss,
            g_loss = metrics.g_loss,
            "Training diverged! NaN or infinite loss detected"
        );
        return;
    }

    info!(
        d_loss = metrics.d_loss,
        g_loss = metrics.g_loss,
        real_score = metrics.real_score,
        fake_score = metrics.fake_score,
        elapsed_ms = metrics.elapsed_ms as u64,
        "epoch {} batch {}: d_loss {:.4} g_loss {:.4} ({} ms)",
        epoch,
        batch,
        metrics.d_loss,
        metrics.g_loss,
        metrics.elapsed_ms
    );

    if metrics.discriminator_collapsed() {
        warn!(
            real_score = metrics.real_score,
            fake_score = metrics.fake_score,
            "Discriminator scores pinned to one extreme. Consider: \
             (1) lowering the learning rate, (2) a softer real label"
        );
    }

    debug!(
        gap = metrics.real_score - metrics.fake_score,
        "realness gap between real and generated samples"
    );
}

/// Log the end of an epoch.
pub fn log_epoch(epoch: usize, batches: usize, mean_d_loss: f64, mean_g_loss: f64) {
    info!(
        epoch = epoch,
        batches = batches,
        mean_d_loss = mean_d_loss,
        mean_g_loss = mean_g_loss,
        event = "epoch_completed",
        "Epoch completed"
    );
}

/// Log checkpoint save event.
pub fn log_checkpoint_save(epoch: usize, step: usize, path: &str) {
    info!(
        epoch = epoch,
        step = step,
        path = path,
        event = "checkpoint_saved",
        "Checkpoint saved successfully"
    );
}

/// Log a tripped memory guard.
pub fn log_resource_leak(step: usize, previous: usize, current: usize) {
    error!(
        step = step,
        previous = previous,
        current = current,
        event = "resource_leak",
        "Live tensor count grew between steps. Aborting."
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(real: f64, fake: f64) -> BatchMetrics {
        BatchMetrics {
            d_loss: 0.7,
            g_loss: 0.8,
            real_score: real,
            fake_score: fake,
            elapsed_ms: 12,
        }
    }

    #[test]
    fn test_collapse_detection() {
        assert!(metrics(0.01, 0.005).discriminator_collapsed());
        assert!(metrics(0.99, 0.995).discriminator_collapsed());
        assert!(!metrics(0.9, 0.1).discriminator_collapsed());
        assert!(!metrics(0.5, 0.5).discriminator_collapsed());
    }

    #[test]
    fn test_non_finite() {
        let mut m = metrics(0.5, 0.5);
        assert!(m.is_finite());
        m.g_loss = f64::NAN;
        assert!(!m.is_finite());
    }

    #[test]
    fn test_logging_does_not_panic() {
        log_batch(1, 1, &metrics(0.6, 0.4));
        log_batch(1, 2, &metrics(0.999, 0.999));
        log_batch(1, 3, &BatchMetrics { d_loss: f64::INFINITY, ..metrics(0.5, 0.5) });
        log_epoch(1, 3, 0.7, 0.8);
        log_checkpoint_save(1, 3, "/tmp/checkpoint");
        log_resource_leak(4, 5, 8);
    }
}
