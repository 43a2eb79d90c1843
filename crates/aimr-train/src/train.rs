//! Adversarial training loop.
//!
//! Per batch, in this order: discriminator step, generator step (through the
//! combined model), metrics, memory guard, preview, checkpoint check. Steps
//! never overlap and batches are consumed strictly in iterator order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use aimr_common::{GanModels, LatentSampler, TensorRuntime, Tracked, TrainingConfig};
use candle_core::{Device, Tensor};

use crate::checkpoint::{CheckpointMeta, CheckpointStore};
use crate::data::{Batch, ImageDataset};
use crate::error::{config_error, TrainError, TrainResult};
use crate::guard::MemoryGuard;
use crate::logging::{log_batch, log_checkpoint_save, log_epoch, log_resource_leak, BatchMetrics};
use crate::metrics::{
    sinks_for, MetricsSink, DISCRIMINATOR_LOSS, GENERATOR_LOSS, REALNESS_FAKE, REALNESS_REAL,
};
use crate::preview::{PngPreview, PreviewImage, PreviewSink};

/// Any failure while rendering a preview is reported as a preview failure.
fn preview_failure(err: impl Into<TrainError>) -> TrainError {
    match err.into() {
        err @ TrainError::Preview(_) => err,
        err => TrainError::Preview(err.to_string()),
    }
}

/// `[soft_one; b] ++ [0; b]`: real samples first, then fakes.
pub fn discriminator_label_values(b: usize, soft_one: f64) -> Vec<f32> {
    let mut labels = vec![soft_one as f32; b];
    labels.resize(2 * b, 0.0);
    labels
}

/// `[soft_one; 2b]`: fakes the generator wants called real.
pub fn generator_label_values(b: usize, soft_one: f64) -> Vec<f32> {
    vec![soft_one as f32; 2 * b]
}

/// Stack real and fake images with their labels into one discriminator
/// batch of `2b` rows.
pub fn assemble_discriminator_batch(
    real: &Tensor,
    fake: &Tensor,
    soft_one: f64,
) -> candle_core::Result<(Tensor, Tensor)> {
    let b = real.dim(0)?;
    let x = Tensor::cat(&[real, fake], 0)?;
    let y = Tensor::from_vec(
        discriminator_label_values(b, soft_one),
        (2 * b, 1),
        real.device(),
    )?;
    Ok((x, y))
}

/// Result of one pass over the dataset.
#[derive(Debug, Clone, Default)]
pub struct EpochSummary {
    pub batches: usize,
    pub mean_d_loss: f64,
    pub mean_g_loss: f64,
    /// The shutdown flag was raised before the pass finished.
    pub interrupted: bool,
}

/// Result of [`GanTrainer::train`].
#[derive(Debug, Clone, Default)]
pub struct TrainSummary {
    pub epochs_completed: usize,
    pub steps: usize,
    pub interrupted: bool,
}

/// Owns the models and everything a run writes to.
pub struct GanTrainer {
    pub config: TrainingConfig,
    pub models: GanModels,
    runtime: Arc<dyn TensorRuntime>,
    latents: LatentSampler,
    guard: MemoryGuard,
    /// Opened on first use, once a dataset has produced a batch.
    metrics: Option<Box<dyn MetricsSink>>,
    preview: Option<Box<dyn PreviewSink>>,
    checkpoints: Option<CheckpointStore>,
    /// Completed epochs.
    pub epoch: usize,
    /// Completed batches over the whole run.
    pub global_step: usize,
    last_losses: (f64, f64),
    last_saved_step: Option<usize>,
}

impl GanTrainer {
    /// Build models and sinks from `config`, restoring from the checkpoint
    /// directory when recovery is enabled and a checkpoint exists.
    pub fn new(config: TrainingConfig, runtime: Arc<dyn TensorRuntime>) -> TrainResult<Self> {
        config
            .validate()
            .map_err(|errors| config_error(errors.join("; ")))?;

        let models = GanModels::build(&config, runtime.as_ref())?;
        let preview = config
            .preview_path
            .as_ref()
            .and_then(|p| PngPreview::new(p, config.preview_scale))
            .map(|p| Box::new(p) as Box<dyn PreviewSink>);
        let checkpoints = config.checkpoint_dir.as_ref().map(CheckpointStore::new);

        let mut trainer = Self {
            latents: LatentSampler::new(config.latent_size, config.seed),
            models,
            runtime,
            guard: MemoryGuard::new(),
            metrics: None,
            preview,
            checkpoints,
            epoch: 0,
            global_step: 0,
            last_losses: (0.0, 0.0),
            last_saved_step: None,
            config,
        };

        if trainer.config.recover {
            trainer.recover()?;
        }
        Ok(trainer)
    }

    /// Replace the metrics sink.
    pub fn with_metrics(mut self, sink: Box<dyn MetricsSink>) -> Self {
        self.metrics = Some(sink);
        self
    }

    /// Replace the preview sink.
    pub fn with_preview(mut self, sink: Box<dyn PreviewSink>) -> Self {
        self.preview = Some(sink);
        self
    }

    pub fn runtime(&self) -> &dyn TensorRuntime {
        self.runtime.as_ref()
    }

    fn device(&self) -> Device {
        self.runtime.device().clone()
    }

    /// The metrics sink, opening the configured one on first use. Opening
    /// clears stats left in the tensorboard directory by an earlier run.
    fn metrics(&mut self) -> TrainResult<&mut dyn MetricsSink> {
        let sink: Box<dyn MetricsSink> = match self.metrics.take() {
            Some(sink) => sink,
            None => Box::new(sinks_for(self.config.tensorboard_path.as_deref())?),
        };
        Ok(self.metrics.insert(sink).as_mut())
    }

    fn recover(&mut self) -> TrainResult<()> {
        let Some(store) = self.checkpoints.clone() else {
            tracing::warn!("recovery requested without a checkpoint directory");
            return Ok(());
        };
        if !store.exists() {
            tracing::info!(dir = %store.dir().display(), "no checkpoint to recover, starting fresh");
            return Ok(());
        }
        let meta = store.restore(&mut self.models)?;
        self.epoch = meta.epoch;
        self.global_step = meta.step;
        self.last_losses = (meta.d_loss, meta.g_loss);
        self.last_saved_step = Some(meta.step);
        tracing::info!(
            dir = %store.dir().display(),
            epoch = meta.epoch,
            step = meta.step,
            "recovered from checkpoint"
        );
        Ok(())
    }

    /// Train the discriminator on `b` real images and `b` fresh fakes.
    pub fn discriminator_step(&mut self, real: &Tensor) -> TrainResult<f64> {
        let b = real.dim(0)?;
        let device = self.device();
        let ledger = self.runtime.ledger().clone();
        let soft_one = self.config.soft_one;
        let (models, latents) = (&mut self.models, &mut self.latents);

        ledger.scope(|s| -> TrainResult<f64> {
            let z = s.track(latents.sample(b, &device)?);
            let fake = s.track(models.generator.forward(&z, false)?.detach());
            let (x, y) = assemble_discriminator_batch(real, &fake, soft_one)?;
            let (x, y) = (s.track(x), s.track(y));
            Ok(models.discriminator.train_on_batch(&x, &y)? as f64)
        })
    }

    /// Train the generator through the combined model on `2b` fresh latents.
    pub fn generator_step(&mut self, b: usize) -> TrainResult<f64> {
        let device = self.device();
        let ledger = self.runtime.ledger().clone();
        let soft_one = self.config.soft_one;
        let (models, latents) = (&mut self.models, &mut self.latents);

        ledger.scope(|s| -> TrainResult<f64> {
            let z = s.track(latents.sample(2 * b, &device)?);
            let y = s.track(Tensor::from_vec(
                generator_label_values(b, soft_one),
                (2 * b, 1),
                &device,
            )?);
            Ok(models
                .combined
                .train_on_batch(&models.discriminator, &z, &y)? as f64)
        })
    }

    /// Realness of one real sample and one fresh fake. Also returns the
    /// fake, which stays counted by the ledger until the handle is dropped.
    pub fn probe(&mut self, real: &Tensor) -> TrainResult<(f64, f64, Tracked)> {
        let device = self.device();
        let ledger = self.runtime.ledger().clone();
        let (models, latents) = (&self.models, &mut self.latents);

        ledger.scope(|s| -> TrainResult<(f64, f64, Tracked)> {
            let sample = s.track(real.narrow(0, 0, 1)?);
            let z = s.track(latents.sample(1, &device)?);
            let fake = s.keep(models.generator.forward(&z, false)?);
            let real_score = models.discriminator.realness(&sample)? as f64;
            let fake_score = models.discriminator.realness(&fake)? as f64;
            Ok((real_score, fake_score, fake))
        })
    }

    fn update_preview(&mut self, fake: &Tensor, real: &Tensor) -> TrainResult<()> {
        let scale = self.config.preview_scale;
        let Some(preview) = self.preview.as_mut() else {
            return Ok(());
        };
        let generated = PreviewImage::from_tensor(fake, scale).map_err(preview_failure)?;
        preview.write(&generated, false)?;
        let first = real.narrow(0, 0, 1).map_err(preview_failure)?;
        let sample = PreviewImage::from_tensor(&first, scale).map_err(preview_failure)?;
        preview.write(&sample, true)
    }

    /// Run the full per-batch protocol on one batch.
    pub fn train_batch(&mut self, epoch: usize, batch: &Batch<'_>) -> TrainResult<BatchMetrics> {
        let b = batch.size();

        let d_loss = self.discriminator_step(batch.images)?;
        let g_loss = self.generator_step(b)?;

        let (real_score, fake_score, fake) = self.probe(batch.images)?;
        let sink = self.metrics()?;
        sink.record(DISCRIMINATOR_LOSS, d_loss)?;
        sink.record(GENERATOR_LOSS, g_loss)?;
        sink.record(REALNESS_REAL, real_score)?;
        sink.record(REALNESS_FAKE, fake_score)?;

        self.runtime.synchronize()?;
        let live = self.runtime.live_tensors();
        if let Err(e) = self.guard.observe(live) {
            log_resource_leak(self.global_step + 1, self.guard.baseline().unwrap_or(0), live);
            return Err(e);
        }

        match self.update_preview(&fake, batch.images) {
            Err(e) if e.is_recoverable() => tracing::warn!(error = %e, "preview update failed"),
            Err(e) => return Err(e),
            Ok(()) => {}
        }
        drop(fake);

        self.global_step += 1;
        self.last_losses = (d_loss, g_loss);
        let metrics = BatchMetrics {
            d_loss,
            g_loss,
            real_score,
            fake_score,
            elapsed_ms: batch.elapsed_ms,
        };
        if self.global_step % self.config.log_interval.max(1) == 0 {
            log_batch(epoch + 1, batch.index, &metrics);
        }

        let interval = self.config.checkpoint_interval;
        if interval > 0 && self.global_step % interval == 0 {
            self.save_checkpoint()?;
        }
        Ok(metrics)
    }

    /// One pass over `dataset`. Checks `shutdown` before every batch.
    pub fn train_epoch(
        &mut self,
        dataset: &ImageDataset,
        shutdown: &AtomicBool,
    ) -> TrainResult<EpochSummary> {
        let epoch = self.epoch;
        let mut summary = EpochSummary::default();
        let (mut d_total, mut g_total) = (0.0, 0.0);

        let mut batches = dataset.batches(self.config.batch_size);
        while let Some(batch) = batches.next()? {
            if shutdown.load(Ordering::SeqCst) {
                summary.interrupted = true;
                break;
            }
            let m = self.train_batch(epoch, &batch)?;
            d_total += m.d_loss;
            g_total += m.g_loss;
            summary.batches += 1;
        }

        if summary.batches > 0 {
            summary.mean_d_loss = d_total / summary.batches as f64;
            summary.mean_g_loss = g_total / summary.batches as f64;
        }
        Ok(summary)
    }

    /// Train until the configured epoch count is reached or `shutdown` is
    /// raised, checkpointing at every epoch boundary and once more on exit.
    pub fn train(
        &mut self,
        dataset: &ImageDataset,
        shutdown: &AtomicBool,
    ) -> TrainResult<TrainSummary> {
        let start = Instant::now();
        let mut interrupted = false;
        let first_epoch = self.epoch;
        self.metrics()?;

        tracing::info!(
            samples = dataset.len(),
            batch_size = self.config.batch_size,
            batches_per_epoch = dataset.n_batches(self.config.batch_size),
            epochs = ?self.config.epochs,
            start_epoch = self.epoch,
            "training started"
        );

        while self.config.epochs.map_or(true, |n| self.epoch < n) {
            let summary = self.train_epoch(dataset, shutdown)?;
            if summary.interrupted {
                interrupted = true;
                break;
            }
            self.epoch += 1;
            log_epoch(self.epoch, summary.batches, summary.mean_d_loss, summary.mean_g_loss);
            self.save_checkpoint()?;
            if shutdown.load(Ordering::SeqCst) {
                interrupted = true;
                break;
            }
        }

        if self.last_saved_step != Some(self.global_step) {
            self.save_checkpoint()?;
        }
        if let Some(metrics) = self.metrics.as_mut() {
            metrics.flush()?;
        }

        tracing::info!(
            epochs = self.epoch - first_epoch,
            steps = self.global_step,
            interrupted = interrupted,
            elapsed_secs = start.elapsed().as_secs_f64(),
            "training finished"
        );
        Ok(TrainSummary {
            epochs_completed: self.epoch - first_epoch,
            steps: self.global_step,
            interrupted,
        })
    }

    /// Write a checkpoint if a directory is configured.
    ///
    /// Failures abort training unless `checkpoint_failures_fatal` is off, in
    /// which case they are logged and training continues.
    pub fn save_checkpoint(&mut self) -> TrainResult<()> {
        let Some(store) = &self.checkpoints else {
            return Ok(());
        };
        let meta = CheckpointMeta {
            config: self.config.clone(),
            epoch: self.epoch,
            step: self.global_step,
            d_loss: self.last_losses.0,
            g_loss: self.last_losses.1,
        };
        match store.save(&self.models, &meta) {
            Ok(()) => {
                self.last_saved_step = Some(self.global_step);
                log_checkpoint_save(self.epoch, self.global_step, &store.dir().display().to_string());
                Ok(())
            }
            Err(e) if !self.config.checkpoint_failures_fatal => {
                tracing::error!(
                    error = %e,
                    path = e.path().unwrap_or_default(),
                    "checkpoint save failed, continuing"
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aimr_common::CandleRuntime;
    use candle_core::DType;

    fn trainer(cfg: TrainingConfig) -> TrainResult<GanTrainer> {
        GanTrainer::new(cfg, Arc::new(CandleRuntime::cpu()))
    }

    fn dataset(t: &GanTrainer, n: usize) -> TrainResult<ImageDataset> {
        let values = (0..n * t.config.sample_len())
            .map(|i| ((i % 17) as f32 / 8.0) - 1.0)
            .collect();
        ImageDataset::from_samples(values, &t.config, t.runtime())
    }

    #[test]
    fn test_label_layout() {
        assert_eq!(
            discriminator_label_values(2, 0.95),
            vec![0.95, 0.95, 0.0, 0.0]
        );
        assert_eq!(generator_label_values(1, 0.9), vec![0.9, 0.9]);
    }

    #[test]
    fn test_assembled_batch_has_2b_rows() -> candle_core::Result<()> {
        let real = Tensor::ones((3, 8, 8, 3), DType::F32, &Device::Cpu)?;
        let fake = Tensor::zeros((3, 8, 8, 3), DType::F32, &Device::Cpu)?;
        let (x, y) = assemble_discriminator_batch(&real, &fake, 0.95)?;
        assert_eq!(x.dims(), &[6, 8, 8, 3]);
        assert_eq!(y.dims(), &[6, 1]);
        Ok(())
    }

    #[test]
    fn test_steps_release_scratch() -> TrainResult<()> {
        let mut t = trainer(TrainingConfig::tiny_cpu())?;
        let ds = dataset(&t, 4)?;
        let before = t.runtime().live_tensors();

        let d = t.discriminator_step(ds.tensor())?;
        let g = t.generator_step(4)?;
        assert!(d.is_finite() && g.is_finite());
        assert_eq!(t.runtime().live_tensors(), before);
        Ok(())
    }

    #[test]
    fn test_train_batch_reports_probes_in_range() -> TrainResult<()> {
        let mut t = trainer(TrainingConfig::tiny_cpu())?;
        let ds = dataset(&t, 6)?;
        let mut it = ds.batches(4);
        let batch = it.next()?.expect("first batch");
        let m = t.train_batch(0, &batch)?;
        assert!((0.0..=1.0).contains(&m.real_score));
        assert!((0.0..=1.0).contains(&m.fake_score));
        assert_eq!(t.global_step, 1);
        Ok(())
    }

    #[test]
    fn test_shutdown_before_first_batch_flushes_checkpoint() -> TrainResult<()> {
        let dir = tempfile::tempdir()?;
        let mut cfg = TrainingConfig::tiny_cpu();
        cfg.checkpoint_dir = Some(dir.path().join("ckpt"));
        let mut t = trainer(cfg)?;
        let ds = dataset(&t, 4)?;

        let shutdown = AtomicBool::new(true);
        let summary = t.train(&ds, &shutdown)?;
        assert!(summary.interrupted);
        assert_eq!(summary.steps, 0);
        assert!(CheckpointStore::new(dir.path().join("ckpt")).exists());
        Ok(())
    }

    #[test]
    fn test_non_fatal_checkpoint_failure() -> TrainResult<()> {
        let dir = tempfile::tempdir()?;
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"not a directory")?;

        let mut cfg = TrainingConfig::tiny_cpu();
        cfg.checkpoint_dir = Some(blocker.join("ckpt"));
        cfg.checkpoint_failures_fatal = false;
        let mut t = trainer(cfg.clone())?;
        t.save_checkpoint()?;

        cfg.checkpoint_failures_fatal = true;
        let mut t = trainer(cfg)?;
        assert!(t.save_checkpoint().is_err());
        Ok(())
    }

    #[test]
    fn test_retained_fake_trips_guard() -> TrainResult<()> {
        let mut t = trainer(TrainingConfig::tiny_cpu())?;
        let ds = dataset(&t, 8)?;
        let mut it = ds.batches(4);

        let first = it.next()?.expect("first batch");
        t.train_batch(0, &first)?;

        let (_, _, kept) = t.probe(ds.tensor())?;
        let second = it.next()?.expect("second batch");
        let err = t.train_batch(0, &second).err();
        assert!(matches!(err, Some(TrainError::ResourceLeak { .. })));
        assert_eq!(err.map(|e| e.exit_code()), Some(3));
        drop(kept);
        Ok(())
    }

    #[test]
    fn test_tensorboard_dir_untouched_until_training() -> TrainResult<()> {
        let dir = tempfile::tempdir()?;
        let board = dir.path().join("board");
        std::fs::create_dir_all(&board)?;
        let stale = board.join("stale.jsonl");
        std::fs::write(&stale, b"{}")?;

        let empty = dir.path().join("inputs");
        std::fs::create_dir_all(&empty)?;
        let mut cfg = TrainingConfig::tiny_cpu();
        cfg.tensorboard_path = Some(board.clone());
        cfg.inputs_path = Some(empty);

        let mut t = trainer(cfg.clone())?;
        let opened = ImageDataset::open(&cfg, t.runtime()).err();
        assert!(matches!(opened, Some(TrainError::Config(_))));
        assert!(stale.exists());

        let ds = dataset(&t, 4)?;
        t.train(&ds, &AtomicBool::new(true))?;
        assert!(!stale.exists());
        assert!(board.join(crate::metrics::SCALARS_FILE).exists());
        Ok(())
    }

    struct FailingPreview(TrainError);

    impl PreviewSink for FailingPreview {
        fn write(&mut self, _image: &PreviewImage, _is_sample: bool) -> TrainResult<()> {
            Err(self.0.clone())
        }
    }

    #[test]
    fn test_only_preview_failures_are_skipped() -> TrainResult<()> {
        let preview = FailingPreview(TrainError::Preview("disk full".to_string()));
        let mut t = trainer(TrainingConfig::tiny_cpu())?.with_preview(Box::new(preview));
        let ds = dataset(&t, 4)?;
        let mut it = ds.batches(4);
        let batch = it.next()?.expect("batch");
        t.train_batch(0, &batch)?;
        assert_eq!(t.global_step, 1);

        let io = TrainError::Io {
            message: "read-only".to_string(),
            path: "/preview.png".to_string(),
        };
        let mut t = trainer(TrainingConfig::tiny_cpu())?.with_preview(Box::new(FailingPreview(io)));
        let err = t.train_batch(0, &batch).err();
        assert!(matches!(err, Some(TrainError::Io { .. })));
        assert_eq!(t.global_step, 0);
        Ok(())
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut cfg = TrainingConfig::tiny_cpu();
        cfg.batch_size = 0;
        let err = trainer(cfg).err().map(|e| e.exit_code());
        assert_eq!(err, Some(2));
    }
}
