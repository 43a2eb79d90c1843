//! End-to-end tests for dataset ingestion and the adversarial training loop.

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use aimr_common::{CandleRuntime, Generator, LatentSampler, TensorRuntime, TrainingConfig};
use aimr_train::checkpoint::CheckpointStore;
use aimr_train::data::ImageDataset;
use aimr_train::guard::MemoryGuard;
use aimr_train::metrics::{ScalarEvent, DISCRIMINATOR_LOSS, SCALARS_FILE};
use aimr_train::train::GanTrainer;
use aimr_train::{TrainError, TrainResult};

fn write_images(dir: &Path, n: usize, side: u32) {
    for i in 0..n {
        let img = image::RgbImage::from_fn(side, side, |x, y| {
            image::Rgb([(x * 4) as u8, (y * 4) as u8, (i * 10) as u8])
        });
        img.save(dir.join(format!("img_{:02}.png", i))).unwrap();
    }
}

fn samples(cfg: &TrainingConfig, n: usize) -> Vec<f32> {
    (0..n * cfg.sample_len())
        .map(|i| ((i % 31) as f32 / 15.0) - 1.0)
        .collect()
}

fn tiny_trainer(cfg: TrainingConfig) -> TrainResult<GanTrainer> {
    GanTrainer::new(cfg, Arc::new(CandleRuntime::cpu()))
}

#[test]
fn test_dataset_filters_non_images_and_respects_cap() -> TrainResult<()> {
    let dir = tempfile::tempdir()?;
    let inputs = dir.path().join("inputs");
    std::fs::create_dir_all(&inputs)?;
    write_images(&inputs, 22, 64);
    std::fs::write(inputs.join("README.md"), "not an image")?;
    std::fs::write(inputs.join("labels.csv"), "a,b")?;
    std::fs::write(inputs.join("notes.txt"), "x")?;

    let mut cfg = TrainingConfig::default();
    cfg.dataset_size = 22;
    cfg.seed = Some(1);
    cfg.inputs_path = Some(inputs.clone());
    cfg.dataset_path = Some(dir.path().join("dataset.bin"));

    let rt = CandleRuntime::cpu();
    let ds = ImageDataset::open(&cfg, &rt)?;
    assert_eq!(ds.len(), 22);
    assert_eq!(ds.tensor().dims(), &[22, 64, 64, 3]);

    let values = ds.tensor().flatten_all()?.to_vec1::<f32>()?;
    assert!(values.iter().all(|v| (-1.0..=1.0).contains(v)));

    // cache written with exactly 22 samples and reused on the next open
    let bytes = std::fs::metadata(dir.path().join("dataset.bin"))?.len();
    assert_eq!(bytes as usize, 22 * cfg.sample_len() * 4);
    cfg.inputs_path = None;
    let cached = ImageDataset::open(&cfg, &rt)?;
    assert_eq!(cached.tensor().flatten_all()?.to_vec1::<f32>()?, values);

    // cap below the number of files
    let mut capped = TrainingConfig::default();
    capped.dataset_size = 5;
    capped.inputs_path = Some(inputs);
    assert_eq!(ImageDataset::open(&capped, &rt)?.len(), 5);
    Ok(())
}

#[test]
fn test_grayscale_and_resize() -> TrainResult<()> {
    let dir = tempfile::tempdir()?;
    write_images(dir.path(), 3, 20);

    let mut cfg = TrainingConfig::tiny_cpu();
    cfg.channels = 1;
    cfg.inputs_path = Some(dir.path().to_path_buf());
    let ds = ImageDataset::open(&cfg, &CandleRuntime::cpu())?;
    assert_eq!(ds.tensor().dims(), &[3, 8, 8, 1]);
    Ok(())
}

#[test]
fn test_empty_inputs_is_config_error() -> TrainResult<()> {
    let dir = tempfile::tempdir()?;
    std::fs::write(dir.path().join("a.txt"), "x")?;
    let mut cfg = TrainingConfig::tiny_cpu();
    cfg.inputs_path = Some(dir.path().to_path_buf());
    let err = ImageDataset::open(&cfg, &CandleRuntime::cpu()).err();
    assert!(matches!(err, Some(TrainError::Config(_))));
    Ok(())
}

#[test]
fn test_epoch_of_22_in_batches_of_10() -> TrainResult<()> {
    let cfg = TrainingConfig::default();
    let rt = CandleRuntime::cpu();
    let ds = ImageDataset::from_samples(samples(&cfg, 22), &cfg, &rt)?;

    let mut it = ds.batches(10);
    let mut sizes = Vec::new();
    while let Some(batch) = it.next()? {
        sizes.push(batch.size());
    }
    assert_eq!(sizes, vec![10, 10, 2]);

    // restart yields identical boundaries
    it.reset();
    let mut again = Vec::new();
    while let Some(batch) = it.next()? {
        again.push((batch.index, batch.size()));
    }
    assert_eq!(again, vec![(1, 10), (2, 10), (3, 2)]);
    Ok(())
}

#[test]
fn test_memory_guard_scenarios() {
    let run = |counts: &[usize]| {
        let mut guard = MemoryGuard::new();
        counts.iter().position(|&c| guard.observe(c).is_err())
    };
    assert_eq!(run(&[5, 5, 5, 8]), Some(3));
    assert_eq!(run(&[5, 4, 5, 5]), None);
}

#[test]
fn test_same_seed_same_updates() -> TrainResult<()> {
    let run = || -> TrainResult<(Vec<f32>, Vec<f32>)> {
        let mut t = tiny_trainer(TrainingConfig::tiny_cpu())?;
        let ds = ImageDataset::from_samples(samples(&t.config, 4), &t.config, t.runtime())?;
        t.discriminator_step(ds.tensor())?;
        t.generator_step(4)?;
        Ok((t.models.generator.snapshot()?, t.models.discriminator.snapshot()?))
    };
    let (g1, d1) = run()?;
    let (g2, d2) = run()?;
    assert_eq!(g1, g2);
    assert_eq!(d1, d2);
    Ok(())
}

#[test]
fn test_generator_output_range_over_many_latents() -> TrainResult<()> {
    let t = tiny_trainer(TrainingConfig::tiny_cpu())?;
    let mut latents = LatentSampler::new(t.config.latent_size, Some(11));
    let z = latents.sample(64, t.runtime().device())?;
    let fake = t.models.generator.forward(&z, false)?;
    let values = fake.flatten_all()?.to_vec1::<f32>()?;
    assert!(values.iter().all(|v| (-1.0..=1.0).contains(v)));

    let scores = t.models.discriminator.forward(&fake, false)?;
    let scores = scores.flatten_all()?.to_vec1::<f32>()?;
    assert!(scores.iter().all(|s| (0.0..=1.0).contains(s)));
    Ok(())
}

#[test]
fn test_full_run_with_sinks_and_recovery() -> TrainResult<()> {
    let dir = tempfile::tempdir()?;
    let mut cfg = TrainingConfig::tiny_cpu();
    cfg.epochs = Some(2);
    cfg.checkpoint_dir = Some(dir.path().join("ckpt"));
    cfg.tensorboard_path = Some(dir.path().join("board"));
    cfg.preview_path = Some(dir.path().join("preview.png"));

    let mut trainer = tiny_trainer(cfg.clone())?;
    let ds = ImageDataset::from_samples(samples(&cfg, 10), &cfg, trainer.runtime())?;
    let live_before = trainer.runtime().live_tensors();

    let summary = trainer.train(&ds, &AtomicBool::new(false))?;
    assert_eq!(summary.epochs_completed, 2);
    assert_eq!(summary.steps, 2 * ds.n_batches(cfg.batch_size));
    assert!(!summary.interrupted);
    assert_eq!(trainer.runtime().live_tensors(), live_before);

    assert!(dir.path().join("preview.png").exists());
    assert!(dir.path().join("preview.sample.png").exists());

    let text = std::fs::read_to_string(dir.path().join("board").join(SCALARS_FILE))?;
    let events: Vec<ScalarEvent> = text
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(events.len(), 4 * summary.steps);
    let d_steps: Vec<u64> = events
        .iter()
        .filter(|e| e.series == DISCRIMINATOR_LOSS)
        .map(|e| e.step)
        .collect();
    assert_eq!(d_steps, (1..=summary.steps as u64).collect::<Vec<_>>());

    // the generator bundle in the checkpoint reproduces the trained generator
    let store = CheckpointStore::new(dir.path().join("ckpt"));
    assert!(store.exists());
    let loaded = Generator::load(store.generator_dir(), trainer.runtime().device())?;
    let z = LatentSampler::new(cfg.latent_size, Some(5)).sample(3, trainer.runtime().device())?;
    assert_eq!(
        loaded.forward(&z, false)?.flatten_all()?.to_vec1::<f32>()?,
        trainer.models.generator.forward(&z, false)?.flatten_all()?.to_vec1::<f32>()?
    );

    // resume: epoch counter continues from the checkpoint
    let mut resumed_cfg = cfg.clone();
    resumed_cfg.recover = true;
    resumed_cfg.epochs = Some(3);
    let mut resumed = tiny_trainer(resumed_cfg)?;
    assert_eq!(resumed.epoch, 2);
    assert_eq!(resumed.global_step, summary.steps);
    assert_eq!(
        resumed.models.generator.snapshot()?,
        trainer.models.generator.snapshot()?
    );
    let ds = ImageDataset::from_samples(samples(&cfg, 10), &cfg, resumed.runtime())?;
    let more = resumed.train(&ds, &AtomicBool::new(false))?;
    assert_eq!(more.epochs_completed, 1);
    assert_eq!(resumed.epoch, 3);
    Ok(())
}
