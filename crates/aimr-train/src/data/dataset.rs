//! Image dataset and its restartable batch iterator.
//!
//! The dataset is one `[N, H, W, C]` tensor with values in [-1, 1], either
//! read from a raw little-endian f32 cache or built from a directory of
//! images. It is never mutated after construction.

use std::path::{Path, PathBuf};
use std::time::Instant;

use aimr_common::init::component_rng;
use aimr_common::{AllocationLedger, TensorRuntime, Tracked, TrainingConfig};
use candle_core::Tensor;
use image::imageops::FilterType;
use indicatif::{ProgressBar, ProgressStyle};
use rand::seq::SliceRandom;

use crate::error::{config_error, image_error, IoResultExt, TrainResult};

/// Extensions accepted when building from an inputs directory.
const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

/// Shuffle stream, distinct from weight init and latent sampling.
const SHUFFLE_STREAM: u64 = 2;

/// In-memory image dataset.
pub struct ImageDataset {
    images: Tracked,
    len: usize,
    ledger: AllocationLedger,
}

impl ImageDataset {
    /// Load the dataset cache, or build it from the inputs directory and
    /// write the cache.
    pub fn open(cfg: &TrainingConfig, runtime: &dyn TensorRuntime) -> TrainResult<Self> {
        match (&cfg.dataset_path, &cfg.inputs_path) {
            (Some(cache), _) if cache.exists() => {
                tracing::info!(path = %cache.display(), "loading dataset from cache");
                let samples = read_cache(cache, cfg)?;
                Self::from_samples(samples, cfg, runtime)
            }
            (cache, Some(inputs)) => {
                tracing::info!(inputs = %inputs.display(), "building dataset from images");
                let samples = build_from_images(inputs, cfg)?;
                if let Some(cache) = cache {
                    write_cache(cache, &samples)?;
                    tracing::info!(path = %cache.display(), "dataset cache written");
                }
                Self::from_samples(samples, cfg, runtime)
            }
            (Some(cache), None) => Err(config_error(format!(
                "dataset cache {} does not exist and no inputs directory was given",
                cache.display()
            ))),
            (None, None) => Err(config_error(
                "either a dataset path or an inputs path must be set",
            )),
        }
    }

    /// Wrap flat NHWC samples.
    pub fn from_samples(
        samples: Vec<f32>,
        cfg: &TrainingConfig,
        runtime: &dyn TensorRuntime,
    ) -> TrainResult<Self> {
        let per_sample = cfg.sample_len();
        if samples.is_empty() || samples.len() % per_sample != 0 {
            return Err(config_error(format!(
                "dataset holds {} values, not a whole number of {}x{}x{} samples",
                samples.len(),
                cfg.image_size,
                cfg.image_size,
                cfg.channels
            )));
        }
        let len = samples.len() / per_sample;
        let tensor = Tensor::from_vec(
            samples,
            (len, cfg.image_size, cfg.image_size, cfg.channels),
            runtime.device(),
        )?;
        let ledger = runtime.ledger().clone();
        Ok(Self {
            images: ledger.track(tensor),
            len,
            ledger,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn tensor(&self) -> &Tensor {
        &self.images
    }

    /// Number of batches one pass yields.
    pub fn n_batches(&self, batch_size: usize) -> usize {
        self.len.div_ceil(batch_size)
    }

    /// A fresh iterator positioned at the first batch.
    pub fn batches(&self, batch_size: usize) -> BatchIter<'_> {
        BatchIter {
            dataset: self,
            ledger: self.ledger.clone(),
            batch_size: batch_size.max(1),
            cursor: 0,
            index: 0,
            last_yield: None,
            current: None,
        }
    }
}

/// One step of a [`BatchIter`].
#[derive(Debug)]
pub struct Batch<'a> {
    /// Milliseconds since the previous batch was produced (0 for the first).
    pub elapsed_ms: u128,
    /// 1-based position within the pass.
    pub index: usize,
    /// `[b, H, W, C]` view into the dataset.
    pub images: &'a Tensor,
}

impl Batch<'_> {
    pub fn size(&self) -> usize {
        self.images.dims()[0]
    }
}

/// Cursor over the dataset in `batch_size` steps.
///
/// At most one batch view is alive at a time: the previous view is released
/// before the next one is created, and the borrow returned by
/// [`BatchIter::next`] cannot outlive the following call.
pub struct BatchIter<'a> {
    dataset: &'a ImageDataset,
    ledger: AllocationLedger,
    batch_size: usize,
    cursor: usize,
    index: usize,
    last_yield: Option<Instant>,
    current: Option<Tracked>,
}

impl<'a> BatchIter<'a> {
    /// Advance to the next batch; `None` once the dataset is exhausted.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> TrainResult<Option<Batch<'_>>> {
        self.current = None;
        if self.cursor >= self.dataset.len {
            return Ok(None);
        }

        let size = self.batch_size.min(self.dataset.len - self.cursor);
        let view = self.dataset.images.narrow(0, self.cursor, size)?;
        self.cursor += size;
        self.index += 1;

        let now = Instant::now();
        let elapsed_ms = self
            .last_yield
            .map(|t| now.duration_since(t).as_millis())
            .unwrap_or(0);
        self.last_yield = Some(now);

        let current = self.current.insert(self.ledger.track(view));
        Ok(Some(Batch {
            elapsed_ms,
            index: self.index,
            images: current.tensor(),
        }))
    }

    /// Rewind for a new pass. The dataset itself is not reloaded or
    /// reshuffled.
    pub fn reset(&mut self) {
        self.current = None;
        self.cursor = 0;
        self.index = 0;
        self.last_yield = None;
    }

    /// Samples consumed so far in this pass.
    pub fn position(&self) -> usize {
        self.cursor
    }
}

fn read_cache(path: &Path, cfg: &TrainingConfig) -> TrainResult<Vec<f32>> {
    let bytes = std::fs::read(path).with_path(path)?;
    let per_sample = cfg.sample_len() * 4;
    let n = bytes.len() / per_sample.max(1);
    if bytes.len() % per_sample != 0 || n == 0 || n > cfg.dataset_size {
        return Err(config_error(format!(
            "dataset cache {} has {} bytes; expected 1..={} samples of {} bytes",
            path.display(),
            bytes.len(),
            cfg.dataset_size,
            per_sample
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn write_cache(path: &Path, samples: &[f32]) -> TrainResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).with_path(parent)?;
    }
    let bytes: Vec<u8> = samples.iter().flat_map(|v| v.to_le_bytes()).collect();
    std::fs::write(path, bytes).with_path(path)
}

/// Image files in `dir`, sorted by name, capped at `limit`.
pub fn list_images(dir: &Path, limit: usize) -> TrainResult<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_path(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && has_image_extension(p))
        .collect();
    files.sort();
    files.truncate(limit);
    Ok(files)
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.iter().any(|x| x.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}

/// Decode one image to `[H, W, C]` values in [-1, 1].
fn decode_image(path: &Path, cfg: &TrainingConfig) -> TrainResult<Vec<f32>> {
    let size = cfg.image_size as u32;
    let mut rgb = image::open(path)
        .map_err(|e| image_error(e.to_string(), path))?
        .to_rgb8();
    if rgb.dimensions() != (size, size) {
        rgb = image::imageops::resize(&rgb, size, size, FilterType::Triangle);
    }

    let normalize = |v: f32| v / 127.5 - 1.0;
    let mut out = Vec::with_capacity(cfg.sample_len());
    for pixel in rgb.pixels() {
        let [r, g, b] = pixel.0;
        if cfg.channels == 1 {
            out.push(normalize((r as f32 + g as f32 + b as f32) / 3.0));
        } else {
            out.extend([r, g, b].map(|c| normalize(c as f32)));
        }
    }
    Ok(out)
}

fn build_from_images(dir: &Path, cfg: &TrainingConfig) -> TrainResult<Vec<f32>> {
    let files = list_images(dir, cfg.dataset_size)?;
    if files.is_empty() {
        return Err(config_error(format!(
            "no .png or .jpg images found in {}",
            dir.display()
        )));
    }

    let pb = ProgressBar::new(files.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-"),
    );
    pb.set_message("decoding images");

    let mut samples = Vec::with_capacity(files.len());
    for file in &files {
        samples.push(decode_image(file, cfg)?);
        pb.inc(1);
    }
    pb.finish_and_clear();

    samples.shuffle(&mut component_rng(cfg.seed, SHUFFLE_STREAM));
    tracing::info!(samples = samples.len(), "dataset built");
    Ok(samples.concat())
}
