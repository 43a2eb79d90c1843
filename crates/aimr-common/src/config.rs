//! Training configuration for the AiMR image GAN.
//!
//! A [`TrainingConfig`] is resolved once at startup (preset, optional TOML
//! file, CLI overrides) and then passed by reference to the model factory,
//! the dataset reader and the training loop. Nothing mutates it afterwards.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{ModelError, Result};

fn default_soft_one() -> f64 {
    0.95 // slightly below 1.0 so the discriminator never becomes overconfident
}

fn default_l2_scale() -> f64 {
    1e-4
}

fn default_dataset_size() -> usize {
    22
}

fn default_preview_scale() -> usize {
    500
}

fn default_log_interval() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn default_leaky_relu_slope() -> f64 {
    0.2
}

/// Convolutional layout of the generator and discriminator.
///
/// The generator projects the latent vector to a
/// `base_resolution x base_resolution x generator_filters[0]` volume and then
/// doubles the resolution once per remaining filter entry plus once for the
/// output stage. The discriminator halves the resolution once per
/// `discriminator_filters` entry before the dense classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchitectureConfig {
    pub base_resolution: usize,
    pub generator_filters: Vec<usize>,
    pub discriminator_filters: Vec<usize>,
    pub kernel_size: usize,
    /// Extra stride-1 stage after the last upsampling stage (and a mirrored
    /// one in the discriminator) against checkerboard artifacts.
    #[serde(default = "default_true")]
    pub anti_checkerboard: bool,
    /// Batch normalization between generator upsampling stages.
    #[serde(default)]
    pub batch_norm: bool,
    /// Dropout after each discriminator stage (0 = disabled).
    #[serde(default)]
    pub dropout: f32,
    #[serde(default = "default_leaky_relu_slope")]
    pub leaky_relu_slope: f64,
}

impl Default for ArchitectureConfig {
    fn default() -> Self {
        Self {
            base_resolution: 4,
            generator_filters: vec![1024, 512, 256, 128],
            discriminator_filters: vec![128, 256, 512, 1024],
            kernel_size: 5,
            anti_checkerboard: true,
            batch_norm: false,
            dropout: 0.0,
            leaky_relu_slope: default_leaky_relu_slope(),
        }
    }
}

/// `2^stages`, `None` once it no longer fits in a `usize`.
fn stage_factor(stages: usize) -> Option<usize> {
    u32::try_from(stages)
        .ok()
        .and_then(|n| 1usize.checked_shl(n))
}

impl ArchitectureConfig {
    /// Output side length produced by the generator, `None` on overflow.
    pub fn generated_resolution(&self) -> Option<usize> {
        stage_factor(self.generator_filters.len())
            .and_then(|factor| self.base_resolution.checked_mul(factor))
    }

    /// Side length of the feature map the discriminator flattens.
    pub fn discriminator_resolution(&self, image_size: usize) -> usize {
        stage_factor(self.discriminator_filters.len()).map_or(0, |factor| image_size / factor)
    }
}

/// Model + training hyperparameter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    // Optimizer
    pub learning_rate: f64,
    pub adam_beta1: f64,
    pub adam_beta2: f64,

    // Shapes
    pub batch_size: usize,
    pub latent_size: usize,
    pub channels: usize,
    pub image_size: usize,
    /// Upper bound on the number of samples in the dataset.
    #[serde(default = "default_dataset_size")]
    pub dataset_size: usize,

    /// Seed for weight initialization, latent sampling and dataset shuffling.
    /// `None` draws from OS entropy.
    #[serde(default)]
    pub seed: Option<u64>,

    /// Target for real samples; fakes always use 0.
    #[serde(default = "default_soft_one")]
    pub soft_one: f64,

    /// L2 kernel regularization coefficient.
    #[serde(default = "default_l2_scale")]
    pub l2_scale: f64,

    /// Number of epochs; `None` trains until interrupted.
    #[serde(default)]
    pub epochs: Option<usize>,

    // Paths
    /// Binary dataset cache (raw little-endian f32, NHWC).
    #[serde(default)]
    pub dataset_path: Option<PathBuf>,
    /// Directory of images used to build the cache.
    #[serde(default)]
    pub inputs_path: Option<PathBuf>,
    /// Directory receiving scalar series.
    #[serde(default)]
    pub tensorboard_path: Option<PathBuf>,
    /// `.png` path for the live preview.
    #[serde(default)]
    pub preview_path: Option<PathBuf>,
    /// Checkpoint directory (`None` disables checkpointing).
    #[serde(default)]
    pub checkpoint_dir: Option<PathBuf>,
    /// Restore from `checkpoint_dir` at startup when a checkpoint exists.
    #[serde(default)]
    pub recover: bool,

    /// Batches between checkpoints (0 = epoch boundaries and shutdown only).
    #[serde(default)]
    pub checkpoint_interval: usize,
    /// Abort training when a checkpoint cannot be written.
    #[serde(default = "default_true")]
    pub checkpoint_failures_fatal: bool,

    /// Side length of the upscaled preview image.
    #[serde(default = "default_preview_scale")]
    pub preview_scale: usize,

    /// Batches between console lines.
    #[serde(default = "default_log_interval")]
    pub log_interval: usize,

    #[serde(default)]
    pub architecture: ArchitectureConfig,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: 2e-4,
            adam_beta1: 0.5,
            adam_beta2: 0.999,
            batch_size: 10,
            latent_size: 100,
            channels: 3,
            image_size: 64,
            dataset_size: default_dataset_size(),
            seed: None,
            soft_one: default_soft_one(),
            l2_scale: default_l2_scale(),
            epochs: None,
            dataset_path: None,
            inputs_path: None,
            tensorboard_path: None,
            preview_path: None,
            checkpoint_dir: None,
            recover: false,
            checkpoint_interval: 0,
            checkpoint_failures_fatal: true,
            preview_scale: default_preview_scale(),
            log_interval: default_log_interval(),
            architecture: ArchitectureConfig::default(),
        }
    }
}

impl TrainingConfig {
    /// Single-channel variant trained with the 0.9 soft label.
    pub fn grayscale() -> Self {
        Self {
            channels: 1,
            soft_one: 0.9,
            ..Self::default()
        }
    }

    /// Small 8x8 model for CPU smoke runs and tests.
    pub fn tiny_cpu() -> Self {
        Self {
            batch_size: 4,
            latent_size: 8,
            channels: 3,
            image_size: 8,
            dataset_size: 10,
            seed: Some(42),
            preview_scale: 32,
            architecture: ArchitectureConfig {
                base_resolution: 2,
                generator_filters: vec![16, 8],
                discriminator_filters: vec![8, 16],
                kernel_size: 3,
                ..ArchitectureConfig::default()
            },
            ..Self::default()
        }
    }

    /// Number of f32 values in one `[H, W, C]` sample.
    pub fn sample_len(&self) -> usize {
        self.image_size * self.image_size * self.channels
    }

    /// Validate configuration and return every violation found.
    ///
    /// # Returns
    /// * `Ok(())` if configuration is valid
    /// * `Err(errors)` with one message per problem otherwise
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();
        let arch = &self.architecture;

        if self.batch_size == 0 {
            errors.push("batch_size must be greater than 0".to_string());
        }
        if self.latent_size == 0 {
            errors.push("latent_size must be greater than 0".to_string());
        }
        if self.dataset_size == 0 {
            errors.push("dataset_size must be greater than 0".to_string());
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            errors.push(format!(
                "learning rate ({}) must be positive and finite",
                self.learning_rate
            ));
        }
        for (name, beta) in [("adam_beta1", self.adam_beta1), ("adam_beta2", self.adam_beta2)] {
            if !(0.0..1.0).contains(&beta) {
                errors.push(format!("{} ({}) must be in [0, 1)", name, beta));
            }
        }
        if !(self.soft_one > 0.0 && self.soft_one <= 1.0) {
            errors.push(format!("soft_one ({}) must be in (0, 1]", self.soft_one));
        }
        if !(self.l2_scale.is_finite() && self.l2_scale >= 0.0) {
            errors.push(format!(
                "l2_scale ({}) must be finite and not negative",
                self.l2_scale
            ));
        }
        if !matches!(self.channels, 1 | 3) {
            errors.push(format!(
                "channels ({}) must be 1 (grayscale) or 3 (rgb)",
                self.channels
            ));
        }
        if matches!(self.epochs, Some(0)) {
            errors.push("epochs must be greater than 0 when set".to_string());
        }
        if self.preview_scale == 0 {
            errors.push("preview_scale must be greater than 0".to_string());
        }

        if arch.base_resolution == 0 {
            errors.push("base_resolution must be greater than 0".to_string());
        }
        if arch.generator_filters.is_empty() || arch.generator_filters.contains(&0) {
            errors.push("generator_filters must be non-empty and positive".to_string());
        }
        if arch.discriminator_filters.is_empty() || arch.discriminator_filters.contains(&0) {
            errors.push("discriminator_filters must be non-empty and positive".to_string());
        }
        if arch.kernel_size == 0 || arch.kernel_size % 2 == 0 {
            errors.push(format!(
                "kernel_size ({}) must be odd for same padding",
                arch.kernel_size
            ));
        }
        if !(0.0..1.0).contains(&arch.dropout) {
            errors.push(format!("dropout ({}) must be in [0, 1)", arch.dropout));
        }
        match arch.generated_resolution() {
            Some(side) if side == self.image_size => {}
            Some(side) => errors.push(format!(
                "generator produces {}x{} images but image_size is {}",
                side, side, self.image_size
            )),
            None => errors.push(format!(
                "{} generator stages from base_resolution {} overflow the image size",
                arch.generator_filters.len(),
                arch.base_resolution
            )),
        }
        let stages = arch.discriminator_filters.len();
        match stage_factor(stages) {
            Some(downsample) if self.image_size % downsample == 0 && self.image_size >= downsample => {}
            Some(downsample) => errors.push(format!(
                "image_size ({}) must be a multiple of {} for {} discriminator stages",
                self.image_size, downsample, stages
            )),
            None => errors.push(format!(
                "{} discriminator stages halve any image_size to nothing",
                stages
            )),
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Validate and fold every violation into one [`ModelError::InvalidConfig`].
    pub fn ensure_valid(&self) -> Result<()> {
        self.validate()
            .map_err(|errors| ModelError::InvalidConfig(errors.join("; ")))
    }

    /// Load configuration from a TOML file.
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ModelError::InvalidConfig(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Serialize to TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| ModelError::InvalidConfig(format!("Failed to serialize config: {}", e)))
    }
}
