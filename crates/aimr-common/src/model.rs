//! Generator, discriminator and the combined generator-through-discriminator
//! model.
//!
//! All models take and produce NHWC tensors at their boundaries and run NCHW
//! internally, which is the layout candle's convolutions expect.

use candle_core::{DType, Device, Module, ModuleT, Tensor, Var};
use candle_nn::{
    batch_norm, conv2d, conv_transpose2d, linear, linear_no_bias, AdamW, BatchNorm, Conv2d,
    Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig, Linear, Optimizer, ParamsAdamW,
    VarBuilder, VarMap,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;

use crate::config::TrainingConfig;
use crate::error::{ModelError, Result};
use crate::init::{component_rng, glorot_init};
use crate::runtime::{Reservation, TensorRuntime};

/// Generator bundle: topology file.
pub const TOPOLOGY_FILE: &str = "model.json";
/// Generator bundle: weights file.
pub const WEIGHTS_FILE: &str = "weights.safetensors";

const BCE_EPSILON: f64 = 1e-7;
const ADAM_EPSILON: f64 = 1e-7;
const BATCH_NORM_EPSILON: f64 = 1e-3;

/// Binary cross-entropy averaged over all elements.
///
/// Predictions are clamped to `[eps, 1 - eps]` before taking logs.
pub fn binary_cross_entropy(pred: &Tensor, target: &Tensor) -> candle_core::Result<Tensor> {
    let p = pred.clamp(BCE_EPSILON, 1.0 - BCE_EPSILON)?;
    let real = (target * p.log()?)?;
    let fake = (target.affine(-1.0, 1.0)? * p.affine(-1.0, 1.0)?.log()?)?;
    (real + fake)?.mean_all()?.neg()
}

fn adam_params(cfg: &TrainingConfig) -> ParamsAdamW {
    // weight_decay 0 turns AdamW into plain Adam
    ParamsAdamW {
        lr: cfg.learning_rate,
        beta1: cfg.adam_beta1,
        beta2: cfg.adam_beta2,
        eps: ADAM_EPSILON,
        weight_decay: 0.0,
    }
}

/// Rank >= 2 variables (kernels) in name order, minus excluded prefixes.
fn collect_kernels(varmap: &VarMap, exclude: &[&str]) -> Result<Vec<Var>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| ModelError::InvalidConfig("weight registry lock poisoned".to_string()))?;
    let mut named: Vec<(&String, &Var)> = data
        .iter()
        .filter(|(name, var)| {
            var.rank() >= 2 && !exclude.iter().any(|prefix| name.starts_with(prefix))
        })
        .collect();
    named.sort_by(|a, b| a.0.cmp(b.0));
    Ok(named.into_iter().map(|(_, var)| var.clone()).collect())
}

/// `scale * sum(w^2)` over the given kernels.
fn l2_penalty(kernels: &[Var], scale: f64, device: &Device) -> candle_core::Result<Tensor> {
    let mut total = Tensor::zeros((), DType::F32, device)?;
    for kernel in kernels {
        total = (total + kernel.as_tensor().sqr()?.sum_all()?)?;
    }
    total.affine(scale, 0.0)
}

fn same_conv(stride: usize, kernel: usize) -> Conv2dConfig {
    Conv2dConfig {
        padding: kernel / 2,
        stride,
        ..Default::default()
    }
}

fn same_conv_transpose(stride: usize, kernel: usize) -> ConvTranspose2dConfig {
    ConvTranspose2dConfig {
        padding: kernel / 2,
        output_padding: stride - 1,
        stride,
        dilation: 1,
    }
}

fn var_count(varmap: &VarMap) -> usize {
    varmap.all_vars().len()
}

// ---------------------------------------------------------------------------
// Generator
// ---------------------------------------------------------------------------

/// Fixed topology of a generator, persisted next to its weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratorTopology {
    pub latent_size: usize,
    pub image_size: usize,
    pub channels: usize,
    pub base_resolution: usize,
    pub filters: Vec<usize>,
    pub kernel_size: usize,
    pub anti_checkerboard: bool,
    pub batch_norm: bool,
}

impl GeneratorTopology {
    pub fn from_config(cfg: &TrainingConfig) -> Self {
        let arch = &cfg.architecture;
        Self {
            latent_size: cfg.latent_size,
            image_size: cfg.image_size,
            channels: cfg.channels,
            base_resolution: arch.base_resolution,
            filters: arch.generator_filters.clone(),
            kernel_size: arch.kernel_size,
            anti_checkerboard: arch.anti_checkerboard,
            batch_norm: arch.batch_norm,
        }
    }

    /// Output shape for a batch of `n` latents.
    pub fn output_shape(&self, n: usize) -> [usize; 4] {
        [n, self.image_size, self.image_size, self.channels]
    }
}

#[derive(Debug, Clone)]
struct UpStage {
    conv: ConvTranspose2d,
    norm: Option<BatchNorm>,
}

/// Latent vector -> `[N, H, W, C]` image in [-1, 1].
///
/// Never owns an optimizer; it only learns through [`Combined`]. Clones
/// share weights.
#[derive(Clone)]
pub struct Generator {
    topology: GeneratorTopology,
    varmap: VarMap,
    device: Device,
    project: Linear,
    stages: Vec<UpStage>,
    smooth: Option<ConvTranspose2d>,
    output: ConvTranspose2d,
    kernels: Vec<Var>,
}

impl std::fmt::Debug for Generator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Generator")
            .field("topology", &self.topology)
            .field("device", &self.device)
            .field("vars", &self.var_count())
            .finish()
    }
}

impl Generator {
    /// Build with freshly initialized weights.
    pub fn new(topology: GeneratorTopology, device: &Device, rng: &mut StdRng) -> Result<Self> {
        let generator = Self::build(topology, device)?;
        glorot_init(&generator.varmap, rng)?;
        Ok(generator)
    }

    fn build(topology: GeneratorTopology, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let k = topology.kernel_size;
        let base = topology.base_resolution;
        let filters = &topology.filters;
        let first = *filters
            .first()
            .ok_or_else(|| ModelError::InvalidConfig("generator needs filters".to_string()))?;
        let last = filters[filters.len() - 1];

        let project = linear_no_bias(
            topology.latent_size,
            base * base * first,
            vb.pp("project"),
        )?;

        let mut stages = Vec::with_capacity(filters.len() - 1);
        for (i, pair) in filters.windows(2).enumerate() {
            let vb = vb.pp(format!("up{}", i));
            let conv = conv_transpose2d(pair[0], pair[1], k, same_conv_transpose(2, k), vb.pp("conv"))?;
            let norm = if topology.batch_norm {
                Some(batch_norm(pair[1], BATCH_NORM_EPSILON, vb.pp("bn"))?)
            } else {
                None
            };
            stages.push(UpStage { conv, norm });
        }

        let smooth = if topology.anti_checkerboard {
            Some(conv_transpose2d(last, last, k, same_conv_transpose(1, k), vb.pp("smooth"))?)
        } else {
            None
        };

        let output = conv_transpose2d(
            last,
            topology.channels,
            k,
            same_conv_transpose(2, k),
            vb.pp("output"),
        )?;

        // the projection is not regularized
        let kernels = collect_kernels(&varmap, &["project"])?;

        Ok(Self {
            topology,
            varmap,
            device: device.clone(),
            project,
            stages,
            smooth,
            output,
            kernels,
        })
    }

    pub fn topology(&self) -> &GeneratorTopology {
        &self.topology
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Map `(n, latent)` to `(n, H, W, C)`.
    ///
    /// `train` selects batch statistics for batch normalization; it has no
    /// effect otherwise.
    pub fn forward(&self, z: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let n = z.dim(0)?;
        let base = self.topology.base_resolution;
        let mut x = self
            .project
            .forward(z)?
            .reshape((n, self.topology.filters[0], base, base))?;

        for stage in &self.stages {
            x = stage.conv.forward(&x)?;
            if let Some(norm) = &stage.norm {
                x = norm.forward_t(&x, train)?;
            }
            x = x.relu()?;
        }
        if let Some(smooth) = &self.smooth {
            x = smooth.forward(&x)?.relu()?;
        }
        self.output
            .forward(&x)?
            .tanh()?
            .permute((0, 2, 3, 1))?
            .contiguous()
    }

    /// Variables updated when training through [`Combined`].
    pub fn trainable_vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    pub fn var_count(&self) -> usize {
        var_count(&self.varmap)
    }

    pub fn l2_penalty(&self, scale: f64) -> candle_core::Result<Tensor> {
        l2_penalty(&self.kernels, scale, &self.device)
    }

    /// Write `model.json` and `weights.safetensors` into `dir`.
    pub fn save<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        let fail = |reason: String| ModelError::SaveFailed {
            path: dir.display().to_string(),
            reason,
        };
        std::fs::create_dir_all(dir).map_err(|e| fail(e.to_string()))?;
        let topology = serde_json::to_string_pretty(&self.topology)?;
        std::fs::write(dir.join(TOPOLOGY_FILE), topology).map_err(|e| fail(e.to_string()))?;
        self.varmap
            .save(dir.join(WEIGHTS_FILE))
            .map_err(|e| fail(e.to_string()))?;
        tracing::debug!(dir = %dir.display(), "generator saved");
        Ok(())
    }

    /// Load a bundle written by [`Generator::save`].
    pub fn load<P: AsRef<Path>>(dir: P, device: &Device) -> Result<Self> {
        let dir = dir.as_ref();
        let topology_path = dir.join(TOPOLOGY_FILE);
        if !topology_path.exists() {
            return Err(ModelError::ModelNotFound(topology_path.display().to_string()));
        }
        let topology: GeneratorTopology =
            serde_json::from_str(&std::fs::read_to_string(&topology_path)?)?;
        let generator = Self::build(topology, device)?;
        generator.load_weights(dir.join(WEIGHTS_FILE))?;
        Ok(generator)
    }

    /// Overwrite the weights in place from a safetensors file.
    pub fn load_weights<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let mut varmap = self.varmap.clone();
        varmap.load(path).map_err(|e| ModelError::LoadFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Discriminator
// ---------------------------------------------------------------------------

struct DownStage {
    conv: Conv2d,
    norm: Option<BatchNorm>,
}

/// `[N, H, W, C]` image -> `(N, 1)` realness score in [0, 1].
///
/// Owns its Adam optimizer and is trainable on its own.
pub struct Discriminator {
    varmap: VarMap,
    device: Device,
    stages: Vec<DownStage>,
    classify: Linear,
    slope: f64,
    dropout: f32,
    dropout_rng: Mutex<StdRng>,
    kernels: Vec<Var>,
    l2_scale: f64,
    trainable: bool,
    optimizer: AdamW,
}

impl Discriminator {
    pub fn new(cfg: &TrainingConfig, device: &Device, rng: &mut StdRng) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let arch = &cfg.architecture;
        let k = arch.kernel_size;
        let filters = &arch.discriminator_filters;

        let mut stages = Vec::with_capacity(filters.len() + 1);
        let mut in_channels = cfg.channels;
        for (i, &out) in filters.iter().enumerate() {
            let vb = vb.pp(format!("down{}", i));
            let conv = conv2d(in_channels, out, k, same_conv(2, k), vb.pp("conv"))?;
            // the first stage sees raw pixels and is never normalized
            let norm = if arch.batch_norm && i > 0 {
                Some(batch_norm(out, BATCH_NORM_EPSILON, vb.pp("bn"))?)
            } else {
                None
            };
            stages.push(DownStage { conv, norm });
            if i == 0 && arch.anti_checkerboard {
                let conv = conv2d(out, out, k, same_conv(1, k), vb.pp("smooth"))?;
                stages.push(DownStage { conv, norm: None });
            }
            in_channels = out;
        }

        let side = arch.discriminator_resolution(cfg.image_size);
        let classify = linear(in_channels * side * side, 1, vb.pp("classify"))?;

        glorot_init(&varmap, rng)?;
        let kernels = collect_kernels(&varmap, &[])?;
        let optimizer = AdamW::new(varmap.all_vars(), adam_params(cfg))?;

        Ok(Self {
            device: device.clone(),
            stages,
            classify,
            slope: arch.leaky_relu_slope,
            dropout: arch.dropout,
            dropout_rng: Mutex::new(StdRng::seed_from_u64(rng.gen())),
            kernels,
            l2_scale: cfg.l2_scale,
            trainable: true,
            optimizer,
            varmap,
        })
    }

    fn dropout_mask(&self, like: &Tensor) -> candle_core::Result<Tensor> {
        let keep = 1.0 - self.dropout;
        let mut rng = self
            .dropout_rng
            .lock()
            .map_err(|_| candle_core::Error::Msg("dropout rng lock poisoned".to_string()))?;
        let values: Vec<f32> = (0..like.elem_count())
            .map(|_| if rng.gen::<f32>() < keep { 1.0 / keep } else { 0.0 })
            .collect();
        Tensor::from_vec(values, like.shape(), like.device())
    }

    /// Score a batch. `train` enables dropout and batch statistics.
    pub fn forward(&self, images: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let mut x = images.permute((0, 3, 1, 2))?.contiguous()?;
        for stage in &self.stages {
            x = stage.conv.forward(&x)?;
            if let Some(norm) = &stage.norm {
                x = norm.forward_t(&x, train)?;
            }
            x = candle_nn::ops::leaky_relu(&x, self.slope)?;
            if train && self.dropout > 0.0 {
                x = (&x * self.dropout_mask(&x)?)?;
            }
        }
        let x = x.flatten_from(1)?;
        candle_nn::ops::sigmoid(&self.classify.forward(&x)?)
    }

    pub fn is_trainable(&self) -> bool {
        self.trainable
    }

    pub fn set_trainable(&mut self, trainable: bool) {
        self.trainable = trainable;
    }

    /// Variables an optimizer may update; empty while frozen.
    pub fn trainable_vars(&self) -> Vec<Var> {
        if self.trainable {
            self.varmap.all_vars()
        } else {
            Vec::new()
        }
    }

    pub fn var_count(&self) -> usize {
        var_count(&self.varmap)
    }

    pub fn l2_penalty(&self) -> candle_core::Result<Tensor> {
        l2_penalty(&self.kernels, self.l2_scale, &self.device)
    }

    /// One Adam step on binary cross-entropy (plus L2) against `labels`.
    /// Returns the loss before the update.
    pub fn train_on_batch(&mut self, images: &Tensor, labels: &Tensor) -> Result<f32> {
        if !self.trainable {
            return Err(ModelError::NotTrainable("discriminator"));
        }
        let pred = self.forward(images, true)?;
        let loss = (binary_cross_entropy(&pred, labels)? + self.l2_penalty()?)?;
        self.optimizer.backward_step(&loss)?;
        Ok(loss.to_scalar::<f32>()?)
    }

    /// Mean realness score over a batch, without dropout.
    pub fn realness(&self, images: &Tensor) -> Result<f32> {
        Ok(self
            .forward(images, false)?
            .mean_all()?
            .to_scalar::<f32>()?)
    }

    pub fn save_weights<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.varmap.save(path).map_err(|e| ModelError::SaveFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    pub fn load_weights<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.varmap.load(path).map_err(|e| ModelError::LoadFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    /// Flattened copy of every weight in name order.
    pub fn snapshot(&self) -> Result<Vec<f32>> {
        snapshot(&self.varmap)
    }
}

/// Flattened copy of every variable in `varmap`, in name order.
fn snapshot(varmap: &VarMap) -> Result<Vec<f32>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| ModelError::InvalidConfig("weight registry lock poisoned".to_string()))?;
    let mut names: Vec<&String> = data.keys().collect();
    names.sort();
    let mut out = Vec::new();
    for name in names {
        out.extend(data[name].as_tensor().flatten_all()?.to_vec1::<f32>()?);
    }
    Ok(out)
}

impl Generator {
    /// Flattened copy of every weight in name order.
    pub fn snapshot(&self) -> Result<Vec<f32>> {
        snapshot(&self.varmap)
    }
}

/// Marks the discriminator frozen for as long as it lives.
struct Frozen<'a> {
    discriminator: &'a mut Discriminator,
}

impl<'a> Frozen<'a> {
    fn new(discriminator: &'a mut Discriminator) -> Self {
        discriminator.set_trainable(false);
        Self { discriminator }
    }
}

impl Drop for Frozen<'_> {
    fn drop(&mut self) {
        self.discriminator.set_trainable(true);
    }
}

// ---------------------------------------------------------------------------
// Combined
// ---------------------------------------------------------------------------

/// Generator followed by the discriminator, optimizing only the generator.
///
/// Weights are shared with the standalone models, not copied.
pub struct Combined {
    generator: Generator,
    optimizer: AdamW,
    l2_scale: f64,
}

impl Combined {
    /// Wire the combined model.
    ///
    /// The discriminator is frozen while the optimizer collects its
    /// variables and is trainable again when this returns, on every path.
    pub fn new(
        generator: &Generator,
        discriminator: &mut Discriminator,
        cfg: &TrainingConfig,
    ) -> Result<Self> {
        let frozen = Frozen::new(discriminator);
        let mut vars = generator.trainable_vars();
        vars.extend(frozen.discriminator.trainable_vars());
        let optimizer = AdamW::new(vars, adam_params(cfg))?;
        drop(frozen);

        Ok(Self {
            generator: generator.clone(),
            optimizer,
            l2_scale: cfg.l2_scale,
        })
    }

    /// Realness scores for generated images.
    pub fn forward(&self, discriminator: &Discriminator, z: &Tensor) -> candle_core::Result<Tensor> {
        let fake = self.generator.forward(z, true)?;
        discriminator.forward(&fake, true)
    }

    /// One Adam step on the generator weights. Returns the loss before the
    /// update.
    pub fn train_on_batch(
        &mut self,
        discriminator: &Discriminator,
        z: &Tensor,
        labels: &Tensor,
    ) -> Result<f32> {
        let pred = self.forward(discriminator, z)?;
        let loss = (binary_cross_entropy(&pred, labels)? + self.generator.l2_penalty(self.l2_scale)?)?;
        self.optimizer.backward_step(&loss)?;
        Ok(loss.to_scalar::<f32>()?)
    }

    pub fn generator(&self) -> &Generator {
        &self.generator
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Stream offsets for per-component initializers.
const GENERATOR_STREAM: u64 = 0;
const DISCRIMINATOR_STREAM: u64 = 1;

/// The three models of one training run.
pub struct GanModels {
    pub generator: Generator,
    pub discriminator: Discriminator,
    pub combined: Combined,
    weights: Reservation,
}

impl GanModels {
    /// Build generator, discriminator and combined model from `cfg` on the
    /// runtime's device, registering the weights with its ledger.
    pub fn build(cfg: &TrainingConfig, runtime: &dyn TensorRuntime) -> Result<Self> {
        cfg.ensure_valid()?;
        let device = runtime.device();

        let generator = Generator::new(
            GeneratorTopology::from_config(cfg),
            device,
            &mut component_rng(cfg.seed, GENERATOR_STREAM),
        )?;
        let mut discriminator = Discriminator::new(
            cfg,
            device,
            &mut component_rng(cfg.seed, DISCRIMINATOR_STREAM),
        )?;
        let combined = Combined::new(&generator, &mut discriminator, cfg)?;

        let weights = runtime
            .ledger()
            .reserve(generator.var_count() + discriminator.var_count());

        tracing::info!(
            backend = %runtime.name(),
            generator_vars = generator.var_count(),
            discriminator_vars = discriminator.var_count(),
            image_size = cfg.image_size,
            channels = cfg.channels,
            "models built"
        );

        Ok(Self {
            generator,
            discriminator,
            combined,
            weights,
        })
    }

    /// Weight tensors registered with the ledger.
    pub fn weight_count(&self) -> usize {
        self.weights.count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::latent::LatentSampler;
    use crate::runtime::CandleRuntime;
    use candle_core::D;

    fn tiny() -> TrainingConfig {
        TrainingConfig::tiny_cpu()
    }

    fn max_abs(t: &Tensor) -> candle_core::Result<f32> {
        t.abs()?.flatten_all()?.max(D::Minus1)?.to_scalar::<f32>()
    }

    #[test]
    fn test_bce_matches_closed_form() -> candle_core::Result<()> {
        let pred = Tensor::new(&[[0.8f32], [0.3]], &Device::Cpu)?;
        let target = Tensor::new(&[[1.0f32], [0.0]], &Device::Cpu)?;
        let loss = binary_cross_entropy(&pred, &target)?.to_scalar::<f32>()?;
        let expected = -((0.8f32).ln() + (0.7f32).ln()) / 2.0;
        assert!((loss - expected).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_shapes_and_ranges() -> Result<()> {
        let cfg = tiny();
        let rt = CandleRuntime::cpu();
        let models = GanModels::build(&cfg, &rt)?;
        let mut latents = LatentSampler::new(cfg.latent_size, Some(0));

        let z = latents.sample(5, rt.device())?;
        let images = models.generator.forward(&z, false)?;
        assert_eq!(images.dims(), &[5, 8, 8, 3]);
        assert!(max_abs(&images)? <= 1.0);

        let scores = models.discriminator.forward(&images, false)?;
        assert_eq!(scores.dims(), &[5, 1]);
        let scores = scores.flatten_all()?.to_vec1::<f32>()?;
        assert!(scores.iter().all(|s| (0.0..=1.0).contains(s)));
        Ok(())
    }

    #[test]
    fn test_weights_registered_with_ledger() -> Result<()> {
        let rt = CandleRuntime::cpu();
        let models = GanModels::build(&tiny(), &rt)?;
        assert!(models.weight_count() > 0);
        assert_eq!(rt.live_tensors(), models.weight_count());
        drop(models);
        assert_eq!(rt.live_tensors(), 0);
        Ok(())
    }

    #[test]
    fn test_discriminator_trainable_after_combined() -> Result<()> {
        let cfg = tiny();
        let rt = CandleRuntime::cpu();
        let models = GanModels::build(&cfg, &rt)?;
        assert!(models.discriminator.is_trainable());
        assert!(!models.discriminator.trainable_vars().is_empty());
        Ok(())
    }

    #[test]
    fn test_frozen_discriminator_rejects_training() -> Result<()> {
        let cfg = tiny();
        let mut d = Discriminator::new(&cfg, &Device::Cpu, &mut component_rng(Some(1), 1))?;
        d.set_trainable(false);
        assert!(d.trainable_vars().is_empty());
        let x = Tensor::zeros((2, 8, 8, 3), DType::F32, &Device::Cpu)?;
        let y = Tensor::zeros((2, 1), DType::F32, &Device::Cpu)?;
        assert!(matches!(
            d.train_on_batch(&x, &y),
            Err(ModelError::NotTrainable(_))
        ));
        Ok(())
    }

    #[test]
    fn test_combined_moves_only_generator() -> Result<()> {
        let cfg = tiny();
        let rt = CandleRuntime::cpu();
        let mut models = GanModels::build(&cfg, &rt)?;
        let mut latents = LatentSampler::new(cfg.latent_size, Some(0));

        let g_before = models.generator.snapshot()?;
        let d_before = models.discriminator.snapshot()?;

        let z = latents.sample(4, rt.device())?;
        let y = Tensor::full(0.95f32, (4, 1), rt.device())?;
        let loss = models.combined.train_on_batch(&models.discriminator, &z, &y)?;
        assert!(loss.is_finite());

        assert_ne!(models.generator.snapshot()?, g_before);
        assert_eq!(models.discriminator.snapshot()?, d_before);
        Ok(())
    }

    #[test]
    fn test_discriminator_step_moves_only_discriminator() -> Result<()> {
        let cfg = tiny();
        let rt = CandleRuntime::cpu();
        let mut models = GanModels::build(&cfg, &rt)?;

        let g_before = models.generator.snapshot()?;
        let d_before = models.discriminator.snapshot()?;

        let x = Tensor::zeros((4, 8, 8, 3), DType::F32, rt.device())?;
        let y = Tensor::new(&[[0.95f32], [0.95], [0.0], [0.0]], rt.device())?;
        models.discriminator.train_on_batch(&x, &y)?;

        assert_eq!(models.generator.snapshot()?, g_before);
        assert_ne!(models.discriminator.snapshot()?, d_before);
        Ok(())
    }

    #[test]
    fn test_generator_save_load_roundtrip() -> Result<()> {
        let cfg = tiny();
        let rt = CandleRuntime::cpu();
        let models = GanModels::build(&cfg, &rt)?;
        let dir = tempfile::tempdir()?;
        models.generator.save(dir.path())?;

        let loaded = Generator::load(dir.path(), rt.device())?;
        assert_eq!(loaded.topology(), models.generator.topology());

        let z = LatentSampler::new(cfg.latent_size, Some(3)).sample(2, rt.device())?;
        let a = models.generator.forward(&z, false)?.flatten_all()?.to_vec1::<f32>()?;
        let b = loaded.forward(&z, false)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(a, b);
        Ok(())
    }

    #[test]
    fn test_load_missing_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let err = Generator::load(dir.path().join("nope"), &Device::Cpu).unwrap_err();
        assert!(matches!(err, ModelError::ModelNotFound(_)));
    }

    #[test]
    fn test_batch_norm_and_dropout_variant() -> Result<()> {
        let mut cfg = tiny();
        cfg.architecture.batch_norm = true;
        cfg.architecture.dropout = 0.3;
        cfg.architecture.anti_checkerboard = false;
        let rt = CandleRuntime::cpu();
        let mut models = GanModels::build(&cfg, &rt)?;

        let z = LatentSampler::new(cfg.latent_size, Some(0)).sample(4, rt.device())?;
        let fake = models.generator.forward(&z, true)?;
        assert_eq!(fake.dims(), &[4, 8, 8, 3]);
        let y = Tensor::zeros((4, 1), DType::F32, rt.device())?;
        assert!(models.discriminator.train_on_batch(&fake, &y)?.is_finite());
        Ok(())
    }
}
