//! # AiMR Generator Library
//!
//! Inference-only access to a trained AiMR generator: load a bundle from a
//! local cache (falling back to a [`ModelSource`] and caching the result),
//! then sample images from it.
//!
//! ```rust,no_run
//! use aimr_common::CandleRuntime;
//! use aimr_lib::{GanLibrary, DirectorySource};
//!
//! # fn main() -> aimr_lib::Result<()> {
//! let mut lib = GanLibrary::new("/var/cache/aimr")
//!     .with_source(Box::new(DirectorySource::new("/mnt/models/aimr")));
//! lib.load(&CandleRuntime::cpu())?;
//! let images = lib.generate(4)?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod source;

use std::path::{Path, PathBuf};

use aimr_common::{Generator, LatentSampler, TensorRuntime};
use candle_core::DType;

pub use error::{LibError, Result};
#[cfg(feature = "remote")]
pub use source::RemoteSource;
pub use source::{DirectorySource, ModelSource};

/// One generated image, HWC, pixels in [0, 255].
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedImage {
    pub pixels: Vec<u8>,
    pub size: usize,
    pub channels: usize,
}

struct Loaded {
    generator: Generator,
    latents: LatentSampler,
}

/// Load-then-generate facade over a generator bundle.
pub struct GanLibrary {
    cache_dir: PathBuf,
    source: Option<Box<dyn ModelSource>>,
    seed: Option<u64>,
    loaded: Option<Loaded>,
}

impl GanLibrary {
    /// Library whose bundle cache lives in `cache_dir`.
    pub fn new<P: Into<PathBuf>>(cache_dir: P) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            source: None,
            seed: None,
            loaded: None,
        }
    }

    /// Fallback consulted when the cache holds no usable bundle.
    pub fn with_source(mut self, source: Box<dyn ModelSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Seed latent sampling for reproducible output.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.is_some()
    }

    /// Load the generator from the cache, or fetch it from the source into
    /// the cache and load it from there.
    pub fn load(&mut self, runtime: &dyn TensorRuntime) -> Result<()> {
        let device = runtime.device();
        let generator = match Generator::load(&self.cache_dir, device) {
            Ok(g) => {
                tracing::info!(dir = %self.cache_dir.display(), "generator loaded from cache");
                g
            }
            Err(e) => {
                let err = LibError::from(e);
                let Some(source) = self.source.as_ref().filter(|_| err.is_cache_miss()) else {
                    return Err(err);
                };
                tracing::info!(
                    source = %source.location(),
                    dir = %self.cache_dir.display(),
                    "cache miss, fetching generator"
                );
                source.fetch_into(&self.cache_dir)?;
                Generator::load(&self.cache_dir, device)?
            }
        };

        let latents = LatentSampler::new(generator.topology().latent_size, self.seed);
        self.loaded = Some(Loaded { generator, latents });
        Ok(())
    }

    /// Sample `n` images from fresh latent vectors.
    pub fn generate(&mut self, n: usize) -> Result<Vec<GeneratedImage>> {
        let loaded = self.loaded.as_mut().ok_or(LibError::NotLoaded)?;
        if n < 1 {
            return Err(LibError::InvalidArgument(format!(
                "image count must be at least 1, got {}",
                n
            )));
        }

        let generator = &loaded.generator;
        let z = loaded.latents.sample(n, generator.device())?;
        let images = generator.forward(&z, false)?;
        let (_, size, _, channels) = images.dims4()?;

        let pixels = images
            .affine(127.5, 127.5)?
            .clamp(0.0, 255.0)?
            .round()?
            .to_dtype(DType::U8)?
            .flatten_all()?
            .to_vec1::<u8>()?;

        Ok(pixels
            .chunks_exact(size * size * channels)
            .map(|chunk| GeneratedImage {
                pixels: chunk.to_vec(),
                size,
                channels,
            })
            .collect())
    }
}
