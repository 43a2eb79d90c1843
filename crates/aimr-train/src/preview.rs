//! PNG preview of generated and dataset images.

use std::path::{Path, PathBuf};

use candle_core::{DType, Tensor};

use crate::error::{TrainError, TrainResult};

/// Square image with pixels already in [0, 255], HWC order.
#[derive(Debug, Clone, PartialEq)]
pub struct PreviewImage {
    pub pixels: Vec<u8>,
    pub side: usize,
    pub channels: usize,
}

impl PreviewImage {
    /// Convert one `[1, H, W, C]` or `[H, W, C]` image in [-1, 1], upscaled
    /// to `side` with nearest-neighbour sampling.
    pub fn from_tensor(image: &Tensor, side: usize) -> TrainResult<Self> {
        let image = match image.rank() {
            4 => image.squeeze(0)?,
            _ => image.clone(),
        };
        let (_, _, channels) = image.dims3()?;

        // upsample_nearest2d wants NCHW
        let scaled = image
            .permute((2, 0, 1))?
            .unsqueeze(0)?
            .upsample_nearest2d(side, side)?
            .squeeze(0)?
            .permute((1, 2, 0))?;

        let pixels = scaled
            .affine(127.5, 127.5)?
            .clamp(0.0, 255.0)?
            .round()?
            .to_dtype(DType::U8)?
            .flatten_all()?
            .to_vec1::<u8>()?;

        Ok(Self {
            pixels,
            side,
            channels,
        })
    }
}

/// Destination for preview images.
pub trait PreviewSink {
    /// `is_sample` marks a dataset sample rather than a generated image.
    fn write(&mut self, image: &PreviewImage, is_sample: bool) -> TrainResult<()>;
}

/// Writes `<name>.png` for generated images and `<name>.sample.png` for
/// dataset samples.
#[derive(Debug, Clone)]
pub struct PngPreview {
    preview: PathBuf,
    sample: PathBuf,
}

impl PngPreview {
    /// `None` unless `path` ends in `.png`.
    pub fn new<P: AsRef<Path>>(path: P, scale: usize) -> Option<Self> {
        let preview = path.as_ref().to_path_buf();
        let name = preview.to_str()?;
        let stem = name.strip_suffix(".png")?;
        let sample = PathBuf::from(format!("{}.sample.png", stem));

        tracing::info!(
            "to view the live preview: feh -Z -g {0}x{0} --reload 1 {1}",
            scale,
            preview.display()
        );
        tracing::info!(
            "to view live dataset samples: feh -Z -g {0}x{0} --reload 1 {1}",
            scale,
            sample.display()
        );
        Some(Self { preview, sample })
    }

    pub fn preview_path(&self) -> &Path {
        &self.preview
    }

    pub fn sample_path(&self) -> &Path {
        &self.sample
    }
}

impl PreviewSink for PngPreview {
    fn write(&mut self, image: &PreviewImage, is_sample: bool) -> TrainResult<()> {
        let path = if is_sample { &self.sample } else { &self.preview };
        save_png(path, image)
    }
}

/// Encode `image` as a PNG at `path`.
pub fn save_png(path: &Path, image: &PreviewImage) -> TrainResult<()> {
    let color = match image.channels {
        1 => image::ExtendedColorType::L8,
        3 => image::ExtendedColorType::Rgb8,
        n => return Err(TrainError::Preview(format!("unsupported channel count {}", n))),
    };
    image::save_buffer(
        path,
        &image.pixels,
        image.side as u32,
        image.side as u32,
        color,
    )
    .map_err(|e| TrainError::Preview(format!("{}: {}", path.display(), e)))
}
