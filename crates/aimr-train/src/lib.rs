//! # AiMR Training Library
//!
//! Adversarial training for the AiMR image GAN on top of `aimr-common`.
//!
//! ## Architecture Overview
//!
//! - **Data**: one in-memory `[N, H, W, C]` dataset built from an image
//!   directory or a raw f32 cache, walked by a cursor that keeps a single
//!   batch view alive at a time
//! - **Training**: discriminator step, generator step through the combined
//!   model, then metrics, memory guard, preview and checkpointing
//! - **Sinks**: scalar series (JSON lines), PNG previews, checkpoints
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::atomic::AtomicBool;
//! use std::sync::Arc;
//! use aimr_common::{CandleRuntime, TrainingConfig};
//! use aimr_train::{data::ImageDataset, train::GanTrainer};
//!
//! # fn main() -> anyhow::Result<()> {
//! let mut config = TrainingConfig::default();
//! config.inputs_path = Some("images/".into());
//! config.dataset_path = Some("dataset.bin".into());
//!
//! let mut trainer = GanTrainer::new(config, Arc::new(CandleRuntime::cpu()))?;
//! let dataset = ImageDataset::open(&trainer.config, trainer.runtime())?;
//! trainer.train(&dataset, &AtomicBool::new(false))?;
//! # Ok(())
//! # }
//! ```

pub mod checkpoint;
pub mod data;
pub mod error;
pub mod guard;
pub mod logging;
pub mod metrics;
pub mod preview;
pub mod train;

pub use error::{TrainError, TrainResult};
