//! aimr-common: model factory and tensor runtime adapter for the AiMR
//! image GAN.
//!
//! Shared by the `aimr-train` trainer and the inference-only `aimr-lib`.

pub mod config;
pub mod error;
pub mod init;
pub mod latent;
pub mod model;
pub mod runtime;

pub use config::{ArchitectureConfig, TrainingConfig};
pub use error::{ModelError, Result};
pub use latent::LatentSampler;
pub use model::{
    binary_cross_entropy, Combined, Discriminator, GanModels, Generator, GeneratorTopology,
};
pub use runtime::{AllocationLedger, Backend, CandleRuntime, Reservation, Scope, TensorRuntime, Tracked};
