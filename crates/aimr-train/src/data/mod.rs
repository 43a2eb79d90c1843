pub mod dataset;

pub use dataset::{Batch, BatchIter, ImageDataset};
