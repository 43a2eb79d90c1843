//! Training checkpoint save/restore.
//!
//! Layout of a checkpoint directory:
//!   - `generator/model.json` + `generator/weights.safetensors`, the same
//!     bundle `aimr-lib` loads
//!   - `discriminator.safetensors`
//!   - `meta.json`, removed first and written last so its presence marks a
//!     complete checkpoint

use std::path::{Path, PathBuf};

use aimr_common::{GanModels, TrainingConfig};
use serde::{Deserialize, Serialize};

use crate::error::{checkpoint_error, IoResultExt, TrainResult};

const GENERATOR_DIR: &str = "generator";
const DISCRIMINATOR_FILE: &str = "discriminator.safetensors";
const META_FILE: &str = "meta.json";

/// Metadata stored alongside model weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub config: TrainingConfig,
    /// Completed epochs.
    pub epoch: usize,
    /// Completed batches over the whole run.
    pub step: usize,
    pub d_loss: f64,
    pub g_loss: f64,
}

/// Checkpoint directory.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn generator_dir(&self) -> PathBuf {
        self.dir.join(GENERATOR_DIR)
    }

    /// Whether a complete checkpoint is present.
    pub fn exists(&self) -> bool {
        self.dir.join(META_FILE).is_file()
    }

    /// Persist both models and the metadata.
    pub fn save(&self, models: &GanModels, meta: &CheckpointMeta) -> TrainResult<()> {
        std::fs::create_dir_all(&self.dir).with_path(&self.dir)?;

        // Until the new meta lands the directory holds a mix of old and new
        // weights, so it must not read as complete.
        let meta_path = self.dir.join(META_FILE);
        if meta_path.exists() {
            std::fs::remove_file(&meta_path).with_path(&meta_path)?;
        }

        models
            .generator
            .save(self.generator_dir())
            .map_err(|e| checkpoint_error(e.to_string(), self.generator_dir()))?;

        let d_path = self.dir.join(DISCRIMINATOR_FILE);
        models
            .discriminator
            .save_weights(&d_path)
            .map_err(|e| checkpoint_error(e.to_string(), &d_path))?;

        let json = serde_json::to_string_pretty(meta)
            .map_err(|e| checkpoint_error(e.to_string(), &meta_path))?;
        std::fs::write(&meta_path, json).with_path(&meta_path)?;
        Ok(())
    }

    /// Read the metadata only.
    pub fn load_meta(&self) -> TrainResult<CheckpointMeta> {
        let meta_path = self.dir.join(META_FILE);
        let json = std::fs::read_to_string(&meta_path).with_path(&meta_path)?;
        serde_json::from_str(&json).map_err(|e| checkpoint_error(e.to_string(), &meta_path))
    }

    /// Overwrite the weights of `models` in place and return the metadata.
    pub fn restore(&self, models: &mut GanModels) -> TrainResult<CheckpointMeta> {
        if !self.exists() {
            return Err(checkpoint_error("no checkpoint found", &self.dir));
        }
        let meta = self.load_meta()?;

        let weights = self.generator_dir().join(aimr_common::model::WEIGHTS_FILE);
        models
            .generator
            .load_weights(&weights)
            .map_err(|e| checkpoint_error(e.to_string(), &weights))?;

        let d_path = self.dir.join(DISCRIMINATOR_FILE);
        models
            .discriminator
            .load_weights(&d_path)
            .map_err(|e| checkpoint_error(e.to_string(), &d_path))?;

        Ok(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aimr_common::CandleRuntime;

    fn meta(cfg: &TrainingConfig) -> CheckpointMeta {
        CheckpointMeta {
            config: cfg.clone(),
            epoch: 3,
            step: 42,
            d_loss: 0.69,
            g_loss: 0.71,
        }
    }

    #[test]
    fn test_checkpoint_save_restore_roundtrip() -> TrainResult<()> {
        let cfg = TrainingConfig::tiny_cpu();
        let rt = CandleRuntime::cpu();
        let trained = GanModels::build(&cfg, &rt)?;

        let dir = tempfile::tempdir()?;
        let store = CheckpointStore::new(dir.path().join("ckpt"));
        assert!(!store.exists());
        store.save(&trained, &meta(&cfg))?;
        assert!(store.exists());
        assert!(store.generator_dir().join("model.json").exists());

        let mut other_cfg = cfg.clone();
        other_cfg.seed = Some(7);
        let mut fresh = GanModels::build(&other_cfg, &rt)?;
        assert_ne!(fresh.generator.snapshot()?, trained.generator.snapshot()?);

        let restored = store.restore(&mut fresh)?;
        assert_eq!(restored.epoch, 3);
        assert_eq!(restored.step, 42);
        assert_eq!(fresh.generator.snapshot()?, trained.generator.snapshot()?);
        assert_eq!(fresh.discriminator.snapshot()?, trained.discriminator.snapshot()?);
        Ok(())
    }

    #[test]
    fn test_failed_save_leaves_no_complete_checkpoint() -> TrainResult<()> {
        let cfg = TrainingConfig::tiny_cpu();
        let rt = CandleRuntime::cpu();
        let models = GanModels::build(&cfg, &rt)?;

        let dir = tempfile::tempdir()?;
        let store = CheckpointStore::new(dir.path().join("ckpt"));
        store.save(&models, &meta(&cfg))?;
        assert!(store.exists());

        // a directory where the discriminator file goes makes its write fail
        let d_path = store.dir().join(DISCRIMINATOR_FILE);
        std::fs::remove_file(&d_path)?;
        std::fs::create_dir_all(&d_path)?;

        assert!(store.save(&models, &meta(&cfg)).is_err());
        assert!(!store.exists());
        let mut fresh = GanModels::build(&cfg, &rt)?;
        assert!(store.restore(&mut fresh).is_err());
        Ok(())
    }

    #[test]
    fn test_restore_without_checkpoint() -> TrainResult<()> {
        let cfg = TrainingConfig::tiny_cpu();
        let rt = CandleRuntime::cpu();
        let mut models = GanModels::build(&cfg, &rt)?;
        let dir = tempfile::tempdir()?;
        let err = CheckpointStore::new(dir.path()).restore(&mut models).err();
        assert!(matches!(err, Some(crate::error::TrainError::Checkpoint { .. })));
        Ok(())
    }
}
