//! Checkpoint files for the registration network.
//!
//! A model directory holds `model.json` (the network config) and one
//! `NN.mpk` weight file per saved epoch.

use std::fs;
use std::path::{Path, PathBuf};

use burn::{
    config::Config,
    module::Module,
    record::{FullPrecisionSettings, NamedMpkFileRecorder},
    tensor::backend::Backend,
};
use tracing::info;
use vmorph_core::{RegistrationError, Result};

use crate::network::{VxmNet, VxmNetConfig};

/// Name of the network config file inside a model directory.
pub const MODEL_CONFIG_FILE: &str = "model.json";

const CHECKPOINT_EXTENSION: &str = "mpk";

fn recorder() -> NamedMpkFileRecorder<FullPrecisionSettings> {
    NamedMpkFileRecorder::<FullPrecisionSettings>::new()
}

/// Checkpoint stem for `epoch`, e.g. `model_dir/03`.
///
/// The recorder appends the `.mpk` extension.
pub fn checkpoint_path(model_dir: &Path, epoch: usize) -> PathBuf {
    model_dir.join(format!("{:02}", epoch))
}

/// File actually written for `epoch`.
pub fn checkpoint_file(model_dir: &Path, epoch: usize) -> PathBuf {
    checkpoint_path(model_dir, epoch).with_extension(CHECKPOINT_EXTENSION)
}

/// Write the weights of `model` as the checkpoint for `epoch`.
pub fn save_checkpoint<B: Backend>(model: &VxmNet<B>, model_dir: &Path, epoch: usize) -> Result<PathBuf> {
    fs::create_dir_all(model_dir).map_err(|e| {
        RegistrationError::checkpoint(format!("cannot create {}: {}", model_dir.display(), e))
    })?;

    let path = checkpoint_path(model_dir, epoch);
    model
        .clone()
        .save_file(path.clone(), &recorder())
        .map_err(|e| RegistrationError::checkpoint(format!("cannot save {}: {}", path.display(), e)))?;

    let file = checkpoint_file(model_dir, epoch);
    info!("Saved checkpoint {}", file.display());
    Ok(file)
}

/// Build a network from `config` and load weights from `path`.
///
/// `path` may be given with or without the `.mpk` extension.
pub fn load_checkpoint<B: Backend>(config: &VxmNetConfig, path: &Path, device: &B::Device) -> Result<VxmNet<B>> {
    let model = config.init::<B>(device)?;
    load_weights(model, path, device)
}

/// Load weights from `path` into an already built network.
pub fn load_weights<B: Backend>(model: VxmNet<B>, path: &Path, device: &B::Device) -> Result<VxmNet<B>> {
    let file = path.with_extension(CHECKPOINT_EXTENSION);
    if !file.is_file() {
        return Err(RegistrationError::checkpoint(format!(
            "checkpoint {} does not exist",
            file.display()
        )));
    }

    let model = model
        .load_file(file.clone(), &recorder(), device)
        .map_err(|e| RegistrationError::checkpoint(format!("cannot load {}: {}", file.display(), e)))?;
    info!("Loaded checkpoint {}", file.display());
    Ok(model)
}

/// Write `model_dir/model.json`.
pub fn save_model_config(config: &VxmNetConfig, model_dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(model_dir).map_err(|e| {
        RegistrationError::checkpoint(format!("cannot create {}: {}", model_dir.display(), e))
    })?;

    let path = model_dir.join(MODEL_CONFIG_FILE);
    config
        .save(&path)
        .map_err(|e| RegistrationError::checkpoint(format!("cannot write {}: {}", path.display(), e)))?;
    Ok(path)
}

/// Read `model_dir/model.json`.
pub fn load_model_config(model_dir: &Path) -> Result<VxmNetConfig> {
    let path = model_dir.join(MODEL_CONFIG_FILE);
    VxmNetConfig::load(&path)
        .map_err(|e| RegistrationError::checkpoint(format!("cannot read {}: {}", path.display(), e)))
}

/// All checkpoints in `model_dir`, sorted by epoch.
///
/// Only files named `<digits>.mpk` count. A missing directory has none.
pub fn list_checkpoints(model_dir: &Path) -> Result<Vec<(usize, PathBuf)>> {
    if !model_dir.exists() {
        return Ok(Vec::new());
    }

    let entries = fs::read_dir(model_dir).map_err(|e| {
        RegistrationError::checkpoint(format!("cannot list {}: {}", model_dir.display(), e))
    })?;

    let mut checkpoints = Vec::new();
    for entry in entries {
        let path = entry
            .map_err(|e| RegistrationError::checkpoint(e.to_string()))?
            .path();
        if path.extension().and_then(|e| e.to_str()) != Some(CHECKPOINT_EXTENSION) {
            continue;
        }
        let epoch = path
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()))
            .and_then(|s| s.parse::<usize>().ok());
        if let Some(epoch) = epoch {
            checkpoints.push((epoch, path));
        }
    }

    checkpoints.sort_by_key(|(epoch, _)| *epoch);
    Ok(checkpoints)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_naming() {
        let dir = Path::new("/models");
        assert_eq!(checkpoint_path(dir, 0), PathBuf::from("/models/00"));
        assert_eq!(checkpoint_path(dir, 7), PathBuf::from("/models/07"));
        assert_eq!(checkpoint_path(dir, 123), PathBuf::from("/models/123"));
        assert_eq!(checkpoint_file(dir, 3), PathBuf::from("/models/03.mpk"));
    }

    #[test]
    fn test_list_ignores_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["02.mpk", "00.mpk", "10.mpk", "model.json", "notes.mpk", "01.bin"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }

        let epochs: Vec<usize> = list_checkpoints(dir.path())
            .unwrap()
            .into_iter()
            .map(|(epoch, _)| epoch)
            .collect();
        assert_eq!(epochs, vec![0, 2, 10]);
    }

    #[test]
    fn test_list_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nothing-here");
        assert!(list_checkpoints(&missing).unwrap().is_empty());
    }

    #[test]
    fn test_model_config_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let config = VxmNetConfig::new().with_int_steps(5).with_full_size(true);
        save_model_config(&config, dir.path()).unwrap();

        let loaded = load_model_config(dir.path()).unwrap();
        assert_eq!(loaded.int_steps, 5);
        assert!(loaded.full_size);
        assert_eq!(loaded.enc_features, config.enc_features);
    }
}
