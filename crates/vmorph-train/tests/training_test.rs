use std::path::Path;
use std::sync::Arc;

use burn::config::Config;
use burn::tensor::cast::ToElement;
use burn::tensor::{Distribution, Tensor};
use burn_ndarray::NdArray;
use ndarray::Array3;
use tempfile::TempDir;
use vmorph_io::{volume_to_batch, write_npz_volume, Volume3};
use vmorph_core::RegistrationError;
use vmorph_model::checkpoint::{checkpoint_file, checkpoint_path};
use vmorph_model::{list_checkpoints, load_checkpoint, save_checkpoint, Miccai2018LossConfig, VxmNet, VxmNetConfig};
use vmorph_train::device::CpuBackend;
use vmorph_train::{inference_model, HistoryCallback, ProgressTracker, Trainer, TrainerState, TrainingConfig};

type Backend = NdArray<f32>;

const GRID: usize = 8;

fn small_model() -> VxmNetConfig {
    VxmNetConfig::new()
        .with_enc_features(vec![4, 8])
        .with_dec_features(vec![8, 8, 8, 4])
        .with_int_steps(3)
}

fn write_volume(path: &Path, volume: &Volume3) {
    write_npz_volume(path, "vol", volume).unwrap();
}

/// Temp workspace with an atlas and `subjects` training volumes.
fn workspace(atlas: &Volume3, subjects: &[Volume3]) -> (TempDir, TrainingConfig) {
    let root = tempfile::tempdir().unwrap();
    let data_dir = root.path().join("data");
    std::fs::create_dir_all(&data_dir).unwrap();

    let atlas_file = root.path().join("atlas.npz");
    write_volume(&atlas_file, atlas);
    for (i, subject) in subjects.iter().enumerate() {
        write_volume(&data_dir.join(format!("subject_{}.npz", i)), subject);
    }

    let config = TrainingConfig::new(
        data_dir,
        atlas_file,
        root.path().join("models"),
        small_model(),
        Miccai2018LossConfig::new(),
    )
    .with_lr(1e-2)
    .with_steps_per_epoch(5)
    .with_epochs(2)
    .with_queue_capacity(2);

    (root, config)
}

fn blob(centre: [f32; 3]) -> Volume3 {
    Array3::from_shape_fn((GRID, GRID, GRID), |(d, h, w)| {
        let r2 = (d as f32 - centre[0]).powi(2) + (h as f32 - centre[1]).powi(2) + (w as f32 - centre[2]).powi(2);
        (-r2 / 8.0).exp()
    })
}

#[test]
fn test_empty_data_dir_fails_before_training() {
    let root = tempfile::tempdir().unwrap();
    let data_dir = root.path().join("data");
    std::fs::create_dir_all(&data_dir).unwrap();
    let atlas_file = root.path().join("atlas.npz");
    write_volume(&atlas_file, &blob([3.5, 3.5, 3.5]));
    let model_dir = root.path().join("models");

    let config = TrainingConfig::new(
        data_dir,
        atlas_file,
        model_dir.clone(),
        small_model(),
        Miccai2018LossConfig::new(),
    );

    let err = Trainer::prepare(config).err().expect("prepare should fail without data");
    assert!(err.is_data_not_found(), "unexpected error: {}", err);
    // Nothing was set up for training.
    assert!(!model_dir.exists());
}

#[test]
fn test_atlas_grid_not_divisible_by_levels_is_rejected() {
    let atlas = Array3::<f32>::zeros((6, 8, 8));
    let (_root, config) = workspace(&atlas, &[blob([3.5, 3.5, 3.5])]);
    assert!(Trainer::prepare(config).is_err());
}

#[test]
fn test_two_epochs_write_three_loadable_checkpoints() {
    let (_root, config) = workspace(&blob([4.0, 3.5, 3.5]), &[blob([3.0, 3.5, 3.5]), blob([3.5, 3.0, 3.5])]);
    let model_dir = config.model_dir.clone();
    let model_config = config.model.clone();

    let mut trainer = Trainer::prepare(config).unwrap();
    let history = HistoryCallback::new();
    let mut tracker = ProgressTracker::new(1e-2);
    tracker.add_callback(Arc::new(history.clone()));

    let device = Default::default();
    let outcome = trainer.run::<CpuBackend>(&device, &tracker).unwrap();
    assert_eq!(trainer.state(), TrainerState::Completed);

    let checkpoints = list_checkpoints(&model_dir).unwrap();
    let epochs: Vec<usize> = checkpoints.iter().map(|(epoch, _)| *epoch).collect();
    assert_eq!(epochs, vec![0, 1, 2]);
    assert_eq!(outcome.summary.checkpoints.len(), 3);
    assert_eq!(outcome.summary.steps, 10);
    assert_eq!(history.steps().len(), 10);
    assert_eq!(history.checkpoints().len(), 3);
    assert!(model_dir.join("history.json").is_file());
    assert!(model_dir.join("model.json").is_file());
    let saved = TrainingConfig::load(model_dir.join("training.json")).unwrap();
    assert_eq!(saved.epochs, 2);
    assert_eq!(outcome.summary.final_loss(), history.epochs().last().map(|epoch| epoch.loss));

    let moving = Tensor::<Backend, 5>::random([1, 1, GRID, GRID, GRID], Distribution::Default, &device);
    let fixed = Tensor::<Backend, 5>::random([1, 1, GRID, GRID, GRID], Distribution::Default, &device);

    // Every checkpoint loads on its own.
    for (_, path) in &checkpoints {
        let model = load_checkpoint::<Backend>(&model_config, path, &device).unwrap();
        let out = model.register(moving.clone(), fixed.clone());
        assert!(out.warped.abs().max().into_scalar().to_f64().is_finite());
    }

    // The last one matches the model in memory.
    let restored = load_checkpoint::<Backend>(&model_config, &checkpoint_file(&model_dir, 2), &device).unwrap();
    let trained = inference_model(&outcome.model);
    let a = trained.register(moving.clone(), fixed.clone());
    let b = restored.register(moving, fixed);
    let diff = (a.deformation - b.deformation).abs().max().into_scalar().to_f64();
    assert!(diff < 1e-6, "checkpoint differs from trained model by {}", diff);
}

/// Largest deformation difference between two networks on fixed inputs.
fn deformation_gap(a: &VxmNet<Backend>, b: &VxmNet<Backend>) -> f64 {
    let device = Default::default();
    let moving = volume_to_batch::<Backend>(&blob([3.0, 3.5, 3.5]), 1, &device);
    let fixed = volume_to_batch::<Backend>(&blob([4.0, 3.5, 3.5]), 1, &device);
    let a = a.register(moving.clone(), fixed.clone());
    let b = b.register(moving, fixed);
    (a.deformation - b.deformation).abs().max().into_scalar().to_f64()
}

#[test]
fn test_each_checkpoint_matches_model_when_saved() {
    let (root, config) = workspace(&blob([4.0, 3.5, 3.5]), &[blob([3.0, 3.5, 3.5]), blob([3.5, 3.0, 3.5])]);
    let model_dir = config.model_dir.clone();
    let model_config = config.model.clone();
    let device = Default::default();

    let seed_dir = root.path().join("seed");
    let mut current = model_config.init::<Backend>(&device).unwrap();
    save_checkpoint(&current, &seed_dir, 0).unwrap();
    let mut weights = checkpoint_path(&seed_dir, 0);

    // One epoch per run, each starting from the previous checkpoint.
    for epoch in 0..2 {
        let config = config
            .clone()
            .with_initial_epoch(epoch)
            .with_epochs(epoch + 1)
            .with_load_model_file(Some(weights));
        let mut trainer = Trainer::prepare(config).unwrap();
        let outcome = trainer
            .run::<CpuBackend>(&device, &ProgressTracker::new(1e-2))
            .unwrap();

        let first = load_checkpoint::<Backend>(&model_config, &checkpoint_file(&model_dir, epoch), &device).unwrap();
        let gap = deformation_gap(&current, &first);
        assert!(gap < 1e-6, "checkpoint {} differs from the starting model by {}", epoch, gap);

        let trained = inference_model(&outcome.model);
        let last = load_checkpoint::<Backend>(&model_config, &checkpoint_file(&model_dir, epoch + 1), &device).unwrap();
        let gap = deformation_gap(&trained, &last);
        assert!(gap < 1e-6, "checkpoint {} differs from the trained model by {}", epoch + 1, gap);

        current = trained;
        weights = checkpoint_path(&model_dir, epoch + 1);
    }
}

#[test]
fn test_subject_off_the_atlas_grid_stops_training() {
    let big = Array3::<f32>::zeros((2 * GRID, GRID, GRID));
    let (_root, config) = workspace(&blob([4.0, 3.5, 3.5]), &[big]);
    let model_dir = config.model_dir.clone();

    let mut trainer = Trainer::prepare(config).unwrap();
    let err = trainer
        .run::<CpuBackend>(&Default::default(), &ProgressTracker::new(1e-2))
        .err()
        .expect("a subject on another grid should stop training");

    assert!(
        matches!(err.registration_error(), Some(RegistrationError::ShapeMismatch { .. })),
        "unexpected error: {}",
        err
    );
    assert_eq!(trainer.state(), TrainerState::Failed);
    let epochs: Vec<usize> = list_checkpoints(&model_dir)
        .unwrap()
        .into_iter()
        .map(|(epoch, _)| epoch)
        .collect();
    assert_eq!(epochs, vec![0]);
}

#[test]
fn test_resume_names_first_checkpoint_after_initial_epoch() {
    let (_root, config) = workspace(&blob([4.0, 3.5, 3.5]), &[blob([3.0, 3.5, 3.5])]);
    let config = config.with_initial_epoch(3).with_epochs(4).with_steps_per_epoch(2);
    let model_dir = config.model_dir.clone();

    let mut trainer = Trainer::prepare(config).unwrap();
    trainer
        .run::<CpuBackend>(&Default::default(), &ProgressTracker::new(1e-2))
        .unwrap();

    let epochs: Vec<usize> = list_checkpoints(&model_dir)
        .unwrap()
        .into_iter()
        .map(|(epoch, _)| epoch)
        .collect();
    assert_eq!(epochs, vec![3, 4]);
}

#[test]
fn test_nan_volume_aborts_and_keeps_initial_checkpoint() {
    let nan = Array3::<f32>::from_elem((GRID, GRID, GRID), f32::NAN);
    let (_root, config) = workspace(&blob([4.0, 3.5, 3.5]), &[nan]);
    let model_dir = config.model_dir.clone();

    let mut trainer = Trainer::prepare(config).unwrap();
    let err = trainer
        .run::<CpuBackend>(&Default::default(), &ProgressTracker::new(1e-2))
        .err()
        .expect("training on NaN data should abort");

    assert!(err.is_numerical_instability(), "unexpected error: {}", err);
    assert_eq!(trainer.state(), TrainerState::Failed);
    assert!(checkpoint_file(&model_dir, 0).is_file());
    assert!(!checkpoint_file(&model_dir, 1).exists());
}

#[test]
fn test_zero_moving_volume_against_ones_atlas() {
    let ones = Array3::<f32>::ones((GRID, GRID, GRID));
    let zeros = Array3::<f32>::zeros((GRID, GRID, GRID));
    let (_root, config) = workspace(&ones, &[zeros.clone()]);
    let config = config.with_epochs(4).with_lr(1e-3);

    let mut trainer = Trainer::prepare(config).unwrap();
    let device = Default::default();
    let outcome = trainer.run::<CpuBackend>(&device, &ProgressTracker::new(1e-3)).unwrap();

    let losses: Vec<f64> = outcome.summary.history.iter().map(|epoch| epoch.loss).collect();
    assert_eq!(losses.len(), 4);
    for pair in losses.windows(2) {
        assert!(pair[1] < pair[0], "epoch loss went up: {:?}", losses);
    }

    // A zero volume stays zero under any warp, so its error cannot grow.
    let model = inference_model(&outcome.model);
    let atlas = volume_to_batch::<Backend>(&ones, 1, &device);
    let moving = volume_to_batch::<Backend>(&zeros, 1, &device);
    let warped = model.register(moving, atlas.clone()).warped;
    let mse = (atlas - warped).powf_scalar(2.0).mean().into_scalar().to_f64();
    assert!((mse - 1.0).abs() < 1e-6);
}
