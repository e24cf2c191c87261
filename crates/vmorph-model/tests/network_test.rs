use burn::backend::Autodiff;
use burn::module::AutodiffModule;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::tensor::cast::ToElement;
use burn::tensor::{Distribution, Tensor, TensorData};
use burn_ndarray::NdArray;
use vmorph_model::checkpoint::{checkpoint_file, load_weights};
use vmorph_model::{
    list_checkpoints, load_checkpoint, load_model_config, save_checkpoint, save_model_config, Miccai2018LossConfig,
    VxmNetConfig,
};

type Backend = NdArray<f32>;
type TrainBackend = Autodiff<Backend>;

fn small_config() -> VxmNetConfig {
    VxmNetConfig::new()
        .with_enc_features(vec![4, 8])
        .with_dec_features(vec![8, 8, 8, 4])
        .with_int_steps(3)
}

/// Gaussian blob of radius ~2 voxels centred at `centre` on an 8^3 grid.
fn blob(centre: [f32; 3]) -> Vec<f32> {
    let n = 8;
    let mut data = Vec::with_capacity(n * n * n);
    for d in 0..n {
        for h in 0..n {
            for w in 0..n {
                let r2 = (d as f32 - centre[0]).powi(2) + (h as f32 - centre[1]).powi(2) + (w as f32 - centre[2]).powi(2);
                data.push((-r2 / 8.0).exp());
            }
        }
    }
    data
}

#[test]
fn test_checkpoint_roundtrip_preserves_registration() {
    let device = Default::default();
    let dir = tempfile::tempdir().unwrap();
    let config = small_config();
    let model = config.init::<Backend>(&device).unwrap();

    save_model_config(&config, dir.path()).unwrap();
    let written = save_checkpoint(&model, dir.path(), 0).unwrap();
    assert_eq!(written, checkpoint_file(dir.path(), 0));
    assert!(written.is_file());

    let loaded_config = load_model_config(dir.path()).unwrap();
    let restored = load_checkpoint::<Backend>(&loaded_config, &written, &device).unwrap();

    let moving = Tensor::<Backend, 5>::random([1, 1, 8, 8, 8], Distribution::Default, &device);
    let fixed = Tensor::<Backend, 5>::random([1, 1, 8, 8, 8], Distribution::Default, &device);
    let a = model.register(moving.clone(), fixed.clone());
    let b = restored.register(moving, fixed);

    let diff = (a.warped - b.warped).abs().max().into_scalar().to_f64();
    assert!(diff < 1e-6, "restored model differs by {}", diff);
    let diff = (a.log_variance - b.log_variance).abs().max().into_scalar().to_f64();
    assert!(diff < 1e-6);

    assert_eq!(list_checkpoints(dir.path()).unwrap().len(), 1);
}

#[test]
fn test_missing_checkpoint_is_an_error() {
    let device = Default::default();
    let dir = tempfile::tempdir().unwrap();
    let model = small_config().init::<Backend>(&device).unwrap();
    let result = load_weights(model, &dir.path().join("05"), &device);
    assert!(result.is_err());
}

#[test]
fn test_loss_is_finite_at_initialisation() {
    let device = Default::default();
    let model = small_config().init::<Backend>(&device).unwrap();
    let loss = Miccai2018LossConfig::new().init().unwrap();

    let moving = Tensor::<Backend, 5>::from_data(TensorData::new(blob([3.0, 3.5, 3.5]), [1, 1, 8, 8, 8]), &device);
    let atlas = Tensor::<Backend, 5>::from_data(TensorData::new(blob([4.0, 3.5, 3.5]), [1, 1, 8, 8, 8]), &device);

    let output = model.forward(moving, atlas.clone());
    let parts = loss.total(atlas, &output);
    let recon = parts.recon.into_scalar().to_f64();
    let kl = parts.kl.into_scalar().to_f64();
    let total = parts.total.into_scalar().to_f64();

    assert!(recon.is_finite() && kl.is_finite());
    assert!((total - (recon + kl)).abs() <= 1e-3 * total.abs().max(1.0));
}

#[test]
fn test_one_optimizer_step_moves_the_deformation() {
    let device = Default::default();
    let model = small_config().init::<TrainBackend>(&device).unwrap();
    let loss = Miccai2018LossConfig::new().init().unwrap();
    let mut optimizer = AdamConfig::new().init();

    let moving =
        Tensor::<TrainBackend, 5>::from_data(TensorData::new(blob([3.0, 3.5, 3.5]), [1, 1, 8, 8, 8]), &device);
    let atlas =
        Tensor::<TrainBackend, 5>::from_data(TensorData::new(blob([4.0, 3.5, 3.5]), [1, 1, 8, 8, 8]), &device);

    let before = model
        .valid()
        .register(moving.clone().inner(), atlas.clone().inner())
        .deformation;

    let output = model.forward(moving.clone(), atlas.clone());
    let grads = loss.total(atlas.clone(), &output).total.backward();
    let grads = GradientsParams::from_grads(grads, &model);
    let model = optimizer.step(1e-2, model, grads);

    let after = model.valid().register(moving.inner(), atlas.inner()).deformation;
    let change = (after - before).abs().max().into_scalar().to_f64();
    assert!(change > 1e-6, "deformation did not change: {}", change);
}
