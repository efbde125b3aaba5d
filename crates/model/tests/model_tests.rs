use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use model::{apply_dcgan_init, Critic, Generator, ModelConfig};

fn build_config(image_size: usize) -> ModelConfig {
    ModelConfig {
        latent_dim: 8,
        gen_features: 4,
        critic_features: 4,
        channels: 3,
        image_size,
        dtype: DType::F32,
        device: Device::Cpu,
    }
}

#[test]
fn generator_produces_images_at_configured_resolution() -> Result<()> {
    for image_size in [16, 32] {
        let generator = Generator::new(build_config(image_size))?;
        let noise = Tensor::randn(0f32, 1f32, (2, 8, 1, 1), &Device::Cpu)?;
        let images = generator.forward_t(&noise, true)?;
        assert_eq!(images.dims(), &[2, 3, image_size, image_size]);

        let values = images.flatten_all()?.to_vec1::<f32>()?;
        assert!(values.iter().all(|v| (-1.0..=1.0).contains(v)));
    }
    Ok(())
}

#[test]
fn critic_scores_one_scalar_per_image() -> Result<()> {
    let critic = Critic::new(build_config(16))?;
    let images = Tensor::randn(0f32, 1f32, (4, 3, 16, 16), &Device::Cpu)?;
    let scores = critic.forward_t(&images, true)?;
    assert_eq!(scores.dims(), &[4]);
    Ok(())
}

#[test]
fn rejects_non_power_of_two_resolution() {
    let mut config = build_config(16);
    config.image_size = 48;
    assert!(Generator::new(config.clone()).is_err());
    assert!(Critic::new(config).is_err());
}

#[test]
fn trainable_flag_toggles_in_bulk() -> Result<()> {
    let critic = Critic::new(build_config(16))?;
    assert!(critic.trainable());
    critic.set_trainable(false);
    assert!(!critic.trainable());
    critic.set_trainable(true);
    assert!(critic.trainable());
    Ok(())
}

#[test]
fn state_roundtrips_through_disk() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("generator.safetensors");

    let config = build_config(16);
    let generator = Generator::new(config.clone())?;
    let critic = Critic::new(config.clone())?;
    apply_dcgan_init(&generator, &critic)?;
    generator.save_state(&path)?;

    let mut restored = Generator::new(config)?;
    restored.load_state(&path)?;

    let noise = Tensor::randn(0f32, 1f32, (1, 8, 1, 1), &Device::Cpu)?;
    let expected = generator
        .forward_t(&noise, false)?
        .flatten_all()?
        .to_vec1::<f32>()?;
    let actual = restored
        .forward_t(&noise, false)?
        .flatten_all()?
        .to_vec1::<f32>()?;
    assert_eq!(expected.len(), actual.len());
    for (a, b) in expected.iter().zip(actual.iter()) {
        assert!((a - b).abs() < 1e-6);
    }
    Ok(())
}
