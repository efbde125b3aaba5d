use candle_core::{DType, Result, Tensor};
use candle_nn::VarMap;

use crate::{Critic, Generator};

const CONV_STD: f32 = 0.02;
const NORM_STD: f32 = 0.02;

/// DCGAN weight policy: convolution kernels drawn from N(0, 0.02), batch-norm
/// scales from N(1, 0.02), batch-norm biases zeroed. Running statistics keep
/// their layer defaults.
pub fn apply_dcgan_init(generator: &Generator, critic: &Critic) -> Result<()> {
    init_varmap(generator.varmap())?;
    init_varmap(critic.varmap())
}

fn init_varmap(varmap: &VarMap) -> Result<()> {
    let data = varmap.data().lock().unwrap();
    for (name, var) in data.iter() {
        if name.contains("running_") {
            continue;
        }
        let shape = var.as_tensor().dims().to_vec();
        let device = var.as_tensor().device().clone();
        let dtype = var.as_tensor().dtype();
        let init = if name.contains(".bn.") {
            if name.ends_with("weight") {
                Tensor::randn(1.0f32, NORM_STD, shape, &device)?
            } else {
                Tensor::zeros(shape, DType::F32, &device)?
            }
        } else {
            Tensor::randn(0.0f32, CONV_STD, shape, &device)?
        };
        var.set(&init.to_dtype(dtype)?)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device};

    use super::*;
    use crate::ModelConfig;

    fn tiny_config() -> ModelConfig {
        ModelConfig {
            latent_dim: 8,
            gen_features: 4,
            critic_features: 4,
            channels: 3,
            image_size: 16,
            dtype: DType::F32,
            device: Device::Cpu,
        }
    }

    #[test]
    fn init_leaves_running_stats_alone() {
        let config = tiny_config();
        let generator = Generator::new(config.clone()).unwrap();
        let critic = Critic::new(config).unwrap();
        apply_dcgan_init(&generator, &critic).unwrap();

        for (name, var) in critic.parameters() {
            if name.contains("running_var") {
                let values = var
                    .as_tensor()
                    .flatten_all()
                    .unwrap()
                    .to_vec1::<f32>()
                    .unwrap();
                assert!(values.iter().all(|v| (*v - 1.0).abs() < 1e-6));
            }
        }
    }

    #[test]
    fn init_centers_conv_kernels() {
        let config = tiny_config();
        let generator = Generator::new(config.clone()).unwrap();
        let critic = Critic::new(config).unwrap();
        apply_dcgan_init(&generator, &critic).unwrap();

        for (name, var) in generator.parameters() {
            if name.ends_with("conv.weight") {
                let values = var
                    .as_tensor()
                    .flatten_all()
                    .unwrap()
                    .to_vec1::<f32>()
                    .unwrap();
                let mean = values.iter().sum::<f32>() / values.len() as f32;
                assert!(mean.abs() < 0.05, "kernel {name} mean {mean}");
            }
        }
    }
}
