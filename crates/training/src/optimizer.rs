use candle_core::{backprop::GradStore, DType, Tensor, Var};

use crate::{config, TrainingError};

/// RMSprop over one network's parameter set.
///
/// Keeps a running average of squared gradients per parameter and applies
/// `param -= lr * grad / (sqrt(avg) + eps)`. Running statistics live only as
/// long as the optimizer instance; they are deliberately not checkpointed and
/// start fresh on resume.
#[derive(Debug)]
pub struct RmsProp {
    config: RmsPropConfig,
    params: Vec<ParameterSlot>,
    step: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct RmsPropConfig {
    pub learning_rate: f64,
    pub rho: f64,
    pub epsilon: f64,
}

impl From<&config::OptimizerConfig> for RmsPropConfig {
    fn from(value: &config::OptimizerConfig) -> Self {
        Self {
            learning_rate: value.learning_rate,
            rho: value.rho,
            epsilon: value.epsilon,
        }
    }
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    param: Var,
    dtype: DType,
    square_avg: Tensor,
}

impl RmsProp {
    /// Builds slots for every learnable parameter. Batch-norm running
    /// statistics are state, not parameters, and are skipped.
    pub fn new(
        named_parameters: Vec<(String, Var)>,
        config: RmsPropConfig,
    ) -> Result<Self, TrainingError> {
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }
        if config.learning_rate <= 0.0 {
            return Err(TrainingError::initialization(
                "optimizer requires a learning rate > 0",
            ));
        }
        if !(0.0 < config.rho && config.rho < 1.0) {
            return Err(TrainingError::initialization(
                "optimizer requires rho in (0, 1)",
            ));
        }

        let mut params = Vec::with_capacity(named_parameters.len());
        for (name, var) in named_parameters {
            if name.contains("running_") {
                continue;
            }
            let tensor = var.as_tensor();
            if !tensor.dtype().is_float() {
                return Err(TrainingError::initialization(format!(
                    "optimizer received non-floating parameter '{}'",
                    name
                )));
            }
            let dtype = tensor.dtype();
            let square_avg = Tensor::zeros(tensor.dims(), DType::F32, tensor.device())
                .map_err(to_runtime_error)?;
            params.push(ParameterSlot {
                name,
                param: var,
                dtype,
                square_avg,
            });
        }

        if params.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer parameter set holds only running statistics",
            ));
        }

        Ok(Self {
            config,
            params,
            step: 0,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    pub fn steps_taken(&self) -> usize {
        self.step
    }

    /// Applies one update using the gradients accumulated in `grads`.
    /// Gradients belonging to other parameter sets are left in the store.
    pub fn step(&mut self, grads: &mut GradStore) -> Result<(), TrainingError> {
        let mut stepped = false;

        for slot in &mut self.params {
            let tensor = slot.param.as_tensor();
            let grad = match grads.remove(tensor) {
                Some(grad) => grad,
                None => continue,
            };
            stepped = true;

            let grad = grad.to_dtype(DType::F32).map_err(to_runtime_error)?;

            let decayed = slot
                .square_avg
                .affine(self.config.rho, 0.0)
                .map_err(to_runtime_error)?;
            let grad_sq = grad
                .sqr()
                .map_err(to_runtime_error)?
                .affine(1.0 - self.config.rho, 0.0)
                .map_err(to_runtime_error)?;
            let square_avg = decayed.add(&grad_sq).map_err(to_runtime_error)?;

            let denom = square_avg
                .sqrt()
                .map_err(to_runtime_error)?
                .affine(1.0, self.config.epsilon)
                .map_err(to_runtime_error)?;
            let update = grad
                .div(&denom)
                .map_err(to_runtime_error)?
                .affine(self.config.learning_rate, 0.0)
                .map_err(to_runtime_error)?;

            let current = tensor.to_dtype(DType::F32).map_err(to_runtime_error)?;
            let next = current.sub(&update).map_err(to_runtime_error)?;
            let next = if slot.dtype == DType::F32 {
                next
            } else {
                next.to_dtype(slot.dtype).map_err(to_runtime_error)?
            };
            slot.param.set(&next).map_err(|err| {
                TrainingError::runtime(format!(
                    "failed to update parameter '{}': {err}",
                    slot.name
                ))
            })?;

            slot.square_avg = square_avg;
        }

        if stepped {
            self.step += 1;
        }
        Ok(())
    }
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;

    fn single_param(value: f32) -> (Var, Vec<(String, Var)>) {
        let var = Var::from_tensor(
            &Tensor::from_vec(vec![value], (1,), &Device::Cpu).unwrap(),
        )
        .unwrap();
        (var.clone(), vec![("w".to_string(), var)])
    }

    fn config() -> RmsPropConfig {
        RmsPropConfig {
            learning_rate: 0.1,
            rho: 0.9,
            epsilon: 1e-8,
        }
    }

    #[test]
    fn first_step_matches_the_closed_form() {
        let (var, named) = single_param(1.0);
        let mut optimizer = RmsProp::new(named, config()).unwrap();

        // loss = 0.5 * w^2, so grad = w = 1.
        let loss = var
            .as_tensor()
            .sqr()
            .unwrap()
            .sum_all()
            .unwrap()
            .affine(0.5, 0.0)
            .unwrap();
        let mut grads = loss.backward().unwrap();
        optimizer.step(&mut grads).unwrap();

        // square_avg = 0.1 * 1 = 0.1; update = lr * 1 / (sqrt(0.1) + eps)
        let expected = 1.0 - 0.1 / (0.1f64.sqrt() + 1e-8);
        let actual = var.as_tensor().to_vec1::<f32>().unwrap()[0] as f64;
        assert!((actual - expected).abs() < 1e-6, "got {actual}");
        assert_eq!(optimizer.steps_taken(), 1);
    }

    #[test]
    fn leaves_foreign_gradients_in_the_store() {
        let (mine, named) = single_param(1.0);
        let other = Var::from_tensor(
            &Tensor::from_vec(vec![2.0f32], (1,), &Device::Cpu).unwrap(),
        )
        .unwrap();

        let mut optimizer = RmsProp::new(named, config()).unwrap();

        let joint = mine
            .as_tensor()
            .mul(other.as_tensor())
            .unwrap()
            .sum_all()
            .unwrap();
        let mut grads = joint.backward().unwrap();
        optimizer.step(&mut grads).unwrap();

        assert!(grads.get(other.as_tensor()).is_some());
        assert!(grads.get(mine.as_tensor()).is_none());
        let untouched = other.as_tensor().to_vec1::<f32>().unwrap()[0];
        assert_eq!(untouched, 2.0);
    }

    #[test]
    fn skips_running_statistics() {
        let (_, mut named) = single_param(1.0);
        let running = Var::from_tensor(
            &Tensor::from_vec(vec![0.0f32], (1,), &Device::Cpu).unwrap(),
        )
        .unwrap();
        named.push(("down0.bn.running_mean".to_string(), running));
        let optimizer = RmsProp::new(named, config()).unwrap();
        assert_eq!(optimizer.params.len(), 1);
    }

    #[test]
    fn rejects_bad_hyperparameters() {
        let (_, named) = single_param(1.0);
        let mut bad = config();
        bad.rho = 1.0;
        assert!(RmsProp::new(named, bad).is_err());
    }
}
