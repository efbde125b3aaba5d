use candle_core::{DType, Tensor};

use crate::TrainingError;

/// A least-squares loss term: the graph tensor to backpropagate through and
/// its detached scalar value for bookkeeping.
#[derive(Debug, Clone)]
pub struct LossTerm {
    pub loss: Tensor,
    pub value: f32,
}

/// `0.5 * mean((scores - target)^2)` over a `(batch,)` score tensor.
///
/// The critic uses `target = 1` for real data and `target = alpha(i)` for
/// generated data; the generator uses `target = 1`.
pub fn least_squares(scores: &Tensor, target: f64) -> Result<LossTerm, TrainingError> {
    let loss = scores
        .affine(1.0, -target)
        .map_err(to_runtime_error)?
        .sqr()
        .map_err(to_runtime_error)?
        .mean_all()
        .map_err(to_runtime_error)?
        .affine(0.5, 0.0)
        .map_err(to_runtime_error)?;

    let value = loss
        .to_dtype(DType::F32)
        .map_err(to_runtime_error)?
        .to_vec0::<f32>()
        .map_err(to_runtime_error)?;

    Ok(LossTerm { loss, value })
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;

    #[test]
    fn matches_the_closed_form() {
        let scores = Tensor::from_vec(vec![0.0f32, 1.0, 2.0], (3,), &Device::Cpu).unwrap();
        // 0.5 * mean((s - 1)^2) = 0.5 * (1 + 0 + 1) / 3
        let term = least_squares(&scores, 1.0).unwrap();
        assert!((term.value - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn zero_when_scores_hit_the_target() {
        let scores = Tensor::full(0.25f32, (8,), &Device::Cpu).unwrap();
        let term = least_squares(&scores, 0.25).unwrap();
        assert!(term.value.abs() < 1e-7);
    }

    #[test]
    fn shifting_the_target_shifts_the_minimum() {
        let scores = Tensor::full(0.0f32, (4,), &Device::Cpu).unwrap();
        let at_zero = least_squares(&scores, 0.0).unwrap();
        let at_half = least_squares(&scores, 0.5).unwrap();
        assert!(at_zero.value < at_half.value);
        assert!((at_half.value - 0.125).abs() < 1e-6);
    }
}
