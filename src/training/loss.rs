/// Loss criteria matched to the task mode
use candle_core::{DType, Result, Tensor};

/// Probabilities are clamped to [EPS, 1 - EPS] before taking logs
const EPS: f64 = 1e-7;

/// Training criterion
///
/// Both variants expect scores that already passed through the head
/// activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Criterion {
    /// Mean per-label binary cross-entropy on sigmoid outputs
    BinaryCrossEntropy,
    /// Negative log-likelihood of the target class on softmax outputs
    CrossEntropy,
}

impl Criterion {
    /// Compute the batch-mean loss
    ///
    /// # Arguments
    /// * `outputs` - Scores [batch, num_outputs]
    /// * `targets` - [batch, num_outputs] f32 for BCE, [batch] u32 class ids for CE
    pub fn loss(&self, outputs: &Tensor, targets: &Tensor) -> Result<Tensor> {
        let probs = outputs.clamp(EPS, 1.0 - EPS)?;

        match self {
            Self::BinaryCrossEntropy => {
                let targets = targets.to_dtype(probs.dtype())?;
                let log_p = probs.log()?;
                let log_not_p = probs.affine(-1.0, 1.0)?.log()?;
                let not_targets = targets.affine(-1.0, 1.0)?;

                let likelihood = ((&targets * &log_p)? + (&not_targets * &log_not_p)?)?;
                likelihood.mean_all()?.neg()
            }
            Self::CrossEntropy => {
                let targets = targets.to_dtype(DType::U32)?;
                candle_nn::loss::nll(&probs.log()?, &targets)
            }
        }
    }
}

impl std::fmt::Display for Criterion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BinaryCrossEntropy => f.write_str("BCELoss()"),
            Self::CrossEntropy => f.write_str("CrossEntropyLoss()"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_bce_matches_closed_form() -> Result<()> {
        let device = Device::Cpu;
        let outputs = Tensor::new(&[[0.8f32, 0.3]], &device)?;
        let targets = Tensor::new(&[[1f32, 0.0]], &device)?;

        let loss = Criterion::BinaryCrossEntropy
            .loss(&outputs, &targets)?
            .to_scalar::<f32>()?;

        let expected = -((0.8f32).ln() + (0.7f32).ln()) / 2.0;
        assert!((loss - expected).abs() < 1e-5, "{} vs {}", loss, expected);

        Ok(())
    }

    #[test]
    fn test_bce_is_finite_at_saturation() -> Result<()> {
        let device = Device::Cpu;
        let outputs = Tensor::new(&[[0f32, 1.0]], &device)?;
        let targets = Tensor::new(&[[1f32, 0.0]], &device)?;

        let loss = Criterion::BinaryCrossEntropy
            .loss(&outputs, &targets)?
            .to_scalar::<f32>()?;
        assert!(loss.is_finite());

        Ok(())
    }

    #[test]
    fn test_cross_entropy_on_probabilities() -> Result<()> {
        let device = Device::Cpu;
        let outputs = Tensor::new(&[[0.7f32, 0.2, 0.1], [0.1, 0.1, 0.8]], &device)?;
        let targets = Tensor::new(&[0u32, 2], &device)?;

        let loss = Criterion::CrossEntropy
            .loss(&outputs, &targets)?
            .to_scalar::<f32>()?;

        let expected = -((0.7f32).ln() + (0.8f32).ln()) / 2.0;
        assert!((loss - expected).abs() < 1e-5);

        Ok(())
    }
}
