use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};

use super::TrainError;
use crate::dataset::Target;
use crate::evaluate::log_softmax;

/// Training objective of a probe or fine-tuned model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Objective {
    /// Squared error between the predicted log count and `ln(1 + counts)`.
    /// Expects one output per example.
    Log1pMse,
    /// Softmax cross-entropy over class logits.
    CrossEntropy,
}

impl Objective {
    /// Per-example losses of a batch.
    pub fn losses(
        &self,
        outputs: ArrayView2<'_, f32>,
        targets: &[Target],
    ) -> Result<Vec<f64>, TrainError> {
        self.check(outputs, targets)?;
        outputs
            .rows()
            .into_iter()
            .zip(targets)
            .map(|(row, target)| match (self, *target) {
                (Objective::Log1pMse, Target::Counts(counts)) => {
                    let diff = f64::from(row[0]) - f64::from(counts).ln_1p();
                    Ok(diff * diff)
                }
                (Objective::CrossEntropy, Target::Class(class)) => {
                    let logits = row.to_vec();
                    let log_probs = log_softmax(&logits);
                    log_probs
                        .get(class)
                        .map(|&lp| -f64::from(lp))
                        .ok_or_else(|| {
                            TrainError::InvalidTarget(format!(
                                "class {class} with {} outputs",
                                logits.len()
                            ))
                        })
                }
                (_, target) => Err(TrainError::InvalidTarget(format!(
                    "{target:?} under {self:?}"
                ))),
            })
            .collect()
    }

    /// Mean loss of the batch and its gradient with respect to `outputs`.
    pub fn loss_and_grad(
        &self,
        outputs: ArrayView2<'_, f32>,
        targets: &[Target],
    ) -> Result<(f64, Array2<f32>), TrainError> {
        let losses = self.losses(outputs, targets)?;
        let n = losses.len().max(1) as f32;
        let mut grad = Array2::zeros(outputs.raw_dim());
        for ((row, target), mut g) in outputs.rows().into_iter().zip(targets).zip(grad.rows_mut()) {
            match (self, *target) {
                (Objective::Log1pMse, Target::Counts(counts)) => {
                    g[0] = 2.0 * (row[0] - counts.ln_1p()) / n;
                }
                (Objective::CrossEntropy, Target::Class(class)) => {
                    let log_probs = log_softmax(&row.to_vec());
                    for (j, lp) in log_probs.into_iter().enumerate() {
                        let onehot = if j == class { 1.0 } else { 0.0 };
                        g[j] = (lp.exp() - onehot) / n;
                    }
                }
                _ => {}
            }
        }
        let mean = losses.iter().sum::<f64>() / f64::from(n);
        Ok((mean, grad))
    }

    fn check(&self, outputs: ArrayView2<'_, f32>, targets: &[Target]) -> Result<(), TrainError> {
        if outputs.nrows() != targets.len() {
            return Err(TrainError::InvalidTarget(format!(
                "{} outputs for {} targets",
                outputs.nrows(),
                targets.len()
            )));
        }
        if outputs.ncols() == 0 {
            return Err(TrainError::InvalidTarget("model has no outputs".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn log1p_mse_matches_hand_computation() {
        let outputs = array![[0.0f32], [1.0]];
        let targets = [Target::Counts(0.0), Target::Counts(std::f32::consts::E - 1.0)];
        let (loss, grad) = Objective::Log1pMse
            .loss_and_grad(outputs.view(), &targets)
            .unwrap();
        assert!(loss.abs() < 1e-9);
        assert!(grad.iter().all(|g| g.abs() < 1e-6));

        let (loss, grad) = Objective::Log1pMse
            .loss_and_grad(array![[2.0f32]].view(), &[Target::Counts(0.0)])
            .unwrap();
        assert!((loss - 4.0).abs() < 1e-9);
        assert!((grad[[0, 0]] - 4.0).abs() < 1e-6);
    }

    #[test]
    fn cross_entropy_gradient_is_softmax_minus_onehot() {
        let outputs = array![[0.0f32, 0.0]];
        let (loss, grad) = Objective::CrossEntropy
            .loss_and_grad(outputs.view(), &[Target::Class(1)])
            .unwrap();
        assert!((loss - std::f64::consts::LN_2).abs() < 1e-6);
        assert!((grad[[0, 0]] - 0.5).abs() < 1e-6);
        assert!((grad[[0, 1]] + 0.5).abs() < 1e-6);
    }

    #[test]
    fn mismatched_targets_are_rejected() {
        let outputs = array![[0.0f32, 0.0]];
        assert!(Objective::Log1pMse
            .losses(outputs.view(), &[Target::Class(0)])
            .is_err());
        assert!(Objective::CrossEntropy
            .losses(outputs.view(), &[Target::Class(5)])
            .is_err());
    }
}
