//! Held-out evaluation of trained probes and fine-tuned models.

use ndarray::{Array2, Axis};
use tracing::{info, warn};

use super::metrics::{
    accuracy, argmax, average_precision, counts_pearson, counts_spearman, log1mexp, log_softmax,
    mcc, roc_auc, MetricsReport,
};
use super::EvalError;
use crate::dataset::{batch_ranges, Dataset, Example, Target};
use crate::train::{ComputeError, Objective, Trainable};

/// Model outputs over a dataset, with targets and batch boundaries.
#[derive(Debug, Clone, PartialEq)]
pub struct Predictions {
    /// Outputs `[N, output_dim]` in dataset order.
    pub outputs: Array2<f32>,
    /// Target of every row.
    pub targets: Vec<Target>,
    /// Row counts of the batches the outputs were computed in.
    pub batch_sizes: Vec<usize>,
}

impl Predictions {
    /// Number of rows.
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Returns `true` when no rows were predicted.
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Mean loss of every batch.
    pub fn batch_losses(&self, objective: Objective) -> Result<Vec<f64>, EvalError> {
        let losses = objective
            .losses(self.outputs.view(), &self.targets)
            .map_err(|e| EvalError::Invalid(e.to_string()))?;
        let mut start = 0;
        Ok(self
            .batch_sizes
            .iter()
            .map(|&size| {
                let batch = &losses[start..start + size];
                start += size;
                batch.iter().sum::<f64>() / size.max(1) as f64
            })
            .collect())
    }

    /// Predicted log counts (first output) and target counts.
    pub fn counts(&self) -> Result<(Vec<f32>, Vec<f32>), EvalError> {
        let preds = self.outputs.column(0).to_vec();
        let counts: Vec<f32> = self
            .targets
            .iter()
            .map(|target| match target {
                Target::Counts(c) => Ok(*c),
                Target::Class(_) => Err(EvalError::Invalid(
                    "count metrics on a classification target".to_string(),
                )),
            })
            .collect::<Result<_, EvalError>>()?;
        Ok((preds, counts))
    }

    /// Target classes.
    pub fn classes(&self) -> Result<Vec<usize>, EvalError> {
        self.targets
            .iter()
            .map(|target| match target {
                Target::Class(c) => Ok(*c),
                Target::Counts(_) => Err(EvalError::Invalid(
                    "class metrics on a count target".to_string(),
                )),
            })
            .collect()
    }

    /// Arg-max class of every row.
    pub fn predicted_classes(&self) -> Vec<usize> {
        self.outputs
            .rows()
            .into_iter()
            .map(|row| argmax(&row.to_vec()))
            .collect()
    }
}

/// Run `model` over `dataset` in order. Batches over the model's memory
/// budget are predicted one example at a time.
pub fn predict<M, D>(model: &M, dataset: &D, batch_size: usize) -> Result<Predictions, EvalError>
where
    M: Trainable,
    D: Dataset + ?Sized,
    D::Item: Into<Example<M::Input>>,
{
    let n = dataset.len();
    let mut outputs = Array2::zeros((n, model.output_dim()));
    let mut targets = Vec::with_capacity(n);
    let mut batch_sizes = Vec::new();
    for range in batch_ranges(n, batch_size) {
        let mut inputs = Vec::with_capacity(range.len());
        for idx in range.clone() {
            let example: Example<M::Input> = dataset.get(idx)?.into();
            inputs.push(example.input);
            targets.push(example.target);
        }
        let refs: Vec<&M::Input> = inputs.iter().collect();
        let batch = match model.predict(&refs) {
            Ok(batch) => batch,
            Err(ComputeError::OutOfMemory { .. }) => {
                warn!(start = range.start, "prediction batch over budget, predicting singly");
                let mut batch = Array2::zeros((refs.len(), model.output_dim()));
                for (mut row, input) in batch.rows_mut().into_iter().zip(&refs) {
                    row.assign(&model.predict(&[*input])?.row(0));
                }
                batch
            }
            Err(e) => return Err(e.into()),
        };
        outputs
            .slice_mut(ndarray::s![range.clone(), ..])
            .assign(&batch);
        batch_sizes.push(range.len());
    }
    Ok(Predictions {
        outputs,
        targets,
        batch_sizes,
    })
}

/// Per-class log-odds `log p − log(1 − p)` from logits, NaN mapped to 0.
pub fn class_log_odds(logits: &Array2<f32>) -> Array2<f64> {
    let mut odds = Array2::zeros(logits.raw_dim());
    for (row, mut out) in logits.rows().into_iter().zip(odds.rows_mut()) {
        for (lp, o) in log_softmax(&row.to_vec()).into_iter().zip(out.iter_mut()) {
            let lp = f64::from(lp);
            let value = lp - log1mexp(lp);
            *o = if value.is_nan() { 0.0 } else { value };
        }
    }
    odds
}

fn insert_regression(
    report: &mut MetricsReport,
    suffix: &str,
    loss: f64,
    preds: &[f32],
    counts: &[f32],
) {
    report.insert(format!("test_loss_{suffix}"), loss);
    report.insert(format!("test_pearson_{suffix}"), counts_pearson(preds, counts));
    report.insert(format!("test_spearman_{suffix}"), counts_spearman(preds, counts));
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Count-regression evaluation over peak (`pos`), reproducible-peak (`idr`)
/// and negative (`neg`) partitions.
///
/// Reports loss, Pearson and Spearman per partition and for `all = pos ∪
/// neg` (with `test_loss_all` the mean of the pos and neg losses), plus
/// AUROC/AUPRC of the predicted counts separating IDR peaks from negatives.
pub fn evaluate_chromatin<M, D>(
    model: &M,
    pos: &D,
    idr: &D,
    neg: &D,
    batch_size: usize,
) -> Result<MetricsReport, EvalError>
where
    M: Trainable,
    D: Dataset + ?Sized,
    D::Item: Into<Example<M::Input>>,
{
    let objective = Objective::Log1pMse;
    let mut report = MetricsReport::new();
    let mut partition = |name: &str, data: &D| -> Result<(f64, Vec<f32>, Vec<f32>), EvalError> {
        let predictions = predict(model, data, batch_size)?;
        let loss = mean(&predictions.batch_losses(objective)?);
        let (preds, counts) = predictions.counts()?;
        insert_regression(&mut report, name, loss, &preds, &counts);
        Ok((loss, preds, counts))
    };
    let (loss_pos, pos_preds, pos_counts) = partition("pos", pos)?;
    let (_, idr_preds, _) = partition("idr", idr)?;
    let (loss_neg, neg_preds, neg_counts) = partition("neg", neg)?;

    let all_preds: Vec<f32> = pos_preds.iter().chain(&neg_preds).copied().collect();
    let all_counts: Vec<f32> = pos_counts.iter().chain(&neg_counts).copied().collect();
    insert_regression(
        &mut report,
        "all",
        (loss_pos + loss_neg) / 2.0,
        &all_preds,
        &all_counts,
    );

    let labels: Vec<bool> = std::iter::repeat(true)
        .take(idr_preds.len())
        .chain(std::iter::repeat(false).take(neg_preds.len()))
        .collect();
    let scores: Vec<f64> = idr_preds
        .iter()
        .chain(&neg_preds)
        .map(|&p| f64::from(p))
        .collect();
    report.insert("test_auroc", roc_auc(&labels, &scores));
    report.insert("test_auprc", average_precision(&labels, &scores));
    info!(metrics = report.len(), "chromatin evaluation complete");
    Ok(report)
}

/// Multi-class evaluation: `test_loss`, `test_acc` and one-vs-rest
/// `class_<name>_{auroc,auprc,mcc,acc}` from per-class log-odds, calling a
/// class when its log-odds are non-negative. `class_names[i]` names class `i`.
pub fn evaluate_classifier<M, D>(
    model: &M,
    dataset: &D,
    class_names: &[String],
    batch_size: usize,
) -> Result<MetricsReport, EvalError>
where
    M: Trainable,
    D: Dataset + ?Sized,
    D::Item: Into<Example<M::Input>>,
{
    let predictions = predict(model, dataset, batch_size)?;
    if predictions.outputs.ncols() != class_names.len() {
        return Err(EvalError::Invalid(format!(
            "{} class names for {} outputs",
            class_names.len(),
            predictions.outputs.ncols()
        )));
    }
    let truth = predictions.classes()?;
    let mut report = MetricsReport::new();
    report.insert(
        "test_loss",
        mean(&predictions.batch_losses(Objective::CrossEntropy)?),
    );
    report.insert("test_acc", accuracy(&truth, &predictions.predicted_classes()));

    let log_odds = class_log_odds(&predictions.outputs);
    for (class, name) in class_names.iter().enumerate() {
        let labels: Vec<bool> = truth.iter().map(|&c| c == class).collect();
        let scores: Vec<f64> = log_odds.index_axis(Axis(1), class).to_vec();
        let calls: Vec<bool> = scores.iter().map(|&s| s >= 0.0).collect();
        report.insert(format!("class_{name}_auroc"), roc_auc(&labels, &scores));
        report.insert(format!("class_{name}_auprc"), average_precision(&labels, &scores));
        report.insert(format!("class_{name}_mcc"), mcc(&labels, &calls));
        report.insert(format!("class_{name}_acc"), accuracy(&labels, &calls));
    }
    info!(classes = class_names.len(), "classifier evaluation complete");
    Ok(report)
}

/// Binary evaluation with class 1 as the positive class: `test_loss`,
/// `test_acc`, `test_auroc`, `test_auprc`, `test_mcc`.
pub fn evaluate_binary<M, D>(model: &M, dataset: &D, batch_size: usize) -> Result<MetricsReport, EvalError>
where
    M: Trainable,
    D: Dataset + ?Sized,
    D::Item: Into<Example<M::Input>>,
{
    let predictions = predict(model, dataset, batch_size)?;
    if predictions.outputs.ncols() != 2 {
        return Err(EvalError::Invalid(format!(
            "binary evaluation needs 2 outputs, model has {}",
            predictions.outputs.ncols()
        )));
    }
    let labels: Vec<bool> = predictions.classes()?.into_iter().map(|c| c == 1).collect();
    let scores: Vec<f64> = class_log_odds(&predictions.outputs).column(1).to_vec();
    let calls: Vec<bool> = scores.iter().map(|&s| s >= 0.0).collect();

    let mut report = MetricsReport::new();
    report.insert(
        "test_loss",
        mean(&predictions.batch_losses(Objective::CrossEntropy)?),
    );
    report.insert("test_acc", accuracy(&labels, &calls));
    report.insert("test_auroc", roc_auc(&labels, &scores));
    report.insert("test_auprc", average_precision(&labels, &scores));
    report.insert("test_mcc", mcc(&labels, &calls));
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::test_support::VecDataset;
    use crate::train::{ParamMut, StateDict, TrainError};
    use ndarray::{array, ArrayView2};

    /// Emits its input row verbatim.
    #[derive(Debug)]
    struct Identity(usize);

    impl Trainable for Identity {
        type Input = Vec<f32>;
        type Cache = ();

        fn output_dim(&self) -> usize {
            self.0
        }

        fn forward(&self, batch: &[&Vec<f32>]) -> Result<(Array2<f32>, Self::Cache), ComputeError> {
            let mut out = Array2::zeros((batch.len(), self.0));
            for (mut row, input) in out.rows_mut().into_iter().zip(batch) {
                row.assign(&ndarray::ArrayView1::from(input.as_slice()));
            }
            Ok((out, ()))
        }

        fn backward(&mut self, _: Self::Cache, _: ArrayView2<'_, f32>) -> Result<(), ComputeError> {
            Ok(())
        }

        fn zero_grad(&mut self) {}

        fn params_mut(&mut self) -> Vec<ParamMut<'_>> {
            Vec::new()
        }

        fn state_dict(&self) -> StateDict {
            StateDict::new()
        }

        fn load_state_dict(&mut self, _: &StateDict) -> Result<(), TrainError> {
            Ok(())
        }
    }

    fn counts(rows: &[(f32, f32)]) -> VecDataset<Example<Vec<f32>>> {
        VecDataset(
            rows.iter()
                .map(|&(pred, count)| Example::new(vec![pred], Target::Counts(count)))
                .collect(),
        )
    }

    #[test]
    fn chromatin_report_pools_pos_and_neg() {
        let e = std::f32::consts::E;
        let pos = counts(&[(1.0, e - 1.0), (2.0, e * e - 1.0)]);
        let idr = counts(&[(3.0, 10.0)]);
        let neg = counts(&[(0.0, 1.0), (0.5, 0.0)]);
        let report = evaluate_chromatin(&Identity(1), &pos, &idr, &neg, 8).unwrap();

        assert!(report.get("test_loss_pos").unwrap() < 1e-9);
        let loss_neg = report.get("test_loss_neg").unwrap();
        let expected_neg = ((0.0 - 2f64.ln()).powi(2) + 0.25) / 2.0;
        assert!((loss_neg - expected_neg).abs() < 1e-6);
        assert!((report.get("test_loss_all").unwrap() - loss_neg / 2.0).abs() < 1e-6);
        assert_eq!(report.get("test_auroc"), Some(1.0));
        assert_eq!(report.get("test_auprc"), Some(1.0));
        assert_eq!(report.get("test_pearson_idr"), Some(0.0));
    }

    #[test]
    fn binary_report_uses_class_one_log_odds() {
        let data = VecDataset(vec![
            Example::new(vec![0.0, 2.0], Target::Class(1)),
            Example::new(vec![1.0, 0.0], Target::Class(0)),
            Example::new(vec![0.0, 1.0], Target::Class(0)),
        ]);
        let report = evaluate_binary(&Identity(2), &data, 2).unwrap();
        assert!((report.get("test_acc").unwrap() - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(report.get("test_auroc"), Some(1.0));
        let keys: Vec<&str> = report.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["test_loss", "test_acc", "test_auroc", "test_auprc", "test_mcc"]);
    }

    #[test]
    fn log_odds_of_uniform_logits_are_negative_for_three_classes() {
        let odds = class_log_odds(&array![[0.0f32, 0.0, 0.0]]);
        // p = 1/3 ⇒ log-odds = ln(1/2)
        for &v in odds.iter() {
            assert!((v - 0.5f64.ln()).abs() < 1e-6);
        }
    }
}
