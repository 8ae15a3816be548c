use dnalm_bench::dataset::DatasetError;
use dnalm_bench::evaluate::{counts_pearson, counts_spearman, evaluate_classifier, pearson};
use dnalm_bench::train::{ComputeError, ParamMut, StateDict, TrainError};
use dnalm_bench::{Dataset, Example, Target, Trainable};
use ndarray::{Array2, ArrayView1, ArrayView2};

/// Replays stored logits as model outputs.
#[derive(Debug)]
struct FixedLogits {
    classes: usize,
}

impl Trainable for FixedLogits {
    type Input = Vec<f32>;
    type Cache = ();

    fn output_dim(&self) -> usize {
        self.classes
    }

    fn forward(&self, batch: &[&Vec<f32>]) -> Result<(Array2<f32>, ()), ComputeError> {
        let mut out = Array2::zeros((batch.len(), self.classes));
        for (mut row, logits) in out.rows_mut().into_iter().zip(batch) {
            if logits.len() != self.classes {
                return Err(ComputeError::Shape(format!("{} logits", logits.len())));
            }
            row.assign(&ArrayView1::from(logits.as_slice()));
        }
        Ok((out, ()))
    }

    fn backward(&mut self, _: (), _: ArrayView2<'_, f32>) -> Result<(), ComputeError> {
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

struct Rows(Vec<Example<Vec<f32>>>);

impl Dataset for Rows {
    type Item = Example<Vec<f32>>;

    fn len(&self) -> usize {
        self.0.len()
    }

    fn get(&self, idx: usize) -> Result<Self::Item, DatasetError> {
        self.0.get(idx).cloned().ok_or(DatasetError::IndexOutOfRange {
            idx,
            len: self.0.len(),
        })
    }
}

fn probabilities(rows: &[([f32; 3], usize)]) -> Rows {
    Rows(
        rows.iter()
            .map(|(p, class)| {
                let logits: Vec<f32> = p.iter().map(|v| v.ln()).collect();
                Example::new(logits, Target::Class(*class))
            })
            .collect(),
    )
}

fn assert_close(actual: Option<f64>, expected: f64, name: &str) {
    let actual = actual.unwrap_or_else(|| panic!("{name} missing from report"));
    assert!(
        (actual - expected).abs() < 1e-5,
        "{name}: expected {expected}, found {actual}"
    );
}

#[test]
fn three_class_report_matches_hand_computation() {
    let data = probabilities(&[
        ([0.7, 0.2, 0.1], 0),
        ([0.1, 0.8, 0.1], 1),
        ([0.3, 0.3, 0.4], 2),
        ([0.4, 0.55, 0.05], 0),
    ]);
    let names: Vec<String> = ["enhancer", "promoter", "ctcf"].map(String::from).to_vec();
    let report = evaluate_classifier(&FixedLogits { classes: 3 }, &data, &names, 2)
        .expect("evaluation succeeds");

    // Two batches of two: mean of the batch means of -ln p(target).
    let batch_a = -(0.7f64.ln() + 0.8f64.ln()) / 2.0;
    let batch_b = -(0.4f64.ln() + 0.4f64.ln()) / 2.0;
    assert_close(report.get("test_loss"), (batch_a + batch_b) / 2.0, "test_loss");
    // argmax predictions 0, 1, 2, 1
    assert_close(report.get("test_acc"), 0.75, "test_acc");

    // Each class's positives outrank its negatives.
    for name in &names {
        assert_close(report.get(&format!("class_{name}_auroc")), 1.0, "auroc");
        assert_close(report.get(&format!("class_{name}_auprc")), 1.0, "auprc");
        assert_close(report.get(&format!("class_{name}_acc")), 0.75, "acc");
    }
    // Calls at p >= 0.5: enhancer tp=1 fn=1 tn=2; promoter tp=1 fp=1 tn=2.
    let one_of_two = 2.0 / 12f64.sqrt();
    assert_close(report.get("class_enhancer_mcc"), one_of_two, "enhancer mcc");
    assert_close(report.get("class_promoter_mcc"), one_of_two, "promoter mcc");
    // No ctcf call is made, so the denominator vanishes.
    assert_close(report.get("class_ctcf_mcc"), 0.0, "ctcf mcc");

    let json = report.to_json().expect("report serializes");
    let parsed: serde_json::Value = serde_json::from_str(&json).expect("valid json");
    assert_eq!(parsed.as_object().map(|o| o.len()), Some(2 + 4 * 3));
}

#[test]
fn class_name_count_must_match_outputs() {
    let data = probabilities(&[([0.2, 0.3, 0.5], 2)]);
    let names = vec!["a".to_string(), "b".to_string()];
    assert!(evaluate_classifier(&FixedLogits { classes: 3 }, &data, &names, 4).is_err());
}

#[test]
fn zero_variance_correlations_are_zero() {
    assert_eq!(pearson(&[1.0, 1.0, 1.0], &[0.5, 2.0, 3.0]), 0.0);
    assert_eq!(pearson(&[], &[]), 0.0);
    assert_eq!(counts_pearson(&[0.3, 0.3], &[1.0, 5.0]), 0.0);
    assert_eq!(counts_spearman(&[0.2], &[3.0]), 0.0);
    // Constant predictions or constant targets, in either input order.
    assert_eq!(counts_spearman(&[0.5; 4], &[1.0, 2.0, 3.0, 4.0]), 0.0);
    assert_eq!(counts_spearman(&[0.5; 4], &[4.0, 3.0, 2.0, 1.0]), 0.0);
    assert_eq!(counts_spearman(&[0.1, 0.2, 0.3, 0.4], &[5.0; 4]), 0.0);
    assert_eq!(counts_spearman(&[0.4, 0.3, 0.2, 0.1], &[5.0; 4]), 0.0);
}

#[test]
fn count_correlations_compare_against_log1p_targets() {
    let targets = [0.0f32, 1.0, 3.0, 7.0];
    let log_preds: Vec<f32> = targets.iter().map(|t| t.ln_1p()).collect();
    assert!((counts_pearson(&log_preds, &targets) - 1.0).abs() < 1e-6);
    assert!((counts_spearman(&[0.0, 5.0, 6.0, 100.0], &targets) - 1.0).abs() < 1e-9);
}
