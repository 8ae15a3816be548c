//! Scalar metrics.
//!
//! Every metric returns 0 where it is undefined (empty input, zero variance,
//! a single class, zero denominators) so reports never carry NaN.

use std::fs;
use std::io::Write;
use std::path::Path;

use serde::ser::{Serialize, SerializeMap, Serializer};

use super::EvalError;

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

/// Pearson correlation; 0 on zero variance or empty input.
pub fn pearson(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    if n == 0 {
        return 0.0;
    }
    let mean_a = a[..n].iter().sum::<f64>() / n as f64;
    let mean_b = b[..n].iter().sum::<f64>() / n as f64;
    let (mut cov, mut var_a, mut var_b) = (0.0, 0.0, 0.0);
    for (&x, &y) in a[..n].iter().zip(&b[..n]) {
        let (dx, dy) = (x - mean_a, y - mean_b);
        cov += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }
    finite_or_zero(cov / (var_a * var_b).sqrt())
}

/// Ranks `0..n`; tied values share the mean of the ranks they span.
pub fn average_ranks(values: &[f64]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&i, &j| values[i].total_cmp(&values[j]));
    let mut ranks = vec![0.0; values.len()];
    let mut start = 0;
    while start < order.len() {
        let value = values[order[start]];
        let mut end = start + 1;
        while end < order.len() && values[order[end]].total_cmp(&value).is_eq() {
            end += 1;
        }
        let rank = (start + end - 1) as f64 / 2.0;
        for &idx in &order[start..end] {
            ranks[idx] = rank;
        }
        start = end;
    }
    ranks
}

fn log1p_all(values: &[f32]) -> Vec<f64> {
    values.iter().map(|&v| f64::from(v).ln_1p()).collect()
}

fn widen(values: &[f32]) -> Vec<f64> {
    values.iter().map(|&v| f64::from(v)).collect()
}

/// Pearson correlation of predicted log1p counts with `ln(1 + targets)`.
pub fn counts_pearson(log_preds: &[f32], targets: &[f32]) -> f64 {
    pearson(&widen(log_preds), &log1p_all(targets))
}

/// Spearman correlation of predicted log1p counts with `ln(1 + targets)`.
/// Ties take average ranks, so a constant side yields exactly 0.
pub fn counts_spearman(log_preds: &[f32], targets: &[f32]) -> f64 {
    let pred_ranks = average_ranks(&widen(log_preds));
    let target_ranks = average_ranks(&log1p_all(targets));
    pearson(&pred_ranks, &target_ranks)
}

/// Mean squared error between predicted log1p counts and `ln(1 + counts)`.
pub fn log1p_mse(log_preds: &[f32], counts: &[f32]) -> f64 {
    if log_preds.is_empty() {
        return 0.0;
    }
    let total: f64 = log_preds
        .iter()
        .zip(counts)
        .map(|(&p, &t)| (f64::from(t).ln_1p() - f64::from(p)).powi(2))
        .sum();
    total / log_preds.len() as f64
}

/// Walks distinct score thresholds from high to low, yielding cumulative
/// `(true positives, false positives)` after each threshold.
fn threshold_counts(labels: &[bool], scores: &[f64]) -> Vec<(f64, f64)> {
    let mut order: Vec<usize> = (0..labels.len().min(scores.len())).collect();
    order.sort_by(|&i, &j| scores[j].total_cmp(&scores[i]));
    let mut steps = Vec::new();
    let (mut tp, mut fp) = (0.0, 0.0);
    let mut i = 0;
    while i < order.len() {
        let score = scores[order[i]];
        while i < order.len() && scores[order[i]].total_cmp(&score).is_eq() {
            if labels[order[i]] {
                tp += 1.0;
            } else {
                fp += 1.0;
            }
            i += 1;
        }
        steps.push((tp, fp));
    }
    steps
}

/// Area under the ROC curve with tied scores handled as one threshold.
pub fn roc_auc(labels: &[bool], scores: &[f64]) -> f64 {
    let steps = threshold_counts(labels, scores);
    let Some(&(pos, neg)) = steps.last() else {
        return 0.0;
    };
    if pos == 0.0 || neg == 0.0 {
        return 0.0;
    }
    let mut area = 0.0;
    let (mut prev_tpr, mut prev_fpr) = (0.0, 0.0);
    for (tp, fp) in steps {
        let (tpr, fpr) = (tp / pos, fp / neg);
        area += (fpr - prev_fpr) * (tpr + prev_tpr) / 2.0;
        prev_tpr = tpr;
        prev_fpr = fpr;
    }
    area
}

/// Average precision: `Σ (R_n − R_{n−1}) P_n` over descending thresholds.
pub fn average_precision(labels: &[bool], scores: &[f64]) -> f64 {
    let steps = threshold_counts(labels, scores);
    let Some(&(pos, _)) = steps.last() else {
        return 0.0;
    };
    if pos == 0.0 {
        return 0.0;
    }
    let mut ap = 0.0;
    let mut prev_recall = 0.0;
    for (tp, fp) in steps {
        let recall = tp / pos;
        let precision = tp / (tp + fp);
        ap += (recall - prev_recall) * precision;
        prev_recall = recall;
    }
    ap
}

/// Matthews correlation coefficient of binary predictions.
pub fn mcc(labels: &[bool], predictions: &[bool]) -> f64 {
    let (mut tp, mut tn, mut fp, mut fn_) = (0.0f64, 0.0f64, 0.0f64, 0.0f64);
    for (&label, &pred) in labels.iter().zip(predictions) {
        match (label, pred) {
            (true, true) => tp += 1.0,
            (false, false) => tn += 1.0,
            (false, true) => fp += 1.0,
            (true, false) => fn_ += 1.0,
        }
    }
    let denom = ((tp + fp) * (tp + fn_) * (tn + fp) * (tn + fn_)).sqrt();
    if denom == 0.0 {
        return 0.0;
    }
    finite_or_zero((tp * tn - fp * fn_) / denom)
}

/// Fraction of positions where `truth` and `predictions` agree.
pub fn accuracy<T: PartialEq>(truth: &[T], predictions: &[T]) -> f64 {
    let n = truth.len().min(predictions.len());
    if n == 0 {
        return 0.0;
    }
    let hits = truth.iter().zip(predictions).filter(|(t, p)| t == p).count();
    hits as f64 / n as f64
}

/// Numerically stable log-softmax.
pub fn log_softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let log_sum = logits.iter().map(|&x| (x - max).exp()).sum::<f32>().ln() + max;
    logits.iter().map(|&x| x - log_sum).collect()
}

/// `ln(1 − eˣ)` for `x ≤ 0`, switching formulas at `−ln 2` for precision.
pub fn log1mexp(x: f64) -> f64 {
    if x > -std::f64::consts::LN_2 {
        (-x.exp_m1()).ln()
    } else {
        (-x.exp()).ln_1p()
    }
}

/// Index of the largest value (first on ties).
pub fn argmax(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
        .0
}

/// Flat `metric → value` map that keeps insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsReport {
    entries: Vec<(String, f64)>,
}

impl MetricsReport {
    /// Empty report.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `name`; non-finite values are stored as 0.
    pub fn insert(&mut self, name: impl Into<String>, value: f64) {
        let name = name.into();
        let value = finite_or_zero(value);
        match self.entries.iter_mut().find(|(k, _)| *k == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    /// Value of `name`.
    pub fn get(&self, name: &str) -> Option<f64> {
        self.entries.iter().find(|(k, _)| k == name).map(|&(_, v)| v)
    }

    /// Number of metrics.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` for an empty report.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Metrics in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Pretty JSON with four-space indentation.
    pub fn to_json(&self) -> Result<String, EvalError> {
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        self.serialize(&mut ser)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Write the report as one JSON object.
    pub fn write_json(&self, path: &Path) -> Result<(), EvalError> {
        let json = self.to_json()?;
        let io_err = |source| EvalError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut file = fs::File::create(path).map_err(io_err)?;
        file.write_all(json.as_bytes()).map_err(io_err)?;
        file.write_all(b"\n").map_err(io_err)
    }
}

impl Serialize for MetricsReport {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, value) in &self.entries {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}
