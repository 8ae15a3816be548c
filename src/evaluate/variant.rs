use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use ndarray::Array2;
use tracing::info;

use super::{io_error, EvalError};
use crate::dataset::{batch_ranges, Variant};
use crate::store::GroupReader;
use crate::train::Trainable;

/// Embedding distance between the two allele windows of a variant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VariantScore {
    /// Euclidean distance of the mean-pooled embeddings.
    pub l2: f64,
    /// Cosine similarity of the mean-pooled embeddings; 0 when either is zero.
    pub cosine: f64,
}

/// Predicted log counts of both alleles.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CountDifference {
    /// Prediction for `allele1`.
    pub allele1: f64,
    /// Prediction for `allele2`.
    pub allele2: f64,
}

impl CountDifference {
    /// `allele2 - allele1`.
    pub fn delta(&self) -> f64 {
        self.allele2 - self.allele1
    }
}

fn check_paired(allele1: &GroupReader, allele2: &GroupReader) -> Result<(), EvalError> {
    if allele1.len() != allele2.len() || allele1.seq_len() != allele2.seq_len() {
        return Err(EvalError::Invalid(format!(
            "allele groups disagree: {} × {} vs {} × {}",
            allele1.len(),
            allele1.seq_len(),
            allele2.len(),
            allele2.seq_len()
        )));
    }
    Ok(())
}

/// L2 distance and cosine similarity between the window-pooled embeddings
/// of `allele1` and `allele2`, row by row.
pub fn embedding_scores(
    allele1: &GroupReader,
    allele2: &GroupReader,
) -> Result<Vec<VariantScore>, EvalError> {
    check_paired(allele1, allele2)?;
    let window = 0..allele1.seq_len();
    let scores = (0..allele1.len())
        .map(|idx| {
            let a = allele1.pooled_embedding(idx, window.clone())?;
            let b = allele2.pooled_embedding(idx, window.clone())?;
            let (mut dist, mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64, 0.0f64);
            for (&x, &y) in a.iter().zip(b.iter()) {
                let (x, y) = (f64::from(x), f64::from(y));
                dist += (x - y) * (x - y);
                dot += x * y;
                norm_a += x * x;
                norm_b += y * y;
            }
            let denom = (norm_a * norm_b).sqrt();
            Ok(VariantScore {
                l2: dist.sqrt(),
                cosine: if denom > 0.0 { dot / denom } else { 0.0 },
            })
        })
        .collect::<Result<Vec<_>, EvalError>>()?;
    info!(variants = scores.len(), "embedding scores computed");
    Ok(scores)
}

/// Probe predictions (first output) for both alleles, from per-position
/// embeddings of the two groups.
pub fn probed_count_differences<M>(
    model: &M,
    allele1: &GroupReader,
    allele2: &GroupReader,
    batch_size: usize,
) -> Result<Vec<CountDifference>, EvalError>
where
    M: Trainable<Input = Array2<f32>>,
{
    check_paired(allele1, allele2)?;
    let mut diffs = Vec::with_capacity(allele1.len());
    for range in batch_ranges(allele1.len(), batch_size) {
        let mut predicted = [Vec::new(), Vec::new()];
        for (group, out) in [allele1, allele2].into_iter().zip(predicted.iter_mut()) {
            let inputs = range
                .clone()
                .map(|idx| group.position_embeddings(idx))
                .collect::<Result<Vec<_>, _>>()?;
            let refs: Vec<&Array2<f32>> = inputs.iter().collect();
            let outputs = model.predict(&refs)?;
            *out = outputs.column(0).iter().map(|&v| f64::from(v)).collect();
        }
        let [first, second] = predicted;
        diffs.extend(
            first
                .into_iter()
                .zip(second)
                .map(|(allele1, allele2)| CountDifference { allele1, allele2 }),
        );
    }
    Ok(diffs)
}

/// Write one TSV row per variant: coordinates and alleles, embedding scores,
/// and probe predictions when given.
pub fn write_variant_scores(
    path: &Path,
    variants: &[Variant],
    scores: &[VariantScore],
    counts: Option<&[CountDifference]>,
) -> Result<(), EvalError> {
    if scores.len() != variants.len() || counts.is_some_and(|c| c.len() != variants.len()) {
        return Err(EvalError::Invalid(format!(
            "{} variants but {} score rows",
            variants.len(),
            scores.len()
        )));
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_error(parent))?;
    }
    let file = File::create(path).map_err(io_error(path))?;
    let mut out = BufWriter::new(file);
    let mut header = String::from("idx_orig\tchr\tpos\tallele1\tallele2\tl2\tcosine");
    if counts.is_some() {
        header.push_str("\tallele1_pred\tallele2_pred\tpred_delta");
    }
    writeln!(out, "{header}").map_err(io_error(path))?;
    for (i, (variant, score)) in variants.iter().zip(scores).enumerate() {
        write!(
            out,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}",
            variant.idx_orig,
            variant.chrom,
            variant.pos,
            variant.allele1,
            variant.allele2,
            score.l2,
            score.cosine
        )
        .map_err(io_error(path))?;
        if let Some(diff) = counts.and_then(|c| c.get(i)) {
            write!(out, "\t{}\t{}\t{}", diff.allele1, diff.allele2, diff.delta())
                .map_err(io_error(path))?;
        }
        writeln!(out).map_err(io_error(path))?;
    }
    out.flush().map_err(io_error(path))
}
