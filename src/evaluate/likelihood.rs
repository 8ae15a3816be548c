use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use tracing::info;

use super::{io_error, EvalError};
use crate::dataset::{batch_ranges, load_batch, Dataset};
use crate::extract::GroupedWindows;
use crate::genomics::onehot_to_chars;
use crate::model::LikelihoodModel;

/// Log-likelihoods of the two windows of one row (sequence and control, or
/// both alleles).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PairLikelihood {
    /// Log-likelihood of the first window.
    pub first: f64,
    /// Log-likelihood of the second window.
    pub second: f64,
}

impl PairLikelihood {
    /// `first - second`: positive when the first window is more likely.
    pub fn delta(&self) -> f64 {
        self.first - self.second
    }
}

/// Zero-shot scoring of paired windows with a [`LikelihoodModel`].
#[derive(Debug, Clone)]
pub struct LikelihoodEvaluator<M> {
    model: M,
    batch_size: usize,
}

impl<M: LikelihoodModel> LikelihoodEvaluator<M> {
    /// Evaluator reading `batch_size` rows at a time.
    pub fn new(model: M, batch_size: usize) -> Self {
        Self {
            model,
            batch_size: batch_size.max(1),
        }
    }

    /// Score every row of a two-window dataset in order.
    pub fn score<D>(&self, dataset: &D) -> Result<Vec<PairLikelihood>, EvalError>
    where
        D: Dataset + ?Sized,
        D::Item: GroupedWindows,
    {
        if <D::Item as GroupedWindows>::GROUPS.len() != 2 {
            return Err(EvalError::Invalid(
                "likelihood scoring needs exactly two windows per row".to_string(),
            ));
        }
        let mut scores = Vec::with_capacity(dataset.len());
        for range in batch_ranges(dataset.len(), self.batch_size) {
            for item in load_batch(dataset, range)? {
                let mut lls = item
                    .into_windows()
                    .into_iter()
                    .map(|window| self.model.log_likelihood(&onehot_to_chars(window.view())));
                let first = lls.next().transpose()?.unwrap_or(0.0);
                let second = lls.next().transpose()?.unwrap_or(0.0);
                scores.push(PairLikelihood { first, second });
            }
        }
        info!(rows = scores.len(), "likelihood scoring complete");
        Ok(scores)
    }
}

/// Write `idx, <a>_ll, <b>_ll, delta` rows, where `a` and `b` name the two
/// windows (for example `seq`/`ctrl` or `allele1`/`allele2`).
pub fn write_pair_likelihoods(
    path: &Path,
    names: [&str; 2],
    scores: &[PairLikelihood],
) -> Result<(), EvalError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_error(parent))?;
    }
    let file = File::create(path).map_err(io_error(path))?;
    let mut out = BufWriter::new(file);
    let [a, b] = names;
    writeln!(out, "idx\t{a}_ll\t{b}_ll\tdelta").map_err(io_error(path))?;
    for (idx, score) in scores.iter().enumerate() {
        writeln!(out, "{idx}\t{}\t{}\t{}", score.first, score.second, score.delta())
            .map_err(io_error(path))?;
    }
    out.flush().map_err(io_error(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::test_support::VecDataset;
    use crate::dataset::PairedWindows;
    use crate::genomics::one_hot_encode;
    use crate::model::MarkovLikelihood;

    fn pair(seq: &[u8], ctrl: &[u8]) -> PairedWindows {
        PairedWindows {
            seq: one_hot_encode(seq),
            ctrl: one_hot_encode(ctrl),
        }
    }

    #[test]
    fn scores_favour_the_training_composition() {
        let model = MarkovLikelihood::fit(&[b"AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAC".as_slice()], 1);
        let data = VecDataset(vec![pair(b"AAAAAAAA", b"ACGTACGT"), pair(b"NNNN", b"NNNN")]);
        let scores = LikelihoodEvaluator::new(model, 1).score(&data).unwrap();
        assert_eq!(scores.len(), 2);
        assert!(scores[0].delta() > 0.0);
        assert_eq!(scores[1], PairLikelihood { first: 0.0, second: 0.0 });
    }

    #[test]
    fn writes_named_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/lls.tsv");
        let scores = [PairLikelihood { first: -1.5, second: -2.0 }];
        write_pair_likelihoods(&path, ["seq", "ctrl"], &scores).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "idx\tseq_ll\tctrl_ll\tdelta\n0\t-1.5\t-2\t0.5\n");
    }
}
