//! Evaluation: metric functions, probe evaluation on held-out partitions,
//! zero-shot likelihood scoring and variant effect scores.
//!
//! Every evaluator produces plain numbers; [`MetricsReport`] collects them
//! into one insertion-ordered JSON object and TSV writers cover per-example
//! outputs.

mod likelihood;
mod metrics;
mod probe;
mod variant;

pub use likelihood::{write_pair_likelihoods, LikelihoodEvaluator, PairLikelihood};
pub use metrics::{
    accuracy, argmax, average_precision, average_ranks, counts_pearson, counts_spearman, log1mexp,
    log1p_mse, log_softmax, mcc, pearson, roc_auc, MetricsReport,
};
pub use probe::{
    class_log_odds, evaluate_binary, evaluate_chromatin, evaluate_classifier, predict, Predictions,
};
pub use variant::{
    embedding_scores, probed_count_differences, write_variant_scores, CountDifference,
    VariantScore,
};

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::dataset::DatasetError;
use crate::model::ModelError;
use crate::store::StoreError;
use crate::train::ComputeError;

/// Errors raised while evaluating.
#[derive(Debug, Error)]
pub enum EvalError {
    /// Report or table could not be written.
    #[error("i/o error on {path}: {source}")]
    Io {
        /// Offending path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// Report serialisation failed.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// Dataset access failed.
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    /// Scoring model failed.
    #[error(transparent)]
    Model(#[from] ModelError),
    /// Embedding store access failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Probe forward pass failed.
    #[error(transparent)]
    Compute(#[from] ComputeError),
    /// Inputs of one evaluation disagree.
    #[error("invalid evaluation input: {0}")]
    Invalid(String),
}

pub(crate) fn io_error(path: &std::path::Path) -> impl FnOnce(io::Error) -> EvalError + '_ {
    move |source| EvalError::Io {
        path: path.to_path_buf(),
        source,
    }
}
