//! Probing and fine-tuning.
//!
//! Models expose manual forward/backward passes through [`Trainable`];
//! [`Trainer`] drives epochs with gradient accumulation, per-example
//! fallback when a batch exceeds the model's memory budget, validation,
//! per-epoch checkpoints and resumption.

mod history;
mod lora;
mod loss;
mod optim;
mod param;
mod probe;
mod trainer;

pub use history::{best_epoch, read_train_log, LogRow, TrainLog, LOG_FILE};
pub use lora::{LoraCache, LoraConfig, LoraKmerModel};
pub use loss::Objective;
pub use optim::AdamW;
pub use param::{load_param, ParamMut, StateDict, Tensor};
pub use probe::{ConvProbe, ConvProbeConfig, ExampleCache};
pub use trainer::{
    checkpoint_path, optimizer_path, EpochSummary, Trainer, TrainerConfig, TrainerState,
    Validation,
};

use std::io;
use std::path::PathBuf;

use ndarray::{Array2, ArrayView2};
use thiserror::Error;

use crate::dataset::DatasetError;
use crate::evaluate::EvalError;

/// Failures of a single forward or backward pass.
#[derive(Debug, Error)]
pub enum ComputeError {
    /// Activations of the batch would exceed the memory budget.
    #[error("out of memory: batch needs {required} bytes, budget is {budget}")]
    OutOfMemory {
        /// Bytes the batch would need.
        required: usize,
        /// Configured budget.
        budget: usize,
    },
    /// Input or gradient shapes disagree with the model.
    #[error("shape error: {0}")]
    Shape(String),
}

/// Errors raised by the trainer.
#[derive(Debug, Error)]
pub enum TrainError {
    /// Log or checkpoint i/o failed.
    #[error("i/o error on {path}: {source}")]
    Io {
        /// Offending path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// Model checkpoint for a resume epoch does not exist.
    #[error("checkpoint not found: {0}")]
    NotFound(PathBuf),
    /// Checkpoint (de)serialisation failed.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// Saved state does not fit the model.
    #[error("incompatible state: {0}")]
    State(String),
    /// Dataset access failed.
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    /// Forward or backward pass failed.
    #[error(transparent)]
    Compute(#[from] ComputeError),
    /// Metric computation failed.
    #[error(transparent)]
    Eval(#[from] EvalError),
    /// Target kind does not match the objective.
    #[error("invalid target: {0}")]
    InvalidTarget(String),
    /// Training log is missing rows or malformed.
    #[error("malformed training log {path}: {reason}")]
    Log {
        /// Log location.
        path: PathBuf,
        /// What was wrong.
        reason: String,
    },
    /// Trainer settings are unusable.
    #[error("invalid trainer configuration: {0}")]
    InvalidConfig(String),
}

pub(crate) fn io_error(path: &std::path::Path) -> impl FnOnce(io::Error) -> TrainError + '_ {
    move |source| TrainError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Model with a manual forward/backward pass.
pub trait Trainable {
    /// Per-example input.
    type Input;
    /// Activations saved by [`Trainable::forward`] for the backward pass.
    type Cache;

    /// Outputs per example.
    fn output_dim(&self) -> usize;

    /// Outputs `[batch, output_dim]` and saved activations.
    ///
    /// Fails with [`ComputeError::OutOfMemory`] when the batch does not fit
    /// the model's memory budget; single examples may still fit.
    fn forward(&self, batch: &[&Self::Input]) -> Result<(Array2<f32>, Self::Cache), ComputeError>;

    /// Accumulate parameter gradients for `grad_out = ∂loss/∂outputs`.
    fn backward(&mut self, cache: Self::Cache, grad_out: ArrayView2<'_, f32>)
        -> Result<(), ComputeError>;

    /// Outputs without keeping activations.
    fn predict(&self, batch: &[&Self::Input]) -> Result<Array2<f32>, ComputeError> {
        self.forward(batch).map(|(outputs, _)| outputs)
    }

    /// Reset accumulated gradients.
    fn zero_grad(&mut self);

    /// Trainable parameters with their gradients.
    fn params_mut(&mut self) -> Vec<ParamMut<'_>>;

    /// Snapshot of the trainable parameters.
    fn state_dict(&self) -> StateDict;

    /// Restore parameters from a snapshot.
    fn load_state_dict(&mut self, state: &StateDict) -> Result<(), TrainError>;
}
