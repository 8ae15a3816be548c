use std::fs;
use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{
    io_error, AdamW, ComputeError, Objective, StateDict, TrainError, TrainLog, Trainable, LOG_FILE,
};
use crate::dataset::{batch_ranges, Dataset, Example, Target};
use crate::evaluate::{
    accuracy, average_precision, class_log_odds, counts_pearson, counts_spearman, mcc, predict,
    roc_auc,
};

/// Hyper-parameters of a training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerConfig {
    /// Directory receiving `train.log` and checkpoints.
    pub out_dir: PathBuf,
    /// Total epochs, counting resumed ones.
    pub epochs: usize,
    /// Examples per forward pass.
    pub batch_size: usize,
    /// Batches per optimizer step.
    pub accumulate: usize,
    /// AdamW learning rate.
    pub lr: f32,
    /// AdamW decoupled weight decay.
    pub weight_decay: f32,
    /// Seed of the per-epoch shuffles.
    pub seed: u64,
    /// Loss and validation metrics.
    pub objective: Objective,
}

impl TrainerConfig {
    /// Defaults for a run writing to `out_dir`.
    pub fn new(out_dir: impl Into<PathBuf>, objective: Objective) -> Self {
        Self {
            out_dir: out_dir.into(),
            epochs: 10,
            batch_size: 64,
            accumulate: 1,
            lr: 1e-3,
            weight_decay: 0.01,
            seed: 0,
            objective,
        }
    }

    fn validate(&self) -> Result<(), TrainError> {
        if self.batch_size == 0 || self.accumulate == 0 {
            return Err(TrainError::InvalidConfig(
                "batch_size and accumulate must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Where the trainer is in its epoch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerState {
    /// Nothing run yet (possibly after a resume).
    Initial,
    /// Inside the training pass of an epoch.
    Training {
        /// Current epoch.
        epoch: usize,
    },
    /// Inside the validation pass of an epoch.
    Validating {
        /// Current epoch.
        epoch: usize,
    },
    /// Log row and checkpoints of an epoch written.
    Checkpointed {
        /// Last finished epoch.
        epoch: usize,
    },
    /// All epochs finished.
    Done,
}

/// Validation data: the primary set plus, for count regression, an optional
/// background set (non-peak regions) pooled into the `all` metrics.
#[derive(Debug)]
pub struct Validation<'a, V: ?Sized> {
    /// Peaks for regression, the whole validation set for classification.
    pub primary: &'a V,
    /// Negative regions for regression.
    pub background: Option<&'a V>,
}

impl<V: ?Sized> Clone for Validation<'_, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<V: ?Sized> Copy for Validation<'_, V> {}

impl<'a, V: ?Sized> Validation<'a, V> {
    /// Validation on a single set.
    pub fn new(primary: &'a V) -> Self {
        Self {
            primary,
            background: None,
        }
    }

    /// Add background regions.
    pub fn with_background(mut self, background: &'a V) -> Self {
        self.background = Some(background);
        self
    }
}

/// Results of one finished epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochSummary {
    /// Epoch number.
    pub epoch: usize,
    /// Mean training loss over batches.
    pub train_loss: f64,
    /// Validation loss.
    pub val_loss: f64,
    /// Remaining log columns.
    pub metrics: Vec<(String, f64)>,
}

/// Path of the model checkpoint of `epoch`.
pub fn checkpoint_path(dir: &Path, epoch: usize) -> PathBuf {
    dir.join(format!("checkpoint_{epoch}.json"))
}

/// Path of the optimizer checkpoint of `epoch`.
pub fn optimizer_path(dir: &Path, epoch: usize) -> PathBuf {
    dir.join(format!("optimizer_{epoch}.json"))
}

/// Epoch loop around a [`Trainable`] model.
#[derive(Debug)]
pub struct Trainer<M> {
    model: M,
    optimizer: AdamW,
    config: TrainerConfig,
    state: TrainerState,
    start_epoch: usize,
    resumed: bool,
}

impl<M: Trainable> Trainer<M> {
    /// Trainer with a fresh AdamW optimizer.
    pub fn new(model: M, config: TrainerConfig) -> Result<Self, TrainError> {
        config.validate()?;
        let optimizer = AdamW::default_params(config.lr, config.weight_decay);
        Ok(Self {
            model,
            optimizer,
            config,
            state: TrainerState::Initial,
            start_epoch: 0,
            resumed: false,
        })
    }

    /// Trained model.
    pub fn model(&self) -> &M {
        &self.model
    }

    /// Give back the model.
    pub fn into_model(self) -> M {
        self.model
    }

    /// Current state.
    pub fn state(&self) -> TrainerState {
        self.state
    }

    /// First epoch the next [`Trainer::fit`] will run.
    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    /// Run settings.
    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    /// Restore the state saved after `epoch` and continue at `epoch + 1`.
    ///
    /// The model checkpoint is required. A missing or unreadable optimizer
    /// checkpoint only produces a warning; training then restarts the
    /// optimizer moments.
    pub fn resume(&mut self, epoch: usize) -> Result<(), TrainError> {
        let model_path = checkpoint_path(&self.config.out_dir, epoch);
        if !model_path.exists() {
            return Err(TrainError::NotFound(model_path));
        }
        let bytes = fs::read(&model_path).map_err(io_error(&model_path))?;
        let state: StateDict = serde_json::from_slice(&bytes)?;
        self.model.load_state_dict(&state)?;

        let opt_path = optimizer_path(&self.config.out_dir, epoch);
        match fs::read(&opt_path)
            .map_err(io_error(&opt_path))
            .and_then(|bytes| Ok(serde_json::from_slice::<AdamW>(&bytes)?))
        {
            Ok(saved) => self.optimizer.load_state(saved),
            Err(e) => warn!(
                path = %opt_path.display(),
                error = %e,
                "optimizer state unavailable, continuing with fresh moments"
            ),
        }

        self.start_epoch = epoch + 1;
        self.resumed = true;
        self.state = TrainerState::Initial;
        info!(epoch, next = self.start_epoch, "resumed from checkpoint");
        Ok(())
    }

    /// Train from the start epoch through `config.epochs - 1`, validating,
    /// logging and checkpointing after every epoch.
    pub fn fit<T, V>(
        &mut self,
        train: &mut T,
        validation: Validation<'_, V>,
    ) -> Result<Vec<EpochSummary>, TrainError>
    where
        T: Dataset,
        T::Item: Into<Example<M::Input>>,
        V: Dataset + ?Sized,
        V::Item: Into<Example<M::Input>>,
    {
        let dir = self.config.out_dir.clone();
        fs::create_dir_all(&dir).map_err(io_error(&dir))?;
        let log_path = dir.join(LOG_FILE);
        let mut log = if self.resumed && log_path.exists() {
            TrainLog::append_to(&log_path)?
        } else {
            TrainLog::create(&log_path, self.metric_columns())?
        };

        let mut summaries = Vec::new();
        for epoch in self.start_epoch..self.config.epochs {
            self.state = TrainerState::Training { epoch };
            train.set_epoch(epoch);
            let train_loss = self.train_epoch(train, epoch)?;

            self.state = TrainerState::Validating { epoch };
            let (val_loss, values) = self.validate(validation)?;
            log.write_row(epoch, val_loss, &values)?;
            self.write_checkpoints(&dir, epoch)?;
            self.state = TrainerState::Checkpointed { epoch };

            info!(epoch, train_loss, val_loss, "epoch complete");
            let metrics = self
                .metric_columns()
                .iter()
                .map(|name| name.to_string())
                .zip(values)
                .collect();
            summaries.push(EpochSummary {
                epoch,
                train_loss,
                val_loss,
                metrics,
            });
        }
        self.start_epoch = self.start_epoch.max(self.config.epochs);
        self.resumed = true;
        self.state = TrainerState::Done;
        Ok(summaries)
    }

    fn metric_columns(&self) -> &'static [&'static str] {
        match self.config.objective {
            Objective::Log1pMse => &[
                "val_pearson_all",
                "val_spearman_all",
                "val_pearson_peaks",
                "val_spearman_peaks",
            ],
            Objective::CrossEntropy => &["val_acc", "val_auroc", "val_auprc", "val_mcc"],
        }
    }

    fn train_epoch<T>(&mut self, train: &T, epoch: usize) -> Result<f64, TrainError>
    where
        T: Dataset,
        T::Item: Into<Example<M::Input>>,
    {
        let mut order: Vec<usize> = (0..train.len()).collect();
        let mut rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(epoch as u64));
        order.shuffle(&mut rng);

        let accumulate = self.config.accumulate;
        let mut losses = Vec::new();
        let mut pending = 0;
        self.model.zero_grad();
        for (batch_no, range) in batch_ranges(order.len(), self.config.batch_size).enumerate() {
            let mut inputs = Vec::with_capacity(range.len());
            let mut targets = Vec::with_capacity(range.len());
            for &idx in &order[range] {
                let example: Example<M::Input> = train.get(idx)?.into();
                inputs.push(example.input);
                targets.push(example.target);
            }
            losses.push(self.train_batch(&inputs, &targets, batch_no)?);
            pending += 1;
            if pending == accumulate {
                self.optimizer.step(self.model.params_mut());
                self.model.zero_grad();
                pending = 0;
            }
        }
        if pending > 0 {
            self.optimizer.step(self.model.params_mut());
            self.model.zero_grad();
        }
        Ok(mean(&losses))
    }

    /// Forward/backward of one batch, accumulating gradients scaled by
    /// `1 / accumulate`. A batch over the memory budget is retried one
    /// example at a time with each loss scaled by `1 / (accumulate × n)`.
    fn train_batch(
        &mut self,
        inputs: &[M::Input],
        targets: &[Target],
        batch_no: usize,
    ) -> Result<f64, TrainError> {
        let objective = self.config.objective;
        let accumulate = self.config.accumulate as f32;
        let refs: Vec<&M::Input> = inputs.iter().collect();
        match self.model.forward(&refs) {
            Ok((outputs, cache)) => {
                let (loss, mut grad) = objective.loss_and_grad(outputs.view(), targets)?;
                grad /= accumulate;
                self.model.backward(cache, grad.view())?;
                Ok(loss)
            }
            Err(ComputeError::OutOfMemory { required, budget }) => {
                warn!(
                    batch = batch_no,
                    required, budget, "batch exceeds memory budget, falling back to single examples"
                );
                let n = inputs.len() as f32;
                let mut total = 0.0;
                for (i, (input, target)) in inputs.iter().zip(targets).enumerate() {
                    match self.train_example(input, *target, accumulate * n) {
                        Ok(loss) => total += loss,
                        Err(TrainError::Compute(e)) => {
                            warn!(batch = batch_no, example = i, error = %e, "skipping example");
                        }
                        Err(e) => return Err(e),
                    }
                }
                Ok(total / f64::from(n.max(1.0)))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn train_example(&mut self, input: &M::Input, target: Target, scale: f32) -> Result<f64, TrainError> {
        let (outputs, cache) = self.model.forward(&[input])?;
        let (loss, mut grad) = self
            .config
            .objective
            .loss_and_grad(outputs.view(), &[target])?;
        grad /= scale;
        self.model.backward(cache, grad.view())?;
        Ok(loss)
    }

    fn validate<V>(&self, validation: Validation<'_, V>) -> Result<(f64, Vec<f64>), TrainError>
    where
        V: Dataset + ?Sized,
        V::Item: Into<Example<M::Input>>,
    {
        let objective = self.config.objective;
        let batch_size = self.config.batch_size;
        let primary = predict(&self.model, validation.primary, batch_size)?;
        match objective {
            Objective::Log1pMse => {
                let background = validation
                    .background
                    .map(|set| predict(&self.model, set, batch_size))
                    .transpose()?;
                let mut batch_losses = primary.batch_losses(objective)?;
                let (peak_preds, peak_counts) = primary.counts()?;
                let (mut all_preds, mut all_counts) = (peak_preds.clone(), peak_counts.clone());
                if let Some(background) = &background {
                    batch_losses.extend(background.batch_losses(objective)?);
                    let (preds, counts) = background.counts()?;
                    all_preds.extend(preds);
                    all_counts.extend(counts);
                }
                let values = vec![
                    counts_pearson(&all_preds, &all_counts),
                    counts_spearman(&all_preds, &all_counts),
                    counts_pearson(&peak_preds, &peak_counts),
                    counts_spearman(&peak_preds, &peak_counts),
                ];
                Ok((mean(&batch_losses), values))
            }
            Objective::CrossEntropy => {
                let val_loss = mean(&primary.batch_losses(objective)?);
                let classes = primary.classes()?;
                let predicted: Vec<usize> = primary.predicted_classes();
                let log_odds = class_log_odds(&primary.outputs);
                let num_classes = primary.outputs.ncols();
                let (mut auroc, mut auprc, mut mcc_sum) = (0.0, 0.0, 0.0);
                for class in 0..num_classes {
                    let labels: Vec<bool> = classes.iter().map(|&c| c == class).collect();
                    let scores: Vec<f64> = log_odds.column(class).iter().copied().collect();
                    let calls: Vec<bool> = scores.iter().map(|&s| s >= 0.0).collect();
                    auroc += roc_auc(&labels, &scores);
                    auprc += average_precision(&labels, &scores);
                    mcc_sum += mcc(&labels, &calls);
                }
                let k = num_classes.max(1) as f64;
                let values = vec![
                    accuracy(&classes, &predicted),
                    auroc / k,
                    auprc / k,
                    mcc_sum / k,
                ];
                Ok((val_loss, values))
            }
        }
    }

    fn write_checkpoints(&self, dir: &Path, epoch: usize) -> Result<(), TrainError> {
        let model_path = checkpoint_path(dir, epoch);
        let json = serde_json::to_vec(&self.model.state_dict())?;
        fs::write(&model_path, json).map_err(io_error(&model_path))?;

        let opt_path = optimizer_path(dir, epoch);
        let json = serde_json::to_vec(&self.optimizer)?;
        fs::write(&opt_path, json).map_err(io_error(&opt_path))?;
        debug!(epoch, path = %model_path.display(), "checkpoint written");
        Ok(())
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::test_support::VecDataset;
    use crate::train::{best_epoch, read_train_log, ConvProbe, ConvProbeConfig};
    use ndarray::Array2;

    fn example(level: f32, counts: f32) -> Example<Array2<f32>> {
        Example::new(Array2::from_elem((6, 2), level), Target::Counts(counts))
    }

    fn data() -> VecDataset<Example<Array2<f32>>> {
        VecDataset((0..8).map(|i| example(i as f32 / 8.0, i as f32 * 3.0)).collect())
    }

    fn probe(memory_budget: Option<usize>) -> ConvProbe {
        ConvProbe::new(ConvProbeConfig {
            input_dim: 2,
            hidden: 4,
            kernel: 3,
            output_dim: 1,
            seed: 1,
            memory_budget,
        })
    }

    fn config(dir: &Path, epochs: usize) -> TrainerConfig {
        TrainerConfig {
            epochs,
            batch_size: 4,
            accumulate: 2,
            lr: 0.01,
            ..TrainerConfig::new(dir, Objective::Log1pMse)
        }
    }

    #[test]
    fn writes_log_and_checkpoints_per_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let mut train = data();
        let val = data();
        let mut trainer = Trainer::new(probe(None), config(dir.path(), 3)).unwrap();
        let summaries = trainer.fit(&mut train, Validation::new(&val)).unwrap();
        assert_eq!(summaries.len(), 3);
        assert_eq!(trainer.state(), TrainerState::Done);
        for epoch in 0..3 {
            assert!(checkpoint_path(dir.path(), epoch).exists());
            assert!(optimizer_path(dir.path(), epoch).exists());
        }
        let rows = read_train_log(&dir.path().join(LOG_FILE)).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].metrics.len(), 4);
        assert!(best_epoch(&dir.path().join(LOG_FILE)).unwrap() < 3);
    }

    #[test]
    fn resume_continues_after_the_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let mut train = data();
        let val = data();
        Trainer::new(probe(None), config(dir.path(), 3))
            .unwrap()
            .fit(&mut train, Validation::new(&val))
            .unwrap();
        fs::remove_file(optimizer_path(dir.path(), 2)).unwrap();

        let mut resumed = Trainer::new(probe(None), config(dir.path(), 5)).unwrap();
        resumed.resume(2).unwrap();
        assert_eq!(resumed.start_epoch(), 3);
        let summaries = resumed.fit(&mut train, Validation::new(&val)).unwrap();
        assert_eq!(summaries.iter().map(|s| s.epoch).collect::<Vec<_>>(), vec![3, 4]);

        let text = fs::read_to_string(dir.path().join(LOG_FILE)).unwrap();
        assert_eq!(text.matches("epoch\t").count(), 1);
        let epochs: Vec<usize> = read_train_log(&dir.path().join(LOG_FILE))
            .unwrap()
            .iter()
            .map(|row| row.epoch)
            .collect();
        assert_eq!(epochs, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn resume_without_model_checkpoint_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut trainer = Trainer::new(probe(None), config(dir.path(), 2)).unwrap();
        assert!(matches!(trainer.resume(0), Err(TrainError::NotFound(_))));
    }

    #[test]
    fn over_budget_batches_fall_back_to_single_examples() {
        let full = tempfile::tempdir().unwrap();
        let fallback = tempfile::tempdir().unwrap();
        let one_example = probe(None).activation_bytes([6]);
        let mut train = data();
        let val = data();

        let mut a = Trainer::new(probe(None), config(full.path(), 1)).unwrap();
        a.fit(&mut train, Validation::new(&val)).unwrap();
        let mut b = Trainer::new(probe(Some(one_example)), config(fallback.path(), 1)).unwrap();
        b.fit(&mut train, Validation::new(&val)).unwrap();

        let wa = a.model().state_dict();
        let wb = b.model().state_dict();
        for (name, tensor) in &wa {
            for (x, y) in tensor.data.iter().zip(&wb[name].data) {
                assert!((x - y).abs() < 1e-4, "{name}: {x} vs {y}");
            }
        }
    }
}
