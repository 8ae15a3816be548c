use ndarray::{Array2, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::probe::ExampleCache;
use super::{
    load_param, ComputeError, ConvProbe, ConvProbeConfig, ParamMut, StateDict, Tensor,
    TrainError, Trainable,
};
use crate::genomics::Window;
use crate::model::{offsets_to_indices, KmerEmbedder, SequenceModel};

/// Low-rank adapter settings of a [`LoraKmerModel`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraConfig {
    /// Width of the frozen token embeddings.
    pub embedding_dim: usize,
    /// Adapter rank.
    pub rank: usize,
    /// Adapter scale numerator; updates are scaled by `alpha / rank`.
    pub alpha: f32,
    /// Seed of the frozen table and the adapter.
    pub seed: u64,
    /// Convolution channels of the head.
    pub hidden: usize,
    /// Kernel width of the head.
    pub kernel: usize,
    /// Outputs per example.
    pub output_dim: usize,
    /// Activation memory allowed for one forward pass, in bytes.
    #[serde(default)]
    pub memory_budget: Option<usize>,
}

/// Cached activations of one window.
#[derive(Debug, Clone)]
pub struct LoraCache {
    token_ids: Vec<usize>,
    positions: Vec<usize>,
    head: ExampleCache,
}

/// End-to-end fine-tunable model: frozen 6-mer embedding table with a
/// low-rank adapter, gathered to positions and read out by a [`ConvProbe`].
///
/// Token `t` embeds as `E[t] + (alpha / rank) · A[t] · B` where `E` is frozen,
/// `A` starts random and `B` starts at zero, so training begins from the
/// frozen model exactly.
#[derive(Debug, Clone)]
pub struct LoraKmerModel {
    config: LoraConfig,
    frozen: KmerEmbedder,
    lora_a: Array2<f32>,
    lora_b: Array2<f32>,
    g_lora_a: Array2<f32>,
    g_lora_b: Array2<f32>,
    head: ConvProbe,
}

impl LoraKmerModel {
    /// Build the frozen table, adapter and head from `config`.
    pub fn new(config: LoraConfig) -> Self {
        let frozen = KmerEmbedder::nucleotide_transformer(config.embedding_dim, config.seed);
        let vocab = frozen.table().nrows();
        let rank = config.rank.max(1);
        let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(1));
        let bound = 1.0 / (rank as f32).sqrt();
        let lora_a = Array2::from_shape_simple_fn((vocab, rank), || rng.gen_range(-bound..=bound));
        let lora_b = Array2::zeros((rank, config.embedding_dim));
        let head = ConvProbe::new(ConvProbeConfig {
            input_dim: config.embedding_dim,
            hidden: config.hidden,
            kernel: config.kernel,
            output_dim: config.output_dim,
            seed: config.seed.wrapping_add(2),
            memory_budget: config.memory_budget,
        });
        Self {
            g_lora_a: Array2::zeros(lora_a.raw_dim()),
            g_lora_b: Array2::zeros(lora_b.raw_dim()),
            config,
            frozen,
            lora_a,
            lora_b,
            head,
        }
    }

    /// Adapter settings.
    pub fn config(&self) -> &LoraConfig {
        &self.config
    }

    /// Readout head.
    pub fn head(&self) -> &ConvProbe {
        &self.head
    }

    /// Trainable scalars: adapter plus head. The frozen table is excluded.
    pub fn parameter_count(&self) -> usize {
        self.lora_a.len() + self.lora_b.len() + self.head.parameter_count()
    }

    fn scale(&self) -> f32 {
        self.config.alpha / self.lora_b.nrows() as f32
    }

    fn position_embeddings(
        &self,
        window: &Window,
    ) -> Result<(Array2<f32>, Vec<usize>, Vec<usize>), ComputeError> {
        let tokens = self
            .frozen
            .tokenize(std::slice::from_ref(window))
            .map_err(|e| ComputeError::Shape(e.to_string()))?;
        let token_ids: Vec<usize> = tokens.ids.row(0).iter().map(|&id| id as usize).collect();
        let positions: Vec<usize> = offsets_to_indices(&tokens.offsets, tokens.seq_len)
            .row(0)
            .iter()
            .map(|&t| t as usize)
            .collect();

        let table = self.frozen.table();
        let scale = self.scale();
        let mut embedded = Array2::zeros((positions.len(), table.ncols()));
        for (mut row, &token) in embedded.rows_mut().into_iter().zip(&positions) {
            let id = token_ids.get(token).copied().ok_or_else(|| {
                ComputeError::Shape(format!("position maps to missing token {token}"))
            })?;
            row.assign(&table.row(id));
            let delta = self.lora_a.row(id).dot(&self.lora_b);
            row.scaled_add(scale, &delta);
        }
        Ok((embedded, token_ids, positions))
    }

    fn backward_window(&mut self, cache: &LoraCache, grad_positions: ArrayView2<'_, f32>) {
        let scale = self.scale();
        for (&token, grad) in cache.positions.iter().zip(grad_positions.rows()) {
            let Some(&id) = cache.token_ids.get(token) else {
                continue;
            };
            let a_row = self.lora_a.row(id).to_owned();
            let grad_a = self.lora_b.dot(&grad) * scale;
            self.g_lora_a.row_mut(id).scaled_add(1.0, &grad_a);
            let outer = a_row
                .insert_axis(Axis(1))
                .dot(&grad.insert_axis(Axis(0)));
            self.g_lora_b.scaled_add(scale, &outer);
        }
    }
}

impl Trainable for LoraKmerModel {
    type Input = Window;
    type Cache = Vec<LoraCache>;

    fn output_dim(&self) -> usize {
        self.config.output_dim
    }

    fn forward(&self, batch: &[&Window]) -> Result<(Array2<f32>, Self::Cache), ComputeError> {
        self.head
            .check_budget(self.head.activation_bytes(batch.iter().map(|w| w.nrows())))?;
        let mut outputs = Array2::zeros((batch.len(), self.config.output_dim));
        let mut caches = Vec::with_capacity(batch.len());
        for (mut row, window) in outputs.rows_mut().into_iter().zip(batch) {
            let (embedded, token_ids, positions) = self.position_embeddings(window)?;
            let (output, head) = self.head.forward_example(embedded.view())?;
            row.assign(&output);
            caches.push(LoraCache {
                token_ids,
                positions,
                head,
            });
        }
        Ok((outputs, caches))
    }

    fn backward(
        &mut self,
        cache: Self::Cache,
        grad_out: ArrayView2<'_, f32>,
    ) -> Result<(), ComputeError> {
        if grad_out.nrows() != cache.len() {
            return Err(ComputeError::Shape(format!(
                "{} output gradients for {} cached windows",
                grad_out.nrows(),
                cache.len()
            )));
        }
        for (window, grad) in cache.iter().zip(grad_out.rows()) {
            let grad_positions = self.head.backward_example(&window.head, grad);
            self.backward_window(window, grad_positions.view());
        }
        Ok(())
    }

    fn zero_grad(&mut self) {
        self.g_lora_a.fill(0.0);
        self.g_lora_b.fill(0.0);
        self.head.zero_head_grad();
    }

    fn params_mut(&mut self) -> Vec<ParamMut<'_>> {
        let mut params = vec![
            ParamMut::new("lora.a", &mut self.lora_a, &self.g_lora_a),
            ParamMut::new("lora.b", &mut self.lora_b, &self.g_lora_b),
        ];
        params.extend(self.head.head_params());
        params
    }

    fn state_dict(&self) -> StateDict {
        let mut state = StateDict::new();
        state.insert("lora.a".to_string(), Tensor::from_array(&self.lora_a));
        state.insert("lora.b".to_string(), Tensor::from_array(&self.lora_b));
        self.head.write_state("head.", &mut state);
        state
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<(), TrainError> {
        load_param(state, "lora.a", &mut self.lora_a)?;
        load_param(state, "lora.b", &mut self.lora_b)?;
        self.head.read_state("head.", state)
    }
}
