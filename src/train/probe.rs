use ndarray::{s, Array1, Array2, Array3, ArrayView1, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::{load_param, ComputeError, ParamMut, StateDict, Tensor, TrainError, Trainable};

/// Shape of a [`ConvProbe`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvProbeConfig {
    /// Width of the per-position input features.
    pub input_dim: usize,
    /// Number of convolution channels.
    pub hidden: usize,
    /// Convolution kernel width.
    pub kernel: usize,
    /// Outputs per example (1 for counts, the class count otherwise).
    pub output_dim: usize,
    /// Initialisation seed.
    pub seed: u64,
    /// Activation memory allowed for one forward pass, in bytes.
    #[serde(default)]
    pub memory_budget: Option<usize>,
}

/// Activations of one example kept for the backward pass.
#[derive(Debug, Clone)]
pub struct ExampleCache {
    input: Array2<f32>,
    pre: Array2<f32>,
    pooled: Array1<f32>,
}

/// Convolutional probing head over per-position embeddings:
/// valid 1-d convolution, ReLU, mean pooling over positions, linear readout.
#[derive(Debug, Clone)]
pub struct ConvProbe {
    config: ConvProbeConfig,
    w_conv: Array3<f32>,
    b_conv: Array1<f32>,
    w_out: Array2<f32>,
    b_out: Array1<f32>,
    g_w_conv: Array3<f32>,
    g_b_conv: Array1<f32>,
    g_w_out: Array2<f32>,
    g_b_out: Array1<f32>,
}

impl ConvProbe {
    /// Probe with weights drawn uniformly from ±1/√fan_in.
    pub fn new(config: ConvProbeConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let (h, k, c, o) = (
            config.hidden,
            config.kernel.max(1),
            config.input_dim,
            config.output_dim,
        );
        let conv_bound = 1.0 / ((k * c).max(1) as f32).sqrt();
        let out_bound = 1.0 / (h.max(1) as f32).sqrt();
        let mut uniform = |bound: f32| rng.gen_range(-bound..=bound);
        let w_conv = Array3::from_shape_simple_fn((h, k, c), || uniform(conv_bound));
        let b_conv = Array1::from_shape_simple_fn(h, || uniform(conv_bound));
        let w_out = Array2::from_shape_simple_fn((o, h), || uniform(out_bound));
        let b_out = Array1::from_shape_simple_fn(o, || uniform(out_bound));
        Self {
            g_w_conv: Array3::zeros(w_conv.raw_dim()),
            g_b_conv: Array1::zeros(h),
            g_w_out: Array2::zeros(w_out.raw_dim()),
            g_b_out: Array1::zeros(o),
            config,
            w_conv,
            b_conv,
            w_out,
            b_out,
        }
    }

    /// Probe shape.
    pub fn config(&self) -> &ConvProbeConfig {
        &self.config
    }

    /// Number of trainable scalars.
    pub fn parameter_count(&self) -> usize {
        self.w_conv.len() + self.b_conv.len() + self.w_out.len() + self.b_out.len()
    }

    fn kernel(&self) -> usize {
        self.w_conv.len_of(Axis(1))
    }

    /// Bytes of activations a forward pass over inputs of these lengths keeps.
    pub fn activation_bytes(&self, lengths: impl IntoIterator<Item = usize>) -> usize {
        let k = self.kernel();
        lengths
            .into_iter()
            .map(|len| (len + 1).saturating_sub(k) * self.config.hidden * 2 * 4)
            .sum()
    }

    pub(crate) fn check_budget(&self, required: usize) -> Result<(), ComputeError> {
        match self.config.memory_budget {
            Some(budget) if required > budget => {
                Err(ComputeError::OutOfMemory { required, budget })
            }
            _ => Ok(()),
        }
    }

    pub(crate) fn forward_example(
        &self,
        input: ArrayView2<'_, f32>,
    ) -> Result<(Array1<f32>, ExampleCache), ComputeError> {
        let (len, dim) = input.dim();
        let k = self.kernel();
        if dim != self.config.input_dim {
            return Err(ComputeError::Shape(format!(
                "input width {dim}, probe expects {}",
                self.config.input_dim
            )));
        }
        if len < k {
            return Err(ComputeError::Shape(format!(
                "input of {len} positions is shorter than the kernel ({k})"
            )));
        }
        let out_len = len - k + 1;
        let mut pre = Array2::zeros((out_len, self.config.hidden));
        pre += &self.b_conv;
        for offset in 0..k {
            let window = input.slice(s![offset..offset + out_len, ..]);
            let weights = self.w_conv.index_axis(Axis(1), offset);
            pre += &window.dot(&weights.t());
        }
        let pooled = pre.mapv(|v| v.max(0.0)).mean_axis(Axis(0)).unwrap_or_else(|| {
            Array1::zeros(self.config.hidden)
        });
        let output = self.w_out.dot(&pooled) + &self.b_out;
        Ok((
            output,
            ExampleCache {
                input: input.to_owned(),
                pre,
                pooled,
            },
        ))
    }

    /// Accumulate gradients of one example and return the gradient with
    /// respect to its input.
    pub(crate) fn backward_example(
        &mut self,
        cache: &ExampleCache,
        grad_out: ArrayView1<'_, f32>,
    ) -> Array2<f32> {
        let k = self.kernel();
        let out_len = cache.pre.nrows();
        self.g_b_out += &grad_out;
        self.g_w_out += &outer(grad_out, cache.pooled.view());

        let grad_pooled = self.w_out.t().dot(&grad_out);
        let scale = 1.0 / out_len as f32;
        let mut grad_pre = cache.pre.mapv(|v| if v > 0.0 { scale } else { 0.0 });
        grad_pre *= &grad_pooled;
        self.g_b_conv += &grad_pre.sum_axis(Axis(0));

        let mut grad_input = Array2::zeros(cache.input.raw_dim());
        for offset in 0..k {
            let window = cache.input.slice(s![offset..offset + out_len, ..]);
            let mut g_w = self.g_w_conv.index_axis_mut(Axis(1), offset);
            g_w += &grad_pre.t().dot(&window);
            let weights = self.w_conv.index_axis(Axis(1), offset);
            let mut g_x = grad_input.slice_mut(s![offset..offset + out_len, ..]);
            g_x += &grad_pre.dot(&weights);
        }
        grad_input
    }

    pub(crate) fn zero_head_grad(&mut self) {
        self.g_w_conv.fill(0.0);
        self.g_b_conv.fill(0.0);
        self.g_w_out.fill(0.0);
        self.g_b_out.fill(0.0);
    }

    pub(crate) fn head_params(&mut self) -> Vec<ParamMut<'_>> {
        vec![
            ParamMut::new("conv.weight", &mut self.w_conv, &self.g_w_conv),
            ParamMut::new("conv.bias", &mut self.b_conv, &self.g_b_conv),
            ParamMut::new("out.weight", &mut self.w_out, &self.g_w_out),
            ParamMut::new("out.bias", &mut self.b_out, &self.g_b_out),
        ]
    }

    pub(crate) fn write_state(&self, prefix: &str, state: &mut StateDict) {
        state.insert(format!("{prefix}conv.weight"), Tensor::from_array(&self.w_conv));
        state.insert(format!("{prefix}conv.bias"), Tensor::from_array(&self.b_conv));
        state.insert(format!("{prefix}out.weight"), Tensor::from_array(&self.w_out));
        state.insert(format!("{prefix}out.bias"), Tensor::from_array(&self.b_out));
    }

    pub(crate) fn read_state(&mut self, prefix: &str, state: &StateDict) -> Result<(), TrainError> {
        load_param(state, &format!("{prefix}conv.weight"), &mut self.w_conv)?;
        load_param(state, &format!("{prefix}conv.bias"), &mut self.b_conv)?;
        load_param(state, &format!("{prefix}out.weight"), &mut self.w_out)?;
        load_param(state, &format!("{prefix}out.bias"), &mut self.b_out)
    }
}

fn outer(a: ArrayView1<'_, f32>, b: ArrayView1<'_, f32>) -> Array2<f32> {
    let col = a.insert_axis(Axis(1));
    let row = b.insert_axis(Axis(0));
    col.dot(&row)
}

impl Trainable for ConvProbe {
    type Input = Array2<f32>;
    type Cache = Vec<ExampleCache>;

    fn output_dim(&self) -> usize {
        self.config.output_dim
    }

    fn forward(&self, batch: &[&Array2<f32>]) -> Result<(Array2<f32>, Self::Cache), ComputeError> {
        self.check_budget(self.activation_bytes(batch.iter().map(|x| x.nrows())))?;
        let mut outputs = Array2::zeros((batch.len(), self.config.output_dim));
        let mut caches = Vec::with_capacity(batch.len());
        for (mut row, input) in outputs.rows_mut().into_iter().zip(batch) {
            let (output, cache) = self.forward_example(input.view())?;
            row.assign(&output);
            caches.push(cache);
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
                "{} output gradients for {} cached examples",
                grad_out.nrows(),
                cache.len()
            )));
        }
        for (example, grad) in cache.iter().zip(grad_out.rows()) {
            self.backward_example(example, grad);
        }
        Ok(())
    }

    fn zero_grad(&mut self) {
        self.zero_head_grad();
    }

    fn params_mut(&mut self) -> Vec<ParamMut<'_>> {
        self.head_params()
    }

    fn state_dict(&self) -> StateDict {
        let mut state = StateDict::new();
        self.write_state("", &mut state);
        state
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<(), TrainError> {
        self.read_state("", state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn config(memory_budget: Option<usize>) -> ConvProbeConfig {
        ConvProbeConfig {
            input_dim: 2,
            hidden: 3,
            kernel: 2,
            output_dim: 1,
            seed: 7,
            memory_budget,
        }
    }

    #[test]
    fn counts_parameters() {
        let probe = ConvProbe::new(config(None));
        assert_eq!(probe.parameter_count(), 3 * 2 * 2 + 3 + 3 + 1);
    }

    #[test]
    fn analytic_gradient_matches_finite_difference() {
        let mut probe = ConvProbe::new(config(None));
        probe.b_conv.fill(0.5);
        let x = array![[0.3f32, -0.2], [0.1, 0.4], [-0.5, 0.2], [0.7, 0.1]];

        let (out, cache) = probe.forward(&[&x]).unwrap();
        probe.backward(cache, Array2::ones(out.raw_dim()).view()).unwrap();
        let analytic = probe.g_w_conv[[1, 0, 1]];

        let eps = 1e-3;
        let mut plus = probe.clone();
        plus.w_conv[[1, 0, 1]] += eps;
        let mut minus = probe.clone();
        minus.w_conv[[1, 0, 1]] -= eps;
        let f = |p: &ConvProbe| p.forward(&[&x]).unwrap().0[[0, 0]];
        let numeric = (f(&plus) - f(&minus)) / (2.0 * eps);
        assert!((analytic - numeric).abs() < 1e-2, "{analytic} vs {numeric}");
    }

    #[test]
    fn budget_overflow_reports_out_of_memory() {
        let probe = ConvProbe::new(config(Some(300)));
        let x = Array2::<f32>::zeros((10, 2));
        assert!(probe.forward(&[&x]).is_ok());
        assert!(matches!(
            probe.forward(&[&x, &x]),
            Err(ComputeError::OutOfMemory { .. })
        ));
    }

    #[test]
    fn state_dict_round_trips() {
        let probe = ConvProbe::new(config(None));
        let mut other = ConvProbe::new(ConvProbeConfig { seed: 99, ..config(None) });
        other.load_state_dict(&probe.state_dict()).unwrap();
        assert_eq!(other.w_conv, probe.w_conv);
        assert_eq!(other.b_out, probe.b_out);
    }
}
