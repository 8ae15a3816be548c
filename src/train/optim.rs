//! AdamW optimizer (Adam with decoupled weight decay).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::ParamMut;

/// First and second moment buffers of one parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Moments {
    m: Vec<f32>,
    v: Vec<f32>,
}

/// AdamW optimizer.
///
/// Weight decay is applied to the parameters directly instead of being added
/// to the gradient:
///
/// θ_t = (1 - lr·λ)·θ_{t-1} - lr_t · m_t / (√v_t + ε)
///
/// with bias-corrected step size lr_t = lr·√(1 - β2^t) / (1 - β1^t).
/// Moments are keyed by parameter name so the whole state serialises into
/// an `optimizer_<epoch>.json` checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdamW {
    lr: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    weight_decay: f32,
    t: u64,
    moments: BTreeMap<String, Moments>,
}

impl AdamW {
    /// Create a new AdamW optimizer.
    pub fn new(lr: f32, beta1: f32, beta2: f32, epsilon: f32, weight_decay: f32) -> Self {
        Self {
            lr,
            beta1,
            beta2,
            epsilon,
            weight_decay,
            t: 0,
            moments: BTreeMap::new(),
        }
    }

    /// AdamW with default betas and epsilon.
    pub fn default_params(lr: f32, weight_decay: f32) -> Self {
        Self::new(lr, 0.9, 0.999, 1e-8, weight_decay)
    }

    /// Optimizer steps taken so far.
    pub fn step_count(&self) -> u64 {
        self.t
    }

    /// Learning rate.
    pub fn lr(&self) -> f32 {
        self.lr
    }

    /// Restore step counter and moments from a saved optimizer, keeping this
    /// optimizer's hyper-parameters.
    pub fn load_state(&mut self, saved: AdamW) {
        self.t = saved.t;
        self.moments = saved.moments;
    }

    /// Apply one update to every parameter from its accumulated gradient.
    pub fn step(&mut self, params: Vec<ParamMut<'_>>) {
        self.t += 1;
        let t = self.t.min(i32::MAX as u64) as i32;
        let lr_t = self.lr * (1.0 - self.beta2.powi(t)).sqrt() / (1.0 - self.beta1.powi(t));
        let decay = 1.0 - self.lr * self.weight_decay;
        let (beta1, beta2, epsilon) = (self.beta1, self.beta2, self.epsilon);

        for mut param in params {
            let len = param.value.len();
            let moments = self
                .moments
                .entry(param.name.to_string())
                .or_insert_with(|| Moments {
                    m: vec![0.0; len],
                    v: vec![0.0; len],
                });
            if moments.m.len() != len {
                moments.m = vec![0.0; len];
                moments.v = vec![0.0; len];
            }

            let updates = param
                .value
                .iter_mut()
                .zip(param.grad.iter())
                .zip(moments.m.iter_mut().zip(moments.v.iter_mut()));
            for ((theta, &g), (m, v)) in updates {
                *m = beta1 * *m + (1.0 - beta1) * g;
                *v = beta2 * *v + (1.0 - beta2) * g * g;
                *theta = decay * *theta - lr_t * *m / (v.sqrt() + epsilon);
            }
        }
    }
}
