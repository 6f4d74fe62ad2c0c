//! Learned parameters of weighted layers.
//!
//! [`LearnedParams`] holds the kernel weights and biases of a layer, their
//! gradients, and their device copies. It implements [`Update`] so that
//! weighted layers only have to expose it.
//!
//! # Lifecycle
//!
//! - Host weights are authoritative until the first GPU use, which uploads
//!   them. After a GPU update the host copies are stale until
//!   [`Update::pull_weights_gpu`].
//! - Gradients are zeroed by every update. Backward overwrites them, or
//!   adds to them when `accumulate_delta_weights` is set, so several steps
//!   can be summed before one update.

use crate::backend::ExecutionContext;
use crate::device::Buffer;
use crate::error::{GraphError, Result};
use crate::layer::Update;
use rand::Rng;
use rand::rngs::StdRng;

/// Device copies of the parameters.
#[derive(Debug)]
pub struct DeviceParams {
    /// Kernel weights.
    pub weights: Buffer,
    /// Kernel weight gradients.
    pub weight_grads: Buffer,
    /// Biases.
    pub biases: Buffer,
    /// Bias gradients.
    pub bias_grads: Buffer,
}

fn to_f32(values: &[f64]) -> Vec<f32> {
    values.iter().map(|&x| x as f32).collect()
}

fn load(dst: &mut [f64], buffer: &mut Buffer) -> Result<()> {
    buffer.download()?;
    for (d, s) in dst.iter_mut().zip(buffer.host()) {
        *d = f64::from(*s);
    }
    Ok(())
}

fn sgd(weights: &mut [f64], grads: &mut [f64], learning_rate: f64) {
    for (w, g) in weights.iter_mut().zip(grads.iter_mut()) {
        *w -= learning_rate * *g;
        *g = 0.0;
    }
}

/// Weights and biases of a layer.
#[derive(Debug)]
pub struct LearnedParams {
    weights: Vec<f64>,
    weight_grads: Vec<f64>,
    biases: Vec<f64>,
    bias_grads: Vec<f64>,
    device: Option<DeviceParams>,
    fan_in: usize,
    initialized: bool,
    compute_delta_weights: bool,
    accumulate_delta_weights: bool,
}

impl LearnedParams {
    /// Zeroed parameters; `fan_in` scales the initialization.
    pub fn new(nb_weights: usize, nb_biases: usize, fan_in: usize) -> Self {
        Self {
            weights: vec![0.0; nb_weights],
            weight_grads: vec![0.0; nb_weights],
            biases: vec![0.0; nb_biases],
            bias_grads: vec![0.0; nb_biases],
            device: None,
            fan_in: fan_in.max(1),
            initialized: false,
            compute_delta_weights: true,
            accumulate_delta_weights: false,
        }
    }

    /// Same weights and flags, zero gradients, no device copy.
    pub fn copy(&self) -> Self {
        Self {
            weights: self.weights.clone(),
            weight_grads: vec![0.0; self.weights.len()],
            biases: self.biases.clone(),
            bias_grads: vec![0.0; self.biases.len()],
            device: None,
            fan_in: self.fan_in,
            initialized: self.initialized,
            compute_delta_weights: self.compute_delta_weights,
            accumulate_delta_weights: self.accumulate_delta_weights,
        }
    }

    /// Host kernel weights.
    pub fn kernel(&self) -> &[f64] {
        &self.weights
    }

    /// Host biases.
    pub fn biases(&self) -> &[f64] {
        &self.biases
    }

    /// Host gradients, kernel then biases, for backward to write into.
    pub fn grads_mut(&mut self) -> (&mut [f64], &mut [f64]) {
        (&mut self.weight_grads, &mut self.bias_grads)
    }

    /// Device copies, uploaded on first use.
    pub fn device(&mut self, ctx: &ExecutionContext) -> Result<&DeviceParams> {
        if self.device.is_none() {
            self.init_weights_gpu(ctx)?;
        }
        self.device
            .as_ref()
            .ok_or_else(|| GraphError::Init("weights are not on the device".into()))
    }
}

impl Update for LearnedParams {
    fn nb_learned(&self) -> usize {
        self.weights.len() + self.biases.len()
    }

    fn compute_delta_weights(&self) -> bool {
        self.compute_delta_weights
    }

    fn set_compute_delta_weights(&mut self, value: bool) {
        self.compute_delta_weights = value;
    }

    fn accumulate_delta_weights(&self) -> bool {
        self.accumulate_delta_weights
    }

    fn set_accumulate_delta_weights(&mut self, value: bool) {
        self.accumulate_delta_weights = value;
    }

    fn init_weights(&mut self, rng: &mut StdRng) {
        if self.initialized {
            return;
        }
        let bound = 1.0 / (self.fan_in as f64).sqrt();
        for w in &mut self.weights {
            *w = rng.random_range(-bound..bound);
        }
        for b in &mut self.biases {
            *b = rng.random_range(-bound..bound) * 0.1;
        }
        self.initialized = true;
        self.device = None;
    }

    fn weights(&self) -> Vec<f64> {
        self.weights.iter().chain(&self.biases).copied().collect()
    }

    fn set_weights(&mut self, weights: &[f64]) -> Result<()> {
        if weights.len() != self.nb_learned() {
            return Err(GraphError::DataSize);
        }
        let (kernel, biases) = weights.split_at(self.weights.len());
        self.weights.copy_from_slice(kernel);
        self.biases.copy_from_slice(biases);
        self.initialized = true;
        self.device = None;
        Ok(())
    }

    fn gradients(&self) -> Vec<f64> {
        self.weight_grads
            .iter()
            .chain(&self.bias_grads)
            .copied()
            .collect()
    }

    fn init_weights_gpu(&mut self, ctx: &ExecutionContext) -> Result<()> {
        let device = ctx.device();
        let precision = ctx.precision();
        self.device = Some(DeviceParams {
            weights: Buffer::from_slice(device, &to_f32(&self.weights), precision)?,
            weight_grads: Buffer::new(device, self.weights.len(), precision)?,
            biases: Buffer::from_slice(device, &to_f32(&self.biases), precision)?,
            bias_grads: Buffer::new(device, self.biases.len(), precision)?,
        });
        Ok(())
    }

    fn pull_weights_gpu(&mut self) -> Result<()> {
        let Self {
            weights,
            weight_grads,
            biases,
            bias_grads,
            device,
            ..
        } = self;
        if let Some(params) = device.as_mut() {
            load(weights, &mut params.weights)?;
            load(weight_grads, &mut params.weight_grads)?;
            load(biases, &mut params.biases)?;
            load(bias_grads, &mut params.bias_grads)?;
        }
        Ok(())
    }

    fn update_cpu(&mut self, learning_rate: f64) {
        sgd(&mut self.weights, &mut self.weight_grads, learning_rate);
        sgd(&mut self.biases, &mut self.bias_grads, learning_rate);
    }

    fn update_gpu(&mut self, ctx: &ExecutionContext, learning_rate: f64) -> Result<()> {
        let precision = ctx.precision().flag();
        let lr = (learning_rate as f32).to_bits();
        let params = self.device(ctx)?;
        for (weights, grads) in [
            (&params.weights, &params.weight_grads),
            (&params.biases, &params.bias_grads),
        ] {
            ctx.device()
                .create_command("sgd")
                .set_bytes(0, &[weights.len() as u32, lr, precision])
                .set_buffer(1, weights)
                .set_buffer(2, grads)
                .dispatch_threads(weights.len())
                .enqueue()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn seeded_init_is_deterministic() {
        let mut a = LearnedParams::new(6, 2, 3);
        let mut b = LearnedParams::new(6, 2, 3);
        a.init_weights(&mut StdRng::seed_from_u64(1));
        b.init_weights(&mut StdRng::seed_from_u64(1));
        assert_eq!(a.weights(), b.weights());
        let bound = 1.0 / 3f64.sqrt();
        assert!(a.kernel().iter().all(|w| w.abs() <= bound));
    }

    #[test]
    fn explicit_weights_survive_init() {
        let mut params = LearnedParams::new(2, 1, 2);
        params.set_weights(&[1.0, 2.0, 3.0]).unwrap();
        params.init_weights(&mut StdRng::seed_from_u64(9));
        assert_eq!(params.weights(), vec![1.0, 2.0, 3.0]);
        assert_eq!(params.set_weights(&[1.0]), Err(GraphError::DataSize));
    }

    #[test]
    fn cpu_and_gpu_updates_agree() {
        let ctx = ExecutionContext::host_gpu();
        let mut cpu = LearnedParams::new(2, 1, 2);
        cpu.set_weights(&[0.5, -0.5, 0.25]).unwrap();
        let mut gpu = cpu.copy();
        {
            let (w, b) = cpu.grads_mut();
            w.copy_from_slice(&[1.0, 2.0]);
            b[0] = -1.0;
        }
        cpu.update_cpu(0.1);

        gpu.device(&ctx).unwrap();
        {
            let DeviceParams {
                weight_grads,
                bias_grads,
                ..
            } = gpu.device.as_mut().unwrap();
            weight_grads.host_mut().copy_from_slice(&[1.0, 2.0]);
            weight_grads.upload().unwrap();
            bias_grads.host_mut()[0] = -1.0;
            bias_grads.upload().unwrap();
        }
        gpu.update_gpu(&ctx, 0.1).unwrap();
        gpu.pull_weights_gpu().unwrap();

        for (a, b) in cpu.weights().iter().zip(gpu.weights()) {
            assert!((a - b).abs() < 1e-6);
        }
        assert_eq!(gpu.gradients(), vec![0.0; 3]);
        assert_eq!(cpu.gradients(), vec![0.0; 3]);
    }
}
