//! Mean squared error loss.

use crate::backend::ExecutionContext;
use crate::device::Buffer;
use crate::error::{GraphError, Result};
use crate::layer::{
    Backward, EPSILON, Forward, GradientCheckable, Graph, GraphMut, Layer, LayerBase, LayerId,
    Links, Resizable, write_delta,
};
use crate::model::ModelContext;

/// `coefficient · Σ (out - truth)² / (size · batch)` over its predecessor.
///
/// The output is a copy of the predecessor. The loss layer does not take
/// part in `backward`: [`loss_derivative_cpu`] / [`loss_derivative_gpu`]
/// seed the predecessor's gradient instead.
///
/// Ground truths are flat, one batch element after the other.
///
/// [`loss_derivative_cpu`]: Mse::loss_derivative_cpu
/// [`loss_derivative_gpu`]: Mse::loss_derivative_gpu
#[derive(Debug)]
pub struct Mse {
    base: LayerBase,
    prev: LayerId,
    coefficient: f64,
    truth: Option<Buffer>,
}

impl Mse {
    /// Loss over layer `prev` of `model`.
    pub fn new(model: &ModelContext, prev: LayerId) -> Result<Self> {
        Ok(Self {
            base: LayerBase::new(Links::Single(prev), model.shape(prev)?),
            prev,
            coefficient: 1.0,
            truth: None,
        })
    }

    /// Scales the loss and its derivative.
    pub fn with_coefficient(mut self, coefficient: f64) -> Self {
        self.coefficient = coefficient;
        self
    }

    /// Loss scale.
    pub fn coefficient(&self) -> f64 {
        self.coefficient
    }

    fn norm(&self) -> f64 {
        (self.base.size() * self.base.batch_size()) as f64
    }

    fn check_truth(&self, truth: &[f64]) -> Result<()> {
        if truth.len() != self.base.size() * self.base.batch_size() {
            return Err(GraphError::DataSize);
        }
        Ok(())
    }

    /// Loss of the CPU output.
    pub fn loss_cpu(&self, truth: &[f64]) -> Result<f64> {
        self.check_truth(truth)?;
        let size = self.base.size();
        let neurons = self.base.neurons()?;
        let mut sum = 0.0;
        for (index, unit) in neurons.units().iter().enumerate() {
            for elem in 0..self.base.batch_size() {
                let diff = unit.v[elem].out - truth[elem * size + index];
                sum += diff * diff;
            }
        }
        Ok(self.coefficient * sum / self.norm())
    }

    /// Loss of the device output, downloaded first.
    pub fn loss_gpu(&mut self, truth: &[f64]) -> Result<f64> {
        self.check_truth(truth)?;
        let buffer = self.base.outs_buffer_mut()?;
        buffer.download()?;
        let sum: f64 = buffer
            .host()
            .iter()
            .zip(truth)
            .map(|(&out, gt)| {
                let diff = f64::from(out) - gt;
                diff * diff
            })
            .sum();
        Ok(self.coefficient * sum / self.norm())
    }

    fn loss_gc(&self, truth: &[f64], col: usize) -> Result<f64> {
        let size = self.base.size();
        let neurons = self.base.neurons()?;
        let mut sum = 0.0;
        for (index, unit) in neurons.units().iter().enumerate() {
            for (elem, gc) in unit.gc.iter().enumerate() {
                let diff = gc[col] - truth[elem * size + index];
                sum += diff * diff;
            }
        }
        Ok(self.coefficient * sum / self.norm())
    }

    /// Writes `∂loss/∂out` into the predecessor's CPU gradient.
    pub fn loss_derivative_cpu(&self, graph: &mut GraphMut<'_>, truth: &[f64]) -> Result<()> {
        self.check_truth(truth)?;
        let prev = graph.base_mut(self.prev)?;
        if !prev.compute_delta() {
            return Ok(());
        }
        let (size, batch) = (self.base.size(), self.base.batch_size());
        let factor = 2.0 * self.coefficient / self.norm();
        let overwrite = prev.is_dirty();
        let outs = self.base.neurons()?;
        for (index, (unit, src)) in prev
            .neurons_mut()?
            .units_mut()
            .iter_mut()
            .zip(outs.units())
            .enumerate()
        {
            for elem in 0..batch {
                let value = factor * (src.v[elem].out - truth[elem * size + index]);
                write_delta(&mut unit.v[elem].delta, value, overwrite);
            }
        }
        prev.mark_written();
        Ok(())
    }

    /// Writes `∂loss/∂out` into the predecessor's device gradient.
    pub fn loss_derivative_gpu(
        &mut self,
        graph: &mut GraphMut<'_>,
        ctx: &ExecutionContext,
        truth: &[f64],
    ) -> Result<()> {
        self.check_truth(truth)?;
        let batch = self.base.batch_size();
        let prev = graph.base_mut(self.prev)?;
        if !prev.compute_delta() {
            return Ok(());
        }
        prev.check_state_backward_gpu(ctx, batch)?;
        let factor = (2.0 * self.coefficient / self.norm()) as f32;

        if self.truth.as_ref().is_none_or(|buffer| buffer.len() < truth.len()) {
            self.truth = Some(Buffer::new(ctx.device(), truth.len(), ctx.precision())?);
        }
        let buffer = self
            .truth
            .as_mut()
            .ok_or_else(|| GraphError::Init("ground truth buffer missing".into()))?;
        for (dst, src) in buffer.host_mut().iter_mut().zip(truth) {
            *dst = *src as f32;
        }
        buffer.upload()?;

        ctx.device()
            .create_command("mse_derivative")
            .set_bytes(
                0,
                &[
                    truth.len() as u32,
                    factor.to_bits(),
                    u32::from(!prev.is_dirty()),
                    ctx.precision().flag(),
                ],
            )
            .set_buffer(1, self.base.outs_buffer()?)
            .set_buffer(2, buffer)
            .set_buffer(3, prev.delta_buffer()?)
            .dispatch_threads(truth.len())
            .enqueue()?;
        prev.mark_written();
        Ok(())
    }

    /// Central finite difference of the loss for every learned scalar, from
    /// the probes computed by `forward_gc`.
    pub fn collect_gradients_approx(&self, truth: &[f64]) -> Result<Vec<f64>> {
        self.check_truth(truth)?;
        let nb_gc = self.base.nb_gc();
        (0..nb_gc / 2)
            .map(|probe| {
                let plus = self.loss_gc(truth, 2 * probe)?;
                let minus = self.loss_gc(truth, 2 * probe + 1)?;
                Ok((plus - minus) / (2.0 * EPSILON))
            })
            .collect()
    }
}

impl Forward for Mse {
    fn forward_cpu(&mut self, graph: &Graph<'_>) -> Result<()> {
        let batch = self.base.batch_size();
        self.base.check_state_cpu(batch)?;
        let prev = graph.neurons(self.prev)?;
        let neurons = self.base.neurons_mut()?;
        for (unit, src) in neurons.units_mut().iter_mut().zip(prev.units()) {
            for elem in 0..batch {
                unit.v[elem].out = src.v[elem].out;
            }
        }
        Ok(())
    }

    fn forward_gpu(&mut self, graph: &Graph<'_>, ctx: &ExecutionContext) -> Result<()> {
        let batch = self.base.batch_size();
        self.base.check_state_forward_gpu(ctx, batch)?;
        let n = batch * self.base.size();
        ctx.device()
            .create_command("copy")
            .set_bytes(0, &[n as u32, ctx.precision().flag()])
            .set_buffer(1, graph.base(self.prev)?.outs_buffer()?)
            .set_buffer(2, self.base.outs_buffer()?)
            .dispatch_threads(n)
            .enqueue()?;
        Ok(())
    }
}

impl Backward for Mse {
    fn backward_cpu(&mut self, _graph: &mut GraphMut<'_>) -> Result<()> {
        Ok(())
    }

    fn backward_gpu(&mut self, _graph: &mut GraphMut<'_>, _ctx: &ExecutionContext) -> Result<()> {
        Ok(())
    }
}

impl GradientCheckable for Mse {
    fn forward_gc_cpu(&mut self, graph: &Graph<'_>) -> Result<()> {
        let batch = self.base.batch_size();
        self.base.check_state_cpu(batch)?;
        let prev = graph.neurons(self.prev)?;
        let neurons = self.base.neurons_mut()?;
        neurons.init_gc(batch, prev.nb_gc());
        for (unit, src) in neurons.units_mut().iter_mut().zip(prev.units()) {
            for (dst, values) in unit.gc.iter_mut().zip(&src.gc) {
                dst.copy_from_slice(values);
            }
        }
        Ok(())
    }
}

impl Resizable for Mse {
    fn resize(&self, ctx: &ModelContext, _height: usize, _width: usize) -> Result<Box<dyn Layer>> {
        let mut layer = Self::new(ctx, self.prev)?.with_coefficient(self.coefficient);
        layer.base.set_id(self.base.id());
        Ok(Box::new(layer))
    }
}

impl Layer for Mse {
    fn name(&self) -> &'static str {
        "Mse"
    }

    fn base(&self) -> &LayerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut LayerBase {
        &mut self.base
    }

    fn copy_layer(&self) -> Box<dyn Layer> {
        Box::new(Self {
            base: self.base.copy(),
            prev: self.prev,
            coefficient: self.coefficient,
            truth: None,
        })
    }

    fn as_resizable(&self) -> Option<&dyn Resizable> {
        Some(self)
    }
}
