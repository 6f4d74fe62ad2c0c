//! Fully connected layer.

use crate::backend::ExecutionContext;
use crate::error::{GraphError, Result};
use crate::layer::{
    Backward, EPSILON, Forward, GradientCheckable, Graph, GraphMut, Layer, LayerBase, LayerId,
    Links, Resizable, Update, write_delta,
};
use crate::model::ModelContext;
use crate::shape::Shape;
use crate::weights::LearnedParams;

/// `out[j] = b[j] + Σ_i w[j][i] · in[i]` over the flattened predecessor.
///
/// Weights are stored row-major (`nb_neurons × nb_in`), in probe order.
#[derive(Debug)]
pub struct FullyConnected {
    base: LayerBase,
    prev: LayerId,
    nb_in: usize,
    params: LearnedParams,
}

impl FullyConnected {
    /// `nb_neurons` outputs fed by layer `prev` of `model`.
    pub fn new(model: &ModelContext, prev: LayerId, nb_neurons: usize) -> Result<Self> {
        if nb_neurons == 0 {
            return Err(GraphError::Init(
                "fully connected layer needs at least one neuron".into(),
            ));
        }
        let nb_in = model.shape(prev)?.size();
        Ok(Self {
            base: LayerBase::new(Links::Single(prev), Shape::flat(nb_neurons)),
            prev,
            nb_in,
            params: LearnedParams::new(nb_neurons * nb_in, nb_neurons, nb_in),
        })
    }

    /// Inputs per neuron.
    pub fn nb_in(&self) -> usize {
        self.nb_in
    }

    /// Learned parameters.
    pub fn params(&self) -> &LearnedParams {
        &self.params
    }

    fn dims(&self, batch: usize) -> [u32; 3] {
        [batch as u32, self.base.size() as u32, self.nb_in as u32]
    }
}

impl Forward for FullyConnected {
    fn forward_cpu(&mut self, graph: &Graph<'_>) -> Result<()> {
        let batch = self.base.batch_size();
        self.base.check_state_cpu(batch)?;
        let prev = graph.neurons(self.prev)?;
        let (nb_in, nb_out) = (self.nb_in, self.base.size());
        let weights = self.params.kernel();
        let biases = self.params.biases();
        let neurons = self.base.neurons_mut()?;

        for elem in 0..batch {
            for j in 0..nb_out {
                let mut sum = biases[j];
                for i in 0..nb_in {
                    sum += weights[j * nb_in + i] * prev.get(i).v[elem].out;
                }
                neurons.get_mut(j).v[elem].out = sum;
            }
        }
        Ok(())
    }

    fn forward_gpu(&mut self, graph: &Graph<'_>, ctx: &ExecutionContext) -> Result<()> {
        let batch = self.base.batch_size();
        self.base.check_state_forward_gpu(ctx, batch)?;
        let [b, nb_out, nb_in] = self.dims(batch);
        let prev = graph.base(self.prev)?.outs_buffer()?;
        let params = self.params.device(ctx)?;
        ctx.device()
            .create_command("linear_forward")
            .set_bytes(0, &[b, nb_out, nb_in, ctx.precision().flag()])
            .set_buffer(1, prev)
            .set_buffer(2, &params.weights)
            .set_buffer(3, &params.biases)
            .set_buffer(4, self.base.outs_buffer()?)
            .dispatch_threads(batch * self.base.size())
            .enqueue()?;
        Ok(())
    }
}

impl Backward for FullyConnected {
    fn backward_cpu(&mut self, graph: &mut GraphMut<'_>) -> Result<()> {
        let batch = self.base.batch_size();
        let (nb_in, nb_out) = (self.nb_in, self.base.size());
        let delta = self.base.neurons()?;

        if self.must_compute_backward(&graph.view())? {
            let weights = self.params.kernel();
            let prev = graph.base_mut(self.prev)?;
            let overwrite = prev.is_dirty();
            let prev_neurons = prev.neurons_mut()?;
            for elem in 0..batch {
                for i in 0..nb_in {
                    let sum: f64 = (0..nb_out)
                        .map(|j| weights[j * nb_in + i] * delta.get(j).v[elem].delta)
                        .sum();
                    write_delta(&mut prev_neurons.get_mut(i).v[elem].delta, sum, overwrite);
                }
            }
            prev.mark_written();
        }

        if self.params.compute_delta_weights() {
            let overwrite = !self.params.accumulate_delta_weights();
            let prev = graph.base(self.prev)?.neurons()?;
            let (grad_w, grad_b) = self.params.grads_mut();
            for j in 0..nb_out {
                for i in 0..nb_in {
                    let sum: f64 = (0..batch)
                        .map(|elem| delta.get(j).v[elem].delta * prev.get(i).v[elem].out)
                        .sum();
                    write_delta(&mut grad_w[j * nb_in + i], sum, overwrite);
                }
                let sum: f64 = (0..batch).map(|elem| delta.get(j).v[elem].delta).sum();
                write_delta(&mut grad_b[j], sum, overwrite);
            }
        }
        Ok(())
    }

    fn backward_gpu(&mut self, graph: &mut GraphMut<'_>, ctx: &ExecutionContext) -> Result<()> {
        let batch = self.base.batch_size();
        let [b, nb_out, nb_in] = self.dims(batch);
        let precision = ctx.precision().flag();

        if self.must_compute_backward(&graph.view())? {
            let prev = graph.base_mut(self.prev)?;
            prev.check_state_backward_gpu(ctx, batch)?;
            let accumulate = u32::from(!prev.is_dirty());
            let params = self.params.device(ctx)?;
            ctx.device()
                .create_command("linear_backward")
                .set_bytes(0, &[b, nb_out, nb_in, accumulate, precision])
                .set_buffer(1, self.base.delta_buffer()?)
                .set_buffer(2, &params.weights)
                .set_buffer(3, prev.delta_buffer()?)
                .dispatch_threads(batch * self.nb_in)
                .enqueue()?;
            prev.mark_written();
        }

        if self.params.compute_delta_weights() {
            let accumulate = u32::from(self.params.accumulate_delta_weights());
            let prev = graph.base(self.prev)?.outs_buffer()?;
            let params = self.params.device(ctx)?;
            ctx.device()
                .create_command("linear_weights")
                .set_bytes(0, &[b, nb_out, nb_in, accumulate, precision])
                .set_buffer(1, self.base.delta_buffer()?)
                .set_buffer(2, prev)
                .set_buffer(3, &params.weight_grads)
                .set_buffer(4, &params.bias_grads)
                .dispatch_threads(self.base.size() * self.nb_in)
                .enqueue()?;
        }
        Ok(())
    }
}

impl GradientCheckable for FullyConnected {
    fn forward_gc_cpu(&mut self, graph: &Graph<'_>) -> Result<()> {
        let batch = self.base.batch_size();
        self.base.check_state_cpu(batch)?;
        let prev = graph.neurons(self.prev)?;
        let nb_prev_gc = prev.nb_gc();
        let (nb_in, nb_out) = (self.nb_in, self.base.size());
        let nb_weights = nb_out * nb_in;
        let weights = self.params.kernel();
        let biases = self.params.biases();
        let neurons = self.base.neurons_mut()?;
        neurons.init_gc(batch, nb_prev_gc + 2 * (nb_weights + nb_out));

        for elem in 0..batch {
            for j in 0..nb_out {
                let unit = neurons.get_mut(j);
                let out = unit.v[elem].out;
                let gc = &mut unit.gc[elem];

                for (col, value) in gc.iter_mut().enumerate().take(nb_prev_gc) {
                    let mut sum = biases[j];
                    for i in 0..nb_in {
                        sum += weights[j * nb_in + i] * prev.get(i).gc[elem][col];
                    }
                    *value = sum;
                }
                // weights (J, I) perturb output J only
                for jj in 0..nb_out {
                    for i in 0..nb_in {
                        let col = nb_prev_gc + 2 * (jj * nb_in + i);
                        let shift = if jj == j {
                            EPSILON * prev.get(i).v[elem].out
                        } else {
                            0.0
                        };
                        gc[col] = out + shift;
                        gc[col + 1] = out - shift;
                    }
                }
                for jj in 0..nb_out {
                    let col = nb_prev_gc + 2 * (nb_weights + jj);
                    let shift = if jj == j { EPSILON } else { 0.0 };
                    gc[col] = out + shift;
                    gc[col + 1] = out - shift;
                }
            }
        }
        Ok(())
    }
}

impl Resizable for FullyConnected {
    fn resize(&self, ctx: &ModelContext, _height: usize, _width: usize) -> Result<Box<dyn Layer>> {
        let mut layer = Self::new(ctx, self.prev, self.base.size())?;
        if layer.nb_in != self.nb_in {
            return Err(GraphError::Init(format!(
                "fully connected layer {} expects {} inputs, got {} after resize",
                self.base.id(),
                self.nb_in,
                layer.nb_in
            )));
        }
        layer.params = self.params.copy();
        layer.base = self.base.copy();
        Ok(Box::new(layer))
    }
}

impl Layer for FullyConnected {
    fn name(&self) -> &'static str {
        "FullyConnected"
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
            nb_in: self.nb_in,
            params: self.params.copy(),
        })
    }

    fn as_update(&self) -> Option<&dyn Update> {
        Some(&self.params)
    }

    fn as_update_mut(&mut self) -> Option<&mut dyn Update> {
        Some(&mut self.params)
    }

    fn as_resizable(&self) -> Option<&dyn Resizable> {
        Some(self)
    }
}
