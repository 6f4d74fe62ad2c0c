//! 2D convolution with "same" zero padding.

use crate::backend::ExecutionContext;
use crate::device::kernels::ConvGeometry;
use crate::error::{GraphError, Result};
use crate::layer::{
    Backward, EPSILON, Forward, GradientCheckable, Graph, GraphMut, Layer, LayerBase, LayerId,
    Links, Resizable, Update, write_delta,
};
use crate::model::ModelContext;
use crate::shape::Shape;
use crate::weights::LearnedParams;

/// Square-kernel convolution over a grid predecessor.
///
/// Padding is `(kernel - 1) / 2` on every border; the output plane is
/// `(h + 2·padding - kernel) / stride + 1` high, and as wide likewise.
/// Weights are indexed `[out channel][in channel][row][column]`.
#[derive(Debug)]
pub struct Convolution2D {
    base: LayerBase,
    prev: LayerId,
    geometry: ConvGeometry,
    params: LearnedParams,
}

fn geometry(prev: Shape, nb_filters: usize, kernel: usize, stride: usize) -> Result<ConvGeometry> {
    let Some((c_in, h_in, w_in)) = prev.as_grid() else {
        return Err(GraphError::Init(format!(
            "convolution needs a grid input, got {prev}"
        )));
    };
    if nb_filters == 0 || kernel == 0 || stride == 0 {
        return Err(GraphError::Init(
            "convolution filters, kernel and stride must be positive".into(),
        ));
    }
    let padding = (kernel - 1) / 2;
    let side = |len: usize| {
        (len + 2 * padding)
            .checked_sub(kernel)
            .map(|span| span / stride + 1)
            .ok_or_else(|| {
                GraphError::Init(format!("kernel {kernel} larger than padded input {len}"))
            })
    };
    Ok(ConvGeometry {
        batch: 0,
        c_in,
        h_in,
        w_in,
        c_out: nb_filters,
        h_out: side(h_in)?,
        w_out: side(w_in)?,
        kernel,
        stride,
        padding,
    })
}

impl Convolution2D {
    /// `nb_filters` output channels of `kernel × kernel` filters moved by
    /// `stride` over layer `prev` of `model`.
    pub fn new(
        model: &ModelContext,
        prev: LayerId,
        nb_filters: usize,
        kernel: usize,
        stride: usize,
    ) -> Result<Self> {
        let geometry = geometry(model.shape(prev)?, nb_filters, kernel, stride)?;
        let fan_in = geometry.c_in * kernel * kernel;
        Ok(Self {
            base: LayerBase::new(
                Links::Single(prev),
                Shape::grid(nb_filters, geometry.h_out, geometry.w_out),
            ),
            prev,
            params: LearnedParams::new(geometry.nb_weights(), nb_filters, fan_in),
            geometry,
        })
    }

    /// Geometry for batches of one element.
    pub fn geometry(&self) -> ConvGeometry {
        ConvGeometry {
            batch: 1,
            ..self.geometry
        }
    }

    /// Learned parameters.
    pub fn params(&self) -> &LearnedParams {
        &self.params
    }

    fn batched(&self) -> ConvGeometry {
        ConvGeometry {
            batch: self.base.batch_size(),
            ..self.geometry
        }
    }
}

impl Forward for Convolution2D {
    fn forward_cpu(&mut self, graph: &Graph<'_>) -> Result<()> {
        let batch = self.base.batch_size();
        self.base.check_state_cpu(batch)?;
        let geo = self.geometry;
        let prev = graph.neurons(self.prev)?;
        let weights = self.params.kernel();
        let biases = self.params.biases();
        let neurons = self.base.neurons_mut()?;

        for co in 0..geo.c_out {
            for y in 0..geo.h_out {
                for x in 0..geo.w_out {
                    let unit = neurons.get_mut((co * geo.h_out + y) * geo.w_out + x);
                    for elem in 0..batch {
                        let mut sum = biases[co];
                        for ci in 0..geo.c_in {
                            for ki in 0..geo.kernel {
                                for kj in 0..geo.kernel {
                                    if let Some((iy, ix)) = geo.input_pos(y, x, ki, kj) {
                                        sum += weights[geo.weight_index(co, ci, ki, kj)]
                                            * prev.get((ci * geo.h_in + iy) * geo.w_in + ix).v
                                                [elem]
                                                .out;
                                    }
                                }
                            }
                        }
                        unit.v[elem].out = sum;
                    }
                }
            }
        }
        Ok(())
    }

    fn forward_gpu(&mut self, graph: &Graph<'_>, ctx: &ExecutionContext) -> Result<()> {
        let batch = self.base.batch_size();
        self.base.check_state_forward_gpu(ctx, batch)?;
        let geo = self.batched();
        let mut words = geo.words().to_vec();
        words.push(ctx.precision().flag());
        let params = self.params.device(ctx)?;
        ctx.device()
            .create_command("conv_forward")
            .set_bytes(0, &words)
            .set_buffer(1, graph.base(self.prev)?.outs_buffer()?)
            .set_buffer(2, &params.weights)
            .set_buffer(3, &params.biases)
            .set_buffer(4, self.base.outs_buffer()?)
            .dispatch_threads(batch * geo.out_size())
            .enqueue()?;
        Ok(())
    }
}

impl Backward for Convolution2D {
    fn backward_cpu(&mut self, graph: &mut GraphMut<'_>) -> Result<()> {
        let batch = self.base.batch_size();
        let geo = self.geometry;
        let out_index = |co: usize, y: usize, x: usize| (co * geo.h_out + y) * geo.w_out + x;
        let in_index = |ci: usize, iy: usize, ix: usize| (ci * geo.h_in + iy) * geo.w_in + ix;
        let delta = self.base.neurons()?;

        if self.must_compute_backward(&graph.view())? {
            let weights = self.params.kernel();
            let prev = graph.base_mut(self.prev)?;
            let overwrite = prev.is_dirty();
            let prev_neurons = prev.neurons_mut()?;
            for ci in 0..geo.c_in {
                for iy in 0..geo.h_in {
                    for ix in 0..geo.w_in {
                        let unit = prev_neurons.get_mut(in_index(ci, iy, ix));
                        for elem in 0..batch {
                            let mut sum = 0.0;
                            for co in 0..geo.c_out {
                                for ki in 0..geo.kernel {
                                    for kj in 0..geo.kernel {
                                        if let Some((y, x)) = geo.output_pos(iy, ix, ki, kj) {
                                            sum += weights[geo.weight_index(co, ci, ki, kj)]
                                                * delta.get(out_index(co, y, x)).v[elem].delta;
                                        }
                                    }
                                }
                            }
                            write_delta(&mut unit.v[elem].delta, sum, overwrite);
                        }
                    }
                }
            }
            prev.mark_written();
        }

        if self.params.compute_delta_weights() {
            let overwrite = !self.params.accumulate_delta_weights();
            let prev = graph.base(self.prev)?.neurons()?;
            let (grad_w, grad_b) = self.params.grads_mut();
            for co in 0..geo.c_out {
                for ci in 0..geo.c_in {
                    for ki in 0..geo.kernel {
                        for kj in 0..geo.kernel {
                            let mut sum = 0.0;
                            for y in 0..geo.h_out {
                                for x in 0..geo.w_out {
                                    let Some((iy, ix)) = geo.input_pos(y, x, ki, kj) else {
                                        continue;
                                    };
                                    let g = delta.get(out_index(co, y, x));
                                    let p = prev.get(in_index(ci, iy, ix));
                                    sum += (0..batch)
                                        .map(|elem| g.v[elem].delta * p.v[elem].out)
                                        .sum::<f64>();
                                }
                            }
                            write_delta(&mut grad_w[geo.weight_index(co, ci, ki, kj)], sum, overwrite);
                        }
                    }
                }
                let mut sum = 0.0;
                for y in 0..geo.h_out {
                    for x in 0..geo.w_out {
                        let g = delta.get(out_index(co, y, x));
                        sum += (0..batch).map(|elem| g.v[elem].delta).sum::<f64>();
                    }
                }
                write_delta(&mut grad_b[co], sum, overwrite);
            }
        }
        Ok(())
    }

    fn backward_gpu(&mut self, graph: &mut GraphMut<'_>, ctx: &ExecutionContext) -> Result<()> {
        let batch = self.base.batch_size();
        let geo = self.batched();
        let precision = ctx.precision().flag();

        if self.must_compute_backward(&graph.view())? {
            let prev = graph.base_mut(self.prev)?;
            prev.check_state_backward_gpu(ctx, batch)?;
            let mut words = geo.words().to_vec();
            words.extend([u32::from(!prev.is_dirty()), precision]);
            let params = self.params.device(ctx)?;
            ctx.device()
                .create_command("conv_backward")
                .set_bytes(0, &words)
                .set_buffer(1, self.base.delta_buffer()?)
                .set_buffer(2, &params.weights)
                .set_buffer(3, prev.delta_buffer()?)
                .dispatch_threads(batch * geo.in_size())
                .enqueue()?;
            prev.mark_written();
        }

        if self.params.compute_delta_weights() {
            let mut words = geo.words().to_vec();
            words.extend([u32::from(self.params.accumulate_delta_weights()), precision]);
            let prev = graph.base(self.prev)?.outs_buffer()?;
            let params = self.params.device(ctx)?;
            ctx.device()
                .create_command("conv_weights")
                .set_bytes(0, &words)
                .set_buffer(1, self.base.delta_buffer()?)
                .set_buffer(2, prev)
                .set_buffer(3, &params.weight_grads)
                .set_buffer(4, &params.bias_grads)
                .dispatch_threads(geo.nb_weights())
                .enqueue()?;
        }
        Ok(())
    }
}

impl GradientCheckable for Convolution2D {
    fn forward_gc_cpu(&mut self, graph: &Graph<'_>) -> Result<()> {
        let batch = self.base.batch_size();
        self.base.check_state_cpu(batch)?;
        let geo = self.geometry;
        let prev = graph.neurons(self.prev)?;
        let nb_prev_gc = prev.nb_gc();
        let nb_weights = geo.nb_weights();
        let weights = self.params.kernel();
        let biases = self.params.biases();
        let in_index = |ci: usize, iy: usize, ix: usize| (ci * geo.h_in + iy) * geo.w_in + ix;
        let neurons = self.base.neurons_mut()?;
        neurons.init_gc(batch, nb_prev_gc + 2 * (nb_weights + geo.c_out));

        for co in 0..geo.c_out {
            for y in 0..geo.h_out {
                for x in 0..geo.w_out {
                    let unit = neurons.get_mut((co * geo.h_out + y) * geo.w_out + x);
                    for elem in 0..batch {
                        let out = unit.v[elem].out;
                        let gc = &mut unit.gc[elem];

                        for (col, value) in gc.iter_mut().enumerate().take(nb_prev_gc) {
                            let mut sum = biases[co];
                            for ci in 0..geo.c_in {
                                for ki in 0..geo.kernel {
                                    for kj in 0..geo.kernel {
                                        if let Some((iy, ix)) = geo.input_pos(y, x, ki, kj) {
                                            sum += weights[geo.weight_index(co, ci, ki, kj)]
                                                * prev.get(in_index(ci, iy, ix)).gc[elem][col];
                                        }
                                    }
                                }
                            }
                            *value = sum;
                        }

                        gc[nb_prev_gc..].fill(out);
                        // only the filters of channel `co` see this output
                        for ci in 0..geo.c_in {
                            for ki in 0..geo.kernel {
                                for kj in 0..geo.kernel {
                                    let Some((iy, ix)) = geo.input_pos(y, x, ki, kj) else {
                                        continue;
                                    };
                                    let shift =
                                        EPSILON * prev.get(in_index(ci, iy, ix)).v[elem].out;
                                    let col = nb_prev_gc + 2 * geo.weight_index(co, ci, ki, kj);
                                    gc[col] = out + shift;
                                    gc[col + 1] = out - shift;
                                }
                            }
                        }
                        let col = nb_prev_gc + 2 * (nb_weights + co);
                        gc[col] = out + EPSILON;
                        gc[col + 1] = out - EPSILON;
                    }
                }
            }
        }
        Ok(())
    }
}

impl Resizable for Convolution2D {
    fn resize(&self, ctx: &ModelContext, _height: usize, _width: usize) -> Result<Box<dyn Layer>> {
        let geo = self.geometry;
        let mut layer = Self::new(ctx, self.prev, geo.c_out, geo.kernel, geo.stride)?;
        if layer.geometry.c_in != geo.c_in {
            return Err(GraphError::Init(format!(
                "convolution {} expects {} input channels, got {}",
                self.base.id(),
                geo.c_in,
                layer.geometry.c_in
            )));
        }
        layer.params = self.params.copy();
        layer.base.set_id(self.base.id());
        Ok(Box::new(layer))
    }
}

impl Layer for Convolution2D {
    fn name(&self) -> &'static str {
        "Convolution2D"
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
            geometry: self.geometry,
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

    fn stride_factor(&self, graph: &Graph<'_>) -> Result<f64> {
        let prev = graph.get(self.prev)?.stride_factor(graph)?;
        Ok(prev * self.geometry.stride as f64)
    }

    fn receptive_field(&self, graph: &Graph<'_>) -> Result<usize> {
        let layer = graph.get(self.prev)?;
        let field = layer.receptive_field(graph)?;
        let factor = layer.stride_factor(graph)?;
        Ok(field + (self.geometry.kernel - 1) * factor as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_padding_geometry() {
        let geo = geometry(Shape::grid(2, 5, 4), 3, 3, 2).unwrap();
        assert_eq!((geo.padding, geo.h_out, geo.w_out), (1, 3, 2));
        let geo = geometry(Shape::grid(1, 4, 4), 1, 3, 1).unwrap();
        assert_eq!((geo.h_out, geo.w_out), (4, 4));
        assert!(geometry(Shape::flat(4), 1, 3, 1).is_err());
        assert!(geometry(Shape::grid(1, 1, 1), 1, 4, 1).is_err());
    }
}
