//! Element-wise sum of several branches.

use crate::backend::ExecutionContext;
use crate::error::{GraphError, Result};
use crate::layer::merge::merged_graph;
use crate::layer::{
    Backward, Forward, GradientCheckable, Graph, GraphMut, Layer, LayerBase, LayerId, Links,
    Resizable, write_delta,
};
use crate::model::ModelContext;
use crate::state::Neurons;

/// `out = Σ_b prev_b`, over predecessors of identical shape.
#[derive(Debug)]
pub struct Sum {
    base: LayerBase,
    layers_prev: Vec<LayerId>,
}

impl Sum {
    /// Sum of `layers_prev` of `model`, in order.
    pub fn new(model: &ModelContext, layers_prev: &[LayerId]) -> Result<Self> {
        let Some((&first, rest)) = layers_prev.split_first() else {
            return Err(GraphError::Init("sum needs at least one predecessor".into()));
        };
        let shape = model.shape(first)?;
        for &id in rest {
            let other = model.shape(id)?;
            if other != shape {
                return Err(GraphError::Init(format!(
                    "sum of layers with different shapes: {shape} and {other}"
                )));
            }
        }
        Ok(Self {
            base: LayerBase::new(Links::Merge(layers_prev.to_vec()), shape),
            layers_prev: layers_prev.to_vec(),
        })
    }

    /// Predecessors, in order.
    pub fn layers_prev(&self) -> &[LayerId] {
        &self.layers_prev
    }

    fn branches<'a>(&self, graph: &Graph<'a>) -> Result<Vec<&'a Neurons>> {
        self.layers_prev.iter().map(|&id| graph.neurons(id)).collect()
    }
}

impl Forward for Sum {
    fn forward_cpu(&mut self, graph: &Graph<'_>) -> Result<()> {
        let batch = self.base.batch_size();
        self.base.check_state_cpu(batch)?;
        let branches = self.branches(graph)?;
        let neurons = self.base.neurons_mut()?;
        for (index, unit) in neurons.units_mut().iter_mut().enumerate() {
            for elem in 0..batch {
                unit.v[elem].out = branches.iter().map(|b| b.get(index).v[elem].out).sum();
            }
        }
        Ok(())
    }

    fn forward_gpu(&mut self, graph: &Graph<'_>, ctx: &ExecutionContext) -> Result<()> {
        let batch = self.base.batch_size();
        self.base.check_state_forward_gpu(ctx, batch)?;
        let n = batch * self.base.size();
        let precision = ctx.precision().flag();
        for (num, &id) in self.layers_prev.iter().enumerate() {
            let kernel = if num == 0 { "copy" } else { "add" };
            ctx.device()
                .create_command(kernel)
                .set_bytes(0, &[n as u32, precision])
                .set_buffer(1, graph.base(id)?.outs_buffer()?)
                .set_buffer(2, self.base.outs_buffer()?)
                .dispatch_threads(n)
                .enqueue()?;
        }
        Ok(())
    }
}

impl Backward for Sum {
    fn backward_cpu(&mut self, graph: &mut GraphMut<'_>) -> Result<()> {
        let batch = self.base.batch_size();
        let delta = self.base.neurons()?;
        for &id in &self.layers_prev {
            let prev = graph.base_mut(id)?;
            if !prev.compute_delta() {
                continue;
            }
            let overwrite = prev.is_dirty();
            for (unit, src) in prev.neurons_mut()?.units_mut().iter_mut().zip(delta.units()) {
                for elem in 0..batch {
                    write_delta(&mut unit.v[elem].delta, src.v[elem].delta, overwrite);
                }
            }
            prev.mark_written();
        }
        Ok(())
    }

    fn backward_gpu(&mut self, graph: &mut GraphMut<'_>, ctx: &ExecutionContext) -> Result<()> {
        let batch = self.base.batch_size();
        let n = batch * self.base.size();
        for &id in &self.layers_prev {
            let prev = graph.base_mut(id)?;
            if !prev.compute_delta() {
                continue;
            }
            prev.check_state_backward_gpu(ctx, batch)?;
            let kernel = if prev.is_dirty() { "copy" } else { "add" };
            ctx.device()
                .create_command(kernel)
                .set_bytes(0, &[n as u32, ctx.precision().flag()])
                .set_buffer(1, self.base.delta_buffer()?)
                .set_buffer(2, prev.delta_buffer()?)
                .dispatch_threads(n)
                .enqueue()?;
            prev.mark_written();
        }
        Ok(())
    }
}

impl GradientCheckable for Sum {
    fn forward_gc_cpu(&mut self, graph: &Graph<'_>) -> Result<()> {
        let batch = self.base.batch_size();
        self.base.check_state_cpu(batch)?;
        let merged = merged_graph(graph, &self.layers_prev)?;
        let columns = merged.columns();
        let branches = self.branches(graph)?;
        let neurons = self.base.neurons_mut()?;
        neurons.init_gc(batch, columns.len());

        for (index, unit) in neurons.units_mut().iter_mut().enumerate() {
            for (elem, gc) in unit.gc.iter_mut().enumerate() {
                for (value, column) in gc.iter_mut().zip(columns) {
                    *value = branches
                        .iter()
                        .enumerate()
                        .map(|(num, b)| {
                            let src = b.get(index);
                            match column.source(num) {
                                Some(col) => src.gc[elem][col],
                                None => src.v[elem].out,
                            }
                        })
                        .sum();
                }
            }
        }
        Ok(())
    }
}

impl Resizable for Sum {
    fn resize(&self, ctx: &ModelContext, _height: usize, _width: usize) -> Result<Box<dyn Layer>> {
        let mut layer = Self::new(ctx, &self.layers_prev)?;
        layer.base.set_id(self.base.id());
        Ok(Box::new(layer))
    }
}

impl Layer for Sum {
    fn name(&self) -> &'static str {
        "Sum"
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
            layers_prev: self.layers_prev.clone(),
        })
    }

    fn as_resizable(&self) -> Option<&dyn Resizable> {
        Some(self)
    }
}
