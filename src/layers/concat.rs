//! Concatenation of several branches.

use crate::backend::ExecutionContext;
use crate::error::{GraphError, Result};
use crate::layer::merge::merged_graph;
use crate::layer::{
    Backward, Forward, GradientCheckable, Graph, GraphMut, Layer, LayerBase, LayerId, Links,
    Resizable, write_delta,
};
use crate::model::ModelContext;
use crate::shape::Shape;

/// Places the outputs of its predecessors one after the other.
///
/// Flat outputs of any size are joined, grids of the same plane size are
/// stacked along channels, and sequences with the same features are joined
/// along the sequence.
#[derive(Debug)]
pub struct Concat {
    base: LayerBase,
    layers_prev: Vec<LayerId>,
    offsets: Vec<usize>,
}

fn concat_shape(shapes: &[Shape]) -> Result<Shape> {
    let mismatch = |a: Shape, b: Shape| {
        GraphError::Init(format!("cannot concatenate {a} and {b}"))
    };
    let Some((&first, rest)) = shapes.split_first() else {
        return Err(GraphError::Init(
            "concatenation needs at least one predecessor".into(),
        ));
    };
    rest.iter().try_fold(first, |acc, &shape| match (acc, shape) {
        (Shape::Flat { nb_neurons: a }, Shape::Flat { nb_neurons: b }) => Ok(Shape::flat(a + b)),
        (
            Shape::Grid {
                nb_channels: a,
                height,
                width,
            },
            Shape::Grid {
                nb_channels: b,
                height: h,
                width: w,
            },
        ) if (height, width) == (h, w) => Ok(Shape::grid(a + b, height, width)),
        (
            Shape::Seq {
                sequence: a,
                nb_neurons,
            },
            Shape::Seq {
                sequence: b,
                nb_neurons: n,
            },
        ) if nb_neurons == n => Ok(Shape::seq(a + b, nb_neurons)),
        (a, b) => Err(mismatch(a, b)),
    })
}

impl Concat {
    /// Concatenation of `layers_prev` of `model`, in order.
    pub fn new(model: &ModelContext, layers_prev: &[LayerId]) -> Result<Self> {
        let shapes = layers_prev
            .iter()
            .map(|&id| model.shape(id))
            .collect::<Result<Vec<_>>>()?;
        let shape = concat_shape(&shapes)?;
        let offsets = shapes
            .iter()
            .scan(0, |offset, shape| {
                let start = *offset;
                *offset += shape.size();
                Some(start)
            })
            .collect();
        Ok(Self {
            base: LayerBase::new(Links::Merge(layers_prev.to_vec()), shape),
            layers_prev: layers_prev.to_vec(),
            offsets,
        })
    }

    /// Predecessors, in order.
    pub fn layers_prev(&self) -> &[LayerId] {
        &self.layers_prev
    }

    /// First output unit of each predecessor.
    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }
}

impl Forward for Concat {
    fn forward_cpu(&mut self, graph: &Graph<'_>) -> Result<()> {
        let batch = self.base.batch_size();
        self.base.check_state_cpu(batch)?;
        let neurons = self.base.neurons_mut()?;
        for (&id, &offset) in self.layers_prev.iter().zip(&self.offsets) {
            let prev = graph.neurons(id)?;
            for (unit, src) in neurons.units_mut()[offset..].iter_mut().zip(prev.units()) {
                for elem in 0..batch {
                    unit.v[elem].out = src.v[elem].out;
                }
            }
        }
        Ok(())
    }

    fn forward_gpu(&mut self, graph: &Graph<'_>, ctx: &ExecutionContext) -> Result<()> {
        let batch = self.base.batch_size();
        self.base.check_state_forward_gpu(ctx, batch)?;
        let size_out = self.base.size() as u32;
        for (&id, &offset) in self.layers_prev.iter().zip(&self.offsets) {
            let prev = graph.base(id)?;
            ctx.device()
                .create_command("concat_forward")
                .set_bytes(
                    0,
                    &[
                        batch as u32,
                        prev.size() as u32,
                        size_out,
                        offset as u32,
                        ctx.precision().flag(),
                    ],
                )
                .set_buffer(1, prev.outs_buffer()?)
                .set_buffer(2, self.base.outs_buffer()?)
                .dispatch_threads(batch * prev.size())
                .enqueue()?;
        }
        Ok(())
    }
}

impl Backward for Concat {
    fn backward_cpu(&mut self, graph: &mut GraphMut<'_>) -> Result<()> {
        let batch = self.base.batch_size();
        let delta = self.base.neurons()?;
        for (&id, &offset) in self.layers_prev.iter().zip(&self.offsets) {
            let prev = graph.base_mut(id)?;
            if !prev.compute_delta() {
                continue;
            }
            let overwrite = prev.is_dirty();
            let sources = &delta.units()[offset..];
            for (unit, src) in prev.neurons_mut()?.units_mut().iter_mut().zip(sources) {
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
        let size_out = self.base.size() as u32;
        for (&id, &offset) in self.layers_prev.iter().zip(&self.offsets) {
            let prev = graph.base_mut(id)?;
            if !prev.compute_delta() {
                continue;
            }
            prev.check_state_backward_gpu(ctx, batch)?;
            let size_in = prev.size();
            ctx.device()
                .create_command("concat_backward")
                .set_bytes(
                    0,
                    &[
                        batch as u32,
                        size_in as u32,
                        size_out,
                        offset as u32,
                        u32::from(!prev.is_dirty()),
                        ctx.precision().flag(),
                    ],
                )
                .set_buffer(1, self.base.delta_buffer()?)
                .set_buffer(2, prev.delta_buffer()?)
                .dispatch_threads(batch * size_in)
                .enqueue()?;
            prev.mark_written();
        }
        Ok(())
    }
}

impl GradientCheckable for Concat {
    fn forward_gc_cpu(&mut self, graph: &Graph<'_>) -> Result<()> {
        let batch = self.base.batch_size();
        self.base.check_state_cpu(batch)?;
        let merged = merged_graph(graph, &self.layers_prev)?;
        let columns = merged.columns();
        let neurons = self.base.neurons_mut()?;
        neurons.init_gc(batch, columns.len());

        for (num, (&id, &offset)) in self.layers_prev.iter().zip(&self.offsets).enumerate() {
            let prev = graph.neurons(id)?;
            for (unit, src) in neurons.units_mut()[offset..].iter_mut().zip(prev.units()) {
                for (elem, gc) in unit.gc.iter_mut().enumerate() {
                    for (value, column) in gc.iter_mut().zip(columns) {
                        *value = match column.source(num) {
                            Some(col) => src.gc[elem][col],
                            None => src.v[elem].out,
                        };
                    }
                }
            }
        }
        Ok(())
    }
}

impl Resizable for Concat {
    fn resize(&self, ctx: &ModelContext, _height: usize, _width: usize) -> Result<Box<dyn Layer>> {
        let mut layer = Self::new(ctx, &self.layers_prev)?;
        layer.base.set_id(self.base.id());
        Ok(Box::new(layer))
    }
}

impl Layer for Concat {
    fn name(&self) -> &'static str {
        "Concat"
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
            offsets: self.offsets.clone(),
        })
    }

    fn as_resizable(&self) -> Option<&dyn Resizable> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shapes_join_along_their_leading_axis() {
        assert_eq!(
            concat_shape(&[Shape::flat(2), Shape::flat(3)]),
            Ok(Shape::flat(5))
        );
        assert_eq!(
            concat_shape(&[Shape::grid(1, 4, 4), Shape::grid(2, 4, 4)]),
            Ok(Shape::grid(3, 4, 4))
        );
        assert_eq!(
            concat_shape(&[Shape::seq(2, 8), Shape::seq(5, 8)]),
            Ok(Shape::seq(7, 8))
        );
        assert!(concat_shape(&[Shape::grid(1, 4, 4), Shape::grid(1, 2, 4)]).is_err());
        assert!(concat_shape(&[Shape::flat(16), Shape::grid(1, 4, 4)]).is_err());
        assert!(concat_shape(&[]).is_err());
    }
}
