//! Layer abstraction.
//!
//! A layer is one node of the computation graph. Its behaviour is split in
//! capability traits instead of a deep class chain:
//!
//! - [`Forward`] — compute the output from the predecessors' outputs.
//! - [`Backward`] — write the predecessors' gradients, under the dirty
//!   protocol described below.
//! - [`GradientCheckable`] — compute one extra forward value per
//!   gradient-checking probe.
//! - [`Update`] — layers owning learned weights.
//! - [`Resizable`] — layers that can be rebuilt for a new input resolution.
//!
//! Every operation exists twice: on the per-element [`Neurons`] array
//! (`*_cpu`, `f64`) and on flat device buffers (`*_gpu`, `f32`).
//!
//! # Dirty protocol
//!
//! At the start of a step every layer is dirty. During backward the first
//! layer writing into a predecessor's gradient overwrites it, the following
//! ones accumulate into it; the predecessor is marked clean right after the
//! write. A gradient is only readable once the layer is clean.
//!
//! # Graph views
//!
//! Layers never own their predecessors: they hold ids ([`Links`]) and
//! resolve them through a [`Graph`] (read-only view of the layers created
//! before them) or a [`GraphMut`] during backward.

mod base;
pub mod merge;

pub use base::{LayerBase, StepState, write_delta};

use crate::backend::ExecutionContext;
use crate::error::{GraphError, Result};
use crate::model::ModelContext;
use crate::state::Neurons;
use rand::rngs::StdRng;
use std::any::Any;
use std::collections::HashMap;

/// Unique, monotonically increasing identifier of a layer.
pub type LayerId = usize;

/// Perturbation applied to each learned scalar by gradient checking.
pub const EPSILON: f64 = 1e-6;

/// Predecessor links of a layer, persisted as ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Links {
    /// Graph input.
    None,
    /// One predecessor.
    Single(LayerId),
    /// Ordered predecessors of a merge layer.
    Merge(Vec<LayerId>),
}

impl Links {
    /// Every predecessor id, in order.
    pub fn ids(&self) -> &[LayerId] {
        match self {
            Self::None => &[],
            Self::Single(id) => core::slice::from_ref(id),
            Self::Merge(ids) => ids,
        }
    }

    /// Predecessor followed when walking a chain backward.
    pub fn first(&self) -> Option<LayerId> {
        self.ids().first().copied()
    }
}

/// What the model is initialized for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    /// Weight gradients are computed.
    #[default]
    Training,
    /// Weight gradients are disabled.
    Inference,
}

/// Forward pass.
pub trait Forward {
    /// Computes the output on the CPU state.
    fn forward_cpu(&mut self, graph: &Graph<'_>) -> Result<()>;

    /// Computes the output on device buffers.
    fn forward_gpu(&mut self, graph: &Graph<'_>, ctx: &ExecutionContext) -> Result<()>;
}

/// Backward pass.
pub trait Backward {
    /// Writes the predecessors' gradients on the CPU state.
    fn backward_cpu(&mut self, graph: &mut GraphMut<'_>) -> Result<()>;

    /// Writes the predecessors' gradients on device buffers.
    fn backward_gpu(&mut self, graph: &mut GraphMut<'_>, ctx: &ExecutionContext) -> Result<()>;
}

/// Gradient checking.
pub trait GradientCheckable {
    /// Computes one forward value per probe, after the real forward ran.
    ///
    /// A weighted layer appends two probes per learned scalar (`+ε`, then
    /// `−ε`) after the probes of its predecessor.
    fn forward_gc_cpu(&mut self, graph: &Graph<'_>) -> Result<()>;
}

/// Layers owning learned weights.
///
/// Weights are exposed in probe order: kernel weights first, then biases.
pub trait Update {
    /// Number of learned scalars.
    fn nb_learned(&self) -> usize;

    /// Whether backward computes the weight gradients.
    fn compute_delta_weights(&self) -> bool;

    /// Enables or disables weight gradients.
    fn set_compute_delta_weights(&mut self, value: bool);

    /// Whether weight gradients are summed across steps until `update`.
    fn accumulate_delta_weights(&self) -> bool;

    /// Enables or disables gradient accumulation.
    fn set_accumulate_delta_weights(&mut self, value: bool);

    /// Draws initial weights, unless weights were set explicitly.
    fn init_weights(&mut self, rng: &mut StdRng);

    /// Host copy of the weights.
    fn weights(&self) -> Vec<f64>;

    /// Replaces the weights. Device copies are re-uploaded on next use.
    fn set_weights(&mut self, weights: &[f64]) -> Result<()>;

    /// Host copy of the weight gradients.
    fn gradients(&self) -> Vec<f64>;

    /// Uploads the weights to the device and zeroes the device gradients.
    fn init_weights_gpu(&mut self, ctx: &ExecutionContext) -> Result<()>;

    /// Downloads device weights and gradients into the host copies.
    fn pull_weights_gpu(&mut self) -> Result<()>;

    /// SGD step on the host copies, gradients reset to zero.
    fn update_cpu(&mut self, learning_rate: f64);

    /// SGD step on the device, gradients reset to zero.
    fn update_gpu(&mut self, ctx: &ExecutionContext, learning_rate: f64) -> Result<()>;
}

/// Layers that can be rebuilt for a new input resolution.
pub trait Resizable {
    /// Creates the same layer, with the same id and weights, wired into
    /// `ctx` whose earlier layers are already resized.
    fn resize(&self, ctx: &ModelContext, height: usize, width: usize) -> Result<Box<dyn Layer>>;
}

/// A node of the computation graph.
pub trait Layer: Forward + Backward + GradientCheckable + Any {
    /// Kind of layer, for logs.
    fn name(&self) -> &'static str;

    /// Shared state.
    fn base(&self) -> &LayerBase;

    /// Shared state, mutably.
    fn base_mut(&mut self) -> &mut LayerBase;

    /// Fresh layer with the same configuration, links and weights.
    fn copy_layer(&self) -> Box<dyn Layer>;

    /// Weight capability.
    fn as_update(&self) -> Option<&dyn Update> {
        None
    }

    /// Weight capability, mutably.
    fn as_update_mut(&mut self) -> Option<&mut dyn Update> {
        None
    }

    /// Resize capability.
    fn as_resizable(&self) -> Option<&dyn Resizable> {
        None
    }

    /// Identifier.
    fn id(&self) -> LayerId {
        self.base().id()
    }

    /// Number of gradient-checking probes computed by the last `forward_gc`.
    fn nb_gc(&self) -> usize {
        self.base().nb_gc()
    }

    /// Probes this layer appends to the ones of its predecessors: two per
    /// learned parameter.
    fn nb_probes(&self) -> usize {
        self.as_update().map_or(0, |params| 2 * params.nb_learned())
    }

    /// Down-sampling factor between the graph input and this output.
    fn stride_factor(&self, graph: &Graph<'_>) -> Result<f64> {
        match self.base().links() {
            Links::None => Ok(1.0),
            Links::Single(prev) => graph.get(*prev)?.stride_factor(graph),
            Links::Merge(ids) => merge::stride_factor(graph, ids),
        }
    }

    /// Side of the input window seen by one output.
    fn receptive_field(&self, graph: &Graph<'_>) -> Result<usize> {
        match self.base().links() {
            Links::None => Ok(1),
            Links::Single(prev) => graph.get(*prev)?.receptive_field(graph),
            Links::Merge(ids) => merge::receptive_field(graph, ids),
        }
    }

    /// Whether at least one predecessor needs a gradient.
    fn must_compute_backward(&self, graph: &Graph<'_>) -> Result<bool> {
        for &id in self.base().links().ids() {
            if graph.base(id)?.compute_delta() {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Read-only view over layers, resolving ids.
#[derive(Clone, Copy)]
pub struct Graph<'a> {
    layers: &'a [Box<dyn Layer>],
    index: &'a HashMap<LayerId, usize>,
}

impl<'a> Graph<'a> {
    /// View over `layers`, `index` mapping ids to positions.
    pub fn new(layers: &'a [Box<dyn Layer>], index: &'a HashMap<LayerId, usize>) -> Self {
        Self { layers, index }
    }

    /// Layer `id`.
    pub fn get(&self, id: LayerId) -> Result<&'a dyn Layer> {
        let pos = *self.index.get(&id).ok_or(GraphError::UnknownLayer(id))?;
        self.layers
            .get(pos)
            .map(|layer| layer.as_ref())
            .ok_or(GraphError::UnknownLayer(id))
    }

    /// Shared state of layer `id`.
    pub fn base(&self, id: LayerId) -> Result<&'a LayerBase> {
        Ok(self.get(id)?.base())
    }

    /// CPU state of layer `id`.
    pub fn neurons(&self, id: LayerId) -> Result<&'a Neurons> {
        self.base(id)?.neurons()
    }

    /// Concrete type of layer `id`.
    pub fn downcast<T: Layer>(&self, id: LayerId) -> Result<&'a T> {
        let layer: &'a dyn Any = self.get(id)?;
        layer
            .downcast_ref::<T>()
            .ok_or_else(|| GraphError::Init(format!("layer {id} is not a {}", core::any::type_name::<T>())))
    }
}

/// Mutable view over the layers preceding the one running backward.
pub struct GraphMut<'a> {
    layers: &'a mut [Box<dyn Layer>],
    index: &'a HashMap<LayerId, usize>,
}

impl<'a> GraphMut<'a> {
    /// View over `layers`, `index` mapping ids to positions.
    pub fn new(layers: &'a mut [Box<dyn Layer>], index: &'a HashMap<LayerId, usize>) -> Self {
        Self { layers, index }
    }

    /// Read-only view.
    pub fn view(&self) -> Graph<'_> {
        Graph::new(&*self.layers, self.index)
    }

    fn position(&self, id: LayerId) -> Result<usize> {
        let pos = *self.index.get(&id).ok_or(GraphError::UnknownLayer(id))?;
        if pos < self.layers.len() {
            Ok(pos)
        } else {
            Err(GraphError::UnknownLayer(id))
        }
    }

    /// Layer `id`, mutably.
    pub fn get_mut(&mut self, id: LayerId) -> Result<&mut dyn Layer> {
        let pos = self.position(id)?;
        Ok(self.layers[pos].as_mut())
    }

    /// Shared state of layer `id`.
    pub fn base(&self, id: LayerId) -> Result<&LayerBase> {
        let pos = self.position(id)?;
        Ok(self.layers[pos].base())
    }

    /// Shared state of layer `id`, mutably.
    pub fn base_mut(&mut self, id: LayerId) -> Result<&mut LayerBase> {
        let pos = self.position(id)?;
        Ok(self.layers[pos].base_mut())
    }
}
