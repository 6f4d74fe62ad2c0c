//! Graph construction and traversal.
//!
//! Layers are created through a [`ModelContext`], which assigns increasing
//! ids: since a layer can only link to layers that already exist, creation
//! order is a topological order. [`ModelContext::build`] turns the context
//! into a [`Model`] bound to an [`ExecutionContext`].
//!
//! # One training step
//!
//! ```
//! use briny_graph::backend::ExecutionContext;
//! use briny_graph::layers::{FullyConnected, Input, Mse};
//! use briny_graph::model::ModelContext;
//!
//! # fn main() -> briny_graph::error::Result<()> {
//! let mut graph = ModelContext::new("regression");
//! let input = graph.add(Input::flat(3)?)?;
//! let hidden = graph.add(FullyConnected::new(&graph, input, 2)?)?;
//! let loss = graph.add(Mse::new(&graph, hidden)?)?;
//!
//! let mut model = graph.build(ExecutionContext::cpu())?;
//! model.initialize(Default::default())?;
//! model.update_kernel(1)?;
//! model.set_data(input, &[1.0, 2.0, 3.0])?;
//! model.forward()?;
//! model.loss_derivative(loss, &[0.5, -0.5])?;
//! model.backward()?;
//! model.update(0.01)?;
//! # Ok(())
//! # }
//! ```

use crate::approx::{GRADIENT_WARNING, gradient_diff};
use crate::backend::{Backend, ExecutionContext};
use crate::error::{GraphError, Result};
use crate::layer::merge::{self, MergedGraph};
use crate::layer::{Graph, GraphMut, Layer, LayerId, Links, Phase, StepState};
use crate::layers::{Input, Mse};
use crate::shape::Shape;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::any::Any;
use std::collections::HashMap;

fn index_of(layers: &[Box<dyn Layer>]) -> HashMap<LayerId, usize> {
    layers
        .iter()
        .enumerate()
        .map(|(pos, layer)| (layer.id(), pos))
        .collect()
}

fn downcast_mut<T: Layer>(layer: &mut dyn Layer) -> Result<&mut T> {
    let id = layer.id();
    let any: &mut dyn Any = layer;
    any.downcast_mut::<T>()
        .ok_or_else(|| GraphError::Init(format!("layer {id} is not a {}", core::any::type_name::<T>())))
}

/// Layers under construction.
pub struct ModelContext {
    name: String,
    layers: Vec<Box<dyn Layer>>,
    index: HashMap<LayerId, usize>,
    next_id: LayerId,
}

impl ModelContext {
    /// Empty graph.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            layers: Vec::new(),
            index: HashMap::new(),
            next_id: 0,
        }
    }

    /// Adds `layer` and returns its id.
    pub fn add<L: Layer>(&mut self, layer: L) -> Result<LayerId> {
        self.add_boxed(Box::new(layer))
    }

    /// Adds an already boxed layer and returns its id.
    pub fn add_boxed(&mut self, mut layer: Box<dyn Layer>) -> Result<LayerId> {
        let id = self.next_id;
        layer.base_mut().set_id(id);
        self.insert(layer)?;
        Ok(id)
    }

    /// Adds a layer keeping its id, which must be greater than every id
    /// already present.
    pub(crate) fn insert(&mut self, layer: Box<dyn Layer>) -> Result<()> {
        let id = layer.id();
        if id < self.next_id {
            return Err(GraphError::Init(format!(
                "layer id {id} is not greater than the previous ones"
            )));
        }
        for &prev in layer.base().links().ids() {
            if !self.index.contains_key(&prev) {
                return Err(GraphError::UnknownLayer(prev));
            }
        }
        log::trace!("{}: add {} {id} {}", self.name, layer.name(), layer.base().shape());
        self.index.insert(id, self.layers.len());
        self.layers.push(layer);
        self.next_id = id + 1;
        Ok(())
    }

    /// Output shape of layer `id`.
    pub fn shape(&self, id: LayerId) -> Result<Shape> {
        Ok(self.graph().base(id)?.shape())
    }

    /// Read-only view over the layers added so far.
    pub fn graph(&self) -> Graph<'_> {
        Graph::new(&self.layers, &self.index)
    }

    /// Number of layers.
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Whether no layer was added.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Model running on `ctx`.
    pub fn build(self, ctx: ExecutionContext) -> Result<Model> {
        Model::from_layers(self.name, self.layers, ctx)
    }
}

/// Ordered layer arena and its traversal.
pub struct Model {
    name: String,
    layers: Vec<Box<dyn Layer>>,
    index: HashMap<LayerId, usize>,
    ctx: ExecutionContext,
    phase: Phase,
    batch_size: usize,
    step: usize,
    epoch: usize,
    backward_done: bool,
}

impl Model {
    /// Model over `layers`, for instance after bulk decoding. Layers are
    /// sorted by id and their links resolved.
    pub fn from_layers(
        name: impl Into<String>,
        mut layers: Vec<Box<dyn Layer>>,
        ctx: ExecutionContext,
    ) -> Result<Self> {
        layers.sort_by_key(|layer| layer.id());
        if let Some(pair) = layers.windows(2).find(|pair| pair[0].id() == pair[1].id()) {
            return Err(GraphError::Init(format!("duplicate layer id {}", pair[0].id())));
        }
        let model = Self {
            name: name.into(),
            index: index_of(&layers),
            layers,
            ctx,
            phase: Phase::default(),
            batch_size: 0,
            step: 0,
            epoch: 0,
            backward_done: false,
        };
        model.init_links()?;
        log::info!(
            "model `{}`: {} layers on {:?}",
            model.name,
            model.layers.len(),
            model.ctx
        );
        Ok(model)
    }

    /// Checks every link points to an existing, earlier layer.
    pub fn init_links(&self) -> Result<()> {
        for layer in &self.layers {
            let id = layer.id();
            for &prev in layer.base().links().ids() {
                if !self.index.contains_key(&prev) {
                    return Err(GraphError::UnknownLayer(prev));
                }
                if prev >= id {
                    return Err(GraphError::Init(format!(
                        "layer {id} links to layer {prev}, which does not precede it"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Initializes the weights from the context seed and, on GPU, uploads
    /// them.
    ///
    /// Weights set explicitly before are kept.
    pub fn initialize(&mut self, phase: Phase) -> Result<()> {
        let mut rng = StdRng::seed_from_u64(self.ctx.seed());
        for layer in &mut self.layers {
            let Some(params) = layer.as_update_mut() else {
                continue;
            };
            params.init_weights(&mut rng);
            params.set_compute_delta_weights(phase == Phase::Training);
            if self.ctx.is_gpu() {
                params.init_weights_gpu(&self.ctx)?;
            }
        }
        self.phase = phase;
        log::info!("model `{}`: initialized for {phase:?}", self.name);
        Ok(())
    }

    /// Drops the batch state of every layer.
    pub fn reset_kernel(&mut self) {
        for layer in &mut self.layers {
            layer.base_mut().reset_kernel();
        }
        self.batch_size = 0;
    }

    /// Starts a step over `batch_size` elements: every layer becomes dirty.
    pub fn update_kernel(&mut self, batch_size: usize) -> Result<()> {
        if batch_size == 0 {
            return Err(GraphError::BatchSize);
        }
        for layer in &mut self.layers {
            layer.base_mut().start_step(batch_size);
        }
        self.batch_size = batch_size;
        self.backward_done = false;
        Ok(())
    }

    fn position(&self, id: LayerId) -> Result<usize> {
        self.index.get(&id).copied().ok_or(GraphError::UnknownLayer(id))
    }

    /// Loads the data of input layer `id` for the current step.
    pub fn set_data(&mut self, id: LayerId, data: &[f64]) -> Result<()> {
        let pos = self.position(id)?;
        let batch = self.batch_size;
        if batch == 0 {
            return Err(GraphError::BatchSize);
        }
        let input = downcast_mut::<Input>(self.layers[pos].as_mut())?;
        match self.ctx.backend() {
            Backend::Cpu => input.set_data_cpu(data, batch),
            Backend::Gpu => input.set_data_gpu(&self.ctx, data, batch),
        }
    }

    /// Runs every layer forward, in id order.
    pub fn forward(&mut self) -> Result<()> {
        for pos in 0..self.layers.len() {
            let (prev, rest) = self.layers.split_at_mut(pos);
            let layer = &mut rest[0];
            let graph = Graph::new(prev, &self.index);
            log::trace!("forward {} {}", layer.name(), layer.id());
            match self.ctx.backend() {
                Backend::Cpu => layer.forward_cpu(&graph)?,
                Backend::Gpu => layer.forward_gpu(&graph, &self.ctx)?,
            }
            layer.base_mut().set_state(StepState::Forwarded);
        }
        Ok(())
    }

    /// Computes the gradient-checking probes of every layer.
    ///
    /// Runs on the CPU state: in GPU mode outputs and weights are downloaded
    /// first. `forward` must have run.
    pub fn forward_gradients(&mut self) -> Result<()> {
        if self.ctx.is_gpu() {
            for layer in &mut self.layers {
                layer.base_mut().pull_outs()?;
                if let Some(params) = layer.as_update_mut() {
                    params.pull_weights_gpu()?;
                }
            }
        }
        for pos in 0..self.layers.len() {
            let (prev, rest) = self.layers.split_at_mut(pos);
            let layer = &mut rest[0];
            log::trace!("forward_gc {} {}", layer.name(), layer.id());
            layer.forward_gc_cpu(&Graph::new(prev, &self.index))?;
        }
        Ok(())
    }

    /// Loss of the [`Mse`] layer `id` against `truth`.
    pub fn loss(&mut self, id: LayerId, truth: &[f64]) -> Result<f64> {
        let pos = self.position(id)?;
        let mse = downcast_mut::<Mse>(self.layers[pos].as_mut())?;
        match self.ctx.backend() {
            Backend::Cpu => mse.loss_cpu(truth),
            Backend::Gpu => mse.loss_gpu(truth),
        }
    }

    /// Seeds the gradient of the predecessor of the [`Mse`] layer `id`.
    pub fn loss_derivative(&mut self, id: LayerId, truth: &[f64]) -> Result<()> {
        let pos = self.position(id)?;
        let (prev, rest) = self.layers.split_at_mut(pos);
        let mse = downcast_mut::<Mse>(rest[0].as_mut())?;
        let mut graph = GraphMut::new(prev, &self.index);
        match self.ctx.backend() {
            Backend::Cpu => mse.loss_derivative_cpu(&mut graph, truth),
            Backend::Gpu => mse.loss_derivative_gpu(&mut graph, &self.ctx, truth),
        }
    }

    /// Runs backward in reverse id order, skipping layers no successor
    /// wrote a gradient to.
    ///
    /// A second call in the same step fails with
    /// [`GraphError::BackwardReplay`].
    pub fn backward(&mut self) -> Result<()> {
        if self.backward_done {
            return Err(GraphError::BackwardReplay);
        }
        self.backward_done = true;
        for pos in (0..self.layers.len()).rev() {
            let (prev, rest) = self.layers.split_at_mut(pos);
            let layer = &mut rest[0];
            if layer.base().is_dirty() {
                log::trace!("backward {} {}: no gradient, skipped", layer.name(), layer.id());
                continue;
            }
            log::trace!("backward {} {}", layer.name(), layer.id());
            let mut graph = GraphMut::new(prev, &self.index);
            match self.ctx.backend() {
                Backend::Cpu => layer.backward_cpu(&mut graph)?,
                Backend::Gpu => layer.backward_gpu(&mut graph, &self.ctx)?,
            }
        }
        Ok(())
    }

    /// Plain SGD step on every weighted layer.
    ///
    /// Fails with [`GraphError::Dirty`] when a layer computing weight
    /// gradients got no gradient during this step.
    pub fn update(&mut self, learning_rate: f64) -> Result<()> {
        for layer in &self.layers {
            let computes = layer
                .as_update()
                .is_some_and(|params| params.compute_delta_weights());
            if computes && layer.base().is_dirty() {
                return Err(GraphError::Dirty(layer.id()));
            }
        }
        for layer in &mut self.layers {
            if let Some(params) = layer.as_update_mut() {
                match self.ctx.backend() {
                    Backend::Cpu => params.update_cpu(learning_rate),
                    Backend::Gpu => params.update_gpu(&self.ctx, learning_rate)?,
                }
                layer.base_mut().set_state(StepState::Updated);
            }
        }
        Ok(())
    }

    /// Sums weight gradients over the next steps instead of overwriting them.
    pub fn set_accumulate_delta_weights(&mut self, value: bool) {
        for layer in &mut self.layers {
            if let Some(params) = layer.as_update_mut() {
                params.set_accumulate_delta_weights(value);
            }
        }
    }

    /// Weight gradients of `layers`, in order, kernel then biases.
    pub fn collect_gradients(&mut self, layers: &[LayerId]) -> Result<Vec<f64>> {
        let mut gradients = Vec::new();
        for &id in layers {
            let pos = self.position(id)?;
            if let Some(params) = self.layers[pos].as_update_mut() {
                if self.ctx.is_gpu() {
                    params.pull_weights_gpu()?;
                }
                gradients.extend(params.gradients());
            }
        }
        Ok(gradients)
    }

    /// Finite-difference gradients of the loss of the [`Mse`] layer `id`,
    /// from the probes of the last [`forward_gradients`].
    ///
    /// [`forward_gradients`]: Model::forward_gradients
    pub fn collect_gradients_approx(&self, id: LayerId, truth: &[f64]) -> Result<Vec<f64>> {
        self.graph().downcast::<Mse>(id)?.collect_gradients_approx(truth)
    }

    /// Compares the analytic weight gradients of the graph ending at loss
    /// `id` with finite differences, and returns their relative difference.
    ///
    /// `forward`, `loss_derivative` and `backward` must have run for the
    /// current step.
    pub fn check_gradients(&mut self, id: LayerId, truth: &[f64]) -> Result<f64> {
        self.forward_gradients()?;
        let approx = self.collect_gradients_approx(id, truth)?;
        let layers = self.get_graph(id)?;
        let analytic = self.collect_gradients(&layers)?;
        if approx.len() != analytic.len() {
            return Err(GraphError::DataSize);
        }
        let diff = gradient_diff(&analytic, &approx);
        if diff > GRADIENT_WARNING {
            log::warn!(
                "model `{}`: gradient check of layer {id} off by {diff:e}",
                self.name
            );
        } else {
            log::debug!("model `{}`: gradient check of layer {id}: {diff:e}", self.name);
        }
        Ok(diff)
    }

    /// Every layer `endpoint` depends on, itself included, in ascending id
    /// order.
    pub fn get_graph(&self, endpoint: LayerId) -> Result<Vec<LayerId>> {
        Ok(merge::ancestors(&self.graph(), endpoint)?.into_iter().collect())
    }

    /// Branch reconstruction of merge layer `id`: how its probe columns map
    /// onto the ones of its branches.
    pub fn merged_graph(&self, id: LayerId) -> Result<MergedGraph> {
        let graph = self.graph();
        match graph.base(id)?.links() {
            Links::Merge(ids) => merge::merged_graph(&graph, ids),
            _ => Err(GraphError::Init(format!("layer {id} is not a merge layer"))),
        }
    }

    /// Read-only view over every layer.
    pub fn graph(&self) -> Graph<'_> {
        Graph::new(&self.layers, &self.index)
    }

    /// Every weight of the model, layer by layer.
    pub fn weights(&self) -> Vec<f64> {
        self.layers
            .iter()
            .filter_map(|layer| layer.as_update())
            .flat_map(|params| params.weights())
            .collect()
    }

    /// Replaces every weight, in the order of [`weights`](Model::weights).
    pub fn set_weights(&mut self, weights: &[f64]) -> Result<()> {
        let total: usize = self
            .layers
            .iter()
            .filter_map(|layer| layer.as_update())
            .map(|params| params.nb_learned())
            .sum();
        if total != weights.len() {
            return Err(GraphError::DataSize);
        }
        let mut rest = weights;
        for params in self.layers.iter_mut().filter_map(|layer| layer.as_update_mut()) {
            let (head, tail) = rest.split_at(params.nb_learned());
            params.set_weights(head)?;
            rest = tail;
        }
        Ok(())
    }

    /// Same graph and weights, without batch state.
    pub fn copy(&self) -> Result<Self> {
        let layers = self.layers.iter().map(|layer| layer.copy_layer()).collect();
        self.with_layers(layers)
    }

    /// Copy of the sub-graph `endpoint` depends on.
    pub fn copy_graph(&self, endpoint: LayerId) -> Result<Self> {
        let graph = self.graph();
        let layers = self
            .get_graph(endpoint)?
            .into_iter()
            .map(|id| graph.get(id).map(|layer| layer.copy_layer()))
            .collect::<Result<Vec<_>>>()?;
        self.with_layers(layers)
    }

    /// Same graph and weights for inputs of `height × width`.
    pub fn resize(&self, height: usize, width: usize) -> Result<Self> {
        let mut ctx = ModelContext::new(self.name.clone());
        for layer in &self.layers {
            let resizable = layer.as_resizable().ok_or_else(|| {
                GraphError::Init(format!("layer {} ({}) cannot be resized", layer.id(), layer.name()))
            })?;
            let resized = resizable.resize(&ctx, height, width)?;
            ctx.insert(resized)?;
        }
        log::debug!("model `{}`: resized to {height}x{width}", self.name);
        let mut model = ctx.build(self.ctx.clone())?;
        model.phase = self.phase;
        Ok(model)
    }

    fn with_layers(&self, layers: Vec<Box<dyn Layer>>) -> Result<Self> {
        let mut model = Self::from_layers(self.name.clone(), layers, self.ctx.clone())?;
        model.phase = self.phase;
        Ok(model)
    }

    /// Output of layer `id` for batch element `elem`.
    pub fn outs(&mut self, id: LayerId, elem: usize) -> Result<Vec<f64>> {
        let pos = self.position(id)?;
        let base = self.layers[pos].base_mut();
        match self.ctx.backend() {
            Backend::Cpu => base.outs_cpu(elem),
            Backend::Gpu => base.outs_gpu(elem),
        }
    }

    /// Gradient of layer `id` for batch element `elem`.
    pub fn delta(&mut self, id: LayerId, elem: usize) -> Result<Vec<f64>> {
        let pos = self.position(id)?;
        let base = self.layers[pos].base_mut();
        match self.ctx.backend() {
            Backend::Cpu => base.delta_cpu(elem),
            Backend::Gpu => base.delta_gpu(elem),
        }
    }

    /// Layer `id`.
    pub fn layer(&self, id: LayerId) -> Result<&dyn Layer> {
        self.graph().get(id)
    }

    /// Layer `id`, mutably.
    pub fn layer_mut(&mut self, id: LayerId) -> Result<&mut dyn Layer> {
        let pos = self.position(id)?;
        Ok(self.layers[pos].as_mut())
    }

    /// Layer `id` as its concrete type.
    pub fn downcast<T: Layer>(&self, id: LayerId) -> Result<&T> {
        self.graph().downcast(id)
    }

    /// Layer ids, in order.
    pub fn ids(&self) -> impl Iterator<Item = LayerId> + '_ {
        self.layers.iter().map(|layer| layer.id())
    }

    /// Name given at construction.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Execution context.
    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    /// Phase of the last [`initialize`](Model::initialize).
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Batch size of the current step, `0` before the first one.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Steps run so far.
    pub fn step(&self) -> usize {
        self.step
    }

    /// Epochs run so far.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Counts one step.
    pub fn inc_step(&mut self) {
        self.step += 1;
    }

    /// Counts one epoch.
    pub fn inc_epoch(&mut self) {
        self.epoch += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::FullyConnected;

    fn chain() -> (ModelContext, [LayerId; 3]) {
        let mut ctx = ModelContext::new("chain");
        let input = ctx.add(Input::flat(2).unwrap()).unwrap();
        let fc = ctx.add(FullyConnected::new(&ctx, input, 3).unwrap()).unwrap();
        let loss = ctx.add(Mse::new(&ctx, fc).unwrap()).unwrap();
        (ctx, [input, fc, loss])
    }

    #[test]
    fn ids_increase_with_creation() {
        let (ctx, ids) = chain();
        assert_eq!(ids, [0, 1, 2]);
        assert_eq!(ctx.shape(1), Ok(Shape::flat(3)));
        assert_eq!(ctx.shape(7), Err(GraphError::UnknownLayer(7)));
    }

    #[test]
    fn from_layers_sorts_and_checks_links() {
        let (ctx, _) = chain();
        let mut layers = ctx.layers;
        layers.reverse();
        let model = Model::from_layers("shuffled", layers, ExecutionContext::cpu()).unwrap();
        assert_eq!(model.ids().collect::<Vec<_>>(), vec![0, 1, 2]);

        let (ctx, _) = chain();
        let layers: Vec<_> = ctx.layers.into_iter().skip(1).collect();
        assert!(matches!(
            Model::from_layers("orphan", layers, ExecutionContext::cpu()),
            Err(GraphError::UnknownLayer(0))
        ));
    }

    #[test]
    fn links_must_point_backwards() {
        let (ctx, _) = chain();
        let mut layers = ctx.layers;
        // the fully connected layer now links to itself
        layers[0].base_mut().set_id(3);
        layers[1].base_mut().set_id(0);
        assert!(matches!(
            Model::from_layers("cycle", layers, ExecutionContext::cpu()),
            Err(GraphError::Init(_))
        ));
    }

    #[test]
    fn get_graph_is_ascending() {
        let (ctx, [input, fc, loss]) = chain();
        let model = ctx.build(ExecutionContext::cpu()).unwrap();
        assert_eq!(model.get_graph(loss).unwrap(), vec![input, fc, loss]);
        assert_eq!(model.get_graph(input).unwrap(), vec![input]);
    }
}
