use super::{LayerId, Links};
use crate::backend::ExecutionContext;
use crate::device::Buffer;
use crate::error::{GraphError, Result};
use crate::shape::Shape;
use crate::state::Neurons;

/// Where a layer stands in the current step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StepState {
    /// Nothing ran since the last `update_kernel`.
    #[default]
    Clean,
    /// Output computed.
    Forwarded,
    /// Gradient received or propagated.
    Backwarding,
    /// Weights updated.
    Updated,
}

/// Writes `value` into a gradient slot: the first writer of the pass
/// (`overwrite`, the target is still dirty) replaces, later ones add.
#[inline]
pub fn write_delta(slot: &mut f64, value: f64, overwrite: bool) {
    if overwrite {
        *slot = value;
    } else {
        *slot += value;
    }
}

fn fits(capacity: usize, requested: usize) -> Result<()> {
    if requested > capacity {
        Err(GraphError::BatchSize)
    } else {
        Ok(())
    }
}

/// State shared by every layer: identity, links, flags and batch buffers.
///
/// The CPU state ([`Neurons`]) and the device buffers are allocated lazily
/// by the `check_state_*` functions and kept until [`reset_kernel`].
///
/// [`reset_kernel`]: LayerBase::reset_kernel
#[derive(Debug)]
pub struct LayerBase {
    id: LayerId,
    links: Links,
    shape: Shape,
    compute_delta: bool,
    dirty: bool,
    batch_size: usize,
    state: StepState,
    neurons: Option<Neurons>,
    outs: Option<Buffer>,
    delta: Option<Buffer>,
}

impl LayerBase {
    /// State of a layer producing `shape` from `links`. The id is assigned
    /// when the layer is added to a model.
    pub fn new(links: Links, shape: Shape) -> Self {
        Self {
            id: 0,
            compute_delta: !matches!(links, Links::None),
            links,
            shape,
            dirty: true,
            batch_size: 0,
            state: StepState::Clean,
            neurons: None,
            outs: None,
            delta: None,
        }
    }

    /// Same identity, links and flags, without batch state.
    pub fn copy(&self) -> Self {
        Self {
            id: self.id,
            links: self.links.clone(),
            shape: self.shape,
            compute_delta: self.compute_delta,
            dirty: true,
            batch_size: 0,
            state: StepState::Clean,
            neurons: None,
            outs: None,
            delta: None,
        }
    }

    /// Identifier.
    pub fn id(&self) -> LayerId {
        self.id
    }

    pub(crate) fn set_id(&mut self, id: LayerId) {
        self.id = id;
    }

    /// Predecessor links.
    pub fn links(&self) -> &Links {
        &self.links
    }

    /// Output shape of one batch element.
    pub fn shape(&self) -> Shape {
        self.shape
    }

    /// Scalars per batch element.
    pub fn size(&self) -> usize {
        self.shape.size()
    }

    /// Whether successors must produce this layer's gradient.
    pub fn compute_delta(&self) -> bool {
        self.compute_delta
    }

    /// Sets whether successors must produce this layer's gradient.
    pub fn set_compute_delta(&mut self, value: bool) {
        self.compute_delta = value;
    }

    /// Whether no successor wrote the gradient yet during this step.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Batch size of the current step.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Step state.
    pub fn state(&self) -> StepState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: StepState) {
        self.state = state;
    }

    /// Starts a new step: every gradient becomes dirty.
    pub(crate) fn start_step(&mut self, batch_size: usize) {
        self.batch_size = batch_size;
        self.dirty = true;
        self.state = StepState::Clean;
    }

    /// Records a write into this layer's gradient.
    pub fn mark_written(&mut self) {
        self.dirty = false;
        self.state = StepState::Backwarding;
    }

    /// Drops the CPU state and the device buffers.
    pub fn reset_kernel(&mut self) {
        self.neurons = None;
        self.outs = None;
        self.delta = None;
        self.dirty = true;
        self.state = StepState::Clean;
    }

    /// Allocates the CPU state on first use, then checks it can hold `batch`.
    pub fn check_state_cpu(&mut self, batch: usize) -> Result<()> {
        if batch == 0 {
            return Err(GraphError::BatchSize);
        }
        if let Some(neurons) = &self.neurons {
            return fits(neurons.capacity(), batch);
        }
        log::debug!("layer {}: CPU state for batch {batch}", self.id);
        self.neurons = Some(Neurons::new(self.shape, batch));
        Ok(())
    }

    /// Allocates the output buffer on first use, then checks it can hold
    /// `batch`.
    pub fn check_state_forward_gpu(&mut self, ctx: &ExecutionContext, batch: usize) -> Result<()> {
        let len = self.check_gpu_batch(batch)?;
        if let Some(buffer) = &self.outs {
            return fits(buffer.len(), len);
        }
        log::debug!("layer {}: output buffer for batch {batch}", self.id);
        self.outs = Some(Buffer::new(ctx.device(), len, ctx.precision())?);
        Ok(())
    }

    /// Allocates the gradient buffer on first use when the layer needs a
    /// gradient, then checks it can hold `batch`.
    pub fn check_state_backward_gpu(&mut self, ctx: &ExecutionContext, batch: usize) -> Result<()> {
        if !self.compute_delta {
            return Ok(());
        }
        let len = self.check_gpu_batch(batch)?;
        if let Some(buffer) = &self.delta {
            return fits(buffer.len(), len);
        }
        log::debug!("layer {}: gradient buffer for batch {batch}", self.id);
        self.delta = Some(Buffer::new(ctx.device(), len, ctx.precision())?);
        Ok(())
    }

    fn check_gpu_batch(&self, batch: usize) -> Result<usize> {
        if batch == 0 {
            return Err(GraphError::BatchSize);
        }
        Ok(batch * self.shape.size())
    }

    /// CPU state.
    pub fn neurons(&self) -> Result<&Neurons> {
        self.neurons.as_ref().ok_or(GraphError::Dirty(self.id))
    }

    /// CPU state, mutably.
    pub fn neurons_mut(&mut self) -> Result<&mut Neurons> {
        self.neurons.as_mut().ok_or(GraphError::Dirty(self.id))
    }

    /// Output buffer.
    pub fn outs_buffer(&self) -> Result<&Buffer> {
        self.outs.as_ref().ok_or(GraphError::Dirty(self.id))
    }

    /// Output buffer, mutably.
    pub fn outs_buffer_mut(&mut self) -> Result<&mut Buffer> {
        self.outs.as_mut().ok_or(GraphError::Dirty(self.id))
    }

    /// Gradient buffer.
    pub fn delta_buffer(&self) -> Result<&Buffer> {
        self.delta.as_ref().ok_or(GraphError::Dirty(self.id))
    }

    /// Gradient buffer, mutably.
    pub fn delta_buffer_mut(&mut self) -> Result<&mut Buffer> {
        self.delta.as_mut().ok_or(GraphError::Dirty(self.id))
    }

    /// Number of gradient-checking probes held by the CPU state.
    pub fn nb_gc(&self) -> usize {
        self.neurons.as_ref().map_or(0, Neurons::nb_gc)
    }

    fn check_elem(&self, elem: usize) -> Result<()> {
        if elem < self.batch_size {
            Ok(())
        } else {
            Err(GraphError::BatchSize)
        }
    }

    /// Output of batch element `elem` from the CPU state.
    pub fn outs_cpu(&self, elem: usize) -> Result<Vec<f64>> {
        if self.state == StepState::Clean {
            return Err(GraphError::Dirty(self.id));
        }
        self.check_elem(elem)?;
        Ok(self.neurons()?.outs(elem))
    }

    /// Gradient of batch element `elem` from the CPU state.
    pub fn delta_cpu(&self, elem: usize) -> Result<Vec<f64>> {
        if self.dirty {
            return Err(GraphError::Dirty(self.id));
        }
        self.check_elem(elem)?;
        Ok(self.neurons()?.deltas(elem))
    }

    /// Output of batch element `elem`, downloaded from the device.
    pub fn outs_gpu(&mut self, elem: usize) -> Result<Vec<f64>> {
        if self.state == StepState::Clean {
            return Err(GraphError::Dirty(self.id));
        }
        self.check_elem(elem)?;
        let size = self.shape.size();
        let buffer = self.outs_buffer_mut()?;
        buffer.download()?;
        Ok(buffer.host()[elem * size..(elem + 1) * size]
            .iter()
            .map(|&x| f64::from(x))
            .collect())
    }

    /// Gradient of batch element `elem`, downloaded from the device.
    pub fn delta_gpu(&mut self, elem: usize) -> Result<Vec<f64>> {
        if self.dirty {
            return Err(GraphError::Dirty(self.id));
        }
        self.check_elem(elem)?;
        let size = self.shape.size();
        let buffer = self.delta_buffer_mut()?;
        buffer.download()?;
        Ok(buffer.host()[elem * size..(elem + 1) * size]
            .iter()
            .map(|&x| f64::from(x))
            .collect())
    }

    /// Downloads the device output into the CPU state, allocating it if
    /// needed. Used to run gradient checking on the CPU in GPU mode.
    pub fn pull_outs(&mut self) -> Result<()> {
        let batch = self.batch_size;
        self.check_state_cpu(batch)?;
        let id = self.id;
        let Self { outs, neurons, .. } = self;
        let buffer = outs.as_mut().ok_or(GraphError::Dirty(id))?;
        buffer.download()?;
        if let Some(neurons) = neurons.as_mut() {
            neurons.load_outs(batch, buffer.host());
        }
        Ok(())
    }
}
