use crate::backend::ExecutionContext;
use crate::error::{GraphError, Result};
use crate::layer::{
    Backward, Forward, GradientCheckable, Graph, GraphMut, Layer, LayerBase, Links, Resizable,
};
use crate::model::ModelContext;
use crate::shape::Shape;

/// Graph input. Holds the data set by the caller for the current step.
///
/// Inputs never need a gradient and contribute no gradient-checking probe.
#[derive(Debug)]
pub struct Input {
    base: LayerBase,
}

impl Input {
    /// Input producing `shape`.
    pub fn new(shape: Shape) -> Result<Self> {
        if shape.size() == 0 {
            return Err(GraphError::Init("input shape must not be empty".into()));
        }
        Ok(Self {
            base: LayerBase::new(Links::None, shape),
        })
    }

    /// Flat input of `nb_neurons`.
    pub fn flat(nb_neurons: usize) -> Result<Self> {
        Self::new(Shape::flat(nb_neurons))
    }

    /// Grid input.
    pub fn grid(nb_channels: usize, height: usize, width: usize) -> Result<Self> {
        Self::new(Shape::grid(nb_channels, height, width))
    }

    fn check_data(&self, data: &[f64], batch: usize) -> Result<()> {
        if data.len() != batch * self.base.size() {
            return Err(GraphError::DataSize);
        }
        Ok(())
    }

    /// Loads `batch` elements, laid out one after the other, into the CPU
    /// state.
    pub fn set_data_cpu(&mut self, data: &[f64], batch: usize) -> Result<()> {
        self.check_data(data, batch)?;
        self.base.check_state_cpu(batch)?;
        let size = self.base.size();
        let neurons = self.base.neurons_mut()?;
        for elem in 0..batch {
            for (index, unit) in neurons.units_mut().iter_mut().enumerate() {
                unit.v[elem].out = data[elem * size + index];
            }
        }
        Ok(())
    }

    /// Loads `batch` elements into the output buffer and uploads it.
    pub fn set_data_gpu(&mut self, ctx: &ExecutionContext, data: &[f64], batch: usize) -> Result<()> {
        self.check_data(data, batch)?;
        self.base.check_state_forward_gpu(ctx, batch)?;
        let buffer = self.base.outs_buffer_mut()?;
        for (dst, src) in buffer.host_mut().iter_mut().zip(data) {
            *dst = *src as f32;
        }
        buffer.upload()?;
        Ok(())
    }
}

impl Forward for Input {
    fn forward_cpu(&mut self, _graph: &Graph<'_>) -> Result<()> {
        self.base.neurons().map(|_| ())
    }

    fn forward_gpu(&mut self, _graph: &Graph<'_>, _ctx: &ExecutionContext) -> Result<()> {
        self.base.outs_buffer().map(|_| ())
    }
}

impl Backward for Input {
    fn backward_cpu(&mut self, _graph: &mut GraphMut<'_>) -> Result<()> {
        Ok(())
    }

    fn backward_gpu(&mut self, _graph: &mut GraphMut<'_>, _ctx: &ExecutionContext) -> Result<()> {
        Ok(())
    }
}

impl GradientCheckable for Input {
    fn forward_gc_cpu(&mut self, _graph: &Graph<'_>) -> Result<()> {
        let batch = self.base.batch_size();
        self.base.check_state_cpu(batch)?;
        self.base.neurons_mut()?.init_gc(batch, 0);
        Ok(())
    }
}

impl Resizable for Input {
    fn resize(&self, _ctx: &ModelContext, height: usize, width: usize) -> Result<Box<dyn Layer>> {
        let mut layer = Self::new(self.base.shape().with_resolution(height, width))?;
        layer.base.set_id(self.base.id());
        Ok(Box::new(layer))
    }
}

impl Layer for Input {
    fn name(&self) -> &'static str {
        "Input"
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
        })
    }

    fn as_resizable(&self) -> Option<&dyn Resizable> {
        Some(self)
    }
}
