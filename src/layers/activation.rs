//! Element-wise activations.

use crate::backend::ExecutionContext;
use crate::error::Result;
use crate::layer::{
    Backward, Forward, GradientCheckable, Graph, GraphMut, Layer, LayerBase, LayerId, Links,
    Resizable, write_delta,
};
use crate::model::ModelContext;
use core::str::FromStr;

/// Element-wise function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActivationKind {
    /// `f(x) = x`.
    #[default]
    Identity,
    /// `f(x) = max(x, 0)`.
    ReLU,
    /// `f(x) = 1 / (1 + e^-x)`.
    Sigmoid,
}

impl ActivationKind {
    /// Code passed to the activation kernels.
    pub const fn code(self) -> u32 {
        match self {
            Self::Identity => 0,
            Self::ReLU => 1,
            Self::Sigmoid => 2,
        }
    }

    /// Inverse of [`code`](Self::code).
    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Identity),
            1 => Some(Self::ReLU),
            2 => Some(Self::Sigmoid),
            _ => None,
        }
    }

    /// `f(x)`.
    #[inline]
    pub fn apply(self, x: f64) -> f64 {
        match self {
            Self::Identity => x,
            Self::ReLU => x.max(0.0),
            Self::Sigmoid => 1.0 / (1.0 + (-x).exp()),
        }
    }

    /// `f'(x)`, from the pre-activation value.
    #[inline]
    pub fn derivative(self, x: f64) -> f64 {
        match self {
            Self::Identity => 1.0,
            Self::ReLU => {
                if x > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Self::Sigmoid => {
                let s = self.apply(x);
                s * (1.0 - s)
            }
        }
    }
}

impl FromStr for ActivationKind {
    type Err = String;

    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "identity" | "linear" => Ok(Self::Identity),
            "relu" => Ok(Self::ReLU),
            "sigmoid" => Ok(Self::Sigmoid),
            other => Err(format!("unknown activation `{other}`")),
        }
    }
}

/// Applies an [`ActivationKind`] to every scalar of its predecessor.
#[derive(Debug)]
pub struct Activation {
    base: LayerBase,
    prev: LayerId,
    kind: ActivationKind,
}

impl Activation {
    /// `kind` applied to layer `prev` of `model`. The shape is kept.
    pub fn new(model: &ModelContext, prev: LayerId, kind: ActivationKind) -> Result<Self> {
        Ok(Self {
            base: LayerBase::new(Links::Single(prev), model.shape(prev)?),
            prev,
            kind,
        })
    }

    /// Function applied.
    pub fn kind(&self) -> ActivationKind {
        self.kind
    }
}

impl Forward for Activation {
    fn forward_cpu(&mut self, graph: &Graph<'_>) -> Result<()> {
        let batch = self.base.batch_size();
        self.base.check_state_cpu(batch)?;
        let prev = graph.neurons(self.prev)?;
        let kind = self.kind;
        let neurons = self.base.neurons_mut()?;
        for (unit, src) in neurons.units_mut().iter_mut().zip(prev.units()) {
            for elem in 0..batch {
                unit.v[elem].out = kind.apply(src.v[elem].out);
            }
        }
        Ok(())
    }

    fn forward_gpu(&mut self, graph: &Graph<'_>, ctx: &ExecutionContext) -> Result<()> {
        let batch = self.base.batch_size();
        self.base.check_state_forward_gpu(ctx, batch)?;
        let n = batch * self.base.size();
        ctx.device()
            .create_command("activation_forward")
            .set_bytes(0, &[n as u32, self.kind.code(), ctx.precision().flag()])
            .set_buffer(1, graph.base(self.prev)?.outs_buffer()?)
            .set_buffer(2, self.base.outs_buffer()?)
            .dispatch_threads(n)
            .enqueue()?;
        Ok(())
    }
}

impl Backward for Activation {
    fn backward_cpu(&mut self, graph: &mut GraphMut<'_>) -> Result<()> {
        if !self.must_compute_backward(&graph.view())? {
            return Ok(());
        }
        let batch = self.base.batch_size();
        let kind = self.kind;
        let delta = self.base.neurons()?;
        let prev = graph.base_mut(self.prev)?;
        let overwrite = prev.is_dirty();
        for (unit, src) in prev.neurons_mut()?.units_mut().iter_mut().zip(delta.units()) {
            for elem in 0..batch {
                let value = kind.derivative(unit.v[elem].out) * src.v[elem].delta;
                write_delta(&mut unit.v[elem].delta, value, overwrite);
            }
        }
        prev.mark_written();
        Ok(())
    }

    fn backward_gpu(&mut self, graph: &mut GraphMut<'_>, ctx: &ExecutionContext) -> Result<()> {
        if !self.must_compute_backward(&graph.view())? {
            return Ok(());
        }
        let batch = self.base.batch_size();
        let n = batch * self.base.size();
        let prev = graph.base_mut(self.prev)?;
        prev.check_state_backward_gpu(ctx, batch)?;
        let accumulate = u32::from(!prev.is_dirty());
        ctx.device()
            .create_command("activation_backward")
            .set_bytes(
                0,
                &[n as u32, self.kind.code(), accumulate, ctx.precision().flag()],
            )
            .set_buffer(1, self.base.delta_buffer()?)
            .set_buffer(2, prev.outs_buffer()?)
            .set_buffer(3, prev.delta_buffer()?)
            .dispatch_threads(n)
            .enqueue()?;
        prev.mark_written();
        Ok(())
    }
}

impl GradientCheckable for Activation {
    fn forward_gc_cpu(&mut self, graph: &Graph<'_>) -> Result<()> {
        let batch = self.base.batch_size();
        self.base.check_state_cpu(batch)?;
        let prev = graph.neurons(self.prev)?;
        let kind = self.kind;
        let neurons = self.base.neurons_mut()?;
        neurons.init_gc(batch, prev.nb_gc());
        for (unit, src) in neurons.units_mut().iter_mut().zip(prev.units()) {
            for (dst, values) in unit.gc.iter_mut().zip(&src.gc) {
                for (d, x) in dst.iter_mut().zip(values) {
                    *d = kind.apply(*x);
                }
            }
        }
        Ok(())
    }
}

impl Resizable for Activation {
    fn resize(&self, ctx: &ModelContext, _height: usize, _width: usize) -> Result<Box<dyn Layer>> {
        let mut layer = Self::new(ctx, self.prev, self.kind)?;
        layer.base.set_id(self.base.id());
        Ok(Box::new(layer))
    }
}

impl Layer for Activation {
    fn name(&self) -> &'static str {
        "Activation"
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
            kind: self.kind,
        })
    }

    fn as_resizable(&self) -> Option<&dyn Resizable> {
        Some(self)
    }
}
