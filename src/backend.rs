//! Backend selection and execution context.
//!
//! This module defines the available computation backends and the
//! [`ExecutionContext`] value a [`Model`](crate::model::Model) runs with.
//!
//! # Supported Backends
//!
//! - `Cpu` — every layer runs on its per-element `f64` neuron state (default).
//! - `Gpu` — every layer runs on flat `f32` device buffers through the
//!   kernels of a [`Device`]. The [`HostDevice`] is always available; a
//!   `wgpu` device is available behind the `wgpu` feature.
//!
//! # Configuration
//!
//! There is no global backend: each context carries its own backend,
//! precision, device and seed, so several models may run side by side on
//! different devices. [`ExecutionContext::from_env`] reads the
//! `BRINY_GRAPH_BACKEND`, `BRINY_GRAPH_PRECISION` and `BRINY_GRAPH_SEED`
//! variables.

use crate::device::{Device, HostDevice};
use crate::error::GraphError;
use core::convert::TryFrom;
use core::fmt;
use core::str::FromStr;
use std::sync::Arc;

/// Enumeration of supported computation backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Backend {
    /// Per-element CPU state (default).
    #[default]
    Cpu = 0,
    /// Flat device buffers and dispatched kernels.
    Gpu,
}

impl TryFrom<u8> for Backend {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Cpu),
            1 => Ok(Self::Gpu),
            _ => Err(()),
        }
    }
}

impl FromStr for Backend {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "gpu" => Ok(Self::Gpu),
            other => Err(GraphError::Init(format!("unknown backend `{other}`"))),
        }
    }
}

/// Precision of the values written to device buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Precision {
    /// Full `f32`.
    #[default]
    Float,
    /// Every value written is rounded to binary16.
    Half,
}

impl Precision {
    /// Flag passed to the kernels.
    pub(crate) fn flag(self) -> u32 {
        match self {
            Self::Float => 0,
            Self::Half => 1,
        }
    }

    /// Relative tolerance expected between CPU and GPU results.
    pub fn tolerance(self) -> f64 {
        match self {
            Self::Float => crate::approx::FLOAT_TOLERANCE,
            Self::Half => crate::approx::HALF_TOLERANCE,
        }
    }
}

impl FromStr for Precision {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "float" | "f32" => Ok(Self::Float),
            "half" | "f16" => Ok(Self::Half),
            other => Err(GraphError::Init(format!("unknown precision `{other}`"))),
        }
    }
}

/// Seed used when none is configured.
pub const DEFAULT_SEED: u64 = 42;

/// Everything a model needs to know about where and how it runs.
#[derive(Clone)]
pub struct ExecutionContext {
    backend: Backend,
    precision: Precision,
    seed: u64,
    device: Arc<dyn Device>,
}

impl ExecutionContext {
    /// CPU context. A host device is still attached so that layers can be
    /// moved to the GPU path without rebuilding the context.
    pub fn cpu() -> Self {
        Self {
            backend: Backend::Cpu,
            precision: Precision::Float,
            seed: DEFAULT_SEED,
            device: Arc::new(HostDevice::new()),
        }
    }

    /// GPU context running on `device`.
    pub fn gpu(device: Arc<dyn Device>) -> Self {
        Self {
            backend: Backend::Gpu,
            precision: Precision::Float,
            seed: DEFAULT_SEED,
            device,
        }
    }

    /// GPU context running on a fresh [`HostDevice`].
    pub fn host_gpu() -> Self {
        Self::gpu(Arc::new(HostDevice::new()))
    }

    /// GPU context running on the default `wgpu` adapter.
    #[cfg(feature = "wgpu")]
    pub fn wgpu() -> crate::error::Result<Self> {
        let device = crate::device::wgpu::WgpuDevice::new()?;
        Ok(Self::gpu(Arc::new(device)))
    }

    /// Builds a context from `BRINY_GRAPH_BACKEND`, `BRINY_GRAPH_PRECISION`
    /// and `BRINY_GRAPH_SEED`. Unset variables keep their defaults.
    pub fn from_env() -> crate::error::Result<Self> {
        let backend = match std::env::var("BRINY_GRAPH_BACKEND") {
            Ok(value) => value.parse()?,
            Err(_) => Backend::Cpu,
        };
        let precision = match std::env::var("BRINY_GRAPH_PRECISION") {
            Ok(value) => value.parse()?,
            Err(_) => Precision::Float,
        };
        let seed = match std::env::var("BRINY_GRAPH_SEED") {
            Ok(value) => value
                .trim()
                .parse()
                .map_err(|_| GraphError::Init(format!("invalid seed `{value}`")))?,
            Err(_) => DEFAULT_SEED,
        };
        log::info!("execution context from env: {backend:?}, {precision:?}, seed {seed}");
        Ok(Self::cpu()
            .with_backend(backend)
            .with_precision(precision)
            .with_seed(seed))
    }

    /// Replaces the backend.
    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    /// Replaces the device precision.
    pub fn with_precision(mut self, precision: Precision) -> Self {
        self.precision = precision;
        self
    }

    /// Replaces the weight initialization seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Replaces the device.
    pub fn with_device(mut self, device: Arc<dyn Device>) -> Self {
        self.device = device;
        self
    }

    /// Active backend.
    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Whether layers run on device buffers.
    pub fn is_gpu(&self) -> bool {
        self.backend == Backend::Gpu
    }

    /// Device precision.
    pub fn precision(&self) -> Precision {
        self.precision
    }

    /// Weight initialization seed.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Device kernels are dispatched on.
    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("backend", &self.backend)
            .field("precision", &self.precision)
            .field("seed", &self.seed)
            .field("device", &self.device.name())
            .finish()
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::cpu()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_conversions() {
        assert_eq!(Backend::try_from(0), Ok(Backend::Cpu));
        assert_eq!(Backend::try_from(1), Ok(Backend::Gpu));
        assert!(Backend::try_from(7).is_err());
        assert_eq!(" GPU ".parse::<Backend>(), Ok(Backend::Gpu));
        assert!("tpu".parse::<Backend>().is_err());
    }

    #[test]
    fn precision_parsing() {
        assert_eq!("half".parse::<Precision>(), Ok(Precision::Half));
        assert_eq!("f32".parse::<Precision>(), Ok(Precision::Float));
        assert!("bf16".parse::<Precision>().is_err());
    }

    #[test]
    fn builder_keeps_settings() {
        let ctx = ExecutionContext::host_gpu()
            .with_precision(Precision::Half)
            .with_seed(7);
        assert!(ctx.is_gpu());
        assert_eq!(ctx.precision(), Precision::Half);
        assert_eq!(ctx.seed(), 7);
        assert!(!ExecutionContext::cpu().is_gpu());
    }
}
