//! Error types of the graph engine.
//!
//! Every fallible operation returns [`Result`], whose error is a
//! [`GraphError`]. Failures raised by a compute device are wrapped in
//! [`DeviceError`] and convert into [`GraphError::Device`] through `?`.
//!
//! Structural violations of the graph (branches of a merge that disagree on
//! their down-sampling factor) are not errors: they panic.

use crate::layer::LayerId;
use thiserror::Error;

/// Failures raised by a [`Device`](crate::device::Device) implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    /// No kernel has been registered under this name.
    #[error("no kernel named `{0}` on this device")]
    UnknownKernel(String),
    /// A binding the kernel reads from was never set on the command.
    #[error("kernel `{kernel}` expects a binding at index {index}")]
    MissingBinding {
        /// Kernel name.
        kernel: String,
        /// Binding index.
        index: u32,
    },
    /// The buffer handle does not belong to this device (or was released).
    #[error("buffer {0} is not allocated on this device")]
    UnknownBuffer(u64),
    /// A transfer or a kernel argument does not have the expected length.
    #[error("expected {expected} elements, got {actual}")]
    Size {
        /// Expected number of elements.
        expected: usize,
        /// Actual number of elements.
        actual: usize,
    },
    /// An error in requesting the adapter.
    #[error("adapter error: {0}")]
    Adapter(String),
    /// An error in requesting the device.
    #[error("device error: {0}")]
    Device(String),
    /// Mapping a staging buffer back to the host failed.
    #[error("buffer mapping failed: {0}")]
    Map(String),
}

/// Failures of the layer graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// Batch size is zero or exceeds the allocated state.
    #[error("batch size is not coherent with the allocated state")]
    BatchSize,
    /// Data length does not match the layer shape.
    #[error("data does not have the expected number of elements")]
    DataSize,
    /// The layer state was read before the producing pass ran this step.
    #[error("layer {0} has not been computed during this step")]
    Dirty(LayerId),
    /// Invalid static configuration.
    #[error("invalid layer configuration: {0}")]
    Init(String),
    /// Link resolution failed.
    #[error("no layer with id {0}")]
    UnknownLayer(LayerId),
    /// `backward` already ran during this step.
    #[error("backward already ran during this step, call `update_kernel` first")]
    BackwardReplay,
    /// Device failure.
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Crate-wide result alias.
pub type Result<T> = core::result::Result<T, GraphError>;
