//! Compute devices and batched buffers.
//!
//! A [`Device`] owns flat `f32` storage and executes named kernels on it.
//! Work is recorded through a [`Command`] builder and queued with
//! [`Command::enqueue`]; the device may defer execution until the next
//! transfer, so [`Buffer::download`] is the only synchronization point.
//!
//! # Kernel conventions
//!
//! Binding `0` of every kernel holds its parameters as `u32` words (floats
//! are passed through `f32::to_bits`). Bindings `1..` are buffers. The
//! parameter layout of each kernel is documented in [`kernels`].
//!
//! # Host mirror
//!
//! A [`Buffer`] keeps a host-side copy of its device storage. The two are
//! only made consistent by [`Buffer::upload`] and [`Buffer::download`]:
//! reading the mirror after a kernel wrote the device side, without
//! downloading, returns stale values.

mod host;
pub mod kernels;
#[cfg(feature = "wgpu")]
pub mod wgpu;

pub use host::HostDevice;

use crate::backend::Precision;
use crate::error::DeviceError;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Handle of a device allocation.
pub type BufferId = u64;

/// Something bound to a kernel slot.
#[derive(Debug, Clone, PartialEq)]
pub enum Binding {
    /// A device allocation.
    Buffer(BufferId),
    /// Inline parameter words.
    Bytes(Vec<u32>),
}

/// A fully recorded kernel invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandDesc {
    /// Kernel name.
    pub kernel: &'static str,
    /// Bindings by slot.
    pub bindings: BTreeMap<u32, Binding>,
    /// Number of threads to launch.
    pub threads: usize,
}

impl CommandDesc {
    /// Parameter words bound at slot `0`.
    pub fn params(&self) -> &[u32] {
        match self.bindings.get(&0) {
            Some(Binding::Bytes(words)) => words,
            _ => &[],
        }
    }

    /// Buffer bound at `index`.
    pub fn buffer(&self, index: u32) -> Result<BufferId, DeviceError> {
        match self.bindings.get(&index) {
            Some(Binding::Buffer(id)) => Ok(*id),
            _ => Err(DeviceError::MissingBinding {
                kernel: self.kernel.to_string(),
                index,
            }),
        }
    }
}

/// A compute device.
///
/// Implementations must be usable from several layers at once, hence the
/// shared-reference API.
pub trait Device: Send + Sync {
    /// Human readable name.
    fn name(&self) -> &str;

    /// Allocates a zeroed buffer of `len` elements.
    fn allocate(&self, len: usize) -> Result<BufferId, DeviceError>;

    /// Frees an allocation. Unknown handles are ignored.
    fn release(&self, id: BufferId);

    /// Copies `data` to the device. Ordered after every queued command.
    fn write(&self, id: BufferId, data: &[f32]) -> Result<(), DeviceError>;

    /// Copies the device storage into `out` once every queued command ran.
    fn read(&self, id: BufferId, out: &mut [f32]) -> Result<(), DeviceError>;

    /// Queues a kernel invocation.
    fn submit(&self, command: CommandDesc) -> Result<(), DeviceError>;

    /// Waits for every queued command.
    fn synchronize(&self) -> Result<(), DeviceError>;
}

impl dyn Device {
    /// Starts recording an invocation of `kernel`.
    pub fn create_command(&self, kernel: &'static str) -> Command<'_> {
        Command {
            device: self,
            desc: CommandDesc {
                kernel,
                bindings: BTreeMap::new(),
                threads: 0,
            },
        }
    }
}

/// Builder of a kernel invocation.
#[must_use = "a command does nothing until it is enqueued"]
pub struct Command<'a> {
    device: &'a dyn Device,
    desc: CommandDesc,
}

impl Command<'_> {
    /// Binds a buffer at `index`.
    pub fn set_buffer(mut self, index: u32, buffer: &Buffer) -> Self {
        self.desc.bindings.insert(index, Binding::Buffer(buffer.id()));
        self
    }

    /// Binds inline parameter words at `index`.
    pub fn set_bytes(mut self, index: u32, words: &[u32]) -> Self {
        self.desc.bindings.insert(index, Binding::Bytes(words.to_vec()));
        self
    }

    /// Number of threads to launch.
    pub fn dispatch_threads(mut self, threads: usize) -> Self {
        self.desc.threads = threads;
        self
    }

    /// Queues the invocation on the device.
    pub fn enqueue(self) -> Result<(), DeviceError> {
        log::debug!(
            "enqueue `{}` on {} ({} threads)",
            self.desc.kernel,
            self.device.name(),
            self.desc.threads
        );
        self.device.submit(self.desc)
    }
}

/// Batched `f32` array with a host mirror and a device allocation.
///
/// The device storage is freed when the buffer is dropped.
pub struct Buffer {
    device: Arc<dyn Device>,
    id: BufferId,
    precision: Precision,
    host: Vec<f32>,
}

impl Buffer {
    /// Allocates `len` zeroed elements on `device`.
    pub fn new(
        device: &Arc<dyn Device>,
        len: usize,
        precision: Precision,
    ) -> Result<Self, DeviceError> {
        let id = device.allocate(len)?;
        Ok(Self {
            device: Arc::clone(device),
            id,
            precision,
            host: vec![0.0; len],
        })
    }

    /// Allocates a buffer and uploads `data` into it.
    pub fn from_slice(
        device: &Arc<dyn Device>,
        data: &[f32],
        precision: Precision,
    ) -> Result<Self, DeviceError> {
        let mut buffer = Self::new(device, data.len(), precision)?;
        buffer.host.copy_from_slice(data);
        buffer.upload()?;
        Ok(buffer)
    }

    /// Device handle.
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.host.len()
    }

    /// Whether the buffer holds no element.
    pub fn is_empty(&self) -> bool {
        self.host.is_empty()
    }

    /// Host mirror, as of the last transfer.
    pub fn host(&self) -> &[f32] {
        &self.host
    }

    /// Mutable host mirror. Changes reach the device on the next upload.
    pub fn host_mut(&mut self) -> &mut [f32] {
        &mut self.host
    }

    /// Copies the host mirror to the device.
    ///
    /// With [`Precision::Half`] the mirror is rounded to binary16 first, so
    /// both sides hold the same values afterwards.
    pub fn upload(&mut self) -> Result<(), DeviceError> {
        if self.precision == Precision::Half {
            self.host.iter_mut().for_each(|x| *x = round_to_half(*x));
        }
        self.device.write(self.id, &self.host)
    }

    /// Copies the device storage to the host mirror, waiting for queued work.
    pub fn download(&mut self) -> Result<(), DeviceError> {
        self.device.read(self.id, &mut self.host)
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.device.release(self.id);
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("device", &self.device.name())
            .field("id", &self.id)
            .field("len", &self.host.len())
            .finish()
    }
}

/// Downloads several buffers.
pub fn download(buffers: &mut [&mut Buffer]) -> Result<(), DeviceError> {
    buffers.iter_mut().try_for_each(|buffer| buffer.download())
}

/// Rounds `x` to the nearest binary16 value (ties to even), kept as `f32`.
pub fn round_to_half(x: f32) -> f32 {
    const MIN_NORMAL: f32 = 6.103_515_6e-5;
    const SUBNORMAL_STEP: f32 = 5.960_464_5e-8;
    const OVERFLOW: f32 = 65_520.0;

    if !x.is_finite() || x == 0.0 {
        return x;
    }
    let abs = x.abs();
    if abs >= OVERFLOW {
        return f32::INFINITY.copysign(x);
    }
    if abs < MIN_NORMAL {
        return (x / SUBNORMAL_STEP).round_ties_even() * SUBNORMAL_STEP;
    }
    let bits = x.to_bits();
    let lsb = (bits >> 13) & 1;
    f32::from_bits((bits + 0x0fff + lsb) & !0x1fff)
}

/// Rounds `x` when `half` is set.
#[inline]
pub(crate) fn store(x: f32, half: bool) -> f32 {
    if half { round_to_half(x) } else { x }
}
