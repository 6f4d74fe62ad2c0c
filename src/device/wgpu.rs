//! GPU device using WGPU.
//!
//! Every kernel of the host table has a WGSL counterpart in `shaders/`,
//! with the same bindings and parameter words. Pipelines are compiled on
//! first use and cached per device; the bind group layout is derived from
//! the shader.
//!
//! Commands are encoded and submitted to the queue as soon as they are
//! enqueued. Reads go through a staging buffer and block on
//! `PollType::Wait`.

use super::kernels;
use super::{BufferId, CommandDesc, Device};
use crate::error::DeviceError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, mpsc};
use wgpu::util::DeviceExt;

const WORKGROUP_SIZE: usize = 64;
const MAX_WORKGROUPS: usize = 65_535;

lazy_static::lazy_static! {
    static ref SOURCES: HashMap<&'static str, &'static str> = [
        ("copy", include_str!("shaders/copy.wgsl")),
        ("add", include_str!("shaders/add.wgsl")),
        ("linear_forward", include_str!("shaders/linear_forward.wgsl")),
        ("linear_backward", include_str!("shaders/linear_backward.wgsl")),
        ("linear_weights", include_str!("shaders/linear_weights.wgsl")),
        ("conv_forward", include_str!("shaders/conv_forward.wgsl")),
        ("conv_backward", include_str!("shaders/conv_backward.wgsl")),
        ("conv_weights", include_str!("shaders/conv_weights.wgsl")),
        ("activation_forward", include_str!("shaders/activation_forward.wgsl")),
        ("activation_backward", include_str!("shaders/activation_backward.wgsl")),
        ("concat_forward", include_str!("shaders/concat_forward.wgsl")),
        ("concat_backward", include_str!("shaders/concat_backward.wgsl")),
        ("mse_derivative", include_str!("shaders/mse_derivative.wgsl")),
        ("sgd", include_str!("shaders/sgd.wgsl")),
    ]
    .into_iter()
    .collect();
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn to_bytes(data: &[f32]) -> Vec<u8> {
    data.iter().flat_map(|x| x.to_le_bytes()).collect()
}

/// Workgroup grid covering `threads`, split on `y` past the `x` limit.
fn workgroups(threads: usize) -> (u32, u32) {
    let groups = threads.div_ceil(WORKGROUP_SIZE).max(1);
    let x = groups.min(MAX_WORKGROUPS);
    (x as u32, groups.div_ceil(x) as u32)
}

/// Holds the WGPU device and queue, plus the allocations and pipelines
/// created on them.
pub struct WgpuDevice {
    name: String,
    device: wgpu::Device,
    queue: wgpu::Queue,
    buffers: Mutex<HashMap<BufferId, wgpu::Buffer>>,
    pipelines: Mutex<HashMap<&'static str, wgpu::ComputePipeline>>,
    next_id: AtomicU64,
}

impl WgpuDevice {
    /// Selects the default adapter and creates a device + queue.
    ///
    /// Uses `pollster::block_on` to wait for the async WGPU calls.
    pub fn new() -> Result<Self, DeviceError> {
        let instance = wgpu::Instance::default();
        let adapter =
            pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions::default()))
                .map_err(|err| DeviceError::Adapter(err.to_string()))?;
        let name = adapter.get_info().name;
        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("briny_graph"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::default(),
        }))
        .map_err(|err| DeviceError::Device(err.to_string()))?;
        log::info!("wgpu device ready on `{name}`");

        Ok(Self {
            name,
            device,
            queue,
            buffers: Mutex::new(HashMap::new()),
            pipelines: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        })
    }

    fn create_pipeline(&self, kernel: &'static str) -> Result<wgpu::ComputePipeline, DeviceError> {
        let source = SOURCES
            .get(kernel)
            .ok_or_else(|| DeviceError::UnknownKernel(kernel.to_string()))?;
        log::debug!("compiling `{kernel}` pipeline");
        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(kernel),
            source: wgpu::ShaderSource::Wgsl((*source).into()),
        });
        Ok(self.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(kernel),
            layout: None,
            module: &module,
            entry_point: Some("main"),
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            cache: None,
        }))
    }

    fn wait(&self) -> Result<(), DeviceError> {
        self.device
            .poll(wgpu::PollType::Wait)
            .map(|_| ())
            .map_err(|err| DeviceError::Map(err.to_string()))
    }
}

impl Device for WgpuDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn allocate(&self, len: usize) -> Result<BufferId, DeviceError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        // zero-sized storage bindings are invalid
        let size = (len.max(1) * 4) as u64;
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: None,
            size,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        lock(&self.buffers).insert(id, buffer);
        log::debug!("wgpu device: allocated buffer {id} ({len} elements)");
        Ok(id)
    }

    fn release(&self, id: BufferId) {
        if let Some(buffer) = lock(&self.buffers).remove(&id) {
            buffer.destroy();
        }
    }

    fn write(&self, id: BufferId, data: &[f32]) -> Result<(), DeviceError> {
        let buffers = lock(&self.buffers);
        let buffer = buffers.get(&id).ok_or(DeviceError::UnknownBuffer(id))?;
        let capacity = (buffer.size() / 4) as usize;
        if data.len() > capacity {
            return Err(DeviceError::Size {
                expected: capacity,
                actual: data.len(),
            });
        }
        if !data.is_empty() {
            self.queue.write_buffer(buffer, 0, &to_bytes(data));
        }
        Ok(())
    }

    fn read(&self, id: BufferId, out: &mut [f32]) -> Result<(), DeviceError> {
        if out.is_empty() {
            return Ok(());
        }
        let buffers = lock(&self.buffers);
        let buffer = buffers.get(&id).ok_or(DeviceError::UnknownBuffer(id))?;
        let size = (out.len() * 4) as u64;
        if size > buffer.size() {
            return Err(DeviceError::Size {
                expected: (buffer.size() / 4) as usize,
                actual: out.len(),
            });
        }

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("download"),
            });
        encoder.copy_buffer_to_buffer(buffer, 0, &staging, 0, size);
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (sender, receiver) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.wait()?;
        receiver
            .recv()
            .map_err(|err| DeviceError::Map(err.to_string()))?
            .map_err(|err| DeviceError::Map(err.to_string()))?;

        {
            let view = slice.get_mapped_range();
            for (dst, chunk) in out.iter_mut().zip(view.chunks_exact(4)) {
                *dst = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            }
        }
        staging.unmap();
        Ok(())
    }

    fn submit(&self, command: CommandDesc) -> Result<(), DeviceError> {
        let kernel = kernels::lookup(command.kernel)?;
        if command.threads == 0 {
            return Ok(());
        }

        let mut pipelines = lock(&self.pipelines);
        if !pipelines.contains_key(command.kernel) {
            let pipeline = self.create_pipeline(command.kernel)?;
            pipelines.insert(command.kernel, pipeline);
        }
        let pipeline = pipelines
            .get(command.kernel)
            .ok_or_else(|| DeviceError::UnknownKernel(command.kernel.to_string()))?;

        let mut words = command.params().to_vec();
        if words.is_empty() {
            words.push(0);
        }
        let params: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        let params_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("params"),
                contents: &params,
                usage: wgpu::BufferUsages::STORAGE,
            });

        let buffers = lock(&self.buffers);
        let mut bound = Vec::with_capacity(kernel.inputs.len() + kernel.outputs.len());
        for &index in kernel.inputs.iter().chain(kernel.outputs) {
            let id = command.buffer(index)?;
            let buffer = buffers.get(&id).ok_or(DeviceError::UnknownBuffer(id))?;
            bound.push((index, buffer));
        }
        let mut entries = vec![wgpu::BindGroupEntry {
            binding: 0,
            resource: params_buffer.as_entire_binding(),
        }];
        entries.extend(bound.iter().map(|(index, buffer)| wgpu::BindGroupEntry {
            binding: *index,
            resource: buffer.as_entire_binding(),
        }));

        let layout = pipeline.get_bind_group_layout(0);
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(command.kernel),
            layout: &layout,
            entries: &entries,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(command.kernel),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(command.kernel),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            let (x, y) = workgroups(command.threads);
            pass.dispatch_workgroups(x, y, 1);
        }
        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn synchronize(&self) -> Result<(), DeviceError> {
        self.wait()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workgroup_grid_covers_threads() {
        assert_eq!(workgroups(1), (1, 1));
        assert_eq!(workgroups(64), (1, 1));
        assert_eq!(workgroups(65), (2, 1));
        let (x, y) = workgroups(MAX_WORKGROUPS * WORKGROUP_SIZE * 3 + 1);
        assert_eq!(x as usize, MAX_WORKGROUPS);
        assert_eq!(y, 4);
    }

    #[test]
    fn every_kernel_has_a_shader() {
        for name in kernels::names() {
            let source = SOURCES.get(name).unwrap();
            assert!(source.contains("fn main"), "{name}");
        }
    }
}
