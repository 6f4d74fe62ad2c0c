use super::kernels::{self, Kernel};
use super::{BufferId, CommandDesc, Device};
use crate::error::DeviceError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Device executing kernels on host memory.
///
/// Commands are queued by [`Device::submit`] and run, in order, at the next
/// transfer (`write`, `read`) or [`Device::synchronize`]. This mirrors the
/// asynchronous queue of a real GPU: until a download happens, the host
/// mirror of a buffer does not see what the kernels wrote.
///
/// A failing command ends the flush with its error: the commands queued
/// after it are discarded, not retried.
#[derive(Debug, Default)]
pub struct HostDevice {
    storage: Mutex<HashMap<BufferId, Vec<f32>>>,
    queue: Mutex<Vec<CommandDesc>>,
    next_id: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl HostDevice {
    /// Creates an empty device.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued commands not executed yet.
    pub fn pending(&self) -> usize {
        lock(&self.queue).len()
    }

    fn flush(&self) -> Result<(), DeviceError> {
        let commands = std::mem::take(&mut *lock(&self.queue));
        if commands.is_empty() {
            return Ok(());
        }
        log::trace!("host device: running {} queued commands", commands.len());
        let mut storage = lock(&self.storage);
        for (index, command) in commands.iter().enumerate() {
            let result = kernels::lookup(command.kernel)
                .and_then(|kernel| execute(kernel, command, &mut storage));
            if let Err(err) = result {
                log::warn!(
                    "host device: `{}` failed ({err}), discarding {} queued commands",
                    command.kernel,
                    commands.len() - index - 1
                );
                return Err(err);
            }
        }
        Ok(())
    }
}

/// Runs one command. Output buffers are moved out of the storage while the
/// kernel borrows the inputs, then put back whatever the outcome.
fn execute(
    kernel: &Kernel,
    command: &CommandDesc,
    storage: &mut HashMap<BufferId, Vec<f32>>,
) -> Result<(), DeviceError> {
    let mut taken = Vec::with_capacity(kernel.outputs.len());
    let mut result = Ok(());
    for &index in kernel.outputs {
        match command
            .buffer(index)
            .and_then(|id| storage.remove(&id).map(|data| (id, data)).ok_or(DeviceError::UnknownBuffer(id)))
        {
            Ok(entry) => taken.push(entry),
            Err(err) => {
                result = Err(err);
                break;
            }
        }
    }

    if result.is_ok() {
        result = kernel
            .inputs
            .iter()
            .map(|&index| {
                let id = command.buffer(index)?;
                storage
                    .get(&id)
                    .map(Vec::as_slice)
                    .ok_or(DeviceError::UnknownBuffer(id))
            })
            .collect::<Result<Vec<_>, _>>()
            .and_then(|inputs| {
                let mut outputs: Vec<&mut [f32]> =
                    taken.iter_mut().map(|(_, data)| data.as_mut_slice()).collect();
                (kernel.run)(command.params(), &inputs, &mut outputs)
            });
    }

    for (id, data) in taken {
        storage.insert(id, data);
    }
    result
}

impl Device for HostDevice {
    fn name(&self) -> &str {
        "host"
    }

    fn allocate(&self, len: usize) -> Result<BufferId, DeviceError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.storage).insert(id, vec![0.0; len]);
        log::debug!("host device: allocated buffer {id} ({len} elements)");
        Ok(id)
    }

    fn release(&self, id: BufferId) {
        if let Err(err) = self.flush() {
            log::warn!("host device: queued work failed before release of {id}: {err}");
        }
        lock(&self.storage).remove(&id);
    }

    fn write(&self, id: BufferId, data: &[f32]) -> Result<(), DeviceError> {
        self.flush()?;
        let mut storage = lock(&self.storage);
        let dst = storage.get_mut(&id).ok_or(DeviceError::UnknownBuffer(id))?;
        if dst.len() != data.len() {
            return Err(DeviceError::Size {
                expected: dst.len(),
                actual: data.len(),
            });
        }
        dst.copy_from_slice(data);
        Ok(())
    }

    fn read(&self, id: BufferId, out: &mut [f32]) -> Result<(), DeviceError> {
        self.flush()?;
        let storage = lock(&self.storage);
        let src = storage.get(&id).ok_or(DeviceError::UnknownBuffer(id))?;
        if src.len() != out.len() {
            return Err(DeviceError::Size {
                expected: src.len(),
                actual: out.len(),
            });
        }
        out.copy_from_slice(src);
        Ok(())
    }

    fn submit(&self, command: CommandDesc) -> Result<(), DeviceError> {
        kernels::lookup(command.kernel)?;
        lock(&self.queue).push(command);
        Ok(())
    }

    fn synchronize(&self) -> Result<(), DeviceError> {
        self.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Precision;
    use crate::device::Buffer;
    use std::sync::Arc;

    #[test]
    fn queued_until_download() {
        let device: Arc<dyn Device> = Arc::new(HostDevice::new());
        let src = Buffer::from_slice(&device, &[1.0, 2.0, 3.0], Precision::Float).unwrap();
        let mut dst = Buffer::new(&device, 3, Precision::Float).unwrap();
        device
            .create_command("copy")
            .set_bytes(0, &[3, 0])
            .set_buffer(1, &src)
            .set_buffer(2, &dst)
            .dispatch_threads(3)
            .enqueue()
            .unwrap();

        // stale mirror
        assert_eq!(dst.host(), &[0.0, 0.0, 0.0]);
        dst.download().unwrap();
        assert_eq!(dst.host(), &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn unknown_kernel_rejected_at_submit() {
        let device: Arc<dyn Device> = Arc::new(HostDevice::new());
        let err = device.create_command("nope").enqueue().unwrap_err();
        assert_eq!(err, DeviceError::UnknownKernel("nope".into()));
    }

    #[test]
    fn missing_binding_keeps_storage() {
        let host = HostDevice::new();
        let id = host.allocate(2).unwrap();
        let mut command = CommandDesc {
            kernel: "add",
            bindings: Default::default(),
            threads: 2,
        };
        command.bindings.insert(0, super::super::Binding::Bytes(vec![2, 0]));
        command.bindings.insert(2, super::super::Binding::Buffer(id));
        host.submit(command).unwrap();
        assert!(host.synchronize().is_err());
        let mut out = [1.0; 2];
        host.read(id, &mut out).unwrap();
        assert_eq!(out, [0.0, 0.0]);
    }

    #[test]
    fn failed_flush_discards_later_commands() {
        let host = HostDevice::new();
        let src = host.allocate(2).unwrap();
        let dst = host.allocate(2).unwrap();
        host.write(src, &[4.0, 5.0]).unwrap();

        let mut broken = CommandDesc {
            kernel: "add",
            bindings: Default::default(),
            threads: 2,
        };
        broken.bindings.insert(0, super::super::Binding::Bytes(vec![2, 0]));
        broken.bindings.insert(2, super::super::Binding::Buffer(dst));
        let mut copy = CommandDesc {
            kernel: "copy",
            bindings: Default::default(),
            threads: 2,
        };
        copy.bindings.insert(0, super::super::Binding::Bytes(vec![2, 0]));
        copy.bindings.insert(1, super::super::Binding::Buffer(src));
        copy.bindings.insert(2, super::super::Binding::Buffer(dst));
        host.submit(broken).unwrap();
        host.submit(copy).unwrap();
        assert_eq!(host.pending(), 2);

        assert!(host.synchronize().is_err());
        assert_eq!(host.pending(), 0);
        let mut out = [1.0; 2];
        host.read(dst, &mut out).unwrap();
        assert_eq!(out, [0.0, 0.0]);
    }

    #[test]
    fn release_frees_storage() {
        let device: Arc<dyn Device> = Arc::new(HostDevice::new());
        let buffer = Buffer::new(&device, 8, Precision::Float).unwrap();
        let id = buffer.id();
        drop(buffer);
        let mut out = [0.0; 8];
        assert_eq!(device.read(id, &mut out), Err(DeviceError::UnknownBuffer(id)));
    }
}
