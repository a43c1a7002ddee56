//! Simulated device memory backed by host allocations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use accelop::device::{DeviceMemory, DevicePtr};
use accelop::spec::{OpError, OpResult};

const BASE_ADDR: u64 = 0x7f00_0000_0000;
const ALIGNMENT: u64 = 256;

/// Address-keyed host buffers standing in for device allocations.
///
/// Handles must point at the start of an allocation; interior pointers are
/// rejected like unknown addresses.
#[derive(Debug)]
pub struct HostDevice {
    buffers: Mutex<HashMap<u64, Vec<u8>>>,
    next_addr: AtomicU64,
}

impl Default for HostDevice {
    fn default() -> Self {
        Self {
            buffers: Mutex::new(HashMap::new()),
            next_addr: AtomicU64::new(BASE_ADDR),
        }
    }
}

impl HostDevice {
    pub fn new() -> Self {
        Self::default()
    }

    fn buffers(&self) -> MutexGuard<'_, HashMap<u64, Vec<u8>>> {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of live allocations.
    pub fn allocation_count(&self) -> usize {
        self.buffers().len()
    }

    /// Runs `f` over the allocation behind `ptr`.
    pub fn with_bytes<R>(&self, ptr: DevicePtr, f: impl FnOnce(&[u8]) -> R) -> OpResult<R> {
        let buffers = self.buffers();
        let buffer = buffers
            .get(&ptr.addr())
            .ok_or_else(|| unknown_address(ptr))?;
        Ok(f(buffer))
    }
}

impl DeviceMemory for HostDevice {
    fn alloc(&self, bytes: usize) -> OpResult<DevicePtr> {
        let span = (bytes as u64).max(1).div_ceil(ALIGNMENT) * ALIGNMENT;
        let addr = self.next_addr.fetch_add(span, Ordering::Relaxed);
        self.buffers().insert(addr, vec![0; bytes]);
        tracing::trace!(addr = format_args!("{addr:#x}"), bytes, "host alloc");
        Ok(DevicePtr::new(addr, bytes))
    }

    /// Overwrites the leading `bytes.len()` bytes of the allocation behind `ptr`.
    fn write(&self, ptr: DevicePtr, bytes: &[u8]) -> OpResult<()> {
        let mut buffers = self.buffers();
        let buffer = buffers
            .get_mut(&ptr.addr())
            .ok_or_else(|| unknown_address(ptr))?;
        let dst = buffer.get_mut(..bytes.len()).ok_or_else(|| {
            OpError::device(format!(
                "write of {} bytes overruns {:?}",
                bytes.len(),
                ptr
            ))
        })?;
        dst.copy_from_slice(bytes);
        Ok(())
    }

    fn read(&self, ptr: DevicePtr) -> OpResult<Vec<u8>> {
        self.with_bytes(ptr, <[u8]>::to_vec)
    }

    fn free(&self, ptr: DevicePtr) -> OpResult<()> {
        self.buffers()
            .remove(&ptr.addr())
            .map(drop)
            .ok_or_else(|| unknown_address(ptr))
    }
}

fn unknown_address(ptr: DevicePtr) -> OpError {
    OpError::device(format!("no host allocation at {ptr:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_do_not_overlap() {
        let device = HostDevice::new();
        let a = device.alloc(300).unwrap();
        let b = device.alloc(1).unwrap();
        assert!(b.addr() >= a.addr() + 300);
        assert_eq!(b.addr() % ALIGNMENT, 0);
        assert_eq!(device.allocation_count(), 2);
    }

    #[test]
    fn upload_read_free() {
        let device = HostDevice::new();
        let ptr = device.upload(&[1, 2, 3]).unwrap();
        assert_eq!(device.read(ptr).unwrap(), vec![1, 2, 3]);
        device.free(ptr).unwrap();
        assert!(matches!(device.read(ptr), Err(OpError::Device(_))));
        assert!(device.free(ptr).is_err());
    }

    #[test]
    fn oversized_write_is_rejected() {
        let device = HostDevice::new();
        let ptr = device.alloc(2).unwrap();
        assert!(device.write(ptr, &[0; 3]).is_err());
    }
}
