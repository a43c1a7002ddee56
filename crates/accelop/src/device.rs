//! Execution-context contract supplied by the host runtime.

use std::fmt;

use crate::config::PluginConfig;
use crate::primitive::PermutationPrimitive;
use crate::spec::OpResult;

/// Untyped device allocation handle passed to operators.
///
/// Operators never own device memory; handles are borrowed from the caller for
/// the duration of one `execute` call.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevicePtr {
    addr: u64,
    bytes: usize,
}

impl DevicePtr {
    pub fn new(addr: u64, bytes: usize) -> Self {
        Self { addr, bytes }
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

impl fmt::Debug for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DevicePtr")
            .field("addr", &format_args!("{:#x}", self.addr))
            .field("bytes", &self.bytes)
            .finish()
    }
}

/// Ordered queue of device work.
pub trait Stream: Send + Sync {
    /// Enqueues a copy of `dst.len()` bytes from `src` into host memory.
    ///
    /// The host buffer is only guaranteed to be filled after [`Stream::synchronize`].
    fn download(&self, dst: &mut [u8], src: DevicePtr) -> OpResult<()>;

    /// Blocks until all previously enqueued work has completed.
    fn synchronize(&self) -> OpResult<()>;

    /// Backend-specific raw stream handle (e.g. a `CUstream`), zero for the default stream.
    fn raw_handle(&self) -> usize;
}

/// Per-request resources an operator executes against.
pub trait ExecutionContext: Send + Sync {
    fn stream(&self) -> &dyn Stream;

    fn permutation(&self) -> &dyn PermutationPrimitive;

    fn config(&self) -> &PluginConfig;
}

/// Explicit device allocations, for hosts and harnesses that stage tensors themselves.
pub trait DeviceMemory: Send + Sync {
    fn alloc(&self, bytes: usize) -> OpResult<DevicePtr>;

    /// Blocking copy of `bytes` into the start of an existing allocation.
    fn write(&self, ptr: DevicePtr, bytes: &[u8]) -> OpResult<()>;

    /// Blocking copy of the whole allocation back to the host.
    fn read(&self, ptr: DevicePtr) -> OpResult<Vec<u8>>;

    fn free(&self, ptr: DevicePtr) -> OpResult<()>;

    /// Allocates and fills a buffer from host memory.
    ///
    /// A failed copy releases the fresh allocation and returns the copy error.
    fn upload(&self, bytes: &[u8]) -> OpResult<DevicePtr> {
        let ptr = self.alloc(bytes.len())?;
        if let Err(err) = self.write(ptr, bytes) {
            if let Err(free_err) = self.free(ptr) {
                tracing::warn!(
                    ptr = ?ptr,
                    error = %free_err,
                    "failed to release device buffer after upload error"
                );
            }
            return Err(err);
        }
        Ok(ptr)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;
    use crate::spec::OpError;

    /// Memory whose writes always fail.
    #[derive(Default)]
    struct RejectingMemory {
        live: Mutex<HashMap<u64, usize>>,
        next: Mutex<u64>,
        fail_free: bool,
    }

    impl DeviceMemory for RejectingMemory {
        fn alloc(&self, bytes: usize) -> OpResult<DevicePtr> {
            let mut next = self.next.lock().unwrap();
            *next += 0x100;
            self.live.lock().unwrap().insert(*next, bytes);
            Ok(DevicePtr::new(*next, bytes))
        }

        fn write(&self, _ptr: DevicePtr, _bytes: &[u8]) -> OpResult<()> {
            Err(OpError::device("copy engine unavailable"))
        }

        fn read(&self, ptr: DevicePtr) -> OpResult<Vec<u8>> {
            Ok(vec![0; ptr.bytes()])
        }

        fn free(&self, ptr: DevicePtr) -> OpResult<()> {
            if self.fail_free {
                return Err(OpError::device("free rejected"));
            }
            self.live.lock().unwrap().remove(&ptr.addr());
            Ok(())
        }
    }

    #[test]
    fn failed_upload_releases_its_allocation() {
        let memory = RejectingMemory::default();
        let err = memory.upload(&[1, 2, 3]).expect_err("write fails");
        assert!(matches!(err, OpError::Device(ref msg) if msg.contains("copy engine")));
        assert!(memory.live.lock().unwrap().is_empty());
    }

    #[test]
    fn failed_release_keeps_the_copy_error() {
        let memory = RejectingMemory {
            fail_free: true,
            ..RejectingMemory::default()
        };
        let err = memory.upload(&[1, 2, 3]).expect_err("write fails");
        assert!(matches!(err, OpError::Device(ref msg) if msg.contains("copy engine")));
        assert_eq!(memory.live.lock().unwrap().len(), 1);
    }
}
