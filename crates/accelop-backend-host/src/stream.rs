use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use accelop::device::{DevicePtr, Stream};
use accelop::spec::{OpError, OpResult};

use crate::device::HostDevice;

static NEXT_STREAM_ID: AtomicUsize = AtomicUsize::new(1);

/// In-order stream over [`HostDevice`] memory.
///
/// Work runs eagerly on the calling thread, so `synchronize` has nothing to
/// wait for.
#[derive(Debug)]
pub struct HostStream {
    device: Arc<HostDevice>,
    id: usize,
}

impl HostStream {
    pub fn new(device: Arc<HostDevice>) -> Self {
        Self {
            device,
            id: NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn device(&self) -> &Arc<HostDevice> {
        &self.device
    }
}

impl Stream for HostStream {
    fn download(&self, dst: &mut [u8], src: DevicePtr) -> OpResult<()> {
        self.device.with_bytes(src, |bytes| {
            let chunk = bytes.get(..dst.len()).ok_or_else(|| {
                OpError::device(format!(
                    "download of {} bytes overruns {src:?}",
                    dst.len()
                ))
            })?;
            dst.copy_from_slice(chunk);
            Ok(())
        })?
    }

    fn synchronize(&self) -> OpResult<()> {
        tracing::trace!(stream = self.id, "host synchronize");
        Ok(())
    }

    fn raw_handle(&self) -> usize {
        self.id
    }
}
