use std::sync::Arc;

use accelop::config::PluginConfig;
use accelop::device::{DeviceMemory, DevicePtr, ExecutionContext, Stream};
use accelop::primitive::PermutationPrimitive;
use accelop::spec::OpResult;

use crate::device::HostDevice;
use crate::permute::HostPermutation;
use crate::stream::HostStream;

/// Execution context running every operator on the host.
#[derive(Debug)]
pub struct HostContext {
    device: Arc<HostDevice>,
    stream: HostStream,
    primitive: HostPermutation,
    config: PluginConfig,
}

impl Default for HostContext {
    fn default() -> Self {
        Self::with_config(PluginConfig::default())
    }
}

impl HostContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context configured from `ACCELOP_*` environment variables.
    pub fn from_env() -> Self {
        Self::with_config(PluginConfig::global().clone())
    }

    pub fn with_config(config: PluginConfig) -> Self {
        let device = Arc::new(HostDevice::new());
        Self {
            stream: HostStream::new(Arc::clone(&device)),
            primitive: HostPermutation::new(Arc::clone(&device)),
            device,
            config,
        }
    }

    /// Makes every permutation fail with `status`.
    pub fn with_primitive_failure(mut self, status: i32) -> Self {
        self.primitive = HostPermutation::failing(Arc::clone(&self.device), status);
        self
    }

    pub fn device(&self) -> &Arc<HostDevice> {
        &self.device
    }
}

impl ExecutionContext for HostContext {
    fn stream(&self) -> &dyn Stream {
        &self.stream
    }

    fn permutation(&self) -> &dyn PermutationPrimitive {
        &self.primitive
    }

    fn config(&self) -> &PluginConfig {
        &self.config
    }
}

impl DeviceMemory for HostContext {
    fn alloc(&self, bytes: usize) -> OpResult<DevicePtr> {
        self.device.alloc(bytes)
    }

    fn write(&self, ptr: DevicePtr, bytes: &[u8]) -> OpResult<()> {
        self.device.write(ptr, bytes)
    }

    fn read(&self, ptr: DevicePtr) -> OpResult<Vec<u8>> {
        self.device.read(ptr)
    }

    fn free(&self, ptr: DevicePtr) -> OpResult<()> {
        self.device.free(ptr)
    }
}
