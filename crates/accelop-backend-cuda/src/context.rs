use std::sync::Arc;

use accelop::config::PluginConfig;
use accelop::device::{DeviceMemory, DevicePtr, ExecutionContext, Stream};
use accelop::primitive::PermutationPrimitive;
use accelop::spec::OpResult;

use crate::cutensor::{self, CuTensor};
use crate::driver::{self, CudaDriver, CudaStream};

/// Execution context on one CUDA device: a private stream plus a cuTENSOR handle.
pub struct CudaContext {
    driver: Arc<CudaDriver>,
    stream: CudaStream,
    cutensor: CuTensor,
    config: PluginConfig,
}

impl CudaContext {
    /// Opens the device named by `config` and loads cuTENSOR.
    pub fn new(config: PluginConfig) -> OpResult<Self> {
        let driver = Arc::new(CudaDriver::open(config.device_ordinal)?);
        Self::with_driver(driver, config)
    }

    /// Context on the process-wide driver, configured from the environment.
    pub fn from_env() -> OpResult<Self> {
        Self::with_driver(driver::driver()?, PluginConfig::global().clone())
    }

    fn with_driver(driver: Arc<CudaDriver>, config: PluginConfig) -> OpResult<Self> {
        let stream = CudaStream::new(Arc::clone(&driver))?;
        let cutensor = CuTensor::new(Arc::clone(&driver), config.cutensor_library.as_deref())?;
        tracing::debug!(
            ordinal = driver.ordinal(),
            stream = format_args!("{:#x}", stream.raw_handle()),
            "created CUDA execution context"
        );
        Ok(Self {
            driver,
            stream,
            cutensor,
            config,
        })
    }

    /// Whether both the CUDA driver and cuTENSOR libraries can be loaded.
    pub fn is_available() -> bool {
        driver::driver_library_present()
            && cutensor::library_present(PluginConfig::global().cutensor_library.as_deref())
    }
}

impl ExecutionContext for CudaContext {
    fn stream(&self) -> &dyn Stream {
        &self.stream
    }

    fn permutation(&self) -> &dyn PermutationPrimitive {
        &self.cutensor
    }

    fn config(&self) -> &PluginConfig {
        &self.config
    }
}

impl DeviceMemory for CudaContext {
    fn alloc(&self, bytes: usize) -> OpResult<DevicePtr> {
        self.driver.alloc(bytes)
    }

    fn write(&self, ptr: DevicePtr, bytes: &[u8]) -> OpResult<()> {
        self.driver.write(ptr, bytes)
    }

    /// Waits for queued work on the context's stream before copying.
    fn read(&self, ptr: DevicePtr) -> OpResult<Vec<u8>> {
        self.stream.synchronize()?;
        self.driver.download(ptr)
    }

    fn free(&self, ptr: DevicePtr) -> OpResult<()> {
        self.driver.free(ptr)
    }
}
