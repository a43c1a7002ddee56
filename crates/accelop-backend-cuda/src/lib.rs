//! CUDA execution context: driver API and cuTENSOR are both loaded at runtime
//! with `libloading`, so the crate builds and links without a CUDA toolkit.

pub mod context;
pub mod cutensor;
pub mod driver;

pub use context::CudaContext;
pub use cutensor::CuTensor;
pub use driver::{CudaDriver, CudaStream};
