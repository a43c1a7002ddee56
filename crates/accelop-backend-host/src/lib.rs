//! Host-memory execution context for accelop operators.
//!
//! Device allocations are plain host buffers and the permutation primitive is
//! a straightforward strided copy, which makes this backend the reference the
//! accelerator backends are checked against.

pub mod context;
pub mod device;
pub mod permute;
pub mod stream;

pub use context::HostContext;
pub use device::HostDevice;
pub use permute::HostPermutation;
pub use stream::HostStream;
