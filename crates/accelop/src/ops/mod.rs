//! Accelerator operator adapters.

pub mod transpose;

pub use transpose::{PermutationSource, TransposeOp, TRANSPOSE_OP_TYPE};

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::device::{DevicePtr, ExecutionContext};
use crate::layout::TensorLayout;
use crate::registry::OperatorRegistry;
use crate::spec::{DType, OpResult};

/// Registers every operator shipped with this crate.
pub fn register_builtins(registry: &OperatorRegistry) {
    transpose::register(registry);
}

/// Static description of one operator tensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorBinding {
    pub dtype: DType,
    pub layout: TensorLayout,
}

impl TensorBinding {
    /// Bytes the caller must provide for this tensor.
    pub fn byte_len(&self) -> Option<usize> {
        let count = usize::try_from(self.layout.element_count()).ok()?;
        count.checked_mul(self.dtype.size_in_bytes()?)
    }
}

/// Tensors an operator expects at execution time, fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticLayout {
    pub inputs: Vec<TensorBinding>,
    pub outputs: Vec<TensorBinding>,
}

/// Operator instance bound to a single graph node.
///
/// Construction does all graph-dependent work; `execute` only touches device
/// memory and the primitive exposed by the context. Implementations hold no
/// per-call mutable state, so one instance may serve concurrent requests.
pub trait Operator: Send + Sync + fmt::Debug {
    fn op_type(&self) -> &str;

    fn describe(&self) -> StaticLayout;

    fn execute(
        &self,
        ctx: &dyn ExecutionContext,
        inputs: &[DevicePtr],
        outputs: &[DevicePtr],
    ) -> OpResult<()>;
}
