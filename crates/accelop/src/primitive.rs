//! Contract with the vendor tensor-permutation primitive.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::device::{DevicePtr, Stream};
use crate::layout::TensorLayout;
use crate::spec::{DType, OpError, OpResult};

/// Elementwise operator applied to a tensor as it is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Identity,
}

/// Borrowed tensor descriptor handed to the primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorDescriptor<'a> {
    pub extents: &'a [i64],
    pub strides: &'a [i64],
    pub dtype: DType,
    pub op: UnaryOp,
}

impl<'a> TensorDescriptor<'a> {
    pub fn new(layout: &'a TensorLayout, dtype: DType) -> Self {
        Self {
            extents: layout.extents(),
            strides: layout.strides(),
            dtype,
            op: UnaryOp::Identity,
        }
    }

    pub fn rank(&self) -> usize {
        self.extents.len()
    }
}

/// Host-side scalar operand encoded in the bit pattern of its dtype.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scalar {
    dtype: DType,
    bytes: [u8; 8],
}

impl Scalar {
    /// Multiplicative identity of `dtype`.
    pub fn one(dtype: DType) -> OpResult<Self> {
        let mut bytes = [0u8; 8];
        match dtype {
            DType::F16 => bytes[..2].copy_from_slice(&0x3C00u16.to_le_bytes()),
            DType::Bf16 => bytes[..2].copy_from_slice(&0x3F80u16.to_le_bytes()),
            DType::F32 => bytes[..4].copy_from_slice(&1.0f32.to_le_bytes()),
            DType::F64 => bytes.copy_from_slice(&1.0f64.to_le_bytes()),
            dtype if dtype.is_permutation_index() => bytes[0] = 1,
            other => {
                return Err(OpError::unsupported_type(
                    other,
                    "no multiplicative identity encoding for permutation scaling",
                ))
            }
        }
        Ok(Self { dtype, bytes })
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Little-endian encoding, exactly `size_in_bytes(dtype)` long.
    pub fn as_bytes(&self) -> &[u8] {
        let len = self.dtype.size_in_bytes().unwrap_or(self.bytes.len());
        &self.bytes[..len]
    }
}

/// Non-success status reported by a permutation primitive.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("status {status}: {message}")]
pub struct PrimitiveError {
    pub status: i32,
    pub message: String,
}

impl PrimitiveError {
    pub fn new(status: i32, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

/// Arguments for one permutation: `output[modes_out] = alpha * op(input[modes_in])`.
#[derive(Debug, Clone, Copy)]
pub struct PermutationCall<'a> {
    pub alpha: &'a Scalar,
    pub input: DevicePtr,
    pub input_desc: TensorDescriptor<'a>,
    pub input_modes: &'a [i32],
    pub output: DevicePtr,
    pub output_desc: TensorDescriptor<'a>,
    pub output_modes: &'a [i32],
    pub compute_type: DType,
}

/// Vendor tensor-permutation primitive.
pub trait PermutationPrimitive: Send + Sync {
    fn name(&self) -> &str;

    /// Enqueues the permutation on `stream`.
    fn permute(&self, call: &PermutationCall<'_>, stream: &dyn Stream) -> Result<(), PrimitiveError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_is_encoded_per_dtype() {
        assert_eq!(Scalar::one(DType::F32).unwrap().as_bytes(), &1.0f32.to_le_bytes());
        assert_eq!(Scalar::one(DType::F64).unwrap().as_bytes(), &1.0f64.to_le_bytes());
        assert_eq!(Scalar::one(DType::F16).unwrap().as_bytes(), &[0x00, 0x3C]);
        assert_eq!(Scalar::one(DType::Bf16).unwrap().as_bytes(), &[0x80, 0x3F]);
        assert_eq!(Scalar::one(DType::Ui16).unwrap().as_bytes(), &[1, 0]);
        assert_eq!(Scalar::one(DType::Si64).unwrap().as_bytes(), &1i64.to_le_bytes());
    }

    #[test]
    fn one_rejects_types_without_identity() {
        for dtype in [DType::I1, DType::Si4, DType::Fp8E4M3, DType::Cf32] {
            assert!(matches!(
                Scalar::one(dtype),
                Err(OpError::UnsupportedType { .. })
            ));
        }
    }
}
