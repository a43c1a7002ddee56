use std::{fmt, sync::Arc};

use serde::{ser::SerializeStruct, Deserialize, Serialize};
use thiserror::Error;

/// Enumerates scalar element types that can cross the plugin boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(clippy::upper_case_acronyms)]
pub enum DType {
    I1,
    Si4,
    Ui4,
    Si8,
    Ui8,
    Si16,
    Ui16,
    Si32,
    Ui32,
    Si64,
    Ui64,
    Fp8E4M3,
    Fp8E5M2,
    Bf16,
    F16,
    F32,
    F64,
    Cf32,
    Cf64,
}

impl DType {
    /// Signed and unsigned integer kinds that can encode an axis permutation.
    pub const PERMUTATION_INDEX_TYPES: [DType; 8] = [
        DType::Si8,
        DType::Si16,
        DType::Si32,
        DType::Si64,
        DType::Ui8,
        DType::Ui16,
        DType::Ui32,
        DType::Ui64,
    ];

    /// Returns `true` for the byte-addressable integer kinds usable as permutation indices.
    pub fn is_permutation_index(self) -> bool {
        Self::PERMUTATION_INDEX_TYPES.contains(&self)
    }

    /// Returns the size in bytes when storage size is well-defined.
    pub fn size_in_bytes(self) -> Option<usize> {
        match self {
            DType::I1 => Some(1),
            DType::Si8 | DType::Ui8 => Some(1),
            DType::Si16 | DType::Ui16 | DType::Bf16 | DType::F16 => Some(2),
            DType::Si32 | DType::Ui32 | DType::F32 => Some(4),
            DType::Si64 | DType::Ui64 | DType::F64 => Some(8),
            DType::Cf32 => Some(8),
            DType::Cf64 => Some(16),
            DType::Si4 | DType::Ui4 | DType::Fp8E4M3 | DType::Fp8E5M2 => None,
        }
    }
}

/// Names a symbolic dynamic dimension (e.g. `?B`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DimSymbol(Arc<str>);

impl DimSymbol {
    pub fn new(name: impl Into<String>) -> Self {
        Self(Arc::<str>::from(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Serialize for DimSymbol {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DimSymbol {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let name = String::deserialize(deserializer)?;
        Ok(DimSymbol::new(name))
    }
}

/// Represents a single axis extent in a tensor shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dimension {
    Static(usize),
    Dynamic(DimSymbol),
}

/// Logical tensor shape as an ordered list of dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    dims: Vec<Dimension>,
}

impl Shape {
    pub fn new(dims: impl Into<Vec<Dimension>>) -> Self {
        Self { dims: dims.into() }
    }

    /// Builds a fully static shape from plain extents.
    pub fn from_static(dims: &[usize]) -> Self {
        Self::new(dims.iter().copied().map(Dimension::Static).collect::<Vec<_>>())
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[Dimension] {
        &self.dims
    }

    /// Returns static dimensions when all dims are static.
    pub fn static_dims(&self) -> Option<Vec<usize>> {
        let mut dims = Vec::with_capacity(self.dims.len());
        for dim in &self.dims {
            match dim {
                Dimension::Static(value) => dims.push(*value),
                Dimension::Dynamic(_) => return None,
            }
        }
        Some(dims)
    }

    /// Returns element count when all dims are static.
    pub fn element_count(&self) -> Option<usize> {
        let dims = self.static_dims()?;
        let mut count = 1usize;
        for dim in dims {
            count = count.checked_mul(dim)?;
        }
        Some(count)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims = self
            .dims
            .iter()
            .map(|dim| match dim {
                Dimension::Static(v) => v.to_string(),
                Dimension::Dynamic(sym) => format!("?{}", sym.as_str()),
            })
            .collect::<Vec<_>>();
        write!(f, "[{}]", dims.join(", "))
    }
}

/// Tensor metadata coupling dtype and shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorSpec {
    pub dtype: DType,
    pub shape: Shape,
}

impl TensorSpec {
    pub fn new(dtype: DType, shape: Shape) -> Self {
        Self { dtype, shape }
    }

    /// Returns total element count when shape is fully static.
    pub fn element_count(&self) -> Option<usize> {
        self.shape.element_count()
    }
}

/// Dense literal tensor payload, little-endian.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorLiteral {
    pub spec: TensorSpec,
    pub bytes: Arc<[u8]>,
}

impl TensorLiteral {
    pub fn new(spec: TensorSpec, bytes: Arc<[u8]>) -> Self {
        Self { spec, bytes }
    }

    /// Encodes a rank-1 integer literal holding `values` as `dtype`.
    ///
    /// Values outside the range of `dtype` are rejected rather than wrapped.
    pub fn from_i64s(dtype: DType, values: &[i64]) -> OpResult<Self> {
        let width = integer_width(dtype)?;
        let mut bytes = Vec::with_capacity(values.len() * width);
        for &value in values {
            encode_integer(dtype, value, &mut bytes)?;
        }
        let spec = TensorSpec::new(dtype, Shape::from_static(&[values.len()]));
        Ok(Self::new(spec, Arc::from(bytes)))
    }

    /// Encodes a dense f32 literal of the given shape.
    pub fn from_f32s(shape: Shape, values: &[f32]) -> OpResult<Self> {
        let spec = TensorSpec::new(DType::F32, shape);
        if spec.element_count() != Some(values.len()) {
            return Err(OpError::invalid_graph(format!(
                "f32 literal holds {} values for shape {}",
                values.len(),
                spec.shape
            )));
        }
        let bytes = values
            .iter()
            .flat_map(|value| value.to_le_bytes())
            .collect::<Vec<u8>>();
        Ok(Self::new(spec, Arc::from(bytes)))
    }

    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    /// Decodes every element of an integer literal into `i64`.
    pub fn to_i64_vec(&self) -> OpResult<Vec<i64>> {
        let mut out = Vec::new();
        decode_integers(self.spec.dtype, &self.bytes, &mut out)?;
        Ok(out)
    }
}

impl Serialize for TensorLiteral {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut state = serializer.serialize_struct("TensorLiteral", 2)?;
        state.serialize_field("spec", &self.spec)?;
        state.serialize_field("bytes", &self.bytes.as_ref())?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for TensorLiteral {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct TensorLiteralHelper {
            spec: TensorSpec,
            bytes: Vec<u8>,
        }

        let helper = TensorLiteralHelper::deserialize(deserializer)?;
        Ok(TensorLiteral {
            spec: helper.spec,
            bytes: Arc::<[u8]>::from(helper.bytes),
        })
    }
}

fn integer_width(dtype: DType) -> OpResult<usize> {
    if !dtype.is_permutation_index() {
        return Err(OpError::unsupported_type(
            dtype,
            "expected an 8/16/32/64-bit integer element type",
        ));
    }
    dtype
        .size_in_bytes()
        .ok_or_else(|| OpError::unsupported_type(dtype, "integer width is not byte-addressable"))
}

fn encode_integer(dtype: DType, value: i64, out: &mut Vec<u8>) -> OpResult<()> {
    let out_of_range = || {
        OpError::invalid_graph(format!("integer {value} does not fit in {dtype:?}"))
    };
    match dtype {
        DType::Si8 => out.extend(i8::try_from(value).map_err(|_| out_of_range())?.to_le_bytes()),
        DType::Si16 => out.extend(i16::try_from(value).map_err(|_| out_of_range())?.to_le_bytes()),
        DType::Si32 => out.extend(i32::try_from(value).map_err(|_| out_of_range())?.to_le_bytes()),
        DType::Si64 => out.extend(value.to_le_bytes()),
        DType::Ui8 => out.extend(u8::try_from(value).map_err(|_| out_of_range())?.to_le_bytes()),
        DType::Ui16 => out.extend(u16::try_from(value).map_err(|_| out_of_range())?.to_le_bytes()),
        DType::Ui32 => out.extend(u32::try_from(value).map_err(|_| out_of_range())?.to_le_bytes()),
        DType::Ui64 => out.extend(u64::try_from(value).map_err(|_| out_of_range())?.to_le_bytes()),
        other => {
            return Err(OpError::unsupported_type(
                other,
                "expected an 8/16/32/64-bit integer element type",
            ))
        }
    }
    Ok(())
}

/// Decodes little-endian integers of `dtype` from `bytes`, appending to `out`.
///
/// Unsigned 64-bit values above `i64::MAX` saturate; they can never be valid axis indices.
pub fn decode_integers<E>(dtype: DType, bytes: &[u8], out: &mut E) -> OpResult<()>
where
    E: Extend<i64>,
{
    let width = integer_width(dtype)?;
    if !bytes.len().is_multiple_of(width) {
        return Err(OpError::invalid_graph(format!(
            "{} bytes is not a whole number of {dtype:?} elements",
            bytes.len()
        )));
    }
    let chunks = bytes.chunks_exact(width);
    match dtype {
        DType::Si8 => out.extend(chunks.map(|c| i64::from(i8::from_le_bytes([c[0]])))),
        DType::Si16 => out.extend(chunks.map(|c| i64::from(i16::from_le_bytes([c[0], c[1]])))),
        DType::Si32 => out.extend(
            chunks.map(|c| i64::from(i32::from_le_bytes([c[0], c[1], c[2], c[3]]))),
        ),
        DType::Si64 => out.extend(chunks.map(|c| {
            i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]])
        })),
        DType::Ui8 => out.extend(chunks.map(|c| i64::from(c[0]))),
        DType::Ui16 => out.extend(chunks.map(|c| i64::from(u16::from_le_bytes([c[0], c[1]])))),
        DType::Ui32 => out.extend(
            chunks.map(|c| i64::from(u32::from_le_bytes([c[0], c[1], c[2], c[3]]))),
        ),
        DType::Ui64 => out.extend(chunks.map(|c| {
            let value = u64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]);
            i64::try_from(value).unwrap_or(i64::MAX)
        })),
        other => {
            return Err(OpError::unsupported_type(
                other,
                "expected an 8/16/32/64-bit integer element type",
            ))
        }
    }
    Ok(())
}

/// Operator error surfaced to the host framework.
#[derive(Debug, Error)]
pub enum OpError {
    #[error("invalid graph: {0}")]
    InvalidGraph(String),
    #[error("unsupported element type {dtype:?}: {reason}")]
    UnsupportedType { dtype: DType, reason: String },
    #[error("permutation primitive failed: {0}")]
    PrimitiveFailure(#[from] crate::primitive::PrimitiveError),
    #[error("invalid call: {0}")]
    InvalidCall(String),
    #[error("invalid permutation {perm:?}: {reason}")]
    InvalidPermutation { perm: Vec<i64>, reason: String },
    #[error("device failure: {0}")]
    Device(String),
    #[error("no operator registered for type '{0}'")]
    UnknownOperator(String),
}

impl OpError {
    pub fn invalid_graph(message: impl Into<String>) -> Self {
        OpError::InvalidGraph(message.into())
    }

    pub fn unsupported_type(dtype: DType, reason: impl Into<String>) -> Self {
        OpError::UnsupportedType {
            dtype,
            reason: reason.into(),
        }
    }

    pub fn invalid_call(message: impl Into<String>) -> Self {
        OpError::InvalidCall(message.into())
    }

    pub fn invalid_permutation(perm: &[i64], reason: impl Into<String>) -> Self {
        OpError::InvalidPermutation {
            perm: perm.to_vec(),
            reason: reason.into(),
        }
    }

    pub fn device(message: impl Into<String>) -> Self {
        OpError::Device(message.into())
    }
}

/// Convenience alias for results returned by operator routines.
pub type OpResult<T> = Result<T, OpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_literals_decode_identically_across_widths() {
        let values = [2i64, 0, 1];
        for dtype in DType::PERMUTATION_INDEX_TYPES {
            let literal = TensorLiteral::from_i64s(dtype, &values)
                .unwrap_or_else(|err| panic!("encode {dtype:?}: {err}"));
            assert_eq!(literal.byte_len(), 3 * dtype.size_in_bytes().unwrap());
            assert_eq!(literal.to_i64_vec().unwrap(), values, "dtype {dtype:?}");
        }
    }

    #[test]
    fn negative_values_do_not_fit_unsigned_literals() {
        let err = TensorLiteral::from_i64s(DType::Ui8, &[1, -1]).expect_err("should reject");
        assert!(matches!(err, OpError::InvalidGraph(_)));
    }

    #[test]
    fn float_literals_are_not_integer_decodable() {
        let literal = TensorLiteral::from_f32s(Shape::from_static(&[2]), &[1.0, 0.0]).unwrap();
        let err = literal.to_i64_vec().expect_err("f32 is not an index type");
        assert!(matches!(
            err,
            OpError::UnsupportedType {
                dtype: DType::F32,
                ..
            }
        ));
    }

    #[test]
    fn ragged_byte_buffers_are_rejected() {
        let mut out = Vec::new();
        let err = decode_integers(DType::Si32, &[0, 0, 0], &mut out).expect_err("ragged");
        assert!(matches!(err, OpError::InvalidGraph(_)));
    }

    #[test]
    fn shape_display_marks_dynamic_dims() {
        let shape = Shape::new(vec![
            Dimension::Static(2),
            Dimension::Dynamic(DimSymbol::new("B")),
        ]);
        assert_eq!(shape.to_string(), "[2, ?B]");
        assert_eq!(shape.static_dims(), None);
    }
}
