//! Reference implementation of the mode-labelled permutation primitive.
//!
//! Output axis `j` carries mode `output_modes[j]`; its coordinate indexes the
//! input axis labelled with the same mode. Any strided layout is accepted as
//! long as every addressed element lies inside the buffers.

use std::sync::Arc;

use accelop::device::{DeviceMemory, Stream};
use accelop::layout::INLINE_RANK;
use accelop::primitive::{PermutationCall, PermutationPrimitive, PrimitiveError, Scalar};
use smallvec::SmallVec;

use crate::device::HostDevice;

pub const STATUS_INVALID_VALUE: i32 = 7;
pub const STATUS_NOT_SUPPORTED: i32 = 15;
pub const STATUS_EXECUTION_FAILED: i32 = 13;

type Axes = SmallVec<[usize; INLINE_RANK]>;

#[derive(Debug)]
pub struct HostPermutation {
    device: Arc<HostDevice>,
    forced_status: Option<i32>,
}

impl HostPermutation {
    pub fn new(device: Arc<HostDevice>) -> Self {
        Self {
            device,
            forced_status: None,
        }
    }

    /// A primitive that rejects every call with `status`.
    pub fn failing(device: Arc<HostDevice>, status: i32) -> Self {
        Self {
            device,
            forced_status: Some(status),
        }
    }
}

impl PermutationPrimitive for HostPermutation {
    fn name(&self) -> &str {
        "host"
    }

    fn permute(&self, call: &PermutationCall<'_>, stream: &dyn Stream) -> Result<(), PrimitiveError> {
        if let Some(status) = self.forced_status {
            return Err(PrimitiveError::new(status, "injected failure"));
        }
        let plan = PermutePlan::new(call)?;
        let src = self
            .device
            .read(call.input)
            .map_err(|err| PrimitiveError::new(STATUS_INVALID_VALUE, err.to_string()))?;
        let mut dst = self
            .device
            .read(call.output)
            .map_err(|err| PrimitiveError::new(STATUS_INVALID_VALUE, err.to_string()))?;
        plan.check_bounds(src.len(), dst.len())?;
        plan.run(&src, &mut dst);
        self.device
            .write(call.output, &dst)
            .map_err(|err| PrimitiveError::new(STATUS_EXECUTION_FAILED, err.to_string()))?;
        tracing::trace!(
            stream = stream.raw_handle(),
            elements = plan.element_count,
            "host permutation"
        );
        Ok(())
    }
}

/// Validated per-output-axis extents and strides, in elements.
#[derive(Debug)]
struct PermutePlan {
    width: usize,
    extents: Axes,
    src_strides: Axes,
    dst_strides: Axes,
    element_count: usize,
}

impl PermutePlan {
    fn new(call: &PermutationCall<'_>) -> Result<Self, PrimitiveError> {
        let dtype = call.input_desc.dtype;
        if call.output_desc.dtype != dtype || call.compute_type != dtype || call.alpha.dtype() != dtype
        {
            return Err(invalid(format!(
                "mixed types: input {dtype:?}, output {:?}, compute {:?}, alpha {:?}",
                call.output_desc.dtype,
                call.compute_type,
                call.alpha.dtype()
            )));
        }
        let width = dtype.size_in_bytes().ok_or_else(|| {
            PrimitiveError::new(STATUS_NOT_SUPPORTED, format!("{dtype:?} is not byte addressable"))
        })?;
        let unit = Scalar::one(dtype)
            .map_err(|err| PrimitiveError::new(STATUS_NOT_SUPPORTED, err.to_string()))?;
        if call.alpha.as_bytes() != unit.as_bytes() {
            return Err(PrimitiveError::new(
                STATUS_NOT_SUPPORTED,
                "only unit alpha is supported",
            ));
        }

        let rank = call.input_desc.rank();
        if call.input_modes.len() != rank
            || call.input_desc.strides.len() != rank
            || call.output_modes.len() != call.output_desc.rank()
            || call.output_desc.strides.len() != call.output_desc.rank()
        {
            return Err(invalid("descriptor rank disagrees with its modes or strides"));
        }
        if call.output_desc.rank() != rank {
            return Err(invalid(format!(
                "input rank {rank} differs from output rank {}",
                call.output_desc.rank()
            )));
        }

        let mut used: SmallVec<[bool; INLINE_RANK]> = SmallVec::from_elem(false, rank);
        let mut extents = Axes::with_capacity(rank);
        let mut src_strides = Axes::with_capacity(rank);
        let mut dst_strides = Axes::with_capacity(rank);
        for (axis, &mode) in call.output_modes.iter().enumerate() {
            let source = call
                .input_modes
                .iter()
                .position(|&m| m == mode)
                .ok_or_else(|| invalid(format!("output mode {mode} missing from input")))?;
            if std::mem::replace(&mut used[source], true) {
                return Err(invalid(format!("output mode {mode} repeated")));
            }
            let extent = call.output_desc.extents[axis];
            if call.input_desc.extents[source] != extent {
                return Err(invalid(format!(
                    "mode {mode}: input extent {} differs from output extent {extent}",
                    call.input_desc.extents[source]
                )));
            }
            extents.push(non_negative(extent, "extent")?);
            src_strides.push(non_negative(call.input_desc.strides[source], "stride")?);
            dst_strides.push(non_negative(call.output_desc.strides[axis], "stride")?);
        }

        let element_count = extents
            .iter()
            .try_fold(1usize, |acc, &extent| acc.checked_mul(extent))
            .ok_or_else(|| invalid("element count overflows"))?;
        Ok(Self {
            width,
            extents,
            src_strides,
            dst_strides,
            element_count,
        })
    }

    /// Bytes spanned by a strided view, from offset zero.
    fn span(&self, strides: &[usize]) -> Option<usize> {
        if self.element_count == 0 {
            return Some(0);
        }
        let last = self
            .extents
            .iter()
            .zip(strides)
            .try_fold(0usize, |acc, (&extent, &stride)| {
                acc.checked_add((extent - 1).checked_mul(stride)?)
            })?;
        last.checked_add(1)?.checked_mul(self.width)
    }

    fn check_bounds(&self, src_len: usize, dst_len: usize) -> Result<(), PrimitiveError> {
        for (strides, len, role) in [
            (&self.src_strides, src_len, "input"),
            (&self.dst_strides, dst_len, "output"),
        ] {
            match self.span(strides) {
                Some(span) if span <= len => {}
                _ => {
                    return Err(invalid(format!(
                        "{role} view exceeds its {len}-byte buffer"
                    )))
                }
            }
        }
        Ok(())
    }

    fn run(&self, src: &[u8], dst: &mut [u8]) {
        let rank = self.extents.len();
        let mut coords: Axes = SmallVec::from_elem(0, rank);
        for _ in 0..self.element_count {
            let mut src_offset = 0usize;
            let mut dst_offset = 0usize;
            for axis in 0..rank {
                src_offset += coords[axis] * self.src_strides[axis];
                dst_offset += coords[axis] * self.dst_strides[axis];
            }
            let (src_offset, dst_offset) = (src_offset * self.width, dst_offset * self.width);
            dst[dst_offset..dst_offset + self.width]
                .copy_from_slice(&src[src_offset..src_offset + self.width]);

            for axis in (0..rank).rev() {
                coords[axis] += 1;
                if coords[axis] < self.extents[axis] {
                    break;
                }
                coords[axis] = 0;
            }
        }
    }
}

fn invalid(message: impl Into<String>) -> PrimitiveError {
    PrimitiveError::new(STATUS_INVALID_VALUE, message)
}

fn non_negative(value: i64, what: &str) -> Result<usize, PrimitiveError> {
    usize::try_from(value).map_err(|_| invalid(format!("negative {what} {value}")))
}

#[cfg(test)]
mod tests {
    use accelop::device::DevicePtr;
    use accelop::layout::TensorLayout;
    use accelop::primitive::TensorDescriptor;
    use accelop::spec::DType;

    use super::*;
    use crate::stream::HostStream;

    fn f32_bytes(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn permute_f32(
        device: &Arc<HostDevice>,
        primitive: &HostPermutation,
        dims: &[usize],
        out_dims: &[usize],
        out_modes: &[i32],
        data: &[f32],
    ) -> Result<Vec<f32>, PrimitiveError> {
        let input_layout = TensorLayout::from_extents(dims).unwrap();
        let output_layout = TensorLayout::from_extents(out_dims).unwrap();
        let input = device.upload(&f32_bytes(data)).unwrap();
        let output = device.alloc(data.len() * 4).unwrap();
        let alpha = Scalar::one(DType::F32).unwrap();
        let input_modes: Vec<i32> = (0..dims.len() as i32).collect();
        let call = PermutationCall {
            alpha: &alpha,
            input,
            input_desc: TensorDescriptor::new(&input_layout, DType::F32),
            input_modes: &input_modes,
            output,
            output_desc: TensorDescriptor::new(&output_layout, DType::F32),
            output_modes: out_modes,
            compute_type: DType::F32,
        };
        let stream = HostStream::new(Arc::clone(device));
        primitive.permute(&call, &stream)?;
        let bytes = device.read(output).unwrap();
        Ok(bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    #[test]
    fn matrix_transpose() {
        let device = Arc::new(HostDevice::new());
        let primitive = HostPermutation::new(Arc::clone(&device));
        let out = permute_f32(
            &device,
            &primitive,
            &[2, 3],
            &[3, 2],
            &[1, 0],
            &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0],
        )
        .unwrap();
        assert_eq!(out, vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
    }

    #[test]
    fn mismatched_extents_report_invalid_value() {
        let device = Arc::new(HostDevice::new());
        let primitive = HostPermutation::new(Arc::clone(&device));
        let err = permute_f32(&device, &primitive, &[2, 3], &[2, 3], &[1, 0], &[0.0; 6])
            .unwrap_err();
        assert_eq!(err.status, STATUS_INVALID_VALUE);
    }

    #[test]
    fn repeated_output_mode_is_rejected() {
        let device = Arc::new(HostDevice::new());
        let primitive = HostPermutation::new(Arc::clone(&device));
        let err = permute_f32(&device, &primitive, &[2, 2], &[2, 2], &[0, 0], &[0.0; 4])
            .unwrap_err();
        assert_eq!(err.status, STATUS_INVALID_VALUE);
    }

    #[test]
    fn failing_primitive_reports_its_status() {
        let device = Arc::new(HostDevice::new());
        let primitive = HostPermutation::failing(Arc::clone(&device), 42);
        let err = permute_f32(&device, &primitive, &[1], &[1], &[0], &[1.0]).unwrap_err();
        assert_eq!(err.status, 42);
    }

    #[test]
    fn short_output_buffer_is_rejected() {
        let device = Arc::new(HostDevice::new());
        let primitive = HostPermutation::new(Arc::clone(&device));
        let layout = TensorLayout::from_extents(&[4]).unwrap();
        let alpha = Scalar::one(DType::F32).unwrap();
        let input = device.upload(&[0; 16]).unwrap();
        let output = device.alloc(8).unwrap();
        let call = PermutationCall {
            alpha: &alpha,
            input,
            input_desc: TensorDescriptor::new(&layout, DType::F32),
            input_modes: &[0],
            output: DevicePtr::new(output.addr(), 16),
            output_desc: TensorDescriptor::new(&layout, DType::F32),
            output_modes: &[0],
            compute_type: DType::F32,
        };
        let stream = HostStream::new(Arc::clone(&device));
        let err = primitive.permute(&call, &stream).unwrap_err();
        assert_eq!(err.status, STATUS_INVALID_VALUE);
    }
}
