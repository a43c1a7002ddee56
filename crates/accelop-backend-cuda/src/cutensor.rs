//! cuTENSOR 1.x permutation bound at runtime.

use std::ffi::{c_char, c_void, CStr};
use std::path::Path;
use std::sync::Arc;

use accelop::device::Stream;
use accelop::primitive::{PermutationCall, PermutationPrimitive, PrimitiveError, TensorDescriptor};
use accelop::spec::{DType, OpError, OpResult};
use libloading::Library;

use crate::driver::{load_symbol, CUstream, CudaDriver};

type CutensorStatus = i32;
type CudaDataType = i32;
type CutensorOperator = i32;

const CUTENSOR_STATUS_SUCCESS: CutensorStatus = 0;
const CUTENSOR_STATUS_INVALID_VALUE: CutensorStatus = 7;
const CUTENSOR_OP_IDENTITY: CutensorOperator = 1;

/// Opaque `cutensorHandle_t`.
#[repr(C, align(8))]
struct CutensorHandle {
    _opaque: [i64; 512],
}

/// Opaque `cutensorTensorDescriptor_t`.
#[repr(C, align(8))]
struct CutensorTensorDescriptor {
    _opaque: [i64; 72],
}

impl CutensorTensorDescriptor {
    fn zeroed() -> Self {
        Self { _opaque: [0; 72] }
    }
}

type CutensorInitFn = unsafe extern "C" fn(handle: *mut CutensorHandle) -> CutensorStatus;
type CutensorInitTensorDescriptorFn = unsafe extern "C" fn(
    handle: *const CutensorHandle,
    desc: *mut CutensorTensorDescriptor,
    num_modes: u32,
    extent: *const i64,
    stride: *const i64,
    data_type: CudaDataType,
    unary_op: CutensorOperator,
) -> CutensorStatus;
type CutensorPermutationFn = unsafe extern "C" fn(
    handle: *const CutensorHandle,
    alpha: *const c_void,
    a: *const c_void,
    desc_a: *const CutensorTensorDescriptor,
    mode_a: *const i32,
    b: *mut c_void,
    desc_b: *const CutensorTensorDescriptor,
    mode_b: *const i32,
    type_scalar: CudaDataType,
    stream: CUstream,
) -> CutensorStatus;
type CutensorGetErrorStringFn = unsafe extern "C" fn(status: CutensorStatus) -> *const c_char;

struct CutensorFns {
    init: CutensorInitFn,
    init_tensor_descriptor: CutensorInitTensorDescriptorFn,
    permutation: CutensorPermutationFn,
    get_error_string: CutensorGetErrorStringFn,
}

/// `cudaDataType_t` for the element types cuTENSOR can permute.
pub fn cuda_data_type(dtype: DType) -> OpResult<i32> {
    let code = match dtype {
        DType::F32 => 0,
        DType::F64 => 1,
        DType::F16 => 2,
        DType::Si8 => 3,
        DType::Ui8 => 8,
        DType::Si32 => 10,
        DType::Ui32 => 12,
        DType::Bf16 => 14,
        DType::Si16 => 20,
        DType::Ui16 => 22,
        DType::Si64 => 24,
        DType::Ui64 => 26,
        other => {
            return Err(OpError::unsupported_type(
                other,
                "no cudaDataType_t equivalent",
            ))
        }
    };
    Ok(code)
}

pub struct CuTensor {
    _lib: Library,
    fns: CutensorFns,
    handle: Box<CutensorHandle>,
    driver: Arc<CudaDriver>,
}

impl CuTensor {
    /// Loads cuTENSOR (from `library` when given) and initializes a handle on the driver's device.
    pub fn new(driver: Arc<CudaDriver>, library: Option<&Path>) -> OpResult<Self> {
        let lib = load_cutensor_library(library)?;
        let fns = CutensorFns {
            init: load_symbol(&lib, b"cutensorInit\0")?,
            init_tensor_descriptor: load_symbol(&lib, b"cutensorInitTensorDescriptor\0")?,
            permutation: load_symbol(&lib, b"cutensorPermutation\0")?,
            get_error_string: load_symbol(&lib, b"cutensorGetErrorString\0")?,
        };
        driver.ensure_current()?;
        let mut handle = Box::new(CutensorHandle { _opaque: [0; 512] });
        // SAFETY: `handle` points to writable storage of the opaque handle size.
        let status = unsafe { (fns.init)(&mut *handle as *mut CutensorHandle) };
        if status != CUTENSOR_STATUS_SUCCESS {
            return Err(OpError::device(format!(
                "cutensorInit failed: {}",
                error_string(&fns, status)
            )));
        }
        Ok(Self {
            _lib: lib,
            fns,
            handle,
            driver,
        })
    }

    fn describe(
        &self,
        desc: &TensorDescriptor<'_>,
    ) -> Result<CutensorTensorDescriptor, PrimitiveError> {
        let data_type = cuda_data_type(desc.dtype)
            .map_err(|err| PrimitiveError::new(CUTENSOR_STATUS_INVALID_VALUE, err.to_string()))?;
        let num_modes = u32::try_from(desc.rank())
            .map_err(|_| PrimitiveError::new(CUTENSOR_STATUS_INVALID_VALUE, "rank exceeds u32"))?;
        let mut out = CutensorTensorDescriptor::zeroed();
        // SAFETY: extent/stride slices hold `num_modes` entries and outlive the call; handle is initialized.
        let status = unsafe {
            (self.fns.init_tensor_descriptor)(
                &*self.handle,
                &mut out,
                num_modes,
                desc.extents.as_ptr(),
                desc.strides.as_ptr(),
                data_type,
                CUTENSOR_OP_IDENTITY,
            )
        };
        self.check(status)?;
        Ok(out)
    }

    fn check(&self, status: CutensorStatus) -> Result<(), PrimitiveError> {
        if status == CUTENSOR_STATUS_SUCCESS {
            Ok(())
        } else {
            Err(PrimitiveError::new(status, error_string(&self.fns, status)))
        }
    }
}

impl PermutationPrimitive for CuTensor {
    fn name(&self) -> &str {
        "cutensor"
    }

    fn permute(&self, call: &PermutationCall<'_>, stream: &dyn Stream) -> Result<(), PrimitiveError> {
        if call.input_modes.len() != call.input_desc.rank()
            || call.output_modes.len() != call.output_desc.rank()
        {
            return Err(PrimitiveError::new(
                CUTENSOR_STATUS_INVALID_VALUE,
                "mode count disagrees with descriptor rank",
            ));
        }
        let type_scalar = cuda_data_type(call.compute_type)
            .map_err(|err| PrimitiveError::new(CUTENSOR_STATUS_INVALID_VALUE, err.to_string()))?;
        self.driver
            .ensure_current()
            .map_err(|err| PrimitiveError::new(CUTENSOR_STATUS_INVALID_VALUE, err.to_string()))?;

        let desc_a = self.describe(&call.input_desc)?;
        let desc_b = self.describe(&call.output_desc)?;
        // SAFETY: device pointers come from the caller's live allocations; descriptors, modes and
        // alpha stay alive for the duration of the call, which only enqueues work on `stream`.
        let status = unsafe {
            (self.fns.permutation)(
                &*self.handle,
                call.alpha.as_bytes().as_ptr() as *const c_void,
                call.input.addr() as *const c_void,
                &desc_a,
                call.input_modes.as_ptr(),
                call.output.addr() as *mut c_void,
                &desc_b,
                call.output_modes.as_ptr(),
                type_scalar,
                stream.raw_handle() as CUstream,
            )
        };
        self.check(status)
    }
}

fn error_string(fns: &CutensorFns, status: CutensorStatus) -> String {
    // SAFETY: cuTENSOR returns a pointer to a static NUL-terminated string or null.
    unsafe {
        let ptr = (fns.get_error_string)(status);
        if ptr.is_null() {
            format!("cuTENSOR status {status}")
        } else {
            CStr::from_ptr(ptr).to_string_lossy().into_owned()
        }
    }
}

fn load_cutensor_library(explicit: Option<&Path>) -> OpResult<Library> {
    if let Some(path) = explicit {
        // SAFETY: Dynamic library probe only; no symbols are invoked at this stage.
        return unsafe { Library::new(path) }.map_err(|err| {
            OpError::device(format!("failed to load cuTENSOR from {}: {err}", path.display()))
        });
    }

    let candidates = ["libcutensor.so.1", "libcutensor.so", "cutensor.dll"];
    for candidate in candidates {
        // SAFETY: Dynamic library probe only; no symbols are invoked at this stage.
        if let Ok(lib) = unsafe { Library::new(candidate) } {
            return Ok(lib);
        }
    }

    Err(OpError::device(
        "failed to load cuTENSOR library (tried libcutensor.so.1, libcutensor.so, cutensor.dll)",
    ))
}

/// Probes whether the cuTENSOR library can be loaded.
pub fn library_present(explicit: Option<&Path>) -> bool {
    load_cutensor_library(explicit).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_type_codes_match_cuda_headers() {
        assert_eq!(cuda_data_type(DType::F32).unwrap(), 0);
        assert_eq!(cuda_data_type(DType::F16).unwrap(), 2);
        assert_eq!(cuda_data_type(DType::Bf16).unwrap(), 14);
        assert_eq!(cuda_data_type(DType::Si64).unwrap(), 24);
        assert_eq!(cuda_data_type(DType::Ui16).unwrap(), 22);
    }

    #[test]
    fn every_index_type_has_a_code() {
        for dtype in DType::PERMUTATION_INDEX_TYPES {
            assert!(cuda_data_type(dtype).is_ok(), "{dtype:?}");
        }
        assert!(matches!(
            cuda_data_type(DType::I1),
            Err(OpError::UnsupportedType { .. })
        ));
    }
}
