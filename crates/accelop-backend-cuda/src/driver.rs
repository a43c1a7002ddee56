use std::ffi::c_void;
use std::sync::{Arc, OnceLock};

use accelop::config::PluginConfig;
use accelop::device::{DevicePtr, Stream};
use accelop::spec::{OpError, OpResult};
use libloading::Library;

type CUresult = i32;
type CUdevice = i32;
type CUcontext = *mut c_void;
type CUdeviceptr = u64;
pub(crate) type CUstream = *mut c_void;

const CUDA_SUCCESS: CUresult = 0;
const CU_STREAM_NON_BLOCKING: u32 = 0x1;

type CuInitFn = unsafe extern "C" fn(flags: u32) -> CUresult;
type CuDeviceGetFn = unsafe extern "C" fn(device: *mut CUdevice, ordinal: i32) -> CUresult;
type CuCtxCreateV2Fn =
    unsafe extern "C" fn(ctx: *mut CUcontext, flags: u32, dev: CUdevice) -> CUresult;
type CuCtxDestroyV2Fn = unsafe extern "C" fn(ctx: CUcontext) -> CUresult;
type CuCtxSetCurrentFn = unsafe extern "C" fn(ctx: CUcontext) -> CUresult;
type CuMemAllocV2Fn = unsafe extern "C" fn(dptr: *mut CUdeviceptr, bytesize: usize) -> CUresult;
type CuMemFreeV2Fn = unsafe extern "C" fn(dptr: CUdeviceptr) -> CUresult;
type CuMemcpyHtoDV2Fn = unsafe extern "C" fn(
    dst_device: CUdeviceptr,
    src_host: *const c_void,
    byte_count: usize,
) -> CUresult;
type CuMemcpyDtoHV2Fn = unsafe extern "C" fn(
    dst_host: *mut c_void,
    src_device: CUdeviceptr,
    byte_count: usize,
) -> CUresult;
type CuMemcpyDtoHAsyncV2Fn = unsafe extern "C" fn(
    dst_host: *mut c_void,
    src_device: CUdeviceptr,
    byte_count: usize,
    stream: CUstream,
) -> CUresult;
type CuStreamCreateFn = unsafe extern "C" fn(stream: *mut CUstream, flags: u32) -> CUresult;
type CuStreamDestroyV2Fn = unsafe extern "C" fn(stream: CUstream) -> CUresult;
type CuStreamSynchronizeFn = unsafe extern "C" fn(stream: CUstream) -> CUresult;

struct DriverFns {
    cu_init: CuInitFn,
    cu_device_get: CuDeviceGetFn,
    cu_ctx_create_v2: CuCtxCreateV2Fn,
    cu_ctx_destroy_v2: CuCtxDestroyV2Fn,
    cu_ctx_set_current: CuCtxSetCurrentFn,
    cu_mem_alloc_v2: CuMemAllocV2Fn,
    cu_mem_free_v2: CuMemFreeV2Fn,
    cu_memcpy_hto_d_v2: CuMemcpyHtoDV2Fn,
    cu_memcpy_dto_h_v2: CuMemcpyDtoHV2Fn,
    cu_memcpy_dto_h_async_v2: CuMemcpyDtoHAsyncV2Fn,
    cu_stream_create: CuStreamCreateFn,
    cu_stream_destroy_v2: CuStreamDestroyV2Fn,
    cu_stream_synchronize: CuStreamSynchronizeFn,
}

/// CUDA driver API bound at runtime, owning one context on one device.
pub struct CudaDriver {
    _lib: Library,
    fns: DriverFns,
    ordinal: i32,
    // Stored as usize so the driver is Send + Sync.
    ctx: usize,
}

impl Drop for CudaDriver {
    fn drop(&mut self) {
        if self.ctx != 0 {
            // SAFETY: Context is owned by this driver instance and destroyed once on drop.
            let _ = unsafe { (self.fns.cu_ctx_destroy_v2)(self.ctx_ptr()) };
            self.ctx = 0;
        }
    }
}

static CUDA_DRIVER: OnceLock<Result<Arc<CudaDriver>, String>> = OnceLock::new();

/// Driver for the globally configured device, opened once per process.
pub fn driver() -> OpResult<Arc<CudaDriver>> {
    let init = CUDA_DRIVER.get_or_init(|| {
        CudaDriver::open(PluginConfig::global().device_ordinal)
            .map(Arc::new)
            .map_err(|err| err.to_string())
    });
    match init {
        Ok(driver) => Ok(Arc::clone(driver)),
        Err(msg) => Err(OpError::device(format!("CUDA driver unavailable: {msg}"))),
    }
}

impl CudaDriver {
    /// Loads the driver library and creates a context on device `ordinal`.
    pub fn open(ordinal: i32) -> OpResult<Self> {
        let lib = load_cuda_library()?;
        let fns = DriverFns {
            cu_init: load_symbol(&lib, b"cuInit\0")?,
            cu_device_get: load_symbol(&lib, b"cuDeviceGet\0")?,
            cu_ctx_create_v2: load_symbol(&lib, b"cuCtxCreate_v2\0")?,
            cu_ctx_destroy_v2: load_symbol(&lib, b"cuCtxDestroy_v2\0")?,
            cu_ctx_set_current: load_symbol(&lib, b"cuCtxSetCurrent\0")?,
            cu_mem_alloc_v2: load_symbol(&lib, b"cuMemAlloc_v2\0")?,
            cu_mem_free_v2: load_symbol(&lib, b"cuMemFree_v2\0")?,
            cu_memcpy_hto_d_v2: load_symbol(&lib, b"cuMemcpyHtoD_v2\0")?,
            cu_memcpy_dto_h_v2: load_symbol(&lib, b"cuMemcpyDtoH_v2\0")?,
            cu_memcpy_dto_h_async_v2: load_symbol(&lib, b"cuMemcpyDtoHAsync_v2\0")?,
            cu_stream_create: load_symbol(&lib, b"cuStreamCreate\0")?,
            cu_stream_destroy_v2: load_symbol(&lib, b"cuStreamDestroy_v2\0")?,
            cu_stream_synchronize: load_symbol(&lib, b"cuStreamSynchronize\0")?,
        };

        // SAFETY: Calls are made with valid pointers and follow CUDA driver API contract.
        unsafe {
            check_cuda((fns.cu_init)(0), "cuInit")?;
            let mut dev: CUdevice = 0;
            check_cuda(
                (fns.cu_device_get)(&mut dev as *mut CUdevice, ordinal),
                "cuDeviceGet",
            )?;
            let mut ctx: CUcontext = std::ptr::null_mut();
            check_cuda(
                (fns.cu_ctx_create_v2)(&mut ctx as *mut CUcontext, 0, dev),
                "cuCtxCreate_v2",
            )?;
            check_cuda((fns.cu_ctx_set_current)(ctx), "cuCtxSetCurrent")?;
            tracing::debug!(ordinal, "opened CUDA context");
            Ok(Self {
                _lib: lib,
                fns,
                ordinal,
                ctx: ctx as usize,
            })
        }
    }

    pub fn ordinal(&self) -> i32 {
        self.ordinal
    }

    /// Allocates at least one byte so empty tensors still get a distinct handle.
    pub fn alloc(&self, bytes: usize) -> OpResult<DevicePtr> {
        self.ensure_current()?;
        let mut ptr: CUdeviceptr = 0;
        // SAFETY: `ptr` is a valid out pointer for CUDA allocation.
        unsafe {
            check_cuda(
                (self.fns.cu_mem_alloc_v2)(&mut ptr as *mut CUdeviceptr, bytes.max(1)),
                "cuMemAlloc_v2",
            )?;
        }
        Ok(DevicePtr::new(ptr, bytes))
    }

    pub fn free(&self, ptr: DevicePtr) -> OpResult<()> {
        self.ensure_current()?;
        // SAFETY: Device pointer was returned by `alloc` and is released once by the caller.
        unsafe { check_cuda((self.fns.cu_mem_free_v2)(ptr.addr()), "cuMemFree_v2") }
    }

    pub fn write(&self, dst: DevicePtr, bytes: &[u8]) -> OpResult<()> {
        if bytes.len() > dst.bytes() {
            return Err(OpError::device(format!(
                "upload of {} bytes overruns {dst:?}",
                bytes.len()
            )));
        }
        if bytes.is_empty() {
            return Ok(());
        }
        self.ensure_current()?;
        // SAFETY: Destination is a valid allocated device pointer and source host slice is valid.
        unsafe {
            check_cuda(
                (self.fns.cu_memcpy_hto_d_v2)(
                    dst.addr(),
                    bytes.as_ptr() as *const c_void,
                    bytes.len(),
                ),
                "cuMemcpyHtoD_v2",
            )
        }
    }

    pub fn download(&self, src: DevicePtr) -> OpResult<Vec<u8>> {
        self.ensure_current()?;
        let mut out = vec![0u8; src.bytes()];
        if !out.is_empty() {
            // SAFETY: Source device pointer is valid for `src.bytes()`; destination host buffer is valid and writable.
            unsafe {
                check_cuda(
                    (self.fns.cu_memcpy_dto_h_v2)(
                        out.as_mut_ptr() as *mut c_void,
                        src.addr(),
                        out.len(),
                    ),
                    "cuMemcpyDtoH_v2",
                )?;
            }
        }
        Ok(out)
    }

    pub fn ensure_current(&self) -> OpResult<()> {
        // SAFETY: Context was created by this driver and remains valid until drop.
        unsafe {
            check_cuda(
                (self.fns.cu_ctx_set_current)(self.ctx_ptr()),
                "cuCtxSetCurrent",
            )
        }
    }

    fn ctx_ptr(&self) -> CUcontext {
        self.ctx as CUcontext
    }
}

/// Non-blocking CUDA stream owned by the context that created it.
pub struct CudaStream {
    driver: Arc<CudaDriver>,
    stream: usize,
}

impl CudaStream {
    pub fn new(driver: Arc<CudaDriver>) -> OpResult<Self> {
        driver.ensure_current()?;
        let mut stream: CUstream = std::ptr::null_mut();
        // SAFETY: `stream` is a valid out pointer and the context is current.
        unsafe {
            check_cuda(
                (driver.fns.cu_stream_create)(&mut stream as *mut CUstream, CU_STREAM_NON_BLOCKING),
                "cuStreamCreate",
            )?;
        }
        Ok(Self {
            driver,
            stream: stream as usize,
        })
    }

    pub(crate) fn as_raw(&self) -> CUstream {
        self.stream as CUstream
    }
}

impl Drop for CudaStream {
    fn drop(&mut self) {
        // SAFETY: Stream was created by this instance and is destroyed once on drop.
        let _ = unsafe { (self.driver.fns.cu_stream_destroy_v2)(self.as_raw()) };
    }
}

impl Stream for CudaStream {
    fn download(&self, dst: &mut [u8], src: DevicePtr) -> OpResult<()> {
        if dst.len() > src.bytes() {
            return Err(OpError::device(format!(
                "download of {} bytes overruns {src:?}",
                dst.len()
            )));
        }
        if dst.is_empty() {
            return Ok(());
        }
        self.driver.ensure_current()?;
        // SAFETY: `dst` stays borrowed until the caller synchronizes this stream; `src` is valid for `dst.len()` bytes.
        unsafe {
            check_cuda(
                (self.driver.fns.cu_memcpy_dto_h_async_v2)(
                    dst.as_mut_ptr() as *mut c_void,
                    src.addr(),
                    dst.len(),
                    self.as_raw(),
                ),
                "cuMemcpyDtoHAsync_v2",
            )
        }
    }

    fn synchronize(&self) -> OpResult<()> {
        self.driver.ensure_current()?;
        // SAFETY: Stream handle is valid until drop.
        unsafe {
            check_cuda(
                (self.driver.fns.cu_stream_synchronize)(self.as_raw()),
                "cuStreamSynchronize",
            )
        }
    }

    fn raw_handle(&self) -> usize {
        self.stream
    }
}

/// Probes whether the CUDA driver library can be loaded, without creating a context.
pub fn driver_library_present() -> bool {
    load_cuda_library().is_ok()
}

fn load_cuda_library() -> OpResult<Library> {
    let candidates = ["libcuda.so.1", "libcuda.so", "nvcuda.dll", "libcuda.dylib"];

    for candidate in candidates {
        // SAFETY: Dynamic library probe only; no symbols are invoked at this stage.
        if let Ok(lib) = unsafe { Library::new(candidate) } {
            return Ok(lib);
        }
    }

    Err(OpError::device(
        "failed to load CUDA driver library (tried libcuda.so.1, libcuda.so, nvcuda.dll, libcuda.dylib)",
    ))
}

pub(crate) fn load_symbol<T: Copy>(lib: &Library, name: &'static [u8]) -> OpResult<T> {
    // SAFETY: Caller provides expected symbol type from the library's C API.
    let sym = unsafe { lib.get::<T>(name) }.map_err(|err| {
        OpError::device(format!(
            "failed to resolve symbol {}: {err}",
            String::from_utf8_lossy(name.strip_suffix(b"\0").unwrap_or(name))
        ))
    })?;
    Ok(*sym)
}

fn check_cuda(code: CUresult, op: &str) -> OpResult<()> {
    if code == CUDA_SUCCESS {
        Ok(())
    } else {
        Err(OpError::device(format!(
            "CUDA driver call {op} failed with code {code}"
        )))
    }
}
