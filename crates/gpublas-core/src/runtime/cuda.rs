//! CUDA runtime + cuBLAS backend.
//!
//! Managed buffers come from `cudaMallocManaged` with global attachment. On
//! devices with concurrent managed access, mapping prefetches the range to
//! the device; otherwise mapping is free and unmapping synchronizes.

use std::ffi::c_void;

use parking_lot::Mutex;

use super::{DevicePtr, DeviceRuntime, ElementKind, MatrixShape, RuntimeError, RuntimeStatus};

const BACKEND: &str = "cuda";

const CUDA_SUCCESS: i32 = 0;
const CUDA_ERROR_INVALID_VALUE: i32 = 1;
const CUDA_ERROR_MEMORY_ALLOCATION: i32 = 2;
const CUDA_ERROR_INITIALIZATION: i32 = 3;
const CUDA_ERROR_NOT_SUPPORTED: i32 = 801;

const CUDA_MEMCPY_HOST_TO_DEVICE: i32 = 1;
const CUDA_MEMCPY_DEVICE_TO_HOST: i32 = 2;
const CUDA_MEM_ATTACH_GLOBAL: u32 = 1;
const CUDA_DEV_ATTR_CONCURRENT_MANAGED_ACCESS: i32 = 89;

const CUBLAS_STATUS_SUCCESS: i32 = 0;
const CUBLAS_STATUS_NOT_INITIALIZED: i32 = 1;
const CUBLAS_STATUS_ALLOC_FAILED: i32 = 3;
const CUBLAS_STATUS_INVALID_VALUE: i32 = 7;
const CUBLAS_STATUS_ARCH_MISMATCH: i32 = 8;
const CUBLAS_STATUS_MAPPING_ERROR: i32 = 11;
const CUBLAS_STATUS_EXECUTION_FAILED: i32 = 13;
const CUBLAS_STATUS_NOT_SUPPORTED: i32 = 15;

const CUBLAS_OP_N: i32 = 0;
const CUBLAS_OP_T: i32 = 1;

#[repr(C)]
#[derive(Clone, Copy)]
struct CuComplex {
    x: f32,
    y: f32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct CuDoubleComplex {
    x: f64,
    y: f64,
}

#[link(name = "cudart")]
unsafe extern "C" {
    fn cudaMalloc(ptr: *mut *mut c_void, size: usize) -> i32;
    fn cudaMallocManaged(ptr: *mut *mut c_void, size: usize, flags: u32) -> i32;
    fn cudaFree(ptr: *mut c_void) -> i32;
    fn cudaMemcpy(dst: *mut c_void, src: *const c_void, count: usize, kind: i32) -> i32;
    fn cudaMemPrefetchAsync(ptr: *const c_void, count: usize, device: i32, stream: *mut c_void) -> i32;
    fn cudaDeviceSynchronize() -> i32;
    fn cudaGetDevice(device: *mut i32) -> i32;
    fn cudaDeviceGetAttribute(value: *mut i32, attr: i32, device: i32) -> i32;
}

#[link(name = "cublas")]
unsafe extern "C" {
    fn cublasCreate_v2(handle: *mut *mut c_void) -> i32;
    fn cublasDestroy_v2(handle: *mut c_void) -> i32;
    fn cublasSgeam(
        handle: *mut c_void,
        transa: i32,
        transb: i32,
        m: i32,
        n: i32,
        alpha: *const f32,
        a: *const f32,
        lda: i32,
        beta: *const f32,
        b: *const f32,
        ldb: i32,
        c: *mut f32,
        ldc: i32,
    ) -> i32;
    fn cublasDgeam(
        handle: *mut c_void,
        transa: i32,
        transb: i32,
        m: i32,
        n: i32,
        alpha: *const f64,
        a: *const f64,
        lda: i32,
        beta: *const f64,
        b: *const f64,
        ldb: i32,
        c: *mut f64,
        ldc: i32,
    ) -> i32;
    fn cublasCgeam(
        handle: *mut c_void,
        transa: i32,
        transb: i32,
        m: i32,
        n: i32,
        alpha: *const CuComplex,
        a: *const CuComplex,
        lda: i32,
        beta: *const CuComplex,
        b: *const CuComplex,
        ldb: i32,
        c: *mut CuComplex,
        ldc: i32,
    ) -> i32;
    fn cublasZgeam(
        handle: *mut c_void,
        transa: i32,
        transb: i32,
        m: i32,
        n: i32,
        alpha: *const CuDoubleComplex,
        a: *const CuDoubleComplex,
        lda: i32,
        beta: *const CuDoubleComplex,
        b: *const CuDoubleComplex,
        ldb: i32,
        c: *mut CuDoubleComplex,
        ldc: i32,
    ) -> i32;
}

fn cuda_status(code: i32) -> RuntimeStatus {
    match code {
        CUDA_SUCCESS => RuntimeStatus::Success,
        CUDA_ERROR_INVALID_VALUE => RuntimeStatus::InvalidValue,
        CUDA_ERROR_MEMORY_ALLOCATION => RuntimeStatus::AllocFailed,
        CUDA_ERROR_INITIALIZATION => RuntimeStatus::NotInitialized,
        CUDA_ERROR_NOT_SUPPORTED => RuntimeStatus::Unsupported,
        _ => RuntimeStatus::InternalError,
    }
}

fn cublas_status(code: i32) -> RuntimeStatus {
    match code {
        CUBLAS_STATUS_SUCCESS => RuntimeStatus::Success,
        CUBLAS_STATUS_NOT_INITIALIZED => RuntimeStatus::NotInitialized,
        CUBLAS_STATUS_ALLOC_FAILED => RuntimeStatus::AllocFailed,
        CUBLAS_STATUS_INVALID_VALUE => RuntimeStatus::InvalidValue,
        CUBLAS_STATUS_ARCH_MISMATCH => RuntimeStatus::ArchMismatch,
        CUBLAS_STATUS_MAPPING_ERROR => RuntimeStatus::MappingError,
        CUBLAS_STATUS_EXECUTION_FAILED => RuntimeStatus::ExecutionFailed,
        CUBLAS_STATUS_NOT_SUPPORTED => RuntimeStatus::Unsupported,
        _ => RuntimeStatus::InternalError,
    }
}

fn check_cuda(op: &'static str, code: i32) -> Result<(), RuntimeError> {
    match cuda_status(code) {
        RuntimeStatus::Success => Ok(()),
        status => Err(RuntimeError::new(BACKEND, op, status, code)),
    }
}

fn check_cublas(op: &'static str, code: i32) -> Result<(), RuntimeError> {
    match cublas_status(code) {
        RuntimeStatus::Success => Ok(()),
        status => Err(RuntimeError::new(BACKEND, op, status, code)),
    }
}

fn dim(op: &'static str, value: usize) -> Result<i32, RuntimeError> {
    i32::try_from(value).map_err(|_| RuntimeError::new(BACKEND, op, RuntimeStatus::InvalidValue, -1))
}

struct CublasHandle(*mut c_void);

// SAFETY: the handle is only used while holding the runtime's mutex.
unsafe impl Send for CublasHandle {}

/// CUDA device 0 (or the current device) with one cuBLAS handle.
pub struct CudaRuntime {
    handle: Mutex<CublasHandle>,
    device: i32,
    concurrent: bool,
}

impl std::fmt::Debug for CudaRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CudaRuntime")
            .field("device", &self.device)
            .field("concurrent", &self.concurrent)
            .finish_non_exhaustive()
    }
}

impl CudaRuntime {
    /// Create the cuBLAS handle and query the current device.
    pub fn new() -> Result<Self, RuntimeError> {
        let mut device = 0i32;
        let mut concurrent = 0i32;
        let mut handle: *mut c_void = std::ptr::null_mut();
        // SAFETY: out-pointers reference live locals.
        unsafe {
            check_cuda("cudaGetDevice", cudaGetDevice(&mut device))?;
            check_cuda(
                "cudaDeviceGetAttribute",
                cudaDeviceGetAttribute(&mut concurrent, CUDA_DEV_ATTR_CONCURRENT_MANAGED_ACCESS, device),
            )?;
            check_cublas("cublasCreate", cublasCreate_v2(&mut handle))?;
        }
        Ok(Self {
            handle: Mutex::new(CublasHandle(handle)),
            device,
            concurrent: concurrent != 0,
        })
    }
}

impl Drop for CudaRuntime {
    fn drop(&mut self) {
        let handle = self.handle.get_mut().0;
        if !handle.is_null() {
            // SAFETY: created by cublasCreate_v2 and not used after this point.
            let _ = unsafe { cublasDestroy_v2(handle) };
        }
    }
}

impl DeviceRuntime for CudaRuntime {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn alloc_device(&self, size: usize) -> Result<DevicePtr, RuntimeError> {
        let mut ptr: *mut c_void = std::ptr::null_mut();
        // SAFETY: out-pointer references a live local.
        check_cuda("cudaMalloc", unsafe { cudaMalloc(&mut ptr, size) })?;
        DevicePtr::from_raw(ptr)
            .ok_or_else(|| RuntimeError::new(BACKEND, "cudaMalloc", RuntimeStatus::AllocFailed, -1))
    }

    fn alloc_managed(&self, size: usize) -> Result<DevicePtr, RuntimeError> {
        let mut ptr: *mut c_void = std::ptr::null_mut();
        // SAFETY: out-pointer references a live local.
        check_cuda("cudaMallocManaged", unsafe {
            cudaMallocManaged(&mut ptr, size, CUDA_MEM_ATTACH_GLOBAL)
        })?;
        DevicePtr::from_raw(ptr).ok_or_else(|| {
            RuntimeError::new(BACKEND, "cudaMallocManaged", RuntimeStatus::AllocFailed, -1)
        })
    }

    unsafe fn free(&self, ptr: DevicePtr) -> Result<(), RuntimeError> {
        // SAFETY: caller guarantees `ptr` came from cudaMalloc/cudaMallocManaged.
        check_cuda("cudaFree", unsafe { cudaFree(ptr.as_ptr().cast()) })
    }

    unsafe fn copy_host_to_device(
        &self,
        dst: DevicePtr,
        src: *const u8,
        size: usize,
    ) -> Result<(), RuntimeError> {
        // SAFETY: caller guarantees both ranges.
        check_cuda("cudaMemcpy", unsafe {
            cudaMemcpy(dst.as_ptr().cast(), src.cast(), size, CUDA_MEMCPY_HOST_TO_DEVICE)
        })
    }

    unsafe fn copy_device_to_host(
        &self,
        dst: *mut u8,
        src: DevicePtr,
        size: usize,
    ) -> Result<(), RuntimeError> {
        // SAFETY: caller guarantees both ranges.
        check_cuda("cudaMemcpy", unsafe {
            cudaMemcpy(dst.cast(), src.as_ptr().cast(), size, CUDA_MEMCPY_DEVICE_TO_HOST)
        })
    }

    fn map_for_device(&self, ptr: DevicePtr, size: usize) -> Result<(), RuntimeError> {
        if !self.concurrent {
            return Ok(());
        }
        // SAFETY: prefetch only hints the driver; an invalid range is reported, not UB.
        check_cuda("cudaMemPrefetchAsync", unsafe {
            cudaMemPrefetchAsync(ptr.as_ptr().cast(), size, self.device, std::ptr::null_mut())
        })
    }

    fn unmap_from_device(&self, _ptr: DevicePtr, _size: usize) -> Result<(), RuntimeError> {
        if self.concurrent {
            Ok(())
        } else {
            self.synchronize()
        }
    }

    fn synchronize(&self) -> Result<(), RuntimeError> {
        // SAFETY: no arguments.
        check_cuda("cudaDeviceSynchronize", unsafe { cudaDeviceSynchronize() })
    }

    unsafe fn transpose(
        &self,
        dst: DevicePtr,
        dst_ld: usize,
        src: DevicePtr,
        shape: MatrixShape,
    ) -> Result<(), RuntimeError> {
        let m = dim("geam", shape.rows)?;
        let n = dim("geam", shape.cols)?;
        let lda = dim("geam", shape.ld)?;
        let ldc = dim("geam", dst_ld)?;
        let handle = self.handle.lock();
        // C (rows x cols, column-major) = A^T where A is the row-major source
        // read as a cols x rows column-major matrix. beta = 0, so B is unread.
        // SAFETY: caller guarantees both buffers are device-visible and sized.
        let code = unsafe {
            match shape.elem {
                ElementKind::F32 => {
                    let (one, zero) = (1.0f32, 0.0f32);
                    cublasSgeam(
                        handle.0, CUBLAS_OP_T, CUBLAS_OP_N, m, n, &one,
                        src.as_ptr().cast(), lda, &zero, dst.as_ptr().cast(), ldc,
                        dst.as_ptr().cast(), ldc,
                    )
                }
                ElementKind::F64 => {
                    let (one, zero) = (1.0f64, 0.0f64);
                    cublasDgeam(
                        handle.0, CUBLAS_OP_T, CUBLAS_OP_N, m, n, &one,
                        src.as_ptr().cast(), lda, &zero, dst.as_ptr().cast(), ldc,
                        dst.as_ptr().cast(), ldc,
                    )
                }
                ElementKind::C32 => {
                    let one = CuComplex { x: 1.0, y: 0.0 };
                    let zero = CuComplex { x: 0.0, y: 0.0 };
                    cublasCgeam(
                        handle.0, CUBLAS_OP_T, CUBLAS_OP_N, m, n, &one,
                        src.as_ptr().cast(), lda, &zero, dst.as_ptr().cast(), ldc,
                        dst.as_ptr().cast(), ldc,
                    )
                }
                ElementKind::C64 => {
                    let one = CuDoubleComplex { x: 1.0, y: 0.0 };
                    let zero = CuDoubleComplex { x: 0.0, y: 0.0 };
                    cublasZgeam(
                        handle.0, CUBLAS_OP_T, CUBLAS_OP_N, m, n, &one,
                        src.as_ptr().cast(), lda, &zero, dst.as_ptr().cast(), ldc,
                        dst.as_ptr().cast(), ldc,
                    )
                }
            }
        };
        check_cublas("geam", code)
    }

    fn concurrent_managed_access(&self) -> bool {
        self.concurrent
    }
}
