//! OpenCL 2.0 shared virtual memory + CLBlast backend.
//!
//! All buffers are SVM allocations so they can be addressed by raw pointer.
//! Coarse-grained managed buffers are kept mapped for the host; mapping for
//! the device unmaps them and unmapping maps them back (blocking). With
//! fine-grained SVM both sides may touch the memory at once and map/unmap
//! are no-ops.

use std::ffi::c_void;

use parking_lot::Mutex;

use super::{DevicePtr, DeviceRuntime, ElementKind, MatrixShape, RuntimeError, RuntimeStatus};

const BACKEND: &str = "opencl";

type ClInt = i32;
type ClUint = u32;
type ClBitfield = u64;
type ClPlatformId = *mut c_void;
type ClDeviceId = *mut c_void;
type ClContext = *mut c_void;
type ClCommandQueue = *mut c_void;
type ClMem = *mut c_void;
type ClEvent = *mut c_void;

const CL_SUCCESS: ClInt = 0;
const CL_DEVICE_NOT_FOUND: ClInt = -1;
const CL_DEVICE_NOT_AVAILABLE: ClInt = -2;
const CL_MEM_OBJECT_ALLOCATION_FAILURE: ClInt = -4;
const CL_OUT_OF_RESOURCES: ClInt = -5;
const CL_OUT_OF_HOST_MEMORY: ClInt = -6;
const CL_INVALID_VALUE: ClInt = -30;
const CLBLAST_NOT_IMPLEMENTED: ClInt = -1024;

const CL_TRUE: ClUint = 1;
const CL_DEVICE_TYPE_GPU: ClBitfield = 1 << 2;
const CL_DEVICE_SVM_CAPABILITIES: ClUint = 0x1053;
const CL_DEVICE_SVM_FINE_GRAIN_BUFFER: ClBitfield = 1 << 1;
const CL_MEM_READ_WRITE: ClBitfield = 1 << 0;
const CL_MEM_USE_HOST_PTR: ClBitfield = 1 << 3;
const CL_MEM_SVM_FINE_GRAIN_BUFFER: ClBitfield = 1 << 10;
const CL_MAP_READ: ClBitfield = 1 << 0;
const CL_MAP_WRITE: ClBitfield = 1 << 1;

const CLBLAST_LAYOUT_ROW_MAJOR: i32 = 101;
const CLBLAST_TRANSPOSE_YES: i32 = 112;

#[repr(C, align(8))]
#[derive(Clone, Copy)]
struct ClFloat2([f32; 2]);

#[repr(C, align(16))]
#[derive(Clone, Copy)]
struct ClDouble2([f64; 2]);

#[link(name = "OpenCL")]
unsafe extern "C" {
    fn clGetPlatformIDs(num_entries: ClUint, platforms: *mut ClPlatformId, num_platforms: *mut ClUint) -> ClInt;
    fn clGetDeviceIDs(
        platform: ClPlatformId,
        device_type: ClBitfield,
        num_entries: ClUint,
        devices: *mut ClDeviceId,
        num_devices: *mut ClUint,
    ) -> ClInt;
    fn clGetDeviceInfo(
        device: ClDeviceId,
        param_name: ClUint,
        param_value_size: usize,
        param_value: *mut c_void,
        param_value_size_ret: *mut usize,
    ) -> ClInt;
    fn clCreateContext(
        properties: *const isize,
        num_devices: ClUint,
        devices: *const ClDeviceId,
        pfn_notify: *const c_void,
        user_data: *mut c_void,
        errcode_ret: *mut ClInt,
    ) -> ClContext;
    fn clCreateCommandQueueWithProperties(
        context: ClContext,
        device: ClDeviceId,
        properties: *const u64,
        errcode_ret: *mut ClInt,
    ) -> ClCommandQueue;
    fn clReleaseCommandQueue(queue: ClCommandQueue) -> ClInt;
    fn clReleaseContext(context: ClContext) -> ClInt;
    fn clSVMAlloc(context: ClContext, flags: ClBitfield, size: usize, alignment: ClUint) -> *mut c_void;
    fn clSVMFree(context: ClContext, ptr: *mut c_void);
    fn clEnqueueSVMMemcpy(
        queue: ClCommandQueue,
        blocking: ClUint,
        dst: *mut c_void,
        src: *const c_void,
        size: usize,
        num_events: ClUint,
        wait_list: *const ClEvent,
        event: *mut ClEvent,
    ) -> ClInt;
    fn clEnqueueSVMMap(
        queue: ClCommandQueue,
        blocking: ClUint,
        flags: ClBitfield,
        ptr: *mut c_void,
        size: usize,
        num_events: ClUint,
        wait_list: *const ClEvent,
        event: *mut ClEvent,
    ) -> ClInt;
    fn clEnqueueSVMUnmap(
        queue: ClCommandQueue,
        ptr: *mut c_void,
        num_events: ClUint,
        wait_list: *const ClEvent,
        event: *mut ClEvent,
    ) -> ClInt;
    fn clCreateBuffer(
        context: ClContext,
        flags: ClBitfield,
        size: usize,
        host_ptr: *mut c_void,
        errcode_ret: *mut ClInt,
    ) -> ClMem;
    fn clReleaseMemObject(mem: ClMem) -> ClInt;
    fn clFinish(queue: ClCommandQueue) -> ClInt;
}

#[link(name = "clblast")]
unsafe extern "C" {
    fn CLBlastSomatcopy(
        layout: i32,
        a_transpose: i32,
        m: usize,
        n: usize,
        alpha: f32,
        a_buffer: ClMem,
        a_offset: usize,
        a_ld: usize,
        b_buffer: ClMem,
        b_offset: usize,
        b_ld: usize,
        queue: *mut ClCommandQueue,
        event: *mut ClEvent,
    ) -> ClInt;
    fn CLBlastDomatcopy(
        layout: i32,
        a_transpose: i32,
        m: usize,
        n: usize,
        alpha: f64,
        a_buffer: ClMem,
        a_offset: usize,
        a_ld: usize,
        b_buffer: ClMem,
        b_offset: usize,
        b_ld: usize,
        queue: *mut ClCommandQueue,
        event: *mut ClEvent,
    ) -> ClInt;
    fn CLBlastComatcopy(
        layout: i32,
        a_transpose: i32,
        m: usize,
        n: usize,
        alpha: ClFloat2,
        a_buffer: ClMem,
        a_offset: usize,
        a_ld: usize,
        b_buffer: ClMem,
        b_offset: usize,
        b_ld: usize,
        queue: *mut ClCommandQueue,
        event: *mut ClEvent,
    ) -> ClInt;
    fn CLBlastZomatcopy(
        layout: i32,
        a_transpose: i32,
        m: usize,
        n: usize,
        alpha: ClDouble2,
        a_buffer: ClMem,
        a_offset: usize,
        a_ld: usize,
        b_buffer: ClMem,
        b_offset: usize,
        b_ld: usize,
        queue: *mut ClCommandQueue,
        event: *mut ClEvent,
    ) -> ClInt;
}

fn cl_status(code: ClInt) -> RuntimeStatus {
    match code {
        CL_SUCCESS => RuntimeStatus::Success,
        CL_DEVICE_NOT_FOUND | CL_DEVICE_NOT_AVAILABLE => RuntimeStatus::NotInitialized,
        CL_MEM_OBJECT_ALLOCATION_FAILURE | CL_OUT_OF_RESOURCES | CL_OUT_OF_HOST_MEMORY => {
            RuntimeStatus::AllocFailed
        }
        CLBLAST_NOT_IMPLEMENTED => RuntimeStatus::Unsupported,
        c if (-70..=CL_INVALID_VALUE).contains(&c) => RuntimeStatus::InvalidValue,
        c if (-2048..-1000).contains(&c) => RuntimeStatus::InvalidValue,
        _ => RuntimeStatus::ExecutionFailed,
    }
}

fn check(op: &'static str, code: ClInt) -> Result<(), RuntimeError> {
    match cl_status(code) {
        RuntimeStatus::Success => Ok(()),
        status => Err(RuntimeError::new(BACKEND, op, status, code)),
    }
}

struct Queue {
    context: ClContext,
    queue: ClCommandQueue,
}

// SAFETY: OpenCL contexts and queues are thread-safe objects; enqueue calls
// are additionally serialized by the runtime's mutex.
unsafe impl Send for Queue {}

/// First GPU of the first platform, one in-order queue.
pub struct OpenClRuntime {
    queue: Mutex<Queue>,
    context: ClContext,
    fine_grain: bool,
}

// SAFETY: `context` is only read; all enqueues go through `queue`.
unsafe impl Send for OpenClRuntime {}
// SAFETY: as above.
unsafe impl Sync for OpenClRuntime {}

impl std::fmt::Debug for OpenClRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenClRuntime")
            .field("fine_grain", &self.fine_grain)
            .finish_non_exhaustive()
    }
}

impl OpenClRuntime {
    pub fn new() -> Result<Self, RuntimeError> {
        let mut platform: ClPlatformId = std::ptr::null_mut();
        let mut device: ClDeviceId = std::ptr::null_mut();
        let mut caps: ClBitfield = 0;
        let mut err: ClInt = CL_SUCCESS;
        // SAFETY: every out-pointer references a live local of the right size.
        unsafe {
            check("clGetPlatformIDs", clGetPlatformIDs(1, &mut platform, std::ptr::null_mut()))?;
            check(
                "clGetDeviceIDs",
                clGetDeviceIDs(platform, CL_DEVICE_TYPE_GPU, 1, &mut device, std::ptr::null_mut()),
            )?;
            check(
                "clGetDeviceInfo",
                clGetDeviceInfo(
                    device,
                    CL_DEVICE_SVM_CAPABILITIES,
                    std::mem::size_of::<ClBitfield>(),
                    std::ptr::from_mut(&mut caps).cast(),
                    std::ptr::null_mut(),
                ),
            )?;
            let context = clCreateContext(
                std::ptr::null(),
                1,
                &device,
                std::ptr::null(),
                std::ptr::null_mut(),
                &mut err,
            );
            check("clCreateContext", err)?;
            let queue = clCreateCommandQueueWithProperties(context, device, std::ptr::null(), &mut err);
            if let Err(e) = check("clCreateCommandQueueWithProperties", err) {
                let _ = clReleaseContext(context);
                return Err(e);
            }
            Ok(Self {
                queue: Mutex::new(Queue { context, queue }),
                context,
                fine_grain: caps & CL_DEVICE_SVM_FINE_GRAIN_BUFFER != 0,
            })
        }
    }

    fn svm_alloc(&self, size: usize, flags: ClBitfield, op: &'static str) -> Result<DevicePtr, RuntimeError> {
        // SAFETY: context is live for the runtime's lifetime.
        let ptr = unsafe { clSVMAlloc(self.context, flags, size.max(1), 0) };
        DevicePtr::from_raw(ptr)
            .ok_or_else(|| RuntimeError::new(BACKEND, op, RuntimeStatus::AllocFailed, CL_MEM_OBJECT_ALLOCATION_FAILURE))
    }

    fn wrap(&self, ptr: DevicePtr, size: usize) -> Result<ClMem, RuntimeError> {
        let mut err = CL_SUCCESS;
        // SAFETY: an SVM pointer may back a buffer created with USE_HOST_PTR.
        let mem = unsafe {
            clCreateBuffer(self.context, CL_MEM_READ_WRITE | CL_MEM_USE_HOST_PTR, size.max(1), ptr.as_ptr().cast(), &mut err)
        };
        check("clCreateBuffer", err)?;
        Ok(mem)
    }
}

impl Drop for OpenClRuntime {
    fn drop(&mut self) {
        let q = self.queue.get_mut();
        // SAFETY: both handles were created in `new` and are released once.
        unsafe {
            let _ = clReleaseCommandQueue(q.queue);
            let _ = clReleaseContext(q.context);
        }
    }
}

impl DeviceRuntime for OpenClRuntime {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn alloc_device(&self, size: usize) -> Result<DevicePtr, RuntimeError> {
        self.svm_alloc(size, CL_MEM_READ_WRITE, "clSVMAlloc")
    }

    fn alloc_managed(&self, size: usize) -> Result<DevicePtr, RuntimeError> {
        if self.fine_grain {
            return self.svm_alloc(size, CL_MEM_READ_WRITE | CL_MEM_SVM_FINE_GRAIN_BUFFER, "clSVMAlloc");
        }
        let ptr = self.svm_alloc(size, CL_MEM_READ_WRITE, "clSVMAlloc")?;
        let q = self.queue.lock();
        // SAFETY: freshly allocated SVM range of `size` bytes.
        let code = unsafe {
            clEnqueueSVMMap(
                q.queue, CL_TRUE, CL_MAP_READ | CL_MAP_WRITE, ptr.as_ptr().cast(), size.max(1),
                0, std::ptr::null(), std::ptr::null_mut(),
            )
        };
        if let Err(e) = check("clEnqueueSVMMap", code) {
            // SAFETY: not yet handed out.
            unsafe { clSVMFree(self.context, ptr.as_ptr().cast()) };
            return Err(e);
        }
        Ok(ptr)
    }

    unsafe fn free(&self, ptr: DevicePtr) -> Result<(), RuntimeError> {
        let q = self.queue.lock();
        // SAFETY: caller guarantees `ptr` came from clSVMAlloc; finish first
        // so no queued command still references it.
        unsafe {
            check("clFinish", clFinish(q.queue))?;
            clSVMFree(self.context, ptr.as_ptr().cast());
        }
        Ok(())
    }

    unsafe fn copy_host_to_device(
        &self,
        dst: DevicePtr,
        src: *const u8,
        size: usize,
    ) -> Result<(), RuntimeError> {
        let q = self.queue.lock();
        // SAFETY: caller guarantees both ranges; the copy is blocking.
        check("clEnqueueSVMMemcpy", unsafe {
            clEnqueueSVMMemcpy(
                q.queue, CL_TRUE, dst.as_ptr().cast(), src.cast(), size,
                0, std::ptr::null(), std::ptr::null_mut(),
            )
        })
    }

    unsafe fn copy_device_to_host(
        &self,
        dst: *mut u8,
        src: DevicePtr,
        size: usize,
    ) -> Result<(), RuntimeError> {
        let q = self.queue.lock();
        // SAFETY: caller guarantees both ranges; the copy is blocking.
        check("clEnqueueSVMMemcpy", unsafe {
            clEnqueueSVMMemcpy(
                q.queue, CL_TRUE, dst.cast(), src.as_ptr().cast(), size,
                0, std::ptr::null(), std::ptr::null_mut(),
            )
        })
    }

    fn map_for_device(&self, ptr: DevicePtr, _size: usize) -> Result<(), RuntimeError> {
        if self.fine_grain {
            return Ok(());
        }
        let q = self.queue.lock();
        // SAFETY: `ptr` is inside a host-mapped coarse-grained SVM buffer.
        check("clEnqueueSVMUnmap", unsafe {
            clEnqueueSVMUnmap(q.queue, ptr.as_ptr().cast(), 0, std::ptr::null(), std::ptr::null_mut())
        })
    }

    fn unmap_from_device(&self, ptr: DevicePtr, size: usize) -> Result<(), RuntimeError> {
        if self.fine_grain {
            return Ok(());
        }
        let q = self.queue.lock();
        // SAFETY: `ptr` is inside a device-owned coarse-grained SVM buffer.
        check("clEnqueueSVMMap", unsafe {
            clEnqueueSVMMap(
                q.queue, CL_TRUE, CL_MAP_READ | CL_MAP_WRITE, ptr.as_ptr().cast(), size.max(1),
                0, std::ptr::null(), std::ptr::null_mut(),
            )
        })
    }

    fn synchronize(&self) -> Result<(), RuntimeError> {
        let q = self.queue.lock();
        // SAFETY: live queue.
        check("clFinish", unsafe { clFinish(q.queue) })
    }

    unsafe fn transpose(
        &self,
        dst: DevicePtr,
        dst_ld: usize,
        src: DevicePtr,
        shape: MatrixShape,
    ) -> Result<(), RuntimeError> {
        let invalid = || RuntimeError::new(BACKEND, "omatcopy", RuntimeStatus::InvalidValue, CL_INVALID_VALUE);
        let src_bytes = shape.bytes().ok_or_else(invalid)?;
        let dst_bytes = MatrixShape::new(shape.cols, shape.rows, dst_ld, shape.elem)
            .bytes()
            .ok_or_else(invalid)?;
        let a = self.wrap(src, src_bytes)?;
        let b = match self.wrap(dst, dst_bytes) {
            Ok(b) => b,
            Err(e) => {
                // SAFETY: created just above.
                unsafe { clReleaseMemObject(a) };
                return Err(e);
            }
        };
        let mut q = self.queue.lock();
        let queue = &mut q.queue;
        let (m, n, lda) = (shape.rows, shape.cols, shape.ld);
        let none = std::ptr::null_mut();
        // Row-major B (cols x rows, ld dst_ld) = A^T.
        // SAFETY: both cl_mem objects wrap live SVM ranges of the stated sizes.
        let code = unsafe {
            match shape.elem {
                ElementKind::F32 => CLBlastSomatcopy(
                    CLBLAST_LAYOUT_ROW_MAJOR, CLBLAST_TRANSPOSE_YES, m, n, 1.0, a, 0, lda, b, 0, dst_ld, queue, none,
                ),
                ElementKind::F64 => CLBlastDomatcopy(
                    CLBLAST_LAYOUT_ROW_MAJOR, CLBLAST_TRANSPOSE_YES, m, n, 1.0, a, 0, lda, b, 0, dst_ld, queue, none,
                ),
                ElementKind::C32 => CLBlastComatcopy(
                    CLBLAST_LAYOUT_ROW_MAJOR, CLBLAST_TRANSPOSE_YES, m, n, ClFloat2([1.0, 0.0]), a, 0, lda, b, 0,
                    dst_ld, queue, none,
                ),
                ElementKind::C64 => CLBlastZomatcopy(
                    CLBLAST_LAYOUT_ROW_MAJOR, CLBLAST_TRANSPOSE_YES, m, n, ClDouble2([1.0, 0.0]), a, 0, lda, b, 0,
                    dst_ld, queue, none,
                ),
            }
        };
        // SAFETY: release after the command has been enqueued; OpenCL keeps
        // the objects alive until the command completes.
        unsafe {
            clReleaseMemObject(a);
            clReleaseMemObject(b);
        }
        check("omatcopy", code)
    }

    fn concurrent_managed_access(&self) -> bool {
        self.fine_grain
    }
}
