//! Host-memory emulation of an accelerator.
//!
//! Device and managed buffers are ordinary heap blocks, so every placement
//! path can be exercised on machines without a GPU. The runtime validates
//! each device pointer against its live-buffer table, tracks map/unmap
//! balance for managed buffers, and can be told to fail specific operations
//! to drive rollback paths.

use std::alloc::{Layout, alloc, alloc_zeroed, dealloc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use super::{DevicePtr, DeviceRuntime, MatrixShape, RuntimeError, RuntimeStatus};

const BACKEND: &str = "host";
const BUFFER_ALIGN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufferKind {
    Device,
    Managed,
}

#[derive(Debug)]
struct Buffer {
    layout: Layout,
    size: usize,
    kind: BufferKind,
    /// Outstanding `map_for_device` calls.
    maps: usize,
}

#[derive(Debug, Default)]
struct FailurePlan {
    /// Device allocations still allowed to succeed; `None` = unlimited.
    device_alloc_budget: Option<usize>,
    managed_alloc_budget: Option<usize>,
}

/// Host-emulated accelerator.
#[derive(Debug)]
pub struct HostRuntime {
    buffers: Mutex<BTreeMap<usize, Buffer>>,
    plan: Mutex<FailurePlan>,
    fail_copy: AtomicBool,
    fail_map: AtomicBool,
    fail_unmap: AtomicBool,
    fail_free: AtomicBool,
    fail_sync: AtomicBool,
    concurrent: AtomicBool,
    synchronizations: AtomicU64,
}

impl HostRuntime {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffers: Mutex::new(BTreeMap::new()),
            plan: Mutex::new(FailurePlan::default()),
            fail_copy: AtomicBool::new(false),
            fail_map: AtomicBool::new(false),
            fail_unmap: AtomicBool::new(false),
            fail_free: AtomicBool::new(false),
            fail_sync: AtomicBool::new(false),
            concurrent: AtomicBool::new(true),
            synchronizations: AtomicU64::new(0),
        }
    }

    /// Let `n` more device allocations succeed, then fail every one after.
    pub fn fail_device_alloc_after(&self, n: usize) {
        self.plan.lock().device_alloc_budget = Some(n);
    }

    pub fn fail_managed_alloc_after(&self, n: usize) {
        self.plan.lock().managed_alloc_budget = Some(n);
    }

    /// Fail host/device copies while set.
    pub fn set_fail_copy(&self, fail: bool) {
        self.fail_copy.store(fail, Ordering::Relaxed);
    }

    pub fn set_fail_map(&self, fail: bool) {
        self.fail_map.store(fail, Ordering::Relaxed);
    }

    pub fn set_fail_unmap(&self, fail: bool) {
        self.fail_unmap.store(fail, Ordering::Relaxed);
    }

    pub fn set_fail_free(&self, fail: bool) {
        self.fail_free.store(fail, Ordering::Relaxed);
    }

    pub fn set_fail_sync(&self, fail: bool) {
        self.fail_sync.store(fail, Ordering::Relaxed);
    }

    /// Emulate a device without concurrent managed access.
    pub fn set_concurrent_managed_access(&self, concurrent: bool) {
        self.concurrent.store(concurrent, Ordering::Relaxed);
    }

    /// Clear every injected failure.
    pub fn heal(&self) {
        *self.plan.lock() = FailurePlan::default();
        for flag in [
            &self.fail_copy,
            &self.fail_map,
            &self.fail_unmap,
            &self.fail_free,
            &self.fail_sync,
        ] {
            flag.store(false, Ordering::Relaxed);
        }
    }

    /// Live device-only buffers.
    #[must_use]
    pub fn live_device_buffers(&self) -> usize {
        self.count(BufferKind::Device)
    }

    #[must_use]
    pub fn live_managed_buffers(&self) -> usize {
        self.count(BufferKind::Managed)
    }

    /// True if the managed buffer containing `addr` is currently mapped.
    #[must_use]
    pub fn is_mapped(&self, addr: usize) -> bool {
        let buffers = self.buffers.lock();
        find(&buffers, addr, 1).is_some_and(|(_, b)| b.maps > 0)
    }

    #[must_use]
    pub fn synchronizations(&self) -> u64 {
        self.synchronizations.load(Ordering::Relaxed)
    }

    fn count(&self, kind: BufferKind) -> usize {
        self.buffers.lock().values().filter(|b| b.kind == kind).count()
    }

    fn allocate(&self, size: usize, kind: BufferKind, op: &'static str) -> Result<DevicePtr, RuntimeError> {
        {
            let mut plan = self.plan.lock();
            let budget = match kind {
                BufferKind::Device => &mut plan.device_alloc_budget,
                BufferKind::Managed => &mut plan.managed_alloc_budget,
            };
            match budget {
                Some(0) => return Err(error(op, RuntimeStatus::AllocFailed)),
                Some(n) => *n -= 1,
                None => {}
            }
        }

        let layout = Layout::from_size_align(size.max(1), BUFFER_ALIGN)
            .map_err(|_| error(op, RuntimeStatus::InvalidValue))?;
        // SAFETY: layout has non-zero size.
        let raw = unsafe {
            match kind {
                BufferKind::Device => alloc(layout),
                BufferKind::Managed => alloc_zeroed(layout),
            }
        };
        let ptr = DevicePtr::from_raw(raw).ok_or_else(|| error(op, RuntimeStatus::AllocFailed))?;
        self.buffers.lock().insert(
            ptr.addr(),
            Buffer {
                layout,
                size,
                kind,
                maps: 0,
            },
        );
        Ok(ptr)
    }

    fn check_range(&self, ptr: DevicePtr, size: usize, op: &'static str) -> Result<(), RuntimeError> {
        let buffers = self.buffers.lock();
        find(&buffers, ptr.addr(), size)
            .map(|_| ())
            .ok_or_else(|| error(op, RuntimeStatus::InvalidValue))
    }
}

impl Default for HostRuntime {
    fn default() -> Self {
        Self::new()
    }
}

fn error(op: &'static str, status: RuntimeStatus) -> RuntimeError {
    RuntimeError::new(BACKEND, op, status, status as i32)
}

/// Live buffer covering `[addr, addr + len)`.
fn find(buffers: &BTreeMap<usize, Buffer>, addr: usize, len: usize) -> Option<(usize, &Buffer)> {
    let (&start, buffer) = buffers.range(..=addr).next_back()?;
    let end = start + buffer.size.max(1);
    let want_end = addr.checked_add(len)?;
    (want_end <= end).then_some((start, buffer))
}

fn find_mut(buffers: &mut BTreeMap<usize, Buffer>, addr: usize, len: usize) -> Option<&mut Buffer> {
    let start = find(buffers, addr, len)?.0;
    buffers.get_mut(&start)
}

impl DeviceRuntime for HostRuntime {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn alloc_device(&self, size: usize) -> Result<DevicePtr, RuntimeError> {
        self.allocate(size, BufferKind::Device, "alloc_device")
    }

    fn alloc_managed(&self, size: usize) -> Result<DevicePtr, RuntimeError> {
        self.allocate(size, BufferKind::Managed, "alloc_managed")
    }

    unsafe fn free(&self, ptr: DevicePtr) -> Result<(), RuntimeError> {
        if self.fail_free.load(Ordering::Relaxed) {
            return Err(error("free", RuntimeStatus::InternalError));
        }
        let buffer = self
            .buffers
            .lock()
            .remove(&ptr.addr())
            .ok_or_else(|| error("free", RuntimeStatus::InvalidValue))?;
        // SAFETY: the block was allocated with this layout and is now unlisted.
        unsafe { dealloc(ptr.as_ptr(), buffer.layout) };
        Ok(())
    }

    unsafe fn copy_host_to_device(
        &self,
        dst: DevicePtr,
        src: *const u8,
        size: usize,
    ) -> Result<(), RuntimeError> {
        if self.fail_copy.load(Ordering::Relaxed) {
            return Err(error("copy_host_to_device", RuntimeStatus::MappingError));
        }
        self.check_range(dst, size, "copy_host_to_device")?;
        // SAFETY: caller guarantees `src` is readable; `dst` range was validated.
        unsafe { std::ptr::copy(src, dst.as_ptr(), size) };
        Ok(())
    }

    unsafe fn copy_device_to_host(
        &self,
        dst: *mut u8,
        src: DevicePtr,
        size: usize,
    ) -> Result<(), RuntimeError> {
        if self.fail_copy.load(Ordering::Relaxed) {
            return Err(error("copy_device_to_host", RuntimeStatus::MappingError));
        }
        self.check_range(src, size, "copy_device_to_host")?;
        // SAFETY: caller guarantees `dst` is writable; `src` range was validated.
        unsafe { std::ptr::copy(src.as_ptr(), dst, size) };
        Ok(())
    }

    fn map_for_device(&self, ptr: DevicePtr, size: usize) -> Result<(), RuntimeError> {
        if self.fail_map.load(Ordering::Relaxed) {
            return Err(error("map_for_device", RuntimeStatus::MappingError));
        }
        let mut buffers = self.buffers.lock();
        match find_mut(&mut buffers, ptr.addr(), size) {
            Some(b) if b.kind == BufferKind::Managed => {
                b.maps += 1;
                Ok(())
            }
            _ => Err(error("map_for_device", RuntimeStatus::InvalidValue)),
        }
    }

    fn unmap_from_device(&self, ptr: DevicePtr, size: usize) -> Result<(), RuntimeError> {
        if self.fail_unmap.load(Ordering::Relaxed) {
            return Err(error("unmap_from_device", RuntimeStatus::MappingError));
        }
        let mut buffers = self.buffers.lock();
        match find_mut(&mut buffers, ptr.addr(), size) {
            Some(b) if b.kind == BufferKind::Managed && b.maps > 0 => {
                b.maps -= 1;
                Ok(())
            }
            _ => Err(error("unmap_from_device", RuntimeStatus::InvalidValue)),
        }
    }

    fn synchronize(&self) -> Result<(), RuntimeError> {
        if self.fail_sync.load(Ordering::Relaxed) {
            return Err(error("synchronize", RuntimeStatus::ExecutionFailed));
        }
        self.synchronizations.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    unsafe fn transpose(
        &self,
        dst: DevicePtr,
        dst_ld: usize,
        src: DevicePtr,
        shape: MatrixShape,
    ) -> Result<(), RuntimeError> {
        if !shape.is_valid() || dst_ld < shape.rows {
            return Err(error("transpose", RuntimeStatus::InvalidValue));
        }
        let src_bytes = shape
            .bytes()
            .ok_or_else(|| error("transpose", RuntimeStatus::InvalidValue))?;
        let dst_bytes = MatrixShape::new(shape.cols, shape.rows, dst_ld, shape.elem)
            .bytes()
            .ok_or_else(|| error("transpose", RuntimeStatus::InvalidValue))?;
        if src_bytes == 0 {
            return Ok(());
        }
        self.check_range(src, src_bytes, "transpose")?;
        self.check_range(dst, dst_bytes, "transpose")?;

        let elem = shape.elem.size();
        for i in 0..shape.rows {
            for j in 0..shape.cols {
                let from = (i * shape.ld + j) * elem;
                let to = (j * dst_ld + i) * elem;
                // SAFETY: both offsets are inside ranges validated above.
                unsafe {
                    std::ptr::copy_nonoverlapping(src.as_ptr().add(from), dst.as_ptr().add(to), elem);
                }
            }
        }
        Ok(())
    }

    fn concurrent_managed_access(&self) -> bool {
        self.concurrent.load(Ordering::Relaxed)
    }
}

impl Drop for HostRuntime {
    fn drop(&mut self) {
        for (addr, buffer) in std::mem::take(self.buffers.get_mut()) {
            // SAFETY: every listed block was allocated with its recorded layout.
            unsafe { dealloc(addr as *mut u8, buffer.layout) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ElementKind;

    #[test]
    fn device_buffers_round_trip() {
        let rt = HostRuntime::new();
        let buf = rt.alloc_device(16).unwrap();
        let src = [1u8, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16];
        let mut back = [0u8; 16];
        unsafe {
            rt.copy_host_to_device(buf, src.as_ptr(), 16).unwrap();
            rt.copy_device_to_host(back.as_mut_ptr(), buf, 16).unwrap();
        }
        assert_eq!(src, back);
        assert_eq!(rt.live_device_buffers(), 1);
        unsafe { rt.free(buf).unwrap() };
        assert_eq!(rt.live_device_buffers(), 0);
    }

    #[test]
    fn copies_outside_a_buffer_are_rejected() {
        let rt = HostRuntime::new();
        let buf = rt.alloc_device(8).unwrap();
        let src = [0u8; 16];
        let err = unsafe { rt.copy_host_to_device(buf, src.as_ptr(), 16) }.unwrap_err();
        assert_eq!(err.status, RuntimeStatus::InvalidValue);
        unsafe { rt.free(buf).unwrap() };
    }

    #[test]
    fn allocation_budget_fails_after_n() {
        let rt = HostRuntime::new();
        rt.fail_device_alloc_after(2);
        let a = rt.alloc_device(4).unwrap();
        let b = rt.alloc_device(4).unwrap();
        assert_eq!(rt.alloc_device(4).unwrap_err().status, RuntimeStatus::AllocFailed);
        rt.heal();
        let c = rt.alloc_device(4).unwrap();
        unsafe {
            rt.free(a).unwrap();
            rt.free(b).unwrap();
            rt.free(c).unwrap();
        }
    }

    #[test]
    fn map_unmap_balance_on_managed_only() {
        let rt = HostRuntime::new();
        let managed = rt.alloc_managed(64).unwrap();
        let device = rt.alloc_device(64).unwrap();
        rt.map_for_device(managed.offset(16), 32).unwrap();
        assert!(rt.is_mapped(managed.addr()));
        rt.unmap_from_device(managed.offset(16), 32).unwrap();
        assert!(!rt.is_mapped(managed.addr()));
        assert!(rt.unmap_from_device(managed, 64).is_err());
        assert!(rt.map_for_device(device, 64).is_err());
        unsafe {
            rt.free(managed).unwrap();
            rt.free(device).unwrap();
        }
    }

    #[test]
    fn transpose_and_back_restores_layout() {
        let rt = HostRuntime::new();
        // 2 x 3 row-major with ld 4 (one padding column).
        let host: [f32; 8] = [1.0, 2.0, 3.0, -1.0, 4.0, 5.0, 6.0, -1.0];
        let shape = MatrixShape::new(2, 3, 4, ElementKind::F32);
        let a = rt.alloc_device(32).unwrap();
        let t = rt.alloc_device(24).unwrap();
        unsafe {
            rt.copy_host_to_device(a, host.as_ptr().cast(), 32).unwrap();
            rt.transpose(t, 2, a, shape).unwrap();
            let mut col_major = [0f32; 6];
            rt.copy_device_to_host(col_major.as_mut_ptr().cast(), t, 24).unwrap();
            assert_eq!(col_major, [1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);

            let zero = [0f32; 8];
            rt.copy_host_to_device(a, zero.as_ptr().cast(), 32).unwrap();
            rt.transpose(a, 4, t, shape.transposed()).unwrap();
            let mut back = [0f32; 8];
            rt.copy_device_to_host(back.as_mut_ptr().cast(), a, 32).unwrap();
            assert_eq!(back, [1.0, 2.0, 3.0, 0.0, 4.0, 5.0, 6.0, 0.0]);

            rt.free(a).unwrap();
            rt.free(t).unwrap();
        }
    }

    #[test]
    fn injected_failures_report_status() {
        let rt = HostRuntime::new();
        rt.set_fail_sync(true);
        assert_eq!(rt.synchronize().unwrap_err().status, RuntimeStatus::ExecutionFailed);
        rt.heal();
        rt.synchronize().unwrap();
        assert_eq!(rt.synchronizations(), 1);
    }
}
