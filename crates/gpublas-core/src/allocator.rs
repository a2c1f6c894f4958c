//! Object allocators behind [`AllocationRecord`](gpublas_membrane::AllocationRecord)s.
//!
//! - [`SystemAllocator`]: the C heap through `libc`.
//! - [`ManagedAllocator`]: device-visible managed memory from a
//!   [`DeviceRuntime`], with the requested size stored in a header in front
//!   of the object so `usable_size` needs no side table.
//!
//! The interposed `malloc` family in `gpublas-abi` brings its own
//! allocator over the glibc-internal entry points; `SystemAllocator` would
//! recurse into the interposer there.

use std::ptr::NonNull;
use std::sync::Arc;

use gpublas_membrane::{Logger, ObjectAllocator};

use crate::fatal::fatal;
use crate::runtime::{DevicePtr, DeviceRuntime};

/// Bytes in front of a managed object. Keeps the object 16-byte aligned.
pub const MANAGED_HEADER: usize = 16;

/// C heap allocator.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAllocator;

impl SystemAllocator {
    #[must_use]
    pub fn shared() -> Arc<dyn ObjectAllocator> {
        Arc::new(Self)
    }
}

impl ObjectAllocator for SystemAllocator {
    fn name(&self) -> &'static str {
        "system"
    }

    fn device_visible(&self) -> bool {
        false
    }

    fn construct(&self, size: usize) -> Option<NonNull<u8>> {
        // SAFETY: plain libc call; null is mapped to `None`.
        NonNull::new(unsafe { libc::malloc(size.max(1)) }.cast())
    }

    fn construct_zeroed(&self, count: usize, size: usize) -> Option<NonNull<u8>> {
        count.checked_mul(size)?;
        // SAFETY: overflow was ruled out above; calloc zero-fills.
        NonNull::new(unsafe { libc::calloc(count.max(1), size.max(1)) }.cast())
    }

    unsafe fn resize(&self, ptr: NonNull<u8>, _old_size: usize, new_size: usize) -> Option<NonNull<u8>> {
        // SAFETY: caller guarantees `ptr` came from this allocator.
        NonNull::new(unsafe { libc::realloc(ptr.as_ptr().cast(), new_size.max(1)) }.cast())
    }

    unsafe fn destroy(&self, ptr: NonNull<u8>) {
        // SAFETY: caller guarantees `ptr` came from this allocator.
        unsafe { libc::free(ptr.as_ptr().cast()) }
    }

    unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        // SAFETY: caller guarantees `ptr` is a live block from this allocator.
        unsafe { libc::malloc_usable_size(ptr.as_ptr().cast()) }
    }
}

/// Managed-memory allocator: objects are addressable from host and device.
#[derive(Debug)]
pub struct ManagedAllocator {
    runtime: Arc<dyn DeviceRuntime>,
    /// Receives the `fatal` event when the runtime refuses a free.
    logger: Arc<Logger>,
}

impl ManagedAllocator {
    #[must_use]
    pub fn new(runtime: Arc<dyn DeviceRuntime>, logger: Arc<Logger>) -> Self {
        Self { runtime, logger }
    }

    #[must_use]
    pub fn shared(runtime: Arc<dyn DeviceRuntime>, logger: Arc<Logger>) -> Arc<dyn ObjectAllocator> {
        Arc::new(Self::new(runtime, logger))
    }

    fn base(ptr: NonNull<u8>) -> *mut u8 {
        ptr.as_ptr().wrapping_sub(MANAGED_HEADER)
    }
}

impl ObjectAllocator for ManagedAllocator {
    fn name(&self) -> &'static str {
        "managed"
    }

    fn device_visible(&self) -> bool {
        true
    }

    fn construct(&self, size: usize) -> Option<NonNull<u8>> {
        let total = size.checked_add(MANAGED_HEADER)?;
        let base = self.runtime.alloc_managed(total).ok()?;
        // SAFETY: the block is at least MANAGED_HEADER bytes and suitably
        // aligned for usize (runtimes return at least 16-byte alignment).
        unsafe {
            base.as_ptr().cast::<usize>().write(size);
            NonNull::new(base.as_ptr().add(MANAGED_HEADER))
        }
    }

    unsafe fn destroy(&self, ptr: NonNull<u8>) {
        let Some(base) = DevicePtr::from_raw(Self::base(ptr)) else {
            return;
        };
        // SAFETY: caller guarantees `ptr` came from `construct`, so `base` is
        // the runtime allocation.
        if let Err(err) = unsafe { self.runtime.free(base) } {
            fatal(&self.logger, "managed_free", &err);
        }
    }

    unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        // SAFETY: caller guarantees `ptr` came from `construct`; the header
        // holds the requested size.
        unsafe { Self::base(ptr).cast::<usize>().read() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::host::HostRuntime;

    #[test]
    fn system_allocator_round_trip() {
        let a = SystemAllocator;
        let p = a.construct(32).unwrap();
        unsafe {
            assert!(a.usable_size(p) >= 32);
            p.as_ptr().write_bytes(0xAB, 32);
            let q = a.resize(p, 32, 64).unwrap();
            assert_eq!(*q.as_ptr().add(31), 0xAB);
            a.destroy(q);
        }
        assert!(!a.device_visible());
    }

    #[test]
    fn system_zeroed_rejects_overflow() {
        assert!(SystemAllocator.construct_zeroed(usize::MAX, 2).is_none());
        let p = SystemAllocator.construct_zeroed(4, 4).unwrap();
        unsafe {
            assert!(std::slice::from_raw_parts(p.as_ptr(), 16).iter().all(|&b| b == 0));
            SystemAllocator.destroy(p);
        }
    }

    #[test]
    fn managed_header_holds_requested_size() {
        let rt = Arc::new(HostRuntime::new());
        let a = ManagedAllocator::new(rt.clone(), Arc::new(Logger::default()));
        let p = a.construct(100).unwrap();
        assert_eq!(p.as_ptr() as usize % MANAGED_HEADER, 0);
        assert_eq!(unsafe { a.usable_size(p) }, 100);
        assert_eq!(rt.live_managed_buffers(), 1);
        unsafe { a.destroy(p) };
        assert_eq!(rt.live_managed_buffers(), 0);
    }

    #[test]
    fn managed_resize_keeps_prefix() {
        let rt = Arc::new(HostRuntime::new());
        let a = ManagedAllocator::new(rt.clone(), Arc::new(Logger::default()));
        let p = a.construct(8).unwrap();
        unsafe {
            std::ptr::copy_nonoverlapping([1u8, 2, 3, 4, 5, 6, 7, 8].as_ptr(), p.as_ptr(), 8);
            let q = a.resize(p, 8, 4).unwrap();
            assert_eq!(std::slice::from_raw_parts(q.as_ptr(), 4), &[1, 2, 3, 4]);
            assert_eq!(a.usable_size(q), 4);
            a.destroy(q);
        }
        assert_eq!(rt.live_managed_buffers(), 0);
    }

    #[test]
    fn managed_exhaustion_is_none() {
        let rt = Arc::new(HostRuntime::new());
        rt.fail_managed_alloc_after(0);
        assert!(ManagedAllocator::new(rt, Arc::new(Logger::default())).construct(8).is_none());
    }
}
