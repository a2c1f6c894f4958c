//! Process-wide session access for the ABI entry points.
//!
//! The session is built lazily on the first intercepted call (or eagerly by
//! the load-time constructor). Its host allocator goes straight to glibc's
//! internal entry points: going through `libc::malloc` would land back in
//! this library's own `malloc`.

use std::ffi::{c_int, c_void};
use std::ptr::NonNull;
use std::sync::{Arc, OnceLock};

use gpublas_core::{GpuBlas, ReentryGuard, init_global, last_session};
use gpublas_membrane::{CallSite, ObjectAllocator};

unsafe extern "C" {
    #[link_name = "__libc_malloc@GLIBC_2.2.5"]
    fn native_libc_malloc_sym(size: usize) -> *mut c_void;
    #[link_name = "__libc_calloc@GLIBC_2.2.5"]
    fn native_libc_calloc_sym(nmemb: usize, size: usize) -> *mut c_void;
    #[link_name = "__libc_realloc@GLIBC_2.2.5"]
    fn native_libc_realloc_sym(ptr: *mut c_void, size: usize) -> *mut c_void;
    #[link_name = "__libc_free@GLIBC_2.2.5"]
    fn native_libc_free_sym(ptr: *mut c_void);
    #[link_name = "backtrace@GLIBC_2.2.5"]
    fn native_backtrace_sym(buffer: *mut *mut c_void, size: c_int) -> c_int;
}

#[inline]
pub(crate) unsafe fn native_libc_malloc(size: usize) -> *mut c_void {
    // SAFETY: direct call to libc allocator symbol.
    unsafe { native_libc_malloc_sym(size) }
}

#[inline]
pub(crate) unsafe fn native_libc_calloc(nmemb: usize, size: usize) -> *mut c_void {
    // SAFETY: direct call to libc allocator symbol.
    unsafe { native_libc_calloc_sym(nmemb, size) }
}

#[inline]
pub(crate) unsafe fn native_libc_realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    // SAFETY: direct call to libc allocator symbol.
    unsafe { native_libc_realloc_sym(ptr, size) }
}

#[inline]
pub(crate) unsafe fn native_libc_free(ptr: *mut c_void) {
    // SAFETY: direct call to libc allocator symbol.
    unsafe { native_libc_free_sym(ptr) }
}

/// glibc's heap, reached below any interposed symbol.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeAllocator;

impl ObjectAllocator for NativeAllocator {
    fn name(&self) -> &'static str {
        "native"
    }

    fn device_visible(&self) -> bool {
        false
    }

    fn construct(&self, size: usize) -> Option<NonNull<u8>> {
        // SAFETY: glibc allocator; null maps to `None`.
        NonNull::new(unsafe { native_libc_malloc(size.max(1)) }.cast())
    }

    fn construct_zeroed(&self, count: usize, size: usize) -> Option<NonNull<u8>> {
        count.checked_mul(size)?;
        // SAFETY: overflow ruled out above.
        NonNull::new(unsafe { native_libc_calloc(count.max(1), size.max(1)) }.cast())
    }

    unsafe fn resize(&self, ptr: NonNull<u8>, _old_size: usize, new_size: usize) -> Option<NonNull<u8>> {
        // SAFETY: caller guarantees `ptr` is a glibc heap block.
        NonNull::new(unsafe { native_libc_realloc(ptr.as_ptr().cast(), new_size.max(1)) }.cast())
    }

    unsafe fn destroy(&self, ptr: NonNull<u8>) {
        // SAFETY: caller guarantees `ptr` is a glibc heap block.
        unsafe { native_libc_free(ptr.as_ptr().cast()) }
    }

    unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        // SAFETY: caller guarantees `ptr` is a live glibc heap block; this
        // symbol is not interposed for foreign blocks, it is glibc's own.
        unsafe { native_usable_size(ptr.as_ptr().cast()) }
    }
}

unsafe extern "C" {
    #[link_name = "malloc_usable_size@GLIBC_2.2.5"]
    fn native_malloc_usable_size_sym(ptr: *mut c_void) -> usize;
}

#[inline]
pub(crate) unsafe fn native_usable_size(ptr: *mut c_void) -> usize {
    // SAFETY: versioned glibc symbol, bypasses this library's export.
    unsafe { native_malloc_usable_size_sym(ptr) }
}

fn native_allocator() -> Arc<dyn ObjectAllocator> {
    static NATIVE: OnceLock<Arc<dyn ObjectAllocator>> = OnceLock::new();
    Arc::clone(NATIVE.get_or_init(|| Arc::new(NativeAllocator)))
}

/// Session for a new allocation or BLAS call. `None` while this thread is
/// inside the tracker (including during session construction) and after
/// teardown.
pub(crate) fn session() -> Option<&'static GpuBlas> {
    if ReentryGuard::active() {
        return None;
    }
    let host = {
        // First use allocates the shared handle.
        let _guard = ReentryGuard::hold();
        native_allocator()
    };
    init_global(host)
}

/// Session for releasing or inspecting an existing object. Never builds one:
/// without a session every live block is a glibc block. Keeps working after
/// teardown so objects allocated during the session go back to the right
/// allocator.
pub(crate) fn release_session() -> Option<&'static GpuBlas> {
    if ReentryGuard::active() {
        return None;
    }
    last_session()
}

/// Frames between `call_site` and the application: this function, then the
/// interposed entry point.
const SKIPPED_FRAMES: usize = 2;

/// Return address of the application code that called the interposed
/// symbol. `CallSite::UNKNOWN` when the stack cannot be walked.
#[inline(never)]
pub(crate) fn call_site() -> CallSite {
    // The unwinder may allocate on first use; those calls must pass through.
    let _guard = ReentryGuard::hold();
    let mut frames = [std::ptr::null_mut::<c_void>(); SKIPPED_FRAMES + 1];
    // SAFETY: the buffer holds `frames.len()` entries.
    let depth = unsafe { native_backtrace_sym(frames.as_mut_ptr(), frames.len() as c_int) };
    match usize::try_from(depth) {
        Ok(n) if n > SKIPPED_FRAMES => CallSite(frames[SKIPPED_FRAMES] as usize),
        _ => CallSite::UNKNOWN,
    }
}
