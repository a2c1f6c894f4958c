//! ABI layer for the allocator family (`malloc`, `calloc`, `realloc`, `free`,
//! `malloc_usable_size`).
//!
//! Each entry point asks for the process session. Without one (reentrant
//! call, session under construction, tracking off) the call goes straight to
//! glibc. Otherwise the caller's return address becomes the call-site and
//! the session's interceptor decides where the object lives.
//!
//! Release paths use the session even after teardown: a managed object must
//! never reach glibc's `free`.

use std::ffi::c_void;

use gpublas_membrane::CallSite;

use crate::session_state::{
    call_site, native_libc_calloc, native_libc_free, native_libc_malloc, native_libc_realloc,
    native_usable_size, release_session, session,
};

#[inline]
fn set_enomem() {
    // SAFETY: `__errno_location` returns this thread's errno slot.
    unsafe { *libc::__errno_location() = libc::ENOMEM };
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    let Some(session) = session().filter(|s| s.interceptor().tracking_enabled()) else {
        // SAFETY: passthrough to glibc.
        return unsafe { native_libc_malloc(size) };
    };
    let site = call_site();
    match session.interceptor().allocate(size, site) {
        Some(ptr) => ptr.as_ptr().cast(),
        None => {
            set_enomem();
            std::ptr::null_mut()
        }
    }
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut c_void {
    let Some(session) = session().filter(|s| s.interceptor().tracking_enabled()) else {
        // SAFETY: passthrough to glibc.
        return unsafe { native_libc_calloc(nmemb, size) };
    };
    let site = call_site();
    match session.interceptor().allocate_zeroed(nmemb, size, site) {
        Some(ptr) => ptr.as_ptr().cast(),
        None => {
            set_enomem();
            std::ptr::null_mut()
        }
    }
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    let session = if ptr.is_null() {
        session()
    } else {
        release_session()
    };
    let Some(session) = session.filter(|s| s.interceptor().tracking_enabled()) else {
        // SAFETY: passthrough to glibc; `ptr` is null or a glibc block.
        return unsafe { native_libc_realloc(ptr, size) };
    };
    let site = call_site();
    // SAFETY: caller contract of `realloc`: `ptr` is null or a live block
    // returned by this allocator family.
    match unsafe { session.interceptor().resize(ptr.cast(), size, site) } {
        Some(fresh) => fresh.as_ptr().cast(),
        None => {
            if size != 0 {
                set_enomem();
            }
            std::ptr::null_mut()
        }
    }
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    if ptr.is_null() {
        return;
    }
    match release_session() {
        // SAFETY: caller contract of `free`.
        Some(session) => unsafe { session.interceptor().release(ptr.cast(), CallSite::UNKNOWN) },
        // SAFETY: no session means no tracked objects; `ptr` is a glibc block.
        None => unsafe { native_libc_free(ptr) },
    }
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut c_void) -> usize {
    if ptr.is_null() {
        return 0;
    }
    match release_session() {
        // SAFETY: caller contract of `malloc_usable_size`.
        Some(session) => unsafe { session.interceptor().usable_size(ptr.cast()) },
        // SAFETY: no session means `ptr` is a glibc block.
        None => unsafe { native_usable_size(ptr) },
    }
}
