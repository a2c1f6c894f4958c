//! Placement API for BLAS shims.
//!
//! A shim opens a call, places each operand, runs its kernel on the
//! returned device pointers and finishes the call:
//!
//! ```c
//! gpublas_call *call = gpublas_call_begin();
//! float *dx = gpublas_call_place(call, x, n * sizeof(float));
//! float *dy = gpublas_call_place_output(call, y, n * sizeof(float));
//! if (!dx || !dy) { gpublas_call_abort(call); return fallback(); }
//! cublasSaxpy(handle, n, &alpha, dx, 1, dy, 1);
//! gpublas_call_finish(call);
//! ```
//!
//! A failed placement has already rolled back every operand placed before
//! it; the shim only has to drop the call handle with `gpublas_call_abort`.

use std::ffi::{c_int, c_void};

use gpublas_core::{CallPlacement, Direction, ElementKind, MatrixShape, ReentryGuard};
use gpublas_membrane::{LogEvent, LogLevel};
use serde_json::json;

use crate::session_state::session;

/// Opaque handle for one BLAS call.
#[derive(Debug)]
pub struct GpublasCall {
    inner: CallPlacement<'static>,
}

/// Counter snapshot for C callers.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GpublasStats {
    pub hits: u64,
    pub misses: u64,
    pub managed_bytes: u64,
    pub bytes_to_device: u64,
    pub bytes_to_host: u64,
    pub rollbacks: u64,
}

/// `elem` values accepted by [`gpublas_call_place_matrix`].
pub const GPUBLAS_ELEM_F32: c_int = 0;
pub const GPUBLAS_ELEM_F64: c_int = 1;
pub const GPUBLAS_ELEM_C32: c_int = 2;
pub const GPUBLAS_ELEM_C64: c_int = 3;

fn element_kind(elem: c_int) -> Option<ElementKind> {
    match elem {
        GPUBLAS_ELEM_F32 => Some(ElementKind::F32),
        GPUBLAS_ELEM_F64 => Some(ElementKind::F64),
        GPUBLAS_ELEM_C32 => Some(ElementKind::C32),
        GPUBLAS_ELEM_C64 => Some(ElementKind::C64),
        _ => None,
    }
}

fn log_failure(call: &GpublasCall, op: &str, err: &dyn std::fmt::Display) {
    if let Some(session) = session() {
        let _guard = ReentryGuard::hold();
        session.logger().emit(
            &LogEvent::new(LogLevel::Warn, "placement_failure")
                .with_symbol(op)
                .with_message(err.to_string())
                .with_details(json!({ "placed": call.inner.buffers().len() })),
        );
    }
}

/// Start a call. Null without a session.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub extern "C" fn gpublas_call_begin() -> *mut GpublasCall {
    let Some(session) = session() else {
        return std::ptr::null_mut();
    };
    let _guard = ReentryGuard::hold();
    Box::into_raw(Box::new(GpublasCall {
        inner: session.call(),
    }))
}

/// Place an input operand. Null on failure, after rolling back the call.
///
/// # Safety
///
/// `call` must come from [`gpublas_call_begin`]; `host` must be null or
/// readable for `size` bytes.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn gpublas_call_place(
    call: *mut GpublasCall,
    host: *const c_void,
    size: usize,
) -> *mut c_void {
    // SAFETY: caller passes a live handle or null.
    let Some(call) = (unsafe { call.as_mut() }) else {
        return std::ptr::null_mut();
    };
    // SAFETY: forwarded caller contract.
    match unsafe { call.inner.place(host.cast(), size) } {
        Ok(device) => device.as_ptr().cast(),
        Err(err) => {
            log_failure(call, "gpublas_call_place", &err);
            std::ptr::null_mut()
        }
    }
}

/// Place an operand copied back to `host` by [`gpublas_call_finish`].
///
/// # Safety
///
/// `call` must come from [`gpublas_call_begin`]; `host` must be null or
/// valid for reads and writes of `size` bytes until the call finishes.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn gpublas_call_place_output(
    call: *mut GpublasCall,
    host: *mut c_void,
    size: usize,
) -> *mut c_void {
    // SAFETY: caller passes a live handle or null.
    let Some(call) = (unsafe { call.as_mut() }) else {
        return std::ptr::null_mut();
    };
    // SAFETY: forwarded caller contract.
    match unsafe { call.inner.place_output(host.cast(), size) } {
        Ok(device) => device.as_ptr().cast(),
        Err(err) => {
            log_failure(call, "gpublas_call_place_output", &err);
            std::ptr::null_mut()
        }
    }
}

/// Place a row-major `rows x cols` matrix with leading dimension `ld` and
/// return a column-major device copy. With `inout` non-zero the result is
/// transposed back and copied home on finish.
///
/// # Safety
///
/// `call` must come from [`gpublas_call_begin`]; `host` must be valid for
/// the matrix extent (writable when `inout` is set).
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn gpublas_call_place_matrix(
    call: *mut GpublasCall,
    host: *mut c_void,
    rows: usize,
    cols: usize,
    ld: usize,
    elem: c_int,
    inout: c_int,
) -> *mut c_void {
    // SAFETY: caller passes a live handle or null.
    let Some(call) = (unsafe { call.as_mut() }) else {
        return std::ptr::null_mut();
    };
    let Some(elem) = element_kind(elem) else {
        call.inner.rollback();
        return std::ptr::null_mut();
    };
    let direction = if inout == 0 {
        Direction::Input
    } else {
        Direction::InOut
    };
    let shape = MatrixShape::new(rows, cols, ld, elem);
    // SAFETY: forwarded caller contract.
    match unsafe { call.inner.place_matrix(host.cast(), shape, direction) } {
        Ok(device) => device.as_ptr().cast(),
        Err(err) => {
            log_failure(call, "gpublas_call_place_matrix", &err);
            std::ptr::null_mut()
        }
    }
}

/// Synchronize, copy outputs home and release every operand. Consumes the
/// handle. Returns 0, or -1 if completion failed (operands are released
/// either way).
///
/// # Safety
///
/// `call` must come from [`gpublas_call_begin`] and not be used afterwards.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn gpublas_call_finish(call: *mut GpublasCall) -> c_int {
    if call.is_null() {
        return -1;
    }
    let result = {
        let _guard = ReentryGuard::hold();
        // SAFETY: handle was created by `gpublas_call_begin` via `Box::into_raw`.
        let call = unsafe { Box::from_raw(call) };
        call.inner.finish()
    };
    match result {
        Ok(()) => 0,
        Err(err) => {
            if let Some(session) = session() {
                let _guard = ReentryGuard::hold();
                session.logger().emit(
                    &LogEvent::new(LogLevel::Error, "placement_failure")
                        .with_symbol("gpublas_call_finish")
                        .with_message(err.to_string()),
                );
            }
            -1
        }
    }
}

/// Release every operand without copying anything back. Consumes the handle.
///
/// # Safety
///
/// `call` must be null or come from [`gpublas_call_begin`] and not be used
/// afterwards.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn gpublas_call_abort(call: *mut GpublasCall) {
    if call.is_null() {
        return;
    }
    let _guard = ReentryGuard::hold();
    // SAFETY: handle was created by `gpublas_call_begin` via `Box::into_raw`.
    let call = unsafe { Box::from_raw(call) };
    call.inner.abort();
}

/// Copy the session counters into `out`. Returns 0, or -1 without a session
/// or with a null `out`.
///
/// # Safety
///
/// `out` must be null or writable.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn gpublas_stats(out: *mut GpublasStats) -> c_int {
    let Some(session) = session() else {
        return -1;
    };
    if out.is_null() {
        return -1;
    }
    let snap = session.metrics();
    // SAFETY: caller vouches `out` is writable.
    unsafe {
        out.write(GpublasStats {
            hits: snap.hits,
            misses: snap.misses,
            managed_bytes: snap.managed_bytes,
            bytes_to_device: snap.bytes_to_device,
            bytes_to_host: snap.bytes_to_host,
            rollbacks: snap.rollbacks,
        });
    }
    0
}
