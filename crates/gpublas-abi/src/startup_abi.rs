//! Load-time construction and exit-time teardown of the process session.
//!
//! Release builds register [`gpublas_init`] in `.init_array` and
//! [`gpublas_shutdown`] in `.fini_array`, so a preloaded library reports
//! "initialized" before `main` and writes its statistics after it. Both are
//! also exported for processes that link the library directly.

use std::ffi::c_int;

use gpublas_core::shutdown_global;

use crate::session_state::session;

/// Build the process session from `GPUBLAS_OPTIONS`. Returns 0 when a
/// session is ready, -1 otherwise (reentrant call or after teardown).
/// Configuration errors abort.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub extern "C" fn gpublas_init() -> c_int {
    if session().is_some() { 0 } else { -1 }
}

/// Write the statistics report and log teardown, once. Returns 0 on the
/// call that tore the session down, -1 otherwise.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub extern "C" fn gpublas_shutdown() -> c_int {
    if shutdown_global() { 0 } else { -1 }
}

#[cfg(all(target_os = "linux", not(debug_assertions)))]
extern "C" fn run_init() {
    let _ = gpublas_init();
}

#[cfg(all(target_os = "linux", not(debug_assertions)))]
extern "C" fn run_fini() {
    let _ = gpublas_shutdown();
}

#[cfg(all(target_os = "linux", not(debug_assertions)))]
#[used]
#[unsafe(link_section = ".init_array")]
static GPUBLAS_INIT_ARRAY: extern "C" fn() = run_init;

#[cfg(all(target_os = "linux", not(debug_assertions)))]
#[used]
#[unsafe(link_section = ".fini_array")]
static GPUBLAS_FINI_ARRAY: extern "C" fn() = run_fini;
