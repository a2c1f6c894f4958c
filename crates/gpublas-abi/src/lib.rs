//! # gpublas-abi
//!
//! extern "C" boundary for gpublas, built as `libgpublas.so`.
//!
//! Preloaded into an unmodified process, the library interposes the
//! `malloc` family so tracked allocation patterns land in device-visible
//! managed memory, and exports a small placement API for the BLAS shims
//! that run kernels on the accelerator.
//!
//! ```text
//! application -> malloc (this crate) -> Interceptor -> heap | managed memory
//! BLAS shim   -> gpublas_call_*      -> Placer      -> device buffers
//! ```
//!
//! Symbols are exported with `#[no_mangle]` only in release builds.
//! Debug and test builds keep them mangled so test binaries linking the
//! rlib keep the system allocator.

pub mod malloc_abi;
pub mod placement_abi;
pub mod regions_abi;
pub mod session_state;
pub mod startup_abi;
