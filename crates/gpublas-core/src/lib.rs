//! # gpublas-core
//!
//! The accelerator-facing half of gpublas: a backend-neutral runtime trait
//! with host-emulated, CUDA and OpenCL implementations, the allocator
//! interceptor that routes tracked allocations to heap or managed memory,
//! and the placement protocol that moves BLAS operands onto the device and
//! back with all-or-nothing rollback.
//!
//! `unsafe` is confined to the modules that own raw memory or FFI.

#![deny(unsafe_code)]

#[allow(unsafe_code)]
pub mod allocator;
pub mod context;
pub mod fatal;
#[allow(unsafe_code)]
pub mod interceptor;
#[allow(unsafe_code)]
pub mod placement;
#[allow(unsafe_code)]
pub mod runtime;

pub use allocator::{ManagedAllocator, SystemAllocator};
pub use context::{
    ContextError, GpuBlas, GpuBlasBuilder, default_runtime, global, init_global, last_session,
    shutdown_global,
};
pub use fatal::fatal;
pub use interceptor::{Interceptor, ReentryGuard};
pub use placement::{
    CallPlacement, Direction, PlacedBuffer, PlacementError, Placer, Provenance, Tracing,
};
pub use runtime::host::HostRuntime;
pub use runtime::{DevicePtr, DeviceRuntime, ElementKind, MatrixShape, RuntimeError, RuntimeStatus};
