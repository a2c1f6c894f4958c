//! Backend-neutral accelerator runtime.
//!
//! [`DeviceRuntime`] is the narrow set of primitives the placement protocol
//! needs: device and managed allocation, host/device copies, visibility
//! mapping for managed buffers, completion, and a device-side transpose.
//! Every backend normalizes its native status codes into [`RuntimeStatus`]
//! while keeping the raw code for diagnostics.

use std::fmt;
use std::ptr::NonNull;

use serde::Serialize;
use thiserror::Error;

pub mod host;

#[cfg(feature = "cuda")]
pub mod cuda;

#[cfg(feature = "opencl")]
pub mod opencl;

/// Address of a buffer as seen by the accelerator.
///
/// For managed buffers the same address is valid on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevicePtr(usize);

impl DevicePtr {
    /// `None` for a null address.
    #[must_use]
    pub fn new(addr: usize) -> Option<Self> {
        (addr != 0).then_some(Self(addr))
    }

    #[must_use]
    pub fn from_raw<T>(ptr: *mut T) -> Option<Self> {
        Self::new(ptr as usize)
    }

    #[must_use]
    pub fn from_non_null(ptr: NonNull<u8>) -> Self {
        Self(ptr.as_ptr() as usize)
    }

    #[must_use]
    pub const fn addr(self) -> usize {
        self.0
    }

    #[must_use]
    pub fn as_ptr(self) -> *mut u8 {
        self.0 as *mut u8
    }

    /// Pointer `offset` bytes past this one.
    #[must_use]
    pub const fn offset(self, offset: usize) -> Self {
        Self(self.0 + offset)
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Normalized backend status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeStatus {
    Success,
    NotInitialized,
    AllocFailed,
    InvalidValue,
    ArchMismatch,
    MappingError,
    ExecutionFailed,
    InternalError,
    Unsupported,
}

impl RuntimeStatus {
    /// Human-readable description.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::Success => "the operation completed successfully",
            Self::NotInitialized => "the accelerator runtime was not initialized",
            Self::AllocFailed => "resource allocation failed inside the accelerator runtime",
            Self::InvalidValue => "an unsupported value or parameter was passed to the function",
            Self::ArchMismatch => "the function requires a feature absent from the device architecture",
            Self::MappingError => "an access to device memory space failed",
            Self::ExecutionFailed => "the device program failed to execute",
            Self::InternalError => "an internal runtime operation failed",
            Self::Unsupported => "the requested functionality is not supported",
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::NotInitialized => "not_initialized",
            Self::AllocFailed => "alloc_failed",
            Self::InvalidValue => "invalid_value",
            Self::ArchMismatch => "arch_mismatch",
            Self::MappingError => "mapping_error",
            Self::ExecutionFailed => "execution_failed",
            Self::InternalError => "internal_error",
            Self::Unsupported => "unsupported",
        }
    }
}

impl fmt::Display for RuntimeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed runtime call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{backend}: {op} failed: {} (code {code})", .status.message())]
pub struct RuntimeError {
    pub backend: &'static str,
    pub op: &'static str,
    pub status: RuntimeStatus,
    /// Raw backend code.
    pub code: i32,
}

impl RuntimeError {
    #[must_use]
    pub const fn new(backend: &'static str, op: &'static str, status: RuntimeStatus, code: i32) -> Self {
        Self {
            backend,
            op,
            status,
            code,
        }
    }
}

/// Scalar element type of a BLAS operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementKind {
    F32,
    F64,
    C32,
    C64,
}

impl ElementKind {
    /// Bytes per element.
    #[must_use]
    pub const fn size(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F64 | Self::C32 => 8,
            Self::C64 => 16,
        }
    }
}

/// Row-major `rows x cols` matrix with leading dimension `ld` (in elements).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct MatrixShape {
    pub rows: usize,
    pub cols: usize,
    pub ld: usize,
    pub elem: ElementKind,
}

impl MatrixShape {
    #[must_use]
    pub const fn new(rows: usize, cols: usize, ld: usize, elem: ElementKind) -> Self {
        Self {
            rows,
            cols,
            ld,
            elem,
        }
    }

    /// Dense shape (`ld == cols`).
    #[must_use]
    pub const fn dense(rows: usize, cols: usize, elem: ElementKind) -> Self {
        Self::new(rows, cols, cols, elem)
    }

    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.ld >= self.cols
    }

    /// Bytes spanned by the matrix in its buffer. `None` on overflow.
    #[must_use]
    pub fn bytes(&self) -> Option<usize> {
        if self.rows == 0 || self.cols == 0 {
            return Some(0);
        }
        (self.rows - 1)
            .checked_mul(self.ld)?
            .checked_add(self.cols)?
            .checked_mul(self.elem.size())
    }

    /// Shape of the dense transpose (`cols x rows`, `ld == rows`).
    #[must_use]
    pub const fn transposed(&self) -> Self {
        Self::dense(self.cols, self.rows, self.elem)
    }
}

/// Primitives every accelerator backend provides.
///
/// Raw-pointer methods are `unsafe`: the caller guarantees that host
/// pointers are valid for the stated size and that device pointers came from
/// this runtime.
pub trait DeviceRuntime: Send + Sync + fmt::Debug {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Allocate device-only memory.
    fn alloc_device(&self, size: usize) -> Result<DevicePtr, RuntimeError>;

    /// Allocate memory addressable from both host and device.
    fn alloc_managed(&self, size: usize) -> Result<DevicePtr, RuntimeError>;

    /// Release a buffer from `alloc_device` or `alloc_managed`.
    ///
    /// # Safety
    ///
    /// `ptr` must be live and must not be used afterwards.
    unsafe fn free(&self, ptr: DevicePtr) -> Result<(), RuntimeError>;

    /// # Safety
    ///
    /// `src` must be readable for `size` bytes; `dst` must be a device buffer
    /// of at least `size` bytes.
    unsafe fn copy_host_to_device(
        &self,
        dst: DevicePtr,
        src: *const u8,
        size: usize,
    ) -> Result<(), RuntimeError>;

    /// # Safety
    ///
    /// `dst` must be writable for `size` bytes; `src` must be a device buffer
    /// of at least `size` bytes.
    unsafe fn copy_device_to_host(
        &self,
        dst: *mut u8,
        src: DevicePtr,
        size: usize,
    ) -> Result<(), RuntimeError>;

    /// Hand a managed range to the device. The host must not touch it until
    /// the matching [`unmap_from_device`](Self::unmap_from_device).
    fn map_for_device(&self, ptr: DevicePtr, size: usize) -> Result<(), RuntimeError>;

    /// Return a managed range to the host.
    fn unmap_from_device(&self, ptr: DevicePtr, size: usize) -> Result<(), RuntimeError>;

    /// Block until all queued device work has finished.
    fn synchronize(&self) -> Result<(), RuntimeError>;

    /// Device-side transpose: `src` holds `shape` in row-major order; write
    /// its transpose to `dst` with leading dimension `dst_ld`, so that
    /// `dst[j * dst_ld + i] = src[i * shape.ld + j]`.
    ///
    /// # Safety
    ///
    /// Both buffers must be device-visible and large enough for the shapes.
    unsafe fn transpose(
        &self,
        dst: DevicePtr,
        dst_ld: usize,
        src: DevicePtr,
        shape: MatrixShape,
    ) -> Result<(), RuntimeError>;

    /// Whether host and device may touch managed memory concurrently. When
    /// false, kernel launches and unmaps are followed by a synchronize.
    fn concurrent_managed_access(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_ptr_rejects_null() {
        assert!(DevicePtr::new(0).is_none());
        assert_eq!(DevicePtr::new(0x1000).unwrap().offset(16).addr(), 0x1010);
        assert_eq!(DevicePtr::new(0x1000).unwrap().to_string(), "0x1000");
    }

    #[test]
    fn status_messages_are_distinct() {
        let all = [
            RuntimeStatus::Success,
            RuntimeStatus::NotInitialized,
            RuntimeStatus::AllocFailed,
            RuntimeStatus::InvalidValue,
            RuntimeStatus::ArchMismatch,
            RuntimeStatus::MappingError,
            RuntimeStatus::ExecutionFailed,
            RuntimeStatus::InternalError,
            RuntimeStatus::Unsupported,
        ];
        let mut messages: Vec<_> = all.iter().map(|s| s.message()).collect();
        messages.sort_unstable();
        messages.dedup();
        assert_eq!(messages.len(), all.len());
    }

    #[test]
    fn error_display_carries_status_and_code() {
        let err = RuntimeError::new("host", "alloc_device", RuntimeStatus::AllocFailed, 3);
        let text = err.to_string();
        assert!(text.contains("alloc_device"));
        assert!(text.contains("code 3"));
    }

    #[test]
    fn matrix_bytes_respect_leading_dimension() {
        assert_eq!(MatrixShape::dense(2, 3, ElementKind::F32).bytes(), Some(24));
        assert_eq!(MatrixShape::new(2, 3, 5, ElementKind::F64).bytes(), Some(64));
        assert_eq!(MatrixShape::dense(0, 3, ElementKind::F32).bytes(), Some(0));
        assert_eq!(MatrixShape::new(usize::MAX, 2, 2, ElementKind::C64).bytes(), None);
        assert!(!MatrixShape::new(2, 3, 2, ElementKind::F32).is_valid());
        let t = MatrixShape::new(2, 3, 5, ElementKind::F32).transposed();
        assert_eq!((t.rows, t.cols, t.ld), (3, 2, 2));
    }
}
