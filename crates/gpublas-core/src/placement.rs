//! GPU placement protocol.
//!
//! For every operand of a BLAS call, [`Placer::place`] returns a
//! device-visible pointer:
//!
//! 1. null host buffer: a fresh device buffer (scratch output), neither hit
//!    nor miss;
//! 2. host pointer is the start of a live managed object: the same pointer,
//!    mapped for the device, provenance `Shared`, a **hit**;
//! 3. anything else, including a pointer into the middle of a managed
//!    object: a fresh device buffer plus a host-to-device copy,
//!    provenance `Untracked`, a **miss**.
//!
//! Each successful placement is appended to the caller's rollback list. When
//! a placement fails, every buffer already in the list is cleaned up in
//! order before the error is returned, so a failed call leaks no device
//! memory. Hit/miss counters are not undone by a rollback.
//!
//! Cleanup undoes exactly what placement did: untracked buffers are freed,
//! shared ones only unmapped. A cleanup failure aborts the process.

use std::sync::Arc;

use gpublas_membrane::{
    CopyDirection, LogEvent, LogLevel, Logger, ObjectInfo, ObjectRegistry, Options,
    PlacementMetrics,
};
use serde_json::json;
use thiserror::Error;

use crate::fatal::fatal;
use crate::interceptor::ReentryGuard;
use crate::runtime::{DevicePtr, DeviceRuntime, MatrixShape, RuntimeError};

/// Where a placed buffer came from.
#[derive(Debug, Clone)]
pub enum Provenance {
    /// Device buffer owned by this call.
    Untracked,
    /// Managed object owned by the registry; only mapped for this call.
    Shared(Arc<ObjectInfo>),
}

impl Provenance {
    #[must_use]
    pub fn is_shared(&self) -> bool {
        matches!(self, Self::Shared(_))
    }

    #[must_use]
    pub fn info(&self) -> Option<&Arc<ObjectInfo>> {
        match self {
            Self::Shared(info) => Some(info),
            Self::Untracked => None,
        }
    }
}

/// Whether the kernel's result must reach the host buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    InOut,
}

/// One operand placed for the duration of a call.
#[derive(Debug, Clone)]
pub struct PlacedBuffer {
    pub device: DevicePtr,
    /// Host address the buffer mirrors; 0 for scratch buffers.
    pub host: usize,
    pub size: usize,
    pub provenance: Provenance,
    pub direction: Direction,
    /// For a transposed staging buffer: the placed row-major source and its
    /// shape, to transpose back into before copy-back.
    pub transpose_back: Option<(DevicePtr, MatrixShape)>,
}

#[derive(Debug, Error)]
pub enum PlacementError {
    #[error("{op} of {size} bytes failed: {source}")]
    Runtime {
        op: &'static str,
        size: usize,
        #[source]
        source: RuntimeError,
    },
    #[error("invalid matrix shape {rows}x{cols} with leading dimension {ld}")]
    InvalidShape { rows: usize, cols: usize, ld: usize },
}

impl PlacementError {
    /// Runtime status behind the failure, if any.
    #[must_use]
    pub fn runtime(&self) -> Option<&RuntimeError> {
        match self {
            Self::Runtime { source, .. } => Some(source),
            Self::InvalidShape { .. } => None,
        }
    }
}

/// Flags that change what the placer logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tracing {
    pub trace_copy: bool,
    pub debug_exec: bool,
    pub debug_execfail: bool,
}

impl From<&Options> for Tracing {
    fn from(options: &Options) -> Self {
        Self {
            trace_copy: options.trace_copy,
            debug_exec: options.debug_exec,
            debug_execfail: options.debug_execfail,
        }
    }
}

/// Places BLAS operands on a device runtime.
#[derive(Debug)]
pub struct Placer {
    runtime: Arc<dyn DeviceRuntime>,
    registry: Arc<ObjectRegistry>,
    metrics: Arc<PlacementMetrics>,
    logger: Arc<Logger>,
    tracing: Tracing,
}

impl Placer {
    #[must_use]
    pub fn new(
        runtime: Arc<dyn DeviceRuntime>,
        registry: Arc<ObjectRegistry>,
        metrics: Arc<PlacementMetrics>,
        logger: Arc<Logger>,
        tracing: Tracing,
    ) -> Self {
        Self {
            runtime,
            registry,
            metrics,
            logger,
            tracing,
        }
    }

    #[must_use]
    pub fn runtime(&self) -> &Arc<dyn DeviceRuntime> {
        &self.runtime
    }

    #[must_use]
    pub fn metrics(&self) -> &PlacementMetrics {
        &self.metrics
    }

    /// Start placing the operands of one BLAS call.
    #[must_use]
    pub fn call(&self) -> CallPlacement<'_> {
        CallPlacement {
            placer: self,
            buffers: Vec::new(),
            done: false,
        }
    }

    /// Place an input operand. On failure `rollback` has been cleaned up and
    /// emptied.
    ///
    /// # Safety
    ///
    /// `host` must be null or readable for `size` bytes.
    pub unsafe fn place(
        &self,
        host: *const u8,
        size: usize,
        rollback: &mut Vec<PlacedBuffer>,
    ) -> Result<DevicePtr, PlacementError> {
        // SAFETY: forwarded caller contract.
        unsafe { self.place_with(host, size, Direction::Input, rollback) }
    }

    /// Place an operand whose result is copied back by [`CallPlacement::finish`].
    ///
    /// # Safety
    ///
    /// `host` must be null or valid for reads and writes of `size` bytes
    /// until the call finishes.
    pub unsafe fn place_output(
        &self,
        host: *mut u8,
        size: usize,
        rollback: &mut Vec<PlacedBuffer>,
    ) -> Result<DevicePtr, PlacementError> {
        // SAFETY: forwarded caller contract.
        unsafe { self.place_with(host, size, Direction::InOut, rollback) }
    }

    unsafe fn place_with(
        &self,
        host: *const u8,
        size: usize,
        direction: Direction,
        rollback: &mut Vec<PlacedBuffer>,
    ) -> Result<DevicePtr, PlacementError> {
        let _guard = ReentryGuard::hold();

        if host.is_null() {
            let device = match self.runtime.alloc_device(size) {
                Ok(d) => d,
                Err(e) => return Err(self.fail(rollback, "alloc_device", size, e)),
            };
            PlacementMetrics::inc(&self.metrics.device_allocs);
            rollback.push(PlacedBuffer {
                device,
                host: 0,
                size,
                provenance: Provenance::Untracked,
                direction,
                transpose_back: None,
            });
            return Ok(device);
        }

        let addr = host as usize;
        let shared = self
            .registry
            .lookup(addr)
            .filter(|info| info.is_device_visible() && info.covers(addr, size));
        if let (Some(info), Some(device)) = (shared, DevicePtr::new(addr)) {
            PlacementMetrics::inc(&self.metrics.hits);
            if let Err(e) = self.runtime.map_for_device(device, size) {
                return Err(self.fail(rollback, "map_for_device", size, e));
            }
            rollback.push(PlacedBuffer {
                device,
                host: addr,
                size,
                provenance: Provenance::Shared(info),
                direction,
                transpose_back: None,
            });
            return Ok(device);
        }

        PlacementMetrics::inc(&self.metrics.misses);
        // SAFETY: forwarded caller contract.
        match unsafe { self.copy_to_device(host, size) } {
            Ok(device) => {
                rollback.push(PlacedBuffer {
                    device,
                    host: addr,
                    size,
                    provenance: Provenance::Untracked,
                    direction,
                    transpose_back: None,
                });
                Ok(device)
            }
            Err((op, e)) => Err(self.fail(rollback, op, size, e)),
        }
    }

    /// Fresh device buffer holding a copy of `size` host bytes.
    ///
    /// # Safety
    ///
    /// `host` must be readable for `size` bytes.
    pub unsafe fn copy_to_device(
        &self,
        host: *const u8,
        size: usize,
    ) -> Result<DevicePtr, (&'static str, RuntimeError)> {
        let device = self.runtime.alloc_device(size).map_err(|e| ("alloc_device", e))?;
        PlacementMetrics::inc(&self.metrics.device_allocs);
        // SAFETY: `device` holds `size` bytes; caller vouches for `host`.
        if let Err(e) = unsafe { self.runtime.copy_host_to_device(device, host, size) } {
            self.cleanup(&PlacedBuffer {
                device,
                host: 0,
                size,
                provenance: Provenance::Untracked,
                direction: Direction::Input,
                transpose_back: None,
            });
            return Err(("copy_host_to_device", e));
        }
        PlacementMetrics::add(&self.metrics.bytes_to_device, size);
        self.trace_copy(CopyDirection::HostToDevice, size);
        Ok(device)
    }

    /// Fresh host buffer holding a copy of `size` device bytes.
    ///
    /// # Safety
    ///
    /// `device` must be a live device buffer of at least `size` bytes.
    pub unsafe fn copy_to_host(&self, device: DevicePtr, size: usize) -> Result<Vec<u8>, RuntimeError> {
        let mut host = vec![0u8; size];
        // SAFETY: `host` is writable for `size` bytes.
        unsafe { self.copy_from_device(host.as_mut_ptr(), device, size)? };
        Ok(host)
    }

    /// Copy `size` device bytes into an existing host buffer.
    ///
    /// # Safety
    ///
    /// `host` must be writable for `size` bytes and `device` a live device
    /// buffer of at least `size` bytes.
    pub unsafe fn copy_from_device(
        &self,
        host: *mut u8,
        device: DevicePtr,
        size: usize,
    ) -> Result<(), RuntimeError> {
        // SAFETY: forwarded caller contract.
        unsafe { self.runtime.copy_device_to_host(host, device, size)? };
        PlacementMetrics::add(&self.metrics.bytes_to_host, size);
        self.trace_copy(CopyDirection::DeviceToHost, size);
        Ok(())
    }

    /// Undo a placement, aborting on failure.
    pub fn cleanup(&self, buffer: &PlacedBuffer) {
        if let Err(e) = self.try_cleanup(buffer) {
            fatal(&self.logger, "cleanup", e);
        }
    }

    /// Undo a placement: free an untracked buffer, unmap a shared one.
    pub fn try_cleanup(&self, buffer: &PlacedBuffer) -> Result<(), RuntimeError> {
        let _guard = ReentryGuard::hold();
        match buffer.provenance {
            Provenance::Untracked => {
                // SAFETY: untracked buffers were allocated by this placer and
                // are cleaned up exactly once.
                unsafe { self.runtime.free(buffer.device)? };
                PlacementMetrics::inc(&self.metrics.device_frees);
                Ok(())
            }
            Provenance::Shared(_) => {
                if !self.runtime.concurrent_managed_access() {
                    self.runtime.synchronize()?;
                }
                self.runtime.unmap_from_device(buffer.device, buffer.size)
            }
        }
    }

    /// Clean up every buffer of `buffers` in order and empty it.
    pub fn rollback(&self, buffers: &mut Vec<PlacedBuffer>) {
        let _guard = ReentryGuard::hold();
        PlacementMetrics::inc(&self.metrics.rollbacks);
        self.logger.emit(
            &LogEvent::new(LogLevel::Warn, "placement_rollback")
                .with_details(json!({ "buffers": buffers.len() })),
        );
        for buffer in buffers.drain(..) {
            self.cleanup(&buffer);
        }
    }

    fn fail(
        &self,
        rollback: &mut Vec<PlacedBuffer>,
        op: &'static str,
        size: usize,
        source: RuntimeError,
    ) -> PlacementError {
        self.rollback(rollback);
        PlacementError::Runtime { op, size, source }
    }

    /// Run a kernel launch, honoring `debug_exec`/`debug_execfail`. Devices
    /// without concurrent managed access are synchronized after the launch.
    pub fn try_call_kernel(
        &self,
        name: &str,
        launch: impl FnOnce() -> Result<(), RuntimeError>,
    ) -> Result<(), RuntimeError> {
        let result = launch().and_then(|()| {
            if self.runtime.concurrent_managed_access() {
                Ok(())
            } else {
                self.runtime.synchronize()
            }
        });
        match &result {
            Ok(()) if self.tracing.debug_exec => self.logger.emit(
                &LogEvent::new(LogLevel::Debug, "kernel_call").with_symbol(name),
            ),
            Err(e) if self.tracing.debug_execfail => self.logger.emit(
                &LogEvent::new(LogLevel::Error, "kernel_failure")
                    .with_symbol(name)
                    .with_status(e.status.as_str())
                    .with_message(e.to_string()),
            ),
            _ => {}
        }
        result
    }

    /// [`try_call_kernel`](Self::try_call_kernel), aborting on failure.
    pub fn call_kernel(&self, name: &str, launch: impl FnOnce() -> Result<(), RuntimeError>) {
        if let Err(e) = self.try_call_kernel(name, launch) {
            fatal(&self.logger, name, e);
        }
    }

    /// Synchronize, transpose staged matrices back and copy outputs home.
    fn complete(&self, buffers: &[PlacedBuffer]) -> Result<(), PlacementError> {
        let runtime_err = |op, size, source| PlacementError::Runtime { op, size, source };
        self.runtime
            .synchronize()
            .map_err(|e| runtime_err("synchronize", 0, e))?;

        let mut transposed = false;
        for buffer in buffers {
            if let Some((source, shape)) = buffer.transpose_back {
                // SAFETY: both buffers are still placed; shapes match placement.
                unsafe { self.runtime.transpose(source, shape.ld, buffer.device, shape.transposed()) }
                    .map_err(|e| runtime_err("transpose", buffer.size, e))?;
                transposed = true;
            }
        }
        if transposed {
            self.runtime
                .synchronize()
                .map_err(|e| runtime_err("synchronize", 0, e))?;
        }

        for buffer in buffers {
            let copy_back = buffer.direction == Direction::InOut
                && buffer.host != 0
                && !buffer.provenance.is_shared();
            if copy_back {
                // SAFETY: `place_output` callers keep the host range writable.
                unsafe { self.copy_from_device(buffer.host as *mut u8, buffer.device, buffer.size) }
                    .map_err(|e| runtime_err("copy_device_to_host", buffer.size, e))?;
            }
        }
        Ok(())
    }

    fn trace_copy(&self, direction: CopyDirection, size: usize) {
        if self.tracing.trace_copy {
            self.logger.emit(
                &LogEvent::new(LogLevel::Info, "copy")
                    .with_bytes(size)
                    .with_direction(direction)
                    .with_message(format!("{size} B : {}", direction.arrow())),
            );
        }
    }
}

/// The placed operands of one BLAS call.
///
/// Dropping it without [`finish`](Self::finish) rolls every placement back.
#[derive(Debug)]
pub struct CallPlacement<'a> {
    placer: &'a Placer,
    buffers: Vec<PlacedBuffer>,
    done: bool,
}

impl CallPlacement<'_> {
    /// # Safety
    ///
    /// See [`Placer::place`].
    pub unsafe fn place(&mut self, host: *const u8, size: usize) -> Result<DevicePtr, PlacementError> {
        // SAFETY: forwarded caller contract.
        unsafe { self.placer.place(host, size, &mut self.buffers) }
    }

    /// # Safety
    ///
    /// See [`Placer::place_output`].
    pub unsafe fn place_output(&mut self, host: *mut u8, size: usize) -> Result<DevicePtr, PlacementError> {
        // SAFETY: forwarded caller contract.
        unsafe { self.placer.place_output(host, size, &mut self.buffers) }
    }

    /// Place a row-major matrix and return a column-major device copy.
    /// For `InOut` the result is transposed back before copy-back.
    ///
    /// # Safety
    ///
    /// `host` must be valid for `shape.bytes()` bytes (writable for `InOut`).
    pub unsafe fn place_matrix(
        &mut self,
        host: *mut u8,
        shape: MatrixShape,
        direction: Direction,
    ) -> Result<DevicePtr, PlacementError> {
        let invalid = PlacementError::InvalidShape {
            rows: shape.rows,
            cols: shape.cols,
            ld: shape.ld,
        };
        let (Some(bytes), Some(staged_bytes)) = (shape.bytes(), shape.transposed().bytes()) else {
            self.placer.rollback(&mut self.buffers);
            return Err(invalid);
        };
        if !shape.is_valid() {
            self.placer.rollback(&mut self.buffers);
            return Err(invalid);
        }

        // SAFETY: forwarded caller contract.
        let source = unsafe { self.placer.place_with(host, bytes, direction, &mut self.buffers)? };
        let staging = match self.placer.runtime.alloc_device(staged_bytes) {
            Ok(d) => d,
            Err(e) => return Err(self.placer.fail(&mut self.buffers, "alloc_device", staged_bytes, e)),
        };
        PlacementMetrics::inc(&self.placer.metrics.device_allocs);
        self.buffers.push(PlacedBuffer {
            device: staging,
            host: 0,
            size: staged_bytes,
            provenance: Provenance::Untracked,
            direction: Direction::Input,
            transpose_back: (direction == Direction::InOut).then_some((source, shape)),
        });

        // SAFETY: `source` holds `bytes`, `staging` holds the dense transpose.
        if let Err(e) = unsafe { self.placer.runtime.transpose(staging, shape.rows, source, shape) } {
            return Err(self.placer.fail(&mut self.buffers, "transpose", staged_bytes, e));
        }
        Ok(staging)
    }

    #[must_use]
    pub fn buffers(&self) -> &[PlacedBuffer] {
        &self.buffers
    }

    /// Launch the kernel for this call.
    pub fn kernel(
        &self,
        name: &str,
        launch: impl FnOnce() -> Result<(), RuntimeError>,
    ) -> Result<(), RuntimeError> {
        self.placer.try_call_kernel(name, launch)
    }

    /// Copy outputs back and clean up every buffer. Buffers are cleaned up
    /// even when completion fails.
    pub fn finish(mut self) -> Result<(), PlacementError> {
        self.done = true;
        let _guard = ReentryGuard::hold();
        let buffers = std::mem::take(&mut self.buffers);
        let result = self.placer.complete(&buffers);
        for buffer in &buffers {
            self.placer.cleanup(buffer);
        }
        result
    }

    /// Clean up every buffer placed so far; the call stays usable.
    pub fn rollback(&mut self) {
        if !self.buffers.is_empty() {
            self.placer.rollback(&mut self.buffers);
        }
    }

    /// Clean up every buffer without copying anything back.
    pub fn abort(mut self) {
        self.done = true;
        self.rollback();
    }
}

impl Drop for CallPlacement<'_> {
    fn drop(&mut self) {
        if !self.done && !self.buffers.is_empty() {
            self.placer.rollback(&mut self.buffers);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::ManagedAllocator;
    use crate::runtime::host::HostRuntime;
    use crate::runtime::{ElementKind, RuntimeStatus};
    use gpublas_membrane::{
        AllocSym, AllocationRecord, CallSite, MemoryLog, ObjectAllocator,
    };

    struct Fixture {
        rt: Arc<HostRuntime>,
        registry: Arc<ObjectRegistry>,
        placer: Placer,
        log: MemoryLog,
        managed: Arc<dyn ObjectAllocator>,
    }

    fn fixture(tracing: Tracing) -> Fixture {
        let rt = Arc::new(HostRuntime::new());
        let registry = Arc::new(ObjectRegistry::new());
        let (logger, log) = Logger::memory();
        let placer = Placer::new(
            rt.clone(),
            Arc::clone(&registry),
            Arc::new(PlacementMetrics::new()),
            Arc::new(logger),
            tracing,
        );
        let managed = ManagedAllocator::shared(rt.clone(), Arc::new(Logger::default()));
        Fixture {
            rt,
            registry,
            placer,
            log,
            managed,
        }
    }

    impl Fixture {
        /// Managed object registered the way the interceptor would.
        fn managed_object(&self, size: usize) -> *mut u8 {
            let ptr = self.managed.construct(size).unwrap();
            let record = Arc::new(AllocationRecord::new(
                AllocSym::Malloc,
                CallSite(0xabc),
                size,
                Arc::clone(&self.managed),
            ));
            self.registry.register(ptr.as_ptr() as usize, record, size);
            ptr.as_ptr()
        }

        fn release(&self, ptr: *mut u8) {
            self.registry.unregister(ptr as usize);
            unsafe { self.managed.destroy(std::ptr::NonNull::new(ptr).unwrap()) };
        }
    }

    #[test]
    fn null_host_gets_fresh_untracked_buffer() {
        let f = fixture(Tracing::default());
        for size in [1usize, 7, 4096] {
            let mut list = Vec::new();
            let d = unsafe { f.placer.place(std::ptr::null(), size, &mut list) }.unwrap();
            assert_eq!(list.len(), 1);
            assert!(!list[0].provenance.is_shared());
            assert_eq!(list[0].device, d);
            f.placer.cleanup(&list[0]);
        }
        let snap = f.placer.metrics().snapshot();
        assert_eq!((snap.hits, snap.misses), (0, 0));
        assert_eq!(f.rt.live_device_buffers(), 0);
    }

    #[test]
    fn managed_object_start_is_a_hit_and_offset_is_a_miss() {
        let f = fixture(Tracing::default());
        let obj = f.managed_object(64);
        let mut list = Vec::new();
        let d = unsafe { f.placer.place(obj, 64, &mut list) }.unwrap();
        assert_eq!(d.addr(), obj as usize);
        assert!(list[0].provenance.is_shared());
        assert!(f.rt.is_mapped(obj as usize));
        assert_eq!(f.placer.metrics().snapshot().hits, 1);

        // An offset into the object is not the object: copied, not shared.
        let interior = unsafe { f.placer.place(obj.add(16), 16, &mut list) }.unwrap();
        assert_ne!(interior.addr(), obj as usize + 16);
        assert!(!list[1].provenance.is_shared());
        let snap = f.placer.metrics().snapshot();
        assert_eq!((snap.hits, snap.misses), (1, 1));

        for b in &list {
            f.placer.cleanup(b);
        }
        assert!(!f.rt.is_mapped(obj as usize));
        assert_eq!(f.rt.live_managed_buffers(), 1);
        f.release(obj);
    }

    #[test]
    fn host_resident_tracked_object_is_a_miss() {
        let f = fixture(Tracing::default());
        let host = crate::allocator::SystemAllocator::shared();
        let ptr = host.construct(32).unwrap();
        let record = Arc::new(AllocationRecord::new(
            AllocSym::Malloc,
            CallSite(0xdef),
            32,
            Arc::clone(&host),
        ));
        f.registry.register(ptr.as_ptr() as usize, record, 32);

        let mut list = Vec::new();
        let d = unsafe { f.placer.place(ptr.as_ptr(), 32, &mut list) }.unwrap();
        assert_ne!(d.addr(), ptr.as_ptr() as usize);
        let snap = f.placer.metrics().snapshot();
        assert_eq!((snap.hits, snap.misses), (0, 1));
        f.placer.cleanup(&list[0]);

        f.registry.unregister(ptr.as_ptr() as usize);
        unsafe { host.destroy(ptr) };
    }

    #[test]
    fn host_buffer_is_a_miss_with_copy() {
        let f = fixture(Tracing {
            trace_copy: true,
            ..Tracing::default()
        });
        let host: Vec<f32> = vec![1.0, 2.0, 3.0, 4.0];
        let mut list = Vec::new();
        let d = unsafe { f.placer.place(host.as_ptr().cast(), 16, &mut list) }.unwrap();
        assert_ne!(d.addr(), host.as_ptr() as usize);
        let back = unsafe { f.placer.copy_to_host(d, 16) }.unwrap();
        assert_eq!(back, bytes_of(&host));
        f.placer.cleanup(&list[0]);

        let copies = f.log.named("copy");
        assert_eq!(copies.len(), 2);
        assert_eq!(copies[0].bytes, Some(16));
        assert_eq!(copies[0].direction, Some(CopyDirection::HostToDevice));
        assert_eq!(copies[0].message.as_deref(), Some("16 B : CPU ---> GPU"));
        assert_eq!(copies[1].direction, Some(CopyDirection::DeviceToHost));
        assert_eq!(f.rt.live_device_buffers(), 0);
    }

    #[test]
    fn failure_on_third_placement_rolls_back_everything() {
        let f = fixture(Tracing::default());
        f.rt.fail_device_alloc_after(2);
        let a = [1u8; 8];
        let b = [2u8; 8];
        let c = [3u8; 8];
        let mut list = Vec::new();
        unsafe {
            f.placer.place(a.as_ptr(), 8, &mut list).unwrap();
            f.placer.place(b.as_ptr(), 8, &mut list).unwrap();
            assert_eq!(f.rt.live_device_buffers(), 2);
            let err = f.placer.place(c.as_ptr(), 8, &mut list).unwrap_err();
            assert_eq!(err.runtime().unwrap().status, RuntimeStatus::AllocFailed);
        }
        assert!(list.is_empty());
        assert_eq!(f.rt.live_device_buffers(), 0);
        let snap = f.placer.metrics().snapshot();
        assert_eq!(snap.misses, 3);
        assert_eq!(snap.rollbacks, 1);
        assert_eq!(f.log.named("placement_rollback").len(), 1);
    }

    #[test]
    fn rollback_unmaps_shared_without_freeing() {
        let f = fixture(Tracing::default());
        let obj = f.managed_object(16);
        let host = [0u8; 16];
        f.rt.set_fail_copy(true);
        let mut list = Vec::new();
        unsafe {
            f.placer.place(obj, 16, &mut list).unwrap();
            assert!(f.rt.is_mapped(obj as usize));
            assert!(f.placer.place(host.as_ptr(), 16, &mut list).is_err());
        }
        assert!(!f.rt.is_mapped(obj as usize));
        assert_eq!(f.rt.live_managed_buffers(), 1);
        assert_eq!(f.rt.live_device_buffers(), 0);
        f.rt.heal();
        f.release(obj);
    }

    #[test]
    fn try_cleanup_reports_failure() {
        let f = fixture(Tracing::default());
        let mut list = Vec::new();
        unsafe { f.placer.place(std::ptr::null(), 8, &mut list) }.unwrap();
        f.rt.set_fail_free(true);
        assert!(f.placer.try_cleanup(&list[0]).is_err());
        f.rt.heal();
        f.placer.try_cleanup(&list[0]).unwrap();
    }

    #[test]
    fn finish_copies_outputs_back() {
        let f = fixture(Tracing::default());
        let x = [1u8, 2, 3, 4];
        let mut y = [0u8; 4];
        let mut call = f.placer.call();
        let dx = unsafe { call.place(x.as_ptr(), 4) }.unwrap();
        let dy = unsafe { call.place_output(y.as_mut_ptr(), 4) }.unwrap();
        call.kernel("copy", || unsafe {
            // Emulated kernel: y = x on the device.
            std::ptr::copy_nonoverlapping(dx.as_ptr(), dy.as_ptr(), 4);
            Ok(())
        })
        .unwrap();
        call.finish().unwrap();
        assert_eq!(y, x);
        assert_eq!(f.rt.live_device_buffers(), 0);
        assert_eq!(f.placer.metrics().snapshot().bytes_to_host, 4);
    }

    #[test]
    fn dropped_call_rolls_back() {
        let f = fixture(Tracing::default());
        let x = [0u8; 32];
        {
            let mut call = f.placer.call();
            unsafe { call.place(x.as_ptr(), 32) }.unwrap();
            unsafe { call.place(std::ptr::null(), 32) }.unwrap();
            assert_eq!(f.rt.live_device_buffers(), 2);
        }
        assert_eq!(f.rt.live_device_buffers(), 0);
        assert_eq!(f.placer.metrics().snapshot().rollbacks, 1);
    }

    #[test]
    fn matrix_is_transposed_on_device_and_back() {
        let f = fixture(Tracing::default());
        // 2 x 3 row-major.
        let mut a: [f64; 6] = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let shape = MatrixShape::dense(2, 3, ElementKind::F64);
        let mut call = f.placer.call();
        let d = unsafe { call.place_matrix(a.as_mut_ptr().cast(), shape, Direction::InOut) }.unwrap();
        let col_major: Vec<f64> = unsafe { f.placer.copy_to_host(d, 48) }
            .unwrap()
            .chunks_exact(8)
            .map(|c| f64::from_ne_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(col_major, [1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);

        // Emulated kernel scales the column-major matrix by 2.
        call.kernel("scal", || unsafe {
            let p = d.as_ptr().cast::<f64>();
            for i in 0..6 {
                *p.add(i) *= 2.0;
            }
            Ok(())
        })
        .unwrap();
        call.finish().unwrap();
        assert_eq!(a, [2.0, 4.0, 6.0, 8.0, 10.0, 12.0]);
        assert_eq!(f.rt.live_device_buffers(), 0);
    }

    #[test]
    fn shared_matrix_is_transposed_in_place_memory() {
        let f = fixture(Tracing::default());
        let shape = MatrixShape::dense(2, 2, ElementKind::F32);
        let obj = f.managed_object(16);
        unsafe {
            std::ptr::copy_nonoverlapping([1.0f32, 2.0, 3.0, 4.0].as_ptr().cast(), obj, 16);
        }
        let mut call = f.placer.call();
        let d = unsafe { call.place_matrix(obj, shape, Direction::InOut) }.unwrap();
        assert!(call.buffers()[0].provenance.is_shared());
        call.kernel("negate", || unsafe {
            let p = d.as_ptr().cast::<f32>();
            for i in 0..4 {
                *p.add(i) = -*p.add(i);
            }
            Ok(())
        })
        .unwrap();
        call.finish().unwrap();
        let out = unsafe { std::slice::from_raw_parts(obj.cast::<f32>(), 4) };
        assert_eq!(out, &[-1.0, -2.0, -3.0, -4.0]);
        assert_eq!(f.placer.metrics().snapshot().hits, 1);
        f.release(obj);
    }

    #[test]
    fn invalid_shape_rolls_back_earlier_operands() {
        let f = fixture(Tracing::default());
        let x = [0u8; 8];
        let mut m = [0u8; 64];
        let mut call = f.placer.call();
        unsafe { call.place(x.as_ptr(), 8) }.unwrap();
        let err = unsafe {
            call.place_matrix(m.as_mut_ptr(), MatrixShape::new(2, 4, 2, ElementKind::F32), Direction::Input)
        }
        .unwrap_err();
        assert!(matches!(err, PlacementError::InvalidShape { .. }));
        assert!(call.buffers().is_empty());
        assert_eq!(f.rt.live_device_buffers(), 0);
    }

    #[test]
    fn kernel_logging_follows_flags() {
        let f = fixture(Tracing {
            debug_exec: true,
            debug_execfail: true,
            ..Tracing::default()
        });
        f.placer.try_call_kernel("sgemm", || Ok(())).unwrap();
        let err = f
            .placer
            .try_call_kernel("sgemv", || {
                Err(RuntimeError::new("host", "launch", RuntimeStatus::ExecutionFailed, 13))
            })
            .unwrap_err();
        assert_eq!(err.status, RuntimeStatus::ExecutionFailed);
        assert_eq!(f.log.named("kernel_call")[0].symbol.as_deref(), Some("sgemm"));
        let failure = &f.log.named("kernel_failure")[0];
        assert_eq!(failure.symbol.as_deref(), Some("sgemv"));
        assert_eq!(failure.status.as_deref(), Some("execution_failed"));
    }

    #[test]
    fn non_concurrent_device_synchronizes_after_kernels() {
        let f = fixture(Tracing::default());
        f.rt.set_concurrent_managed_access(false);
        f.placer.try_call_kernel("saxpy", || Ok(())).unwrap();
        assert_eq!(f.rt.synchronizations(), 1);
    }

    fn bytes_of(v: &[f32]) -> Vec<u8> {
        v.iter().flat_map(|x| x.to_ne_bytes()).collect()
    }
}
