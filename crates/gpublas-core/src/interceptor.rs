//! Allocator interception policy.
//!
//! Every heap entry point of the host process funnels into an
//! [`Interceptor`]. A call is *tracked* when tracking is enabled, the thread
//! is not already inside the tracker, and the caller's call-site lies outside
//! every excluded region. Tracked calls resolve an allocation record through
//! the call-site table (pinned definitions first, then the heuristic),
//! construct the object with the record's allocator and register it.
//! Everything else goes straight to the host allocator.
//!
//! The reentry guard is thread-local: the tracker's own bookkeeping
//! allocates, and those nested calls must reach the host allocator without
//! being tracked or deadlocking on registry locks.

use std::cell::Cell;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use gpublas_membrane::{
    AllocSym, AllocationRecord, CallSite, ExcludedRegions, Heuristic, ObjectAllocator,
    ObjectRegistry, Placement, PlacementMetrics, SiteKey, TrackingDefinition,
};

thread_local! {
    static TRACKER_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Marks the current thread as inside the tracker while alive.
pub struct ReentryGuard {
    _not_send: PhantomData<*const ()>,
}

impl ReentryGuard {
    /// Enter the tracker; `None` if this thread is already inside it (or its
    /// thread-locals are gone).
    #[must_use]
    pub fn enter() -> Option<Self> {
        TRACKER_DEPTH
            .try_with(|depth| {
                if depth.get() > 0 {
                    None
                } else {
                    depth.set(1);
                    Some(Self {
                        _not_send: PhantomData,
                    })
                }
            })
            .ok()
            .flatten()
    }

    /// Enter unconditionally; nests with any outer guard.
    #[must_use]
    pub fn hold() -> Self {
        let _ = TRACKER_DEPTH.try_with(|depth| depth.set(depth.get().saturating_add(1)));
        Self {
            _not_send: PhantomData,
        }
    }

    /// True while any guard is alive on this thread.
    #[must_use]
    pub fn active() -> bool {
        TRACKER_DEPTH.try_with(|depth| depth.get() > 0).unwrap_or(true)
    }
}

impl Drop for ReentryGuard {
    fn drop(&mut self) {
        let _ = TRACKER_DEPTH.try_with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Routes allocator calls to tracked heap/managed construction or passthrough.
#[derive(Debug)]
pub struct Interceptor {
    host: Arc<dyn ObjectAllocator>,
    managed: Arc<dyn ObjectAllocator>,
    registry: Arc<ObjectRegistry>,
    regions: ExcludedRegions,
    heuristic: Option<Heuristic>,
    metrics: Arc<PlacementMetrics>,
    pinned_any: AtomicBool,
}

impl Interceptor {
    /// `host` serves passthrough calls and host-placed tracked objects;
    /// `managed` serves device-placed ones. Without a heuristic only pinned
    /// call patterns are tracked.
    #[must_use]
    pub fn new(
        host: Arc<dyn ObjectAllocator>,
        managed: Arc<dyn ObjectAllocator>,
        registry: Arc<ObjectRegistry>,
        regions: ExcludedRegions,
        heuristic: Option<Heuristic>,
        metrics: Arc<PlacementMetrics>,
    ) -> Self {
        let pinned_any = registry.sites().pinned_len() > 0;
        Self {
            host,
            managed,
            registry,
            regions,
            heuristic,
            metrics,
            pinned_any: AtomicBool::new(pinned_any),
        }
    }

    /// Pin every pattern of `definition` to managed placement.
    pub fn pin(&self, definition: &TrackingDefinition) -> usize {
        let _guard = ReentryGuard::hold();
        let added = self.registry.sites().pin(definition);
        if self.registry.sites().pinned_len() > 0 {
            self.pinned_any.store(true, Ordering::Release);
        }
        added
    }

    #[must_use]
    pub fn tracking_enabled(&self) -> bool {
        self.heuristic.is_some() || self.pinned_any.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ObjectRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn regions(&self) -> &ExcludedRegions {
        &self.regions
    }

    #[must_use]
    pub fn heuristic(&self) -> Option<&Heuristic> {
        self.heuristic.as_ref()
    }

    #[must_use]
    pub fn host_allocator(&self) -> &Arc<dyn ObjectAllocator> {
        &self.host
    }

    /// `malloc`.
    pub fn allocate(&self, size: usize, site: CallSite) -> Option<NonNull<u8>> {
        self.construct(AllocSym::Malloc, site, size, |a| a.construct(size))
    }

    /// `calloc`. `None` when `count * size` overflows.
    pub fn allocate_zeroed(&self, count: usize, size: usize, site: CallSite) -> Option<NonNull<u8>> {
        let total = count.checked_mul(size)?;
        self.construct(AllocSym::Calloc, site, total, |a| a.construct_zeroed(count, size))
    }

    /// `realloc`. A null `ptr` allocates; a zero `size` releases and returns
    /// `None`. A tracked object keeps its record and allocator.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live pointer returned by this interceptor.
    pub unsafe fn resize(&self, ptr: *mut u8, size: usize, site: CallSite) -> Option<NonNull<u8>> {
        let Some(old) = NonNull::new(ptr) else {
            return self.construct(AllocSym::Realloc, site, size, |a| a.construct(size));
        };
        if size == 0 {
            // SAFETY: forwarded caller contract.
            unsafe { self.release(ptr, site) };
            return None;
        }

        let guard = if self.tracking_enabled() {
            ReentryGuard::enter()
        } else {
            None
        };
        // Unregister before the allocator can recycle `old`: once it is
        // destroyed another thread may be handed the same address.
        let tracked = guard
            .as_ref()
            .and_then(|_| self.registry.unregister(old.as_ptr() as usize));
        let Some(info) = tracked else {
            // SAFETY: untracked pointers always come from the host allocator.
            return unsafe { self.host_resize(old, size) };
        };

        let record = Arc::clone(&info.record);
        // SAFETY: `old` is live, built by `record.allocator`, `info.size` bytes.
        let Some(fresh) = (unsafe { record.allocator.resize(old, info.size, size) }) else {
            // `old` is untouched on failure.
            self.registry.reinsert(info);
            return None;
        };
        if record.is_device_visible() {
            PlacementMetrics::add(&self.metrics.managed_bytes, size);
        }
        self.registry.register(fresh.as_ptr() as usize, record, size);
        Some(fresh)
    }

    /// `free`. Tracked objects are unregistered before their allocator
    /// destroys them.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live pointer returned by this interceptor.
    pub unsafe fn release(&self, ptr: *mut u8, _site: CallSite) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };
        let guard = if self.tracking_enabled() {
            ReentryGuard::enter()
        } else {
            None
        };
        let tracked = guard.and_then(|_g| self.registry.unregister(ptr.as_ptr() as usize));
        match tracked {
            // SAFETY: the registry entry proves `record.allocator` built it.
            Some(info) => unsafe { info.record.allocator.destroy(ptr) },
            // SAFETY: untracked pointers always come from the host allocator.
            None => unsafe { self.host.destroy(ptr) },
        }
    }

    /// `malloc_usable_size`.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live pointer returned by this interceptor.
    pub unsafe fn usable_size(&self, ptr: *mut u8) -> usize {
        let Some(ptr) = NonNull::new(ptr) else {
            return 0;
        };
        let tracked = if self.tracking_enabled() {
            ReentryGuard::enter().and_then(|_g| self.registry.lookup(ptr.as_ptr() as usize))
        } else {
            None
        };
        match tracked {
            // SAFETY: live object of this allocator.
            Some(info) => unsafe { info.record.allocator.usable_size(ptr) },
            // SAFETY: live host block.
            None => unsafe { self.host.usable_size(ptr) },
        }
    }

    /// Guard for a tracked call from `site`, or `None` for passthrough.
    fn enter(&self, site: CallSite) -> Option<ReentryGuard> {
        if !self.tracking_enabled() {
            return None;
        }
        let guard = ReentryGuard::enter()?;
        if self.regions.contains(site.addr()) {
            PlacementMetrics::inc(&self.metrics.excluded_bypasses);
            return None;
        }
        Some(guard)
    }

    /// Placement for a call pattern; `None` leaves it untracked.
    fn target(&self, key: &SiteKey) -> Option<Placement> {
        if self.registry.sites().is_pinned(key) {
            return Some(Placement::Device);
        }
        self.heuristic
            .as_ref()
            .map(|h| Placement::from_decision(h.decide(key.call_site, key.requested)))
    }

    fn construct(
        &self,
        alloc: AllocSym,
        site: CallSite,
        requested: usize,
        build: impl Fn(&dyn ObjectAllocator) -> Option<NonNull<u8>>,
    ) -> Option<NonNull<u8>> {
        let Some(_guard) = self.enter(site) else {
            return build(&*self.host);
        };
        let key = SiteKey::new(alloc, site, requested);
        let Some(target) = self.target(&key) else {
            return build(&*self.host);
        };
        let allocator = match target {
            Placement::Device => &self.managed,
            Placement::Host => &self.host,
        };
        let ptr = build(&**allocator)?;

        if self.regions.contains(ptr.as_ptr() as usize) {
            PlacementMetrics::inc(&self.metrics.excluded_bypasses);
            if target == Placement::Host {
                return Some(ptr);
            }
            // SAFETY: just built by the managed allocator and never exposed.
            unsafe { allocator.destroy(ptr) };
            return build(&*self.host);
        }

        let (record, _) = self.registry.sites().lookup_or_insert(key, target, || {
            AllocationRecord::new(alloc, site, requested, Arc::clone(allocator))
        });
        if target == Placement::Device {
            PlacementMetrics::add(&self.metrics.managed_bytes, requested);
        }
        self.registry.register(ptr.as_ptr() as usize, record, requested);
        Some(ptr)
    }

    /// # Safety
    ///
    /// `ptr` must be a live host-allocator block.
    unsafe fn host_resize(&self, ptr: NonNull<u8>, size: usize) -> Option<NonNull<u8>> {
        // SAFETY: forwarded caller contract.
        unsafe {
            let old_size = self.host.usable_size(ptr);
            self.host.resize(ptr, old_size, size)
        }
    }
}
