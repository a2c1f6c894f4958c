//! Allocation provenance records and the allocator capability interface.
//!
//! An [`AllocationRecord`] describes *how* a call pattern allocates: which
//! intercepted symbol it came through, the call-site, the requested size and
//! the [`ObjectAllocator`] that constructs and destroys its objects. Records
//! are immutable once built and shared through `Arc` by every object created
//! from the same pattern.

#![allow(unsafe_code)]

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Intercepted allocator entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AllocSym {
    Malloc,
    Calloc,
    Realloc,
    Free,
}

impl AllocSym {
    pub const COUNT: usize = 4;

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Malloc => "malloc",
            Self::Calloc => "calloc",
            Self::Realloc => "realloc",
            Self::Free => "free",
        }
    }

    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Parse a symbol name. Unknown names yield `None`.
    #[must_use]
    pub fn from_symbol(symbol: &str) -> Option<Self> {
        match symbol {
            "malloc" => Some(Self::Malloc),
            "calloc" => Some(Self::Calloc),
            "realloc" => Some(Self::Realloc),
            "free" => Some(Self::Free),
            _ => None,
        }
    }
}

impl fmt::Display for AllocSym {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for AllocSym {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for AllocSym {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::from_symbol(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown allocator symbol '{raw}'")))
    }
}

/// Instruction address an allocation request originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct CallSite(pub usize);

impl CallSite {
    /// Sentinel for callers that could not resolve a return address.
    pub const UNKNOWN: Self = Self(0);

    #[must_use]
    pub const fn addr(self) -> usize {
        self.0
    }

    /// Parse `0x`-prefixed hex or plain decimal.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let value = match text
            .strip_prefix("0x")
            .or_else(|| text.strip_prefix("0X"))
        {
            Some(hex) => usize::from_str_radix(&hex.replace('_', ""), 16).ok()?,
            None => text.parse::<usize>().ok()?,
        };
        Some(Self(value))
    }
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl Serialize for CallSite {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for CallSite {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Int(v) => usize::try_from(v)
                .map(Self)
                .map_err(|_| serde::de::Error::custom("call-site does not fit in usize")),
            Raw::Text(s) => Self::parse(&s)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid call-site '{s}'"))),
        }
    }
}

/// Where objects from a call pattern live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Placement {
    /// Ordinary host heap.
    Host,
    /// Managed memory visible to both host and accelerator.
    Device,
}

impl Placement {
    #[must_use]
    pub const fn from_decision(on_device: bool) -> Self {
        if on_device { Self::Device } else { Self::Host }
    }
}

/// Construction/destruction capability for tracked objects.
///
/// One implementation exists per backing store (standard heap, accelerator
/// managed memory). The interceptor holds them as `Arc<dyn ObjectAllocator>`
/// and picks one per [`AllocationRecord`].
pub trait ObjectAllocator: Send + Sync + fmt::Debug {
    /// Short identifier used in logs.
    fn name(&self) -> &'static str;

    /// True if objects built by this allocator are addressable by device kernels.
    fn device_visible(&self) -> bool;

    /// Allocate `size` bytes. `None` on exhaustion.
    fn construct(&self, size: usize) -> Option<NonNull<u8>>;

    /// Allocate `count * size` zeroed bytes. `None` on overflow or exhaustion.
    fn construct_zeroed(&self, count: usize, size: usize) -> Option<NonNull<u8>> {
        let total = count.checked_mul(size)?;
        let ptr = self.construct(total)?;
        // SAFETY: `construct` returned a block valid for `total` bytes.
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0, total) };
        Some(ptr)
    }

    /// Move an object into a block of `new_size` bytes, preserving the first
    /// `min(old_size, new_size)` bytes. On failure the old object is untouched.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live object built by this allocator and valid for
    /// `old_size` bytes.
    unsafe fn resize(
        &self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        let fresh = self.construct(new_size)?;
        // SAFETY: both blocks are live and at least `min(old, new)` bytes long;
        // they are distinct allocations so they cannot overlap.
        unsafe {
            std::ptr::copy_nonoverlapping(
                ptr.as_ptr(),
                fresh.as_ptr(),
                old_size.min(new_size),
            );
            self.destroy(ptr);
        }
        Some(fresh)
    }

    /// Release an object.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live object built by this allocator; it is dangling
    /// afterwards.
    unsafe fn destroy(&self, ptr: NonNull<u8>);

    /// Bytes actually usable at `ptr` (at least the requested size).
    ///
    /// # Safety
    ///
    /// `ptr` must be a live object built by this allocator.
    unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize;
}

/// Immutable provenance for one allocation call pattern.
#[derive(Clone)]
pub struct AllocationRecord {
    pub alloc: AllocSym,
    pub call_site: CallSite,
    pub requested: usize,
    pub target: Placement,
    pub allocator: Arc<dyn ObjectAllocator>,
}

impl AllocationRecord {
    #[must_use]
    pub fn new(
        alloc: AllocSym,
        call_site: CallSite,
        requested: usize,
        allocator: Arc<dyn ObjectAllocator>,
    ) -> Self {
        let target = Placement::from_decision(allocator.device_visible());
        Self {
            alloc,
            call_site,
            requested,
            target,
            allocator,
        }
    }

    /// True if objects built from this record are accelerator-visible.
    #[must_use]
    pub fn is_device_visible(&self) -> bool {
        self.target == Placement::Device
    }
}

impl fmt::Debug for AllocationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocationRecord")
            .field("alloc", &self.alloc)
            .field("call_site", &self.call_site)
            .field("requested", &self.requested)
            .field("target", &self.target)
            .field("allocator", &self.allocator.name())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::alloc::Layout;
    use std::collections::HashMap;

    /// Heap allocator over `std::alloc` that remembers layouts, for tests.
    #[derive(Debug, Default)]
    pub struct VecAllocator {
        device: bool,
        layouts: Mutex<HashMap<usize, Layout>>,
    }

    impl VecAllocator {
        pub fn host() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn device() -> Arc<Self> {
            Arc::new(Self {
                device: true,
                layouts: Mutex::new(HashMap::new()),
            })
        }

        pub fn live(&self) -> usize {
            self.layouts.lock().len()
        }
    }

    impl ObjectAllocator for VecAllocator {
        fn name(&self) -> &'static str {
            if self.device { "test-device" } else { "test-host" }
        }

        fn device_visible(&self) -> bool {
            self.device
        }

        fn construct(&self, size: usize) -> Option<NonNull<u8>> {
            let layout = Layout::from_size_align(size.max(1), 16).ok()?;
            // SAFETY: layout has non-zero size.
            let ptr = NonNull::new(unsafe { std::alloc::alloc(layout) })?;
            self.layouts.lock().insert(ptr.as_ptr() as usize, layout);
            Some(ptr)
        }

        unsafe fn destroy(&self, ptr: NonNull<u8>) {
            if let Some(layout) = self.layouts.lock().remove(&(ptr.as_ptr() as usize)) {
                // SAFETY: pointer/layout pair came from `construct`.
                unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
            }
        }

        unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
            self.layouts
                .lock()
                .get(&(ptr.as_ptr() as usize))
                .map_or(0, Layout::size)
        }
    }
}
