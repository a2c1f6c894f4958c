//! Live object registry.
//!
//! Maps every live tracked pointer to its [`ObjectInfo`]. Exact lookups go
//! through address-sharded hash maps (same sharding as an allocation arena:
//! upper address bits pick the shard) so concurrent allocator traffic on
//! different pages rarely contends. Interior-pointer lookups use an ordered
//! span index.
//!
//! Thread-safe via `parking_lot::Mutex`. Lock order is shard, then spans.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::SystemTime;

use parking_lot::{Mutex, MutexGuard};

use crate::callsite::CallSiteTable;
use crate::record::{AllocSym, AllocationRecord};

/// Number of shards for the live map (power of 2).
const NUM_SHARDS: usize = 16;

/// Metadata for one live tracked object.
#[derive(Debug, Clone)]
pub struct ObjectInfo {
    pub record: Arc<AllocationRecord>,
    /// Size of the object in bytes.
    pub size: usize,
    /// Address of the object start.
    pub ptr: usize,
    pub created: SystemTime,
    /// Process-wide unique id.
    pub uid: u64,
    /// Ordinal among allocations made through the same symbol.
    pub nth_alloc: u64,
}

impl ObjectInfo {
    #[must_use]
    pub fn end(&self) -> usize {
        self.ptr.saturating_add(self.size)
    }

    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.ptr && addr < self.end()
    }

    /// True if `[addr, addr + len)` lies inside this object.
    #[must_use]
    pub fn covers(&self, addr: usize, len: usize) -> bool {
        addr >= self.ptr
            && addr
                .checked_add(len)
                .is_some_and(|end| end <= self.end())
    }

    #[must_use]
    pub fn is_device_visible(&self) -> bool {
        self.record.is_device_visible()
    }
}

/// Registry of live tracked objects plus the call-site table.
#[derive(Debug)]
pub struct ObjectRegistry {
    shards: Box<[Mutex<HashMap<usize, Arc<ObjectInfo>>>]>,
    /// start -> end of every live object.
    spans: Mutex<BTreeMap<usize, usize>>,
    sites: Mutex<CallSiteTable>,
    next_uid: AtomicU64,
    nth: [AtomicU64; AllocSym::COUNT],
    live: AtomicUsize,
}

impl ObjectRegistry {
    #[must_use]
    pub fn new() -> Self {
        let shards: Vec<Mutex<HashMap<usize, Arc<ObjectInfo>>>> = (0..NUM_SHARDS)
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        Self {
            shards: shards.into_boxed_slice(),
            spans: Mutex::new(BTreeMap::new()),
            sites: Mutex::new(CallSiteTable::new()),
            next_uid: AtomicU64::new(1),
            nth: std::array::from_fn(|_| AtomicU64::new(0)),
            live: AtomicUsize::new(0),
        }
    }

    /// Record a freshly constructed object at `ptr`.
    ///
    /// A stale entry at the same address (the allocator reused it without us
    /// seeing the release) is replaced.
    pub fn register(&self, ptr: usize, record: Arc<AllocationRecord>, size: usize) -> Arc<ObjectInfo> {
        let nth_alloc = self.nth[record.alloc.index()].fetch_add(1, Ordering::Relaxed);
        let info = Arc::new(ObjectInfo {
            record,
            size,
            ptr,
            created: SystemTime::now(),
            uid: self.next_uid.fetch_add(1, Ordering::Relaxed),
            nth_alloc,
        });
        self.insert(Arc::clone(&info));
        info
    }

    /// Put back an entry taken out with [`unregister`](Self::unregister),
    /// keeping its uid and ordinal.
    pub fn reinsert(&self, info: Arc<ObjectInfo>) {
        self.insert(info);
    }

    fn insert(&self, info: Arc<ObjectInfo>) {
        let (ptr, end) = (info.ptr, info.end());
        let mut shard = self.shards[shard_for(ptr)].lock();
        let previous = shard.insert(ptr, info);
        self.spans.lock().insert(ptr, end);
        if previous.is_none() {
            self.live.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Exact lookup by object start address.
    #[must_use]
    pub fn lookup(&self, ptr: usize) -> Option<Arc<ObjectInfo>> {
        self.shards[shard_for(ptr)].lock().get(&ptr).cloned()
    }

    /// Lookup of the object containing `addr` (start or interior).
    #[must_use]
    pub fn lookup_containing(&self, addr: usize) -> Option<Arc<ObjectInfo>> {
        if let Some(info) = self.lookup(addr) {
            return Some(info);
        }
        let start = {
            let spans = self.spans.lock();
            let (&start, &end) = spans.range(..=addr).next_back()?;
            if addr >= end {
                return None;
            }
            start
        };
        self.lookup(start)
    }

    /// Remove the entry for `ptr`, returning it.
    pub fn unregister(&self, ptr: usize) -> Option<Arc<ObjectInfo>> {
        let mut shard = self.shards[shard_for(ptr)].lock();
        let removed = shard.remove(&ptr)?;
        self.spans.lock().remove(&ptr);
        self.live.fetch_sub(1, Ordering::Relaxed);
        Some(removed)
    }

    /// Number of live tracked objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total bytes of live device-visible objects.
    #[must_use]
    pub fn device_visible_bytes(&self) -> usize {
        self.shards
            .iter()
            .map(|s| {
                s.lock()
                    .values()
                    .filter(|i| i.is_device_visible())
                    .map(|i| i.size)
                    .sum::<usize>()
            })
            .sum()
    }

    /// Exclusive access to the call-site table.
    pub fn sites(&self) -> MutexGuard<'_, CallSiteTable> {
        self.sites.lock()
    }
}

impl Default for ObjectRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn shard_for(addr: usize) -> usize {
    (addr >> 12) % NUM_SHARDS
}
