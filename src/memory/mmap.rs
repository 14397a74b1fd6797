//! A simple guest mmap allocator: a bump pointer above the brk window
//! plus a free-list of unmapped ranges consulted before bumping.

use serde::{Deserialize, Serialize};

use crate::memory::page::page_align_up;

/// A free range previously released with `mmap_unmap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeRange {
    pub addr: u64,
    pub size: u64,
}

/// Free-list cache for the guest mmap region, ordered by address so
/// adjacent ranges can be coalesced on insert.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MmapCache {
    ranges: Vec<FreeRange>,
}

impl MmapCache {
    /// Takes a range of at least `size` bytes from the cache, splitting
    /// a larger range if needed. First fit.
    pub fn allocate(&mut self, size: u64) -> Option<u64> {
        let idx = self.ranges.iter().position(|r| r.size >= size)?;
        let range = &mut self.ranges[idx];
        let addr = range.addr;
        if range.size == size {
            self.ranges.remove(idx);
        } else {
            range.addr += size;
            range.size -= size;
        }
        Some(addr)
    }

    /// Returns a range to the cache, merging with neighbors.
    pub fn insert(&mut self, addr: u64, size: u64) {
        if size == 0 {
            return;
        }
        let pos = self
            .ranges
            .iter()
            .position(|r| r.addr > addr)
            .unwrap_or(self.ranges.len());
        self.ranges.insert(pos, FreeRange { addr, size });
        self.coalesce(pos);
    }

    /// Removes and returns the range ending exactly at `end`, if any.
    /// Used to relax the bump pointer when the topmost mapping shrinks.
    pub fn take_ending_at(&mut self, end: u64) -> Option<FreeRange> {
        let idx = self
            .ranges
            .iter()
            .position(|r| r.addr + r.size == end)?;
        Some(self.ranges.remove(idx))
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn ranges(&self) -> &[FreeRange] {
        &self.ranges
    }

    fn coalesce(&mut self, idx: usize) {
        // Merge with the successor first so `idx` stays valid.
        if idx + 1 < self.ranges.len() {
            let next = self.ranges[idx + 1];
            let cur = &mut self.ranges[idx];
            if cur.addr + cur.size == next.addr {
                cur.size += next.size;
                self.ranges.remove(idx + 1);
            }
        }
        if idx > 0 {
            let cur = self.ranges[idx];
            let prev = &mut self.ranges[idx - 1];
            if prev.addr + prev.size == cur.addr {
                prev.size += cur.size;
                self.ranges.remove(idx);
            }
        }
    }
}

/// The allocator proper: owns the bump address and the free-list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MmapAllocator {
    /// Next never-allocated address; grows upward.
    pub address: u64,
    /// Start of the mmap region, set at load time.
    pub start: u64,
    pub cache: MmapCache,
}

impl MmapAllocator {
    pub fn new(start: u64) -> Self {
        Self {
            address: start,
            start,
            cache: MmapCache::default(),
        }
    }

    /// Allocates at least `bytes` of page-aligned guest address space.
    pub fn allocate(&mut self, bytes: u64) -> u64 {
        let size = page_align_up(bytes.max(1));
        if let Some(addr) = self.cache.allocate(size) {
            return addr;
        }
        let addr = self.address;
        self.address += size;
        addr
    }

    /// Shrinks `[addr, addr+size)` to `new_size` bytes. Only the topmost
    /// mapping can lower the bump pointer; interior shrinks feed the
    /// free-list. Returns whether anything was released.
    pub fn relax(&mut self, addr: u64, size: u64, new_size: u64) -> bool {
        let size = page_align_up(size);
        let new_size = page_align_up(new_size);
        if new_size >= size || addr + size > self.address {
            return false;
        }
        if addr + size == self.address {
            self.address = addr + new_size;
            // A top-adjacent cached range can now relax further.
            while let Some(range) = self.cache.take_ending_at(self.address) {
                self.address = range.addr;
            }
        } else {
            self.cache.insert(addr + new_size, size - new_size);
        }
        true
    }

    /// Releases `[addr, addr+size)` back to the allocator. Ranges outside
    /// the mmap region are ignored.
    pub fn unmap(&mut self, addr: u64, size: u64) -> bool {
        let size = page_align_up(size);
        if size == 0 || addr < self.start || addr + size > self.address {
            return false;
        }
        if addr + size == self.address {
            self.address = addr;
            while let Some(range) = self.cache.take_ending_at(self.address) {
                self.address = range.addr;
            }
        } else {
            self.cache.insert(addr, size);
        }
        true
    }
}
