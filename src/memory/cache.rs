//! Single-entry page caches for the most recently used readable and
//! writable page.

use crate::memory::page::PAGE_SIZE;

/// Cached translation of a page number to its host backing storage.
///
/// The pointer targets a live 4 KiB buffer owned by the same `Memory`
/// (an `Arc<PageBuffer>` payload or an arena window). Every structural
/// page mutation — creation, removal, attribute change, copy-on-write
/// resolution, fork, deserialization — must call [`CachedPage::invalidate`]
/// before the buffer can move or be freed.
#[derive(Clone, Copy)]
pub(crate) struct CachedPage {
    pageno: u64,
    data: *mut u8,
}

impl CachedPage {
    const INVALID: u64 = u64::MAX;

    pub(crate) const fn new() -> Self {
        Self {
            pageno: Self::INVALID,
            data: std::ptr::null_mut(),
        }
    }

    #[inline(always)]
    pub(crate) fn invalidate(&mut self) {
        self.pageno = Self::INVALID;
        self.data = std::ptr::null_mut();
    }

    #[inline(always)]
    pub(crate) fn set(&mut self, pageno: u64, data: *mut u8) {
        self.pageno = pageno;
        self.data = data;
    }

    /// Returns the cached page slice if `pageno` matches.
    #[inline(always)]
    pub(crate) fn lookup(&self, pageno: u64) -> Option<&[u8]> {
        if self.pageno == pageno {
            // SAFETY: `data` points at a live page buffer of PAGE_SIZE
            // bytes; invalidation precedes every mutation that could
            // move or free it.
            Some(unsafe { std::slice::from_raw_parts(self.data, PAGE_SIZE) })
        } else {
            None
        }
    }

    /// Returns the cached page slice mutably if `pageno` matches.
    #[inline(always)]
    pub(crate) fn lookup_mut(&mut self, pageno: u64) -> Option<&mut [u8]> {
        if self.pageno == pageno {
            // SAFETY: as in `lookup`; additionally the pointer was taken
            // from a uniquely-owned buffer when the cache entry was set.
            Some(unsafe { std::slice::from_raw_parts_mut(self.data, PAGE_SIZE) })
        } else {
            None
        }
    }
}

impl std::fmt::Debug for CachedPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.pageno == Self::INVALID {
            f.write_str("CachedPage(empty)")
        } else {
            write!(f, "CachedPage(0x{:x})", self.pageno)
        }
    }
}
