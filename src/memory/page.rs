//! Guest memory pages: attributes, backing storage variants and the
//! process-wide zero page.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::MachineError;
use crate::memory::Memory;

/// Size of a guest page in bytes.
pub const PAGE_SIZE: usize = 4096;
/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u32 = 12;
/// Offset mask within a page.
pub const PAGE_MASK: u64 = (PAGE_SIZE as u64) - 1;

/// Owned backing storage for a single page.
pub type PageBuffer = [u8; PAGE_SIZE];

/// The process-wide zero page. Used as the backing of every
/// unmapped-but-readable address; never mutated.
pub static ZERO_PAGE: PageBuffer = [0u8; PAGE_SIZE];

/// Returns the page number containing `addr`.
#[inline(always)]
pub const fn page_number(addr: u64) -> u64 {
    addr >> PAGE_SHIFT
}

/// Rounds `addr` up to the next page boundary.
#[inline(always)]
pub const fn page_align_up(addr: u64) -> u64 {
    (addr + PAGE_MASK) & !PAGE_MASK
}

/// Access permissions and sharing state of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageAttributes {
    pub read: bool,
    pub write: bool,
    pub exec: bool,
    /// Backing storage is shared and must never be written through.
    pub shared: bool,
    /// Copy-on-write: reads are shared, the first write clones the page.
    pub cow: bool,
    /// Every access through the paged path invokes the trap callback.
    pub trap: bool,
    /// Set only on the fallback zero page returned for unmapped addresses.
    pub is_default: bool,
}

impl Default for PageAttributes {
    fn default() -> Self {
        // Unmapped guest memory reads zeros and becomes writable on the
        // first write, like anonymous host mappings.
        Self {
            read: true,
            write: true,
            exec: false,
            shared: false,
            cow: false,
            trap: false,
            is_default: false,
        }
    }
}

impl PageAttributes {
    /// Attributes with explicit permission bits and everything else off.
    pub const fn rwx(read: bool, write: bool, exec: bool) -> Self {
        Self {
            read,
            write,
            exec,
            shared: false,
            cow: false,
            trap: false,
            is_default: false,
        }
    }

    /// True when a page with these attributes may be written directly,
    /// without faulting first.
    #[inline]
    pub const fn is_writable(&self) -> bool {
        self.write && !self.cow && !self.shared
    }
}

/// What kind of access triggered a page trap. Read and write carry the
/// access size in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapKind {
    Read(usize),
    Write(usize),
    Exec,
}

/// A trap callback: a capability bundling the target function with
/// whatever state it captured. Invoked with the owning memory, the kind
/// of access, the faulting guest address and (for writes) the value being
/// stored. For reads the returned value is what the guest observes.
pub type TrapHandler<const W: usize> =
    Arc<dyn Fn(&mut Memory<W>, TrapKind, u64, u64) -> Result<u64, MachineError> + Send + Sync>;

/// Backing storage of a page.
#[derive(Clone)]
pub enum PageData {
    /// An owned, refcounted 4 KiB buffer. Shared between forks until a
    /// copy-on-write fault makes it unique again.
    Owned(Arc<PageBuffer>),
    /// A window into the flat memory arena at the given byte offset.
    Arena(usize),
    /// A read-only window into the ELF image at the given byte offset.
    Binary(usize),
    /// The global zero page.
    Zero,
}

impl std::fmt::Debug for PageData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PageData::Owned(_) => f.write_str("Owned"),
            PageData::Arena(off) => write!(f, "Arena(0x{off:x})"),
            PageData::Binary(off) => write!(f, "Binary(0x{off:x})"),
            PageData::Zero => f.write_str("Zero"),
        }
    }
}

/// A unit of guest memory: attributes, backing data and an optional trap
/// callback.
pub struct Page<const W: usize> {
    pub attr: PageAttributes,
    pub data: PageData,
    pub trap_cb: Option<TrapHandler<W>>,
}

impl<const W: usize> Page<W> {
    /// A fresh zero-filled owned page with the given attributes.
    pub fn new_owned(attr: PageAttributes) -> Self {
        Self {
            attr,
            data: PageData::Owned(Arc::new(ZERO_PAGE)),
            trap_cb: None,
        }
    }

    /// A page whose data lives in the arena at `offset`.
    pub fn new_arena(attr: PageAttributes, offset: usize) -> Self {
        Self {
            attr,
            data: PageData::Arena(offset),
            trap_cb: None,
        }
    }

    /// The immutable fallback page for unmapped addresses.
    pub(crate) fn default_zero() -> Self {
        let mut attr = PageAttributes::rwx(true, false, false);
        attr.is_default = true;
        Self {
            attr,
            data: PageData::Zero,
            trap_cb: None,
        }
    }

    #[inline]
    pub fn has_trap(&self) -> bool {
        self.attr.trap && self.trap_cb.is_some()
    }
}

impl<const W: usize> Clone for Page<W> {
    fn clone(&self) -> Self {
        Self {
            attr: self.attr,
            data: self.data.clone(),
            trap_cb: self.trap_cb.clone(),
        }
    }
}

impl<const W: usize> std::fmt::Debug for Page<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("attr", &self.attr)
            .field("data", &self.data)
            .field("trap", &self.trap_cb.is_some())
            .finish()
    }
}
