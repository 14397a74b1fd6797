//! The guest address space: a paged map with copy-on-write semantics, a
//! flat arena fast path for low addresses, single-entry read/write page
//! caches, MMIO traps and a guest mmap allocator.

pub mod arena;
pub(crate) mod cache;
pub mod mmap;
pub mod page;

use std::sync::Arc;

use hashbrown::HashMap;
use nohash_hasher::BuildNoHashHasher;

use crate::cpu::exec_segment::DecodedExecuteSegment;
use crate::error::MachineError;
use arena::Arena;
use cache::CachedPage;
use mmap::MmapAllocator;
use page::{
    page_number, Page, PageAttributes, PageData, TrapHandler, TrapKind, PAGE_MASK, PAGE_SHIFT,
    PAGE_SIZE, ZERO_PAGE,
};

/// Size of the brk window between the heap start and the mmap region.
pub const BRK_MAX: u64 = 16 << 20;
/// Base address for dynamic executables with zero-based segments.
pub const DYLINK_BASE: u64 = 0x40000;
/// Maximum number of live decoded execute segments.
pub const MAX_EXECUTE_SEGS: usize = 8;
/// Upper bound on the flat arena allocation (pages).
const MAX_ARENA_PAGES: u64 = 1 << 16;

/// Invoked when an unmapped page is written. The handler is expected to
/// create the page (or fail); forks and snapshots may interpose.
pub type PageFaultHandler<const W: usize> =
    fn(&mut Memory<W>, u64, bool) -> Result<(), MachineError>;

/// Invoked on the first write to a copy-on-write page. The default
/// handler replaces the mapping with an owned duplicate.
pub type PageWriteHandler<const W: usize> = fn(&mut Memory<W>, u64) -> Result<(), MachineError>;

/// Invoked when an unmapped page is read. The default handler does
/// nothing, leaving the read to observe the zero page.
pub type PageReadHandler<const W: usize> = fn(&mut Memory<W>, u64) -> Result<(), MachineError>;

mod sealed {
    pub trait Sealed {}
    impl Sealed for u8 {}
    impl Sealed for u16 {}
    impl Sealed for u32 {}
    impl Sealed for u64 {}
}

/// Integer types that can be moved between host and guest memory.
pub trait MemoryValue: sealed::Sealed + Copy {
    const SIZE: usize;
    fn from_u64(v: u64) -> Self;
    fn into_u64(self) -> u64;
}

macro_rules! impl_memory_value {
    ($($t:ty),*) => {$(
        impl MemoryValue for $t {
            const SIZE: usize = std::mem::size_of::<$t>();
            #[inline(always)]
            fn from_u64(v: u64) -> Self {
                v as $t
            }
            #[inline(always)]
            fn into_u64(self) -> u64 {
                self as u64
            }
        }
    )*};
}

impl_memory_value!(u8, u16, u32, u64);

#[inline(always)]
fn read_le(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf[..bytes.len()].copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}

#[inline(always)]
fn write_le(dst: &mut [u8], value: u64) {
    let n = dst.len();
    dst.copy_from_slice(&value.to_le_bytes()[..n]);
}

#[inline(always)]
const fn size_mask(size: usize) -> u64 {
    if size >= 8 {
        u64::MAX
    } else {
        (1u64 << (size * 8)) - 1
    }
}

/// The guest address space of one machine.
pub struct Memory<const W: usize> {
    pages: HashMap<u64, Page<W>, BuildNoHashHasher<u64>>,
    pub(crate) arena: Arena,
    rd_cache: CachedPage,
    wr_cache: CachedPage,
    pub(crate) mmap: MmapAllocator,
    exec_segs: Vec<Arc<DecodedExecuteSegment<W>>>,
    exec_generation: u64,
    binary: Arc<[u8]>,

    pub(crate) start_address: u64,
    pub(crate) stack_address: u64,
    pub(crate) exit_address: u64,
    pub(crate) heap_address: u64,
    max_memory: u64,
    pub(crate) is_dynamic: bool,

    /// Set by an execute-trap callback to redirect the interpreter.
    pending_jump: Option<u64>,

    page_fault_handler: PageFaultHandler<W>,
    page_write_handler: PageWriteHandler<W>,
    page_read_handler: PageReadHandler<W>,

    zero_page: Page<W>,
}

// SAFETY: the raw pointers in rd_cache/wr_cache only ever target buffers
// owned by this Memory (arena storage or page buffers kept alive by the
// page map), so moving the Memory between threads moves the referents'
// owner with it. Memory is not Sync.
unsafe impl<const W: usize> Send for Memory<W> {}

impl<const W: usize> Memory<W> {
    /// All addresses are masked to the machine width.
    pub const ADDR_MASK: u64 = if W == 4 { u32::MAX as u64 } else { u64::MAX };

    /// An empty address space backed by an arena sized for `max_memory`.
    /// The caller is expected to run the ELF loader next.
    pub(crate) fn empty(binary: Arc<[u8]>, max_memory: u64) -> Self {
        let max_memory = max_memory & Self::ADDR_MASK & !PAGE_MASK;
        let arena_pages = (max_memory >> PAGE_SHIFT).min(MAX_ARENA_PAGES);
        Self {
            pages: HashMap::default(),
            arena: Arena::new(arena_pages as usize),
            rd_cache: CachedPage::new(),
            wr_cache: CachedPage::new(),
            mmap: MmapAllocator::default(),
            exec_segs: Vec::new(),
            exec_generation: 0,
            binary,
            start_address: 0,
            stack_address: 0,
            exit_address: 0,
            heap_address: 0,
            max_memory,
            is_dynamic: false,
            pending_jump: None,
            page_fault_handler: default_page_fault,
            page_write_handler: default_page_write,
            page_read_handler: default_page_read,
            zero_page: Page::default_zero(),
        }
    }

    // ------------------------------------------------------------------
    // Key addresses
    // ------------------------------------------------------------------

    /// The ELF entry point.
    pub fn start_address(&self) -> u64 {
        self.start_address
    }

    /// The current initial stack pointer (used by construction and
    /// `vmcall`, unrelated to the live SP register).
    pub fn stack_initial(&self) -> u64 {
        self.stack_address
    }

    pub fn set_stack_initial(&mut self, addr: u64) {
        self.stack_address = addr & Self::ADDR_MASK;
    }

    /// The address used for returning from a `vmcall`.
    pub fn exit_address(&self) -> u64 {
        self.exit_address
    }

    pub fn set_exit_address(&mut self, addr: u64) {
        self.exit_address = addr & Self::ADDR_MASK;
    }

    /// The initial heap address (not the current heap maximum).
    pub fn heap_address(&self) -> u64 {
        self.heap_address
    }

    /// Start of the mmap region, above the brk window.
    pub fn mmap_start(&self) -> u64 {
        self.heap_address + BRK_MAX
    }

    /// The next never-allocated mmap address.
    pub fn mmap_address(&self) -> u64 {
        self.mmap.address
    }

    pub fn max_memory(&self) -> u64 {
        self.max_memory
    }

    pub fn is_dynamic_executable(&self) -> bool {
        self.is_dynamic
    }

    /// The ELF image this memory was loaded from.
    pub fn binary(&self) -> &Arc<[u8]> {
        &self.binary
    }

    pub fn pages_active(&self) -> usize {
        self.pages.len()
    }

    fn max_pages(&self) -> usize {
        (self.max_memory >> PAGE_SHIFT) as usize
    }

    // ------------------------------------------------------------------
    // Scalar access
    // ------------------------------------------------------------------

    /// Reads a little-endian value of type `T` from guest memory.
    /// Misaligned and page-straddling accesses are supported.
    #[inline(always)]
    pub fn read<T: MemoryValue>(&mut self, addr: u64) -> Result<T, MachineError> {
        let addr = addr & Self::ADDR_MASK;
        if self.arena.readable(addr, T::SIZE) {
            return Ok(T::from_u64(read_le(self.arena.slice(addr, T::SIZE))));
        }
        self.read_slow(addr, T::SIZE).map(T::from_u64)
    }

    /// Writes a little-endian value of type `T` to guest memory.
    #[inline(always)]
    pub fn write<T: MemoryValue>(&mut self, addr: u64, value: T) -> Result<(), MachineError> {
        let addr = addr & Self::ADDR_MASK;
        if self.arena.writable(addr, T::SIZE) {
            write_le(self.arena.slice_mut(addr, T::SIZE), value.into_u64());
            return Ok(());
        }
        self.write_slow(addr, T::SIZE, value.into_u64())
    }

    fn read_slow(&mut self, addr: u64, size: usize) -> Result<u64, MachineError> {
        if (addr & PAGE_MASK) + size as u64 <= PAGE_SIZE as u64 {
            return self.paged_read(addr, size);
        }
        // Page-straddling access: compose from byte sub-accesses.
        let mut buf = [0u8; 8];
        for (i, byte) in buf.iter_mut().enumerate().take(size) {
            *byte = self.paged_read(addr + i as u64, 1)? as u8;
        }
        Ok(u64::from_le_bytes(buf))
    }

    fn write_slow(&mut self, addr: u64, size: usize, value: u64) -> Result<(), MachineError> {
        if (addr & PAGE_MASK) + size as u64 <= PAGE_SIZE as u64 {
            return self.paged_write(addr, size, value);
        }
        let bytes = value.to_le_bytes();
        for (i, byte) in bytes.iter().enumerate().take(size) {
            self.paged_write(addr + i as u64, 1, *byte as u64)?;
        }
        Ok(())
    }

    fn paged_read(&mut self, addr: u64, size: usize) -> Result<u64, MachineError> {
        let pageno = page_number(addr);
        let off = (addr & PAGE_MASK) as usize;

        if let Some(slice) = self.rd_cache.lookup(pageno) {
            return Ok(read_le(&slice[off..off + size]));
        }
        if addr >= self.max_memory {
            return Err(MachineError::ProtectionFault(addr));
        }

        let trap_cb = match self.pages.get(&pageno) {
            Some(p) if p.attr.trap => p.trap_cb.clone(),
            _ => None,
        };
        if let Some(cb) = trap_cb {
            let value = cb(self, TrapKind::Read(size), addr, 0)?;
            return Ok(value & size_mask(size));
        }

        if !self.pages.contains_key(&pageno) && !self.arena.contains(pageno << PAGE_SHIFT, PAGE_SIZE)
        {
            (self.page_read_handler)(self, pageno)?;
        }

        let Memory {
            pages,
            arena,
            binary,
            rd_cache,
            zero_page,
            ..
        } = self;

        let page = match pages.get(&pageno) {
            Some(page) => page,
            None => {
                let base = pageno << PAGE_SHIFT;
                if arena.contains(base, PAGE_SIZE) {
                    let slice = arena.slice(base, PAGE_SIZE);
                    rd_cache.set(pageno, slice.as_ptr() as *mut u8);
                    return Ok(read_le(&slice[off..off + size]));
                }
                &*zero_page
            }
        };
        if !page.attr.read {
            return Err(MachineError::ProtectionFault(addr));
        }
        let slice: &[u8] = match &page.data {
            PageData::Owned(buf) => &buf[..],
            PageData::Arena(offset) => arena.slice(*offset as u64, PAGE_SIZE),
            PageData::Binary(offset) => &binary[*offset..*offset + PAGE_SIZE],
            PageData::Zero => &ZERO_PAGE[..],
        };
        rd_cache.set(pageno, slice.as_ptr() as *mut u8);
        Ok(read_le(&slice[off..off + size]))
    }

    fn paged_write(&mut self, addr: u64, size: usize, value: u64) -> Result<(), MachineError> {
        let pageno = page_number(addr);
        let off = (addr & PAGE_MASK) as usize;

        if let Some(slice) = self.wr_cache.lookup_mut(pageno) {
            write_le(&mut slice[off..off + size], value);
            return Ok(());
        }
        if addr >= self.max_memory {
            return Err(MachineError::ProtectionFault(addr));
        }

        let trap_cb = match self.pages.get(&pageno) {
            Some(p) if p.attr.trap => p.trap_cb.clone(),
            _ => None,
        };
        if let Some(cb) = trap_cb {
            cb(self, TrapKind::Write(size), addr, value)?;
            return Ok(());
        }

        if !self.pages.contains_key(&pageno) {
            (self.page_fault_handler)(self, pageno, true)?;
        }

        let (writable, cow, shared, exec) = match self.pages.get(&pageno) {
            Some(p) => (
                p.attr.write,
                p.attr.cow,
                matches!(p.data, PageData::Binary(_) | PageData::Zero),
                p.attr.exec,
            ),
            None => return Err(MachineError::ProtectionFault(addr)),
        };
        if cow {
            (self.page_write_handler)(self, pageno)?;
        } else if !writable {
            return Err(MachineError::ProtectionFault(addr));
        } else if shared {
            // Writable permission over shared backing (an image window):
            // take a private copy first.
            (self.page_write_handler)(self, pageno)?;
        }
        if exec {
            // Self-modifying code: stale decoded instructions must go.
            self.evict_exec_segments_for_page(pageno);
        }

        let Memory {
            pages,
            arena,
            wr_cache,
            ..
        } = self;
        let page = pages
            .get_mut(&pageno)
            .ok_or(MachineError::ProtectionFault(addr))?;
        if !page.attr.is_writable() {
            return Err(MachineError::ProtectionFault(addr));
        }
        let slice: &mut [u8] = match &mut page.data {
            PageData::Owned(buf) => &mut Arc::make_mut(buf)[..],
            PageData::Arena(offset) => arena.slice_mut(*offset as u64, PAGE_SIZE),
            PageData::Binary(_) | PageData::Zero => {
                return Err(MachineError::ProtectionFault(addr))
            }
        };
        // Executable pages stay uncached so every write re-runs the
        // decoder eviction above.
        if !page.attr.exec {
            wr_cache.set(pageno, slice.as_mut_ptr());
        }
        write_le(&mut slice[off..off + size], value);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Page handling
    // ------------------------------------------------------------------

    /// The page containing `addr`, falling back to the immutable default
    /// zero page for unmapped addresses.
    pub fn get_page(&self, addr: u64) -> &Page<W> {
        self.get_pageno(page_number(addr & Self::ADDR_MASK))
    }

    /// The page with the given page number, or the default zero page.
    pub fn get_pageno(&self, pageno: u64) -> &Page<W> {
        self.pages.get(&pageno).unwrap_or(&self.zero_page)
    }

    /// The page with the given page number if it is readable, invoking
    /// the page-read handler for unmapped pages first.
    pub fn get_readable_pageno(&mut self, pageno: u64) -> Result<&Page<W>, MachineError> {
        if !self.pages.contains_key(&pageno) {
            (self.page_read_handler)(self, pageno)?;
        }
        let page = self.pages.get(&pageno).unwrap_or(&self.zero_page);
        if page.attr.read {
            Ok(page)
        } else {
            Err(MachineError::ProtectionFault(pageno << PAGE_SHIFT))
        }
    }

    /// The page with the given page number if it is executable.
    pub fn get_exec_pageno(&self, pageno: u64) -> Result<&Page<W>, MachineError> {
        match self.pages.get(&pageno) {
            Some(page) if page.attr.exec => Ok(page),
            _ => Err(MachineError::ExecutionSpaceProtectionFault(
                pageno << PAGE_SHIFT,
            )),
        }
    }

    /// Makes the page writable-in-place and returns its data: allocates
    /// it if unmapped, duplicates it if copy-on-write.
    pub fn create_writable_pageno(
        &mut self,
        pageno: u64,
        initialize: bool,
    ) -> Result<&mut [u8], MachineError> {
        if !self.pages.contains_key(&pageno) {
            (self.page_fault_handler)(self, pageno, initialize)?;
        }
        let needs_cow = match self.pages.get(&pageno) {
            Some(p) => {
                if !p.attr.write && !p.attr.cow {
                    return Err(MachineError::ProtectionFault(pageno << PAGE_SHIFT));
                }
                p.attr.cow || matches!(p.data, PageData::Binary(_) | PageData::Zero)
            }
            None => return Err(MachineError::ProtectionFault(pageno << PAGE_SHIFT)),
        };
        if needs_cow {
            (self.page_write_handler)(self, pageno)?;
        }
        let exec = self
            .pages
            .get(&pageno)
            .is_some_and(|p| p.attr.exec);
        if exec {
            self.evict_exec_segments_for_page(pageno);
        }
        self.invalidate_caches();

        let Memory { pages, arena, .. } = self;
        let page = pages
            .get_mut(&pageno)
            .ok_or(MachineError::ProtectionFault(pageno << PAGE_SHIFT))?;
        match &mut page.data {
            PageData::Owned(buf) => Ok(&mut Arc::make_mut(buf)[..]),
            PageData::Arena(offset) => Ok(arena.slice_mut(*offset as u64, PAGE_SIZE)),
            PageData::Binary(_) | PageData::Zero => {
                Err(MachineError::ProtectionFault(pageno << PAGE_SHIFT))
            }
        }
    }

    /// Updates the permission bits for all pages covering
    /// `[addr, addr+len)`, creating pages as needed, and downgrades the
    /// arena fast path where the new attributes conflict with it.
    pub fn set_page_attr(
        &mut self,
        addr: u64,
        len: u64,
        attr: PageAttributes,
    ) -> Result<(), MachineError> {
        if len == 0 {
            return Ok(());
        }
        let addr = addr & Self::ADDR_MASK;
        let end = addr
            .checked_add(len)
            .ok_or(MachineError::ProtectionFault(addr))?;
        self.invalidate_caches();

        let first = page_number(addr);
        let last = page_number(end - 1);
        for pageno in first..=last {
            let base = pageno << PAGE_SHIFT;
            if base >= self.max_memory {
                return Err(MachineError::ProtectionFault(base));
            }
            let was_exec = match self.pages.get_mut(&pageno) {
                Some(page) => {
                    let was_exec = page.attr.exec;
                    page.attr.read = attr.read;
                    page.attr.write = attr.write;
                    page.attr.exec = attr.exec;
                    was_exec
                }
                None => {
                    let page = if self.arena.contains(base, PAGE_SIZE) {
                        Page::new_arena(
                            PageAttributes::rwx(attr.read, attr.write, attr.exec),
                            base as usize,
                        )
                    } else {
                        Page::new_owned(PageAttributes::rwx(attr.read, attr.write, attr.exec))
                    };
                    self.pages.insert(pageno, page);
                    false
                }
            };
            if was_exec {
                self.evict_exec_segments_for_page(pageno);
            }
        }

        // Keep the arena contract: the fast path must never satisfy an
        // access the page attributes would deny.
        if !attr.write {
            if addr <= self.arena.initial_rodata_end() {
                self.arena.extend_rodata_guard(end);
            } else {
                self.arena.lower_write_boundary(addr);
            }
        }
        if !attr.read {
            self.arena.lower_read_boundary(addr);
        }
        if attr.exec {
            self.arena.lower_write_boundary(addr);
        }
        Ok(())
    }

    /// Installs an MMIO trap on the page containing `page_addr`. All
    /// subsequent accesses to the page take the paged path and invoke the
    /// callback.
    pub fn trap(&mut self, page_addr: u64, callback: TrapHandler<W>) {
        let page_addr = page_addr & Self::ADDR_MASK;
        let pageno = page_number(page_addr);
        let base = pageno << PAGE_SHIFT;
        self.invalidate_caches();
        // The arena must not hide a trapped page.
        self.arena.lower_read_boundary(base);
        self.bump_exec_generation();

        let arena_backed = self.arena.contains(base, PAGE_SIZE);
        let page = self.pages.entry(pageno).or_insert_with(|| {
            if arena_backed {
                Page::new_arena(PageAttributes::default(), base as usize)
            } else {
                Page::new_owned(PageAttributes::default())
            }
        });
        page.attr.trap = true;
        page.trap_cb = Some(callback);
    }

    /// Consumed by the interpreter after an execute trap to honor a PC
    /// redirect requested by the callback.
    pub fn set_pending_jump(&mut self, target: u64) {
        self.pending_jump = Some(target & Self::ADDR_MASK);
    }

    pub(crate) fn take_pending_jump(&mut self) -> Option<u64> {
        self.pending_jump.take()
    }

    /// Removes the pages covering `[addr, addr+len)`, zeroing any
    /// arena-backed storage so subsequent reads observe zeros again.
    pub fn free_pages(&mut self, addr: u64, len: u64) {
        if len == 0 {
            return;
        }
        let addr = addr & Self::ADDR_MASK;
        self.invalidate_caches();
        let first = page_number(addr);
        let last = page_number(addr + len - 1);
        for pageno in first..=last {
            if let Some(page) = self.pages.remove(&pageno) {
                if page.attr.exec {
                    self.evict_exec_segments_for_page(pageno);
                }
            }
            let base = pageno << PAGE_SHIFT;
            if self.arena.contains(base, PAGE_SIZE) {
                self.arena.slice_mut(base, PAGE_SIZE).fill(0);
            }
        }
    }

    /// Zeroes whole pages inside `[dst, dst+len)`, the guest equivalent
    /// of MADV_DONTNEED. Partial pages at the edges are left alone.
    pub fn memdiscard(
        &mut self,
        dst: u64,
        len: u64,
        ignore_protections: bool,
    ) -> Result<(), MachineError> {
        let dst = dst & Self::ADDR_MASK;
        let start = page::page_align_up(dst);
        let end = (dst + len) & !PAGE_MASK;
        if start >= end {
            return Ok(());
        }
        self.invalidate_caches();
        let Memory { pages, arena, .. } = self;
        for pageno in page_number(start)..page_number(end) {
            let base = pageno << PAGE_SHIFT;
            if let Some(page) = pages.get_mut(&pageno) {
                if !page.attr.write && !ignore_protections {
                    return Err(MachineError::ProtectionFault(base));
                }
                let shared = matches!(page.data, PageData::Binary(_) | PageData::Zero);
                if shared {
                    if !ignore_protections {
                        return Err(MachineError::ProtectionFault(base));
                    }
                    // Shared backing is never zeroed in place.
                    page.data = if arena.contains(base, PAGE_SIZE) {
                        arena.slice_mut(base, PAGE_SIZE).fill(0);
                        PageData::Arena(base as usize)
                    } else {
                        PageData::Owned(Arc::new(ZERO_PAGE))
                    };
                } else {
                    match &mut page.data {
                        PageData::Owned(buf) => Arc::make_mut(buf).fill(0),
                        PageData::Arena(offset) => {
                            arena.slice_mut(*offset as u64, PAGE_SIZE).fill(0);
                        }
                        PageData::Binary(_) | PageData::Zero => {}
                    }
                }
            } else if arena.contains(base, PAGE_SIZE) {
                if arena.writable(base, PAGE_SIZE) || ignore_protections {
                    arena.slice_mut(base, PAGE_SIZE).fill(0);
                }
            }
        }
        Ok(())
    }

    pub fn set_page_fault_handler(&mut self, handler: PageFaultHandler<W>) -> PageFaultHandler<W> {
        std::mem::replace(&mut self.page_fault_handler, handler)
    }

    pub fn set_page_write_handler(&mut self, handler: PageWriteHandler<W>) -> PageWriteHandler<W> {
        std::mem::replace(&mut self.page_write_handler, handler)
    }

    pub fn set_page_read_handler(&mut self, handler: PageReadHandler<W>) -> PageReadHandler<W> {
        std::mem::replace(&mut self.page_read_handler, handler)
    }

    pub(crate) fn invalidate_caches(&mut self) {
        self.rd_cache.invalidate();
        self.wr_cache.invalidate();
    }

    pub(crate) fn insert_page(&mut self, pageno: u64, page: Page<W>) {
        self.invalidate_caches();
        self.pages.insert(pageno, page);
    }

    pub(crate) fn clear_all_pages(&mut self) {
        self.invalidate_caches();
        self.pages.clear();
    }

    pub(crate) fn page_map(&self) -> &HashMap<u64, Page<W>, BuildNoHashHasher<u64>> {
        &self.pages
    }

    // ------------------------------------------------------------------
    // Loader support
    // ------------------------------------------------------------------

    /// Maps `[vaddr, vaddr+memsz)` with the given permissions, backing
    /// it with `file_data` (at `file_offset` in the binary) and leaving
    /// the remainder zero. Read-only pages wholly inside the file data
    /// are mapped as windows into the ELF image rather than copied.
    /// Segments sharing a page union their permissions.
    pub(crate) fn install_segment(
        &mut self,
        vaddr: u64,
        file_offset: usize,
        file_data: &[u8],
        memsz: u64,
        attr: PageAttributes,
    ) -> Result<(), MachineError> {
        if memsz == 0 {
            return Ok(());
        }
        let end = vaddr
            .checked_add(memsz)
            .ok_or(MachineError::InvalidProgram("segment wraps the address space"))?;
        if end > self.max_memory {
            return Err(MachineError::InvalidProgram("segment outside guest memory"));
        }
        if file_data.len() as u64 > memsz {
            return Err(MachineError::InvalidProgram("segment file size exceeds memory size"));
        }
        self.invalidate_caches();
        let file_end = vaddr + file_data.len() as u64;
        for pageno in page_number(vaddr)..=page_number(end - 1) {
            let base = pageno << PAGE_SHIFT;
            match self.pages.get_mut(&pageno) {
                Some(page) => {
                    page.attr.read |= attr.read;
                    page.attr.write |= attr.write;
                    page.attr.exec |= attr.exec;
                }
                None => {
                    let file_backed =
                        base >= vaddr && base + PAGE_SIZE as u64 <= file_end;
                    let page = if !attr.write && file_backed {
                        // The image outlives the machine, so read-only
                        // pages borrow it instead of copying.
                        Page {
                            attr,
                            data: PageData::Binary(file_offset + (base - vaddr) as usize),
                            trap_cb: None,
                        }
                    } else if self.arena.contains(base, PAGE_SIZE) {
                        Page::new_arena(attr, base as usize)
                    } else {
                        Page::new_owned(attr)
                    };
                    self.pages.insert(pageno, page);
                }
            }
        }
        // Arena-covered ranges always mirror the file bytes so the fast
        // read path stays coherent with image-backed pages.
        if self.arena.contains(vaddr, file_data.len()) {
            self.arena
                .slice_mut(vaddr, file_data.len())
                .copy_from_slice(file_data);
            return Ok(());
        }
        let mut cur = vaddr;
        let mut pos = 0usize;
        while pos < file_data.len() {
            let off = (cur & PAGE_MASK) as usize;
            let take = (PAGE_SIZE - off).min(file_data.len() - pos);
            if self.arena.contains(cur, take) {
                self.arena
                    .slice_mut(cur, take)
                    .copy_from_slice(&file_data[pos..pos + take]);
            } else {
                let image_backed = matches!(
                    self.pages.get(&page_number(cur)).map(|p| &p.data),
                    Some(PageData::Binary(_))
                );
                if !image_backed {
                    self.poke_bytes(cur, &file_data[pos..pos + take])?;
                }
            }
            cur += take as u64;
            pos += take;
        }
        Ok(())
    }

    /// Writes bytes ignoring page permissions (loader and relocation
    /// use; never reachable from guest code).
    pub(crate) fn poke_bytes(&mut self, addr: u64, data: &[u8]) -> Result<(), MachineError> {
        let addr = addr & Self::ADDR_MASK;
        let end = addr
            .checked_add(data.len() as u64)
            .ok_or(MachineError::ProtectionFault(addr))?;
        if end > self.max_memory {
            return Err(MachineError::ProtectionFault(addr));
        }
        self.invalidate_caches();
        let mut cur = addr;
        let mut pos = 0usize;
        while pos < data.len() {
            let off = (cur & PAGE_MASK) as usize;
            let take = (PAGE_SIZE - off).min(data.len() - pos);
            let pageno = page_number(cur);
            if !self.pages.contains_key(&pageno) {
                (self.page_fault_handler)(self, pageno, true)?;
            }
            // Shared backing must be replaced with an owned copy first.
            let shared = matches!(
                self.pages.get(&pageno).map(|p| &p.data),
                Some(PageData::Binary(_) | PageData::Zero)
            );
            if shared {
                (self.page_write_handler)(self, pageno)?;
            }
            let Memory { pages, arena, .. } = self;
            match pages.get_mut(&pageno).map(|p| &mut p.data) {
                Some(PageData::Owned(buf)) => {
                    Arc::make_mut(buf)[off..off + take].copy_from_slice(&data[pos..pos + take]);
                }
                Some(PageData::Arena(offset)) => {
                    arena
                        .slice_mut(*offset as u64 + off as u64, take)
                        .copy_from_slice(&data[pos..pos + take]);
                }
                _ => return Err(MachineError::ProtectionFault(cur)),
            }
            cur += take as u64;
            pos += take;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // mmap allocator
    // ------------------------------------------------------------------

    /// Allocates at least `bytes` of page-aligned guest address space in
    /// the mmap region.
    pub fn mmap_allocate(&mut self, bytes: u64) -> u64 {
        self.mmap.allocate(bytes)
    }

    /// Attempts to shrink a previous allocation, freeing space at the
    /// end. Returns whether anything was released.
    pub fn mmap_relax(&mut self, addr: u64, size: u64, new_size: u64) -> bool {
        let size = page::page_align_up(size);
        let new_size = page::page_align_up(new_size);
        let relaxed = self.mmap.relax(addr, size, new_size);
        if relaxed {
            self.free_pages(addr + new_size, size - new_size);
        }
        relaxed
    }

    /// Unmaps `[addr, addr+size)` and releases the range to the mmap
    /// free-list.
    pub fn mmap_unmap(&mut self, addr: u64, size: u64) -> bool {
        let unmapped = self.mmap.unmap(addr, size);
        if unmapped {
            self.free_pages(addr, size);
        }
        unmapped
    }

    // ------------------------------------------------------------------
    // Bulk access
    // ------------------------------------------------------------------

    /// Fills `out` with host views covering guest `[addr, addr+len)`,
    /// which may straddle pages and storage kinds. At most `capacity`
    /// buffers are produced; running out raises `InsufficientBuffers`.
    pub fn gather_buffers_from_range<'a>(
        &'a self,
        capacity: usize,
        out: &mut Vec<&'a [u8]>,
        addr: u64,
        len: u64,
    ) -> Result<usize, MachineError> {
        let addr = addr & Self::ADDR_MASK;
        let mut produced = 0usize;
        let mut cur = addr;
        let end = addr
            .checked_add(len)
            .ok_or(MachineError::ProtectionFault(addr))?;
        if end > self.max_memory && len != 0 {
            return Err(MachineError::ProtectionFault(self.max_memory));
        }
        while cur < end {
            let pageno = page_number(cur);
            let off = (cur & PAGE_MASK) as usize;
            let take = ((PAGE_SIZE - off) as u64).min(end - cur) as usize;
            let slice: &[u8] = match self.pages.get(&pageno) {
                Some(page) => {
                    if !page.attr.read || page.attr.trap {
                        return Err(MachineError::ProtectionFault(cur));
                    }
                    match &page.data {
                        PageData::Owned(buf) => &buf[off..off + take],
                        PageData::Arena(offset) => {
                            self.arena.slice(*offset as u64 + off as u64, take)
                        }
                        PageData::Binary(offset) => &self.binary[*offset + off..*offset + off + take],
                        PageData::Zero => &ZERO_PAGE[off..off + take],
                    }
                }
                None => {
                    let base = pageno << PAGE_SHIFT;
                    if self.arena.contains(base, PAGE_SIZE) {
                        self.arena.slice(cur, take)
                    } else {
                        &ZERO_PAGE[off..off + take]
                    }
                }
            };
            // Merge host-contiguous chunks (adjacent arena pages).
            let merged = out.last_mut().is_some_and(|last| {
                let contiguous = last.as_ptr_range().end == slice.as_ptr();
                if contiguous {
                    // SAFETY: both slices come from the same live
                    // allocation and are adjacent, so the combined range
                    // is in bounds for the owner's lifetime.
                    *last = unsafe {
                        std::slice::from_raw_parts(last.as_ptr(), last.len() + slice.len())
                    };
                }
                contiguous
            });
            if !merged {
                if produced == capacity {
                    return Err(MachineError::InsufficientBuffers);
                }
                out.push(slice);
                produced += 1;
            }
            cur += take as u64;
        }
        Ok(produced)
    }

    /// Copies guest memory out to a host buffer.
    pub fn memcpy_out(&self, dst: &mut [u8], addr: u64) -> Result<(), MachineError> {
        let mut bufs = Vec::new();
        self.gather_buffers_from_range(usize::MAX, &mut bufs, addr, dst.len() as u64)?;
        let mut pos = 0;
        for buf in bufs {
            dst[pos..pos + buf.len()].copy_from_slice(buf);
            pos += buf.len();
        }
        Ok(())
    }

    /// Copies a host buffer into guest memory, honoring page protections.
    pub fn memcpy(&mut self, dst: u64, src: &[u8]) -> Result<(), MachineError> {
        let dst = dst & Self::ADDR_MASK;
        if self.arena.writable(dst, src.len()) {
            self.arena.slice_mut(dst, src.len()).copy_from_slice(src);
            return Ok(());
        }
        let mut cur = dst;
        let mut pos = 0usize;
        while pos < src.len() {
            let off = (cur & PAGE_MASK) as usize;
            let take = (PAGE_SIZE - off).min(src.len() - pos);
            if self.arena.writable(cur, take) {
                self.arena.slice_mut(cur, take).copy_from_slice(&src[pos..pos + take]);
            } else {
                let slice = self.create_writable_pageno(page_number(cur), false)?;
                slice[off..off + take].copy_from_slice(&src[pos..pos + take]);
            }
            cur += take as u64;
            pos += take;
        }
        Ok(())
    }

    /// Fills `[dst, dst+len)` with `value`.
    pub fn memset(&mut self, dst: u64, value: u8, len: u64) -> Result<(), MachineError> {
        let dst = dst & Self::ADDR_MASK;
        let mut cur = dst;
        let end = dst
            .checked_add(len)
            .ok_or(MachineError::ProtectionFault(dst))?;
        while cur < end {
            let off = (cur & PAGE_MASK) as usize;
            let take = ((PAGE_SIZE - off) as u64).min(end - cur) as usize;
            if self.arena.writable(cur, take) {
                self.arena.slice_mut(cur, take).fill(value);
            } else {
                let slice = self.create_writable_pageno(page_number(cur), false)?;
                slice[off..off + take].fill(value);
            }
            cur += take as u64;
        }
        Ok(())
    }

    /// Reads a zero-terminated string from guest memory, up to `maxlen`
    /// bytes.
    pub fn memstring(&self, addr: u64, maxlen: usize) -> Result<String, MachineError> {
        let len = self.strlen(addr, maxlen)?;
        let mut bytes = vec![0u8; len];
        self.memcpy_out(&mut bytes, addr)?;
        String::from_utf8(bytes).map_err(|_| MachineError::ProtectionFault(addr))
    }

    /// The length of the zero-terminated string at `addr`, searching at
    /// most `maxlen` bytes.
    pub fn strlen(&self, addr: u64, maxlen: usize) -> Result<usize, MachineError> {
        let addr = addr & Self::ADDR_MASK;
        let mut bufs = Vec::new();
        let span = (maxlen as u64).min(self.max_memory.saturating_sub(addr));
        self.gather_buffers_from_range(usize::MAX, &mut bufs, addr, span)?;
        let mut scanned = 0usize;
        for buf in bufs {
            if let Some(pos) = buf.iter().position(|&b| b == 0) {
                return Ok(scanned + pos);
            }
            scanned += buf.len();
        }
        Err(MachineError::ProtectionFault(addr + scanned as u64))
    }

    // ------------------------------------------------------------------
    // Execute segments
    // ------------------------------------------------------------------

    /// The decoded execute segment containing `pc`, creating one over the
    /// surrounding contiguous executable range if needed.
    pub fn exec_segment_for(
        &mut self,
        pc: u64,
    ) -> Result<Arc<DecodedExecuteSegment<W>>, MachineError> {
        if let Some(idx) = self.exec_segs.iter().position(|s| s.contains(pc)) {
            // Keep most-recently-used order for eviction.
            let seg = self.exec_segs.remove(idx);
            self.exec_segs.insert(0, Arc::clone(&seg));
            return Ok(seg);
        }
        self.create_execute_segment(pc)
    }

    fn create_execute_segment(
        &mut self,
        pc: u64,
    ) -> Result<Arc<DecodedExecuteSegment<W>>, MachineError> {
        let pageno = page_number(pc);
        if !self.pageno_is_exec(pageno) {
            return Err(MachineError::ExecutionSpaceProtectionFault(pc));
        }
        let mut lo = pageno;
        while lo > 0 && self.pageno_is_exec(lo - 1) {
            lo -= 1;
        }
        let mut hi = pageno;
        while self.pageno_is_exec(hi + 1) {
            hi += 1;
        }
        let base = lo << PAGE_SHIFT;
        let npages = (hi - lo + 1) as usize;
        let mut code = vec![0u8; npages * PAGE_SIZE];
        for (i, chunk) in code.chunks_exact_mut(PAGE_SIZE).enumerate() {
            self.copy_page_raw(lo + i as u64, chunk);
        }
        tracing::debug!(
            base = format_args!("0x{base:x}"),
            pages = npages,
            "creating execute segment"
        );
        let seg = Arc::new(DecodedExecuteSegment::new(base, code.into_boxed_slice()));
        self.exec_segs.insert(0, Arc::clone(&seg));
        if self.exec_segs.len() > MAX_EXECUTE_SEGS {
            self.exec_segs.pop();
            tracing::debug!("evicted least recently used execute segment");
            self.bump_exec_generation();
        }
        Ok(seg)
    }

    fn pageno_is_exec(&self, pageno: u64) -> bool {
        self.pages.get(&pageno).is_some_and(|p| p.attr.exec)
    }

    /// Raw copy of a page's current bytes, without permission checks or
    /// trap dispatch. Used for decoder-cache construction.
    fn copy_page_raw(&self, pageno: u64, out: &mut [u8]) {
        let base = pageno << PAGE_SHIFT;
        match self.pages.get(&pageno) {
            Some(page) => match &page.data {
                PageData::Owned(buf) => out.copy_from_slice(&buf[..]),
                PageData::Arena(offset) => {
                    out.copy_from_slice(self.arena.slice(*offset as u64, PAGE_SIZE));
                }
                PageData::Binary(offset) => {
                    out.copy_from_slice(&self.binary[*offset..*offset + PAGE_SIZE]);
                }
                PageData::Zero => out.fill(0),
            },
            None if self.arena.contains(base, PAGE_SIZE) => {
                out.copy_from_slice(self.arena.slice(base, PAGE_SIZE));
            }
            None => out.fill(0),
        }
    }

    pub(crate) fn evict_exec_segments_for_page(&mut self, pageno: u64) {
        let addr = pageno << PAGE_SHIFT;
        let before = self.exec_segs.len();
        self.exec_segs
            .retain(|seg| !seg.overlaps(addr, PAGE_SIZE as u64));
        if self.exec_segs.len() != before {
            tracing::debug!(
                page = format_args!("0x{addr:x}"),
                "evicting execute segment after write to executable page"
            );
            self.bump_exec_generation();
        }
    }

    /// Drops every decoded execute segment.
    pub fn evict_execute_segments(&mut self) {
        if !self.exec_segs.is_empty() {
            self.exec_segs.clear();
            self.bump_exec_generation();
        }
    }

    pub fn cached_execute_segments(&self) -> usize {
        self.exec_segs.len()
    }

    /// Incremented whenever a segment the CPU may be holding becomes
    /// stale; the interpreter re-resolves on mismatch.
    #[inline(always)]
    pub fn exec_generation(&self) -> u64 {
        self.exec_generation
    }

    fn bump_exec_generation(&mut self) {
        self.exec_generation += 1;
    }

    /// Branch and call targets visible in the decoded segments, for an
    /// external code translator.
    pub fn gather_jump_hints(&self) -> Vec<u64> {
        let mut hints: Vec<u64> = self
            .exec_segs
            .iter()
            .flat_map(|seg| seg.jump_targets())
            .collect();
        hints.sort_unstable();
        hints.dedup();
        hints
    }

    // ------------------------------------------------------------------
    // Fork
    // ------------------------------------------------------------------

    /// Marks every writable owned page copy-on-write (fork preparation:
    /// both sides of the fork share buffers until someone writes).
    pub(crate) fn prepare_fork(&mut self) {
        self.invalidate_caches();
        for page in self.pages.values_mut() {
            if page.attr.write && matches!(page.data, PageData::Owned(_)) {
                page.attr.write = false;
                page.attr.cow = true;
            }
        }
    }

    /// A forked copy sharing execute segments and page buffers. The
    /// arena is copied eagerly; page buffers are cloned on write.
    pub(crate) fn fork_clone(&self) -> Self {
        Self {
            pages: self.pages.clone(),
            arena: self.arena.clone(),
            rd_cache: CachedPage::new(),
            wr_cache: CachedPage::new(),
            mmap: self.mmap.clone(),
            exec_segs: self.exec_segs.clone(),
            exec_generation: self.exec_generation,
            binary: Arc::clone(&self.binary),
            start_address: self.start_address,
            stack_address: self.stack_address,
            exit_address: self.exit_address,
            heap_address: self.heap_address,
            max_memory: self.max_memory,
            is_dynamic: self.is_dynamic,
            pending_jump: None,
            page_fault_handler: self.page_fault_handler,
            page_write_handler: self.page_write_handler,
            page_read_handler: self.page_read_handler,
            zero_page: Page::default_zero(),
        }
    }
}

/// Default unmapped-write handler: allocates a zeroed page, arena-backed
/// where covered.
pub fn default_page_fault<const W: usize>(
    mem: &mut Memory<W>,
    pageno: u64,
    _initialize: bool,
) -> Result<(), MachineError> {
    let base = pageno << PAGE_SHIFT;
    if base >= mem.max_memory {
        return Err(MachineError::ProtectionFault(base));
    }
    if mem.pages.len() >= mem.max_pages() {
        return Err(MachineError::OutOfMemory);
    }
    mem.invalidate_caches();
    let page = if mem.arena.contains(base, PAGE_SIZE) {
        Page::new_arena(PageAttributes::default(), base as usize)
    } else {
        Page::new_owned(PageAttributes::default())
    };
    mem.pages.insert(pageno, page);
    Ok(())
}

/// Default copy-on-write handler: replaces the mapping with a private
/// duplicate of the current bytes and restores write permission. Pages
/// inside the arena coverage become arena-backed again, keeping the
/// fast read path coherent.
pub fn default_page_write<const W: usize>(
    mem: &mut Memory<W>,
    pageno: u64,
) -> Result<(), MachineError> {
    mem.invalidate_caches();
    let base = pageno << PAGE_SHIFT;
    let Memory {
        pages,
        arena,
        binary,
        ..
    } = mem;
    let page = pages
        .get_mut(&pageno)
        .ok_or(MachineError::ProtectionFault(base))?;
    let mut bytes = ZERO_PAGE;
    match &page.data {
        PageData::Owned(buf) => bytes.copy_from_slice(&buf[..]),
        PageData::Arena(offset) => {
            bytes.copy_from_slice(arena.slice(*offset as u64, PAGE_SIZE));
        }
        PageData::Binary(offset) => {
            bytes.copy_from_slice(&binary[*offset..*offset + PAGE_SIZE]);
        }
        PageData::Zero => {}
    }
    if arena.contains(base, PAGE_SIZE) {
        arena.slice_mut(base, PAGE_SIZE).copy_from_slice(&bytes);
        page.data = PageData::Arena(base as usize);
    } else {
        page.data = PageData::Owned(Arc::new(bytes));
    }
    page.attr.write = true;
    page.attr.cow = false;
    page.attr.shared = false;
    Ok(())
}

/// Default unmapped-read handler: leave the page unmapped so the read
/// observes the zero page.
pub fn default_page_read<const W: usize>(
    _mem: &mut Memory<W>,
    _pageno: u64,
) -> Result<(), MachineError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_memory() -> Memory<8> {
        let binary: Arc<[u8]> = Arc::from(&[][..]);
        Memory::<8>::empty(binary, 16 << 20)
    }

    #[test]
    fn store_then_load_round_trips() {
        let mut mem = test_memory();
        for addr in [0x2000u64, 0x2001, 0x2ffd] {
            mem.write::<u64>(addr, 0x1122_3344_5566_7788).unwrap();
            assert_eq!(mem.read::<u64>(addr).unwrap(), 0x1122_3344_5566_7788);
        }
        mem.write::<u8>(0x3000, 0xab).unwrap();
        assert_eq!(mem.read::<u8>(0x3000).unwrap(), 0xab);
    }

    #[test]
    fn cross_page_access_composes_bytewise() {
        let mut mem = test_memory();
        // Force the paged path by revoking arena coverage of the range.
        mem.set_page_attr(0x4000, 0x2000, PageAttributes::rwx(true, true, false))
            .unwrap();
        mem.arena.lower_read_boundary(0x4000);
        let addr = 0x4ffe;
        mem.write::<u32>(addr, 0xdead_beef).unwrap();
        assert_eq!(mem.read::<u32>(addr).unwrap(), 0xdead_beef);
        assert_eq!(mem.read::<u8>(0x4fff).unwrap(), 0xbe);
        assert_eq!(mem.read::<u8>(0x5000).unwrap(), 0xad);
    }

    #[test]
    fn reads_of_unmapped_memory_are_zero() {
        let mut mem = test_memory();
        assert_eq!(mem.read::<u64>(0x10_0000).unwrap(), 0);
    }

    #[test]
    fn writes_above_max_memory_fault() {
        let mut mem = test_memory();
        let err = mem.write::<u32>(32 << 20, 1).unwrap_err();
        assert_eq!(err, MachineError::ProtectionFault(32 << 20));
    }

    #[test]
    fn write_to_read_only_page_faults() {
        let mut mem = test_memory();
        mem.set_page_attr(0x8000, PAGE_SIZE as u64, PageAttributes::rwx(true, false, false))
            .unwrap();
        let err = mem.write::<u32>(0x8010, 7).unwrap_err();
        assert_eq!(err, MachineError::ProtectionFault(0x8010));
        // And the fast path was downgraded, not bypassed.
        assert!(!mem.arena.writable(0x8010, 4));
    }

    #[test]
    fn trapped_page_invokes_callback() {
        use std::sync::atomic::{AtomicU64, Ordering};
        let mut mem = test_memory();
        let hits = Arc::new(AtomicU64::new(0));
        let hits2 = Arc::clone(&hits);
        mem.trap(
            0x6000,
            Arc::new(move |_mem, kind, addr, value| {
                hits2.fetch_add(1, Ordering::Relaxed);
                match kind {
                    TrapKind::Read(_) => Ok(0x55),
                    TrapKind::Write(_) => {
                        assert_eq!((addr, value), (0x6008, 0x99));
                        Ok(0)
                    }
                    TrapKind::Exec => Ok(0),
                }
            }),
        );
        assert_eq!(mem.read::<u32>(0x6000).unwrap(), 0x55);
        mem.write::<u8>(0x6008, 0x99).unwrap();
        assert_eq!(hits.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn gather_covers_fragmented_ranges() {
        let mut mem = test_memory();
        mem.memcpy(0x2ff0, &[1u8; 32]).unwrap();
        let mut bufs = Vec::new();
        let n = mem
            .gather_buffers_from_range(8, &mut bufs, 0x2ff0, 32)
            .unwrap();
        // Arena-contiguous pages merge into one buffer.
        assert_eq!(n, 1);
        assert_eq!(bufs[0].len(), 32);
        assert!(bufs[0].iter().all(|&b| b == 1));
    }

    #[test]
    fn gather_respects_capacity() {
        let mut mem = test_memory();
        // An owned page sandwiched between arena pages forces a split.
        mem.arena.lower_read_boundary(0);
        mem.insert_page(3, Page::new_owned(PageAttributes::default()));
        let mut bufs = Vec::new();
        let err = mem
            .gather_buffers_from_range(1, &mut bufs, 0x2000, 3 * PAGE_SIZE as u64)
            .unwrap_err();
        assert_eq!(err, MachineError::InsufficientBuffers);
    }

    #[test]
    fn strings_read_back() {
        let mut mem = test_memory();
        mem.memcpy(0x9000, b"hello\0world").unwrap();
        assert_eq!(mem.strlen(0x9000, 64).unwrap(), 5);
        assert_eq!(mem.memstring(0x9000, 64).unwrap(), "hello");
    }

    #[test]
    fn free_pages_zeroes_arena_storage() {
        let mut mem = test_memory();
        mem.write::<u64>(0x5000, 0x1234).unwrap();
        mem.free_pages(0x5000, PAGE_SIZE as u64);
        assert_eq!(mem.read::<u64>(0x5000).unwrap(), 0);
    }

    #[test]
    fn memset_and_memdiscard() {
        let mut mem = test_memory();
        mem.memset(0x7ff0, 0x5a, 0x20).unwrap();
        assert_eq!(mem.read::<u8>(0x7ff0).unwrap(), 0x5a);
        assert_eq!(mem.read::<u8>(0x800f).unwrap(), 0x5a);
        // Discard covers only whole pages inside the range.
        mem.memdiscard(0x7000, 0x1800, false).unwrap();
        assert_eq!(mem.read::<u8>(0x7ff0).unwrap(), 0);
        assert_eq!(mem.read::<u8>(0x800f).unwrap(), 0x5a);
    }

    #[test]
    fn readable_pageno_respects_permissions() {
        let mut mem = test_memory();
        // Unmapped pages read as the (default) zero page.
        assert!(mem.get_readable_pageno(0x30).unwrap().attr.is_default);
        mem.set_page_attr(0x31 << PAGE_SHIFT, PAGE_SIZE as u64,
            PageAttributes::rwx(false, false, false))
            .unwrap();
        assert!(mem.get_readable_pageno(0x31).is_err());
        assert!(mem.get_exec_pageno(0x31).is_err());
    }

    #[test]
    fn cow_pages_duplicate_on_first_write() {
        // max_memory above the arena cap, so high pages are owned.
        let binary: Arc<[u8]> = Arc::from(&[][..]);
        let mut mem = Memory::<8>::empty(binary, 512 << 20);
        let far = 300 << 20;
        assert!(far > mem.arena.len());
        mem.write::<u32>(far, 0x11).unwrap();
        mem.prepare_fork();
        let mut child = mem.fork_clone();
        child.write::<u32>(far, 0x22).unwrap();
        assert_eq!(mem.read::<u32>(far).unwrap(), 0x11);
        assert_eq!(child.read::<u32>(far).unwrap(), 0x22);
        mem.write::<u32>(far, 0x33).unwrap();
        assert_eq!(child.read::<u32>(far).unwrap(), 0x22);
    }
}
