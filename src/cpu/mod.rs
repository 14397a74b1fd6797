//! The interpreter-side CPU state: register file, instruction counter
//! and the execute-segment caches the dispatch loop runs from.

pub mod compressed;
pub mod decoder;
pub mod exec_segment;
pub mod registers;

use std::sync::Arc;

use exec_segment::DecodedExecuteSegment;
use registers::Registers;

/// Entries in the recently-used execute segment cache.
pub const SEGMENT_CACHE_SIZE: usize = 4;

/// A CPU-held reference to a decoded execute segment, validated against
/// the memory subsystem's generation counter before use. Memory never
/// frees a referenced segment (it is refcounted); the generation check
/// only prevents executing stale code after eviction.
#[derive(Clone)]
pub(crate) struct CachedSegment<const W: usize> {
    pub seg: Arc<DecodedExecuteSegment<W>>,
    pub generation: u64,
}

/// One hart's execution state.
#[derive(Clone)]
pub struct Cpu<const W: usize> {
    /// Integer, floating-point and CSR register state.
    pub regs: Registers<W>,
    /// Retired instruction count.
    pub(crate) counter: u64,
    /// The execute segment the PC currently lies in.
    pub(crate) current: Option<CachedSegment<W>>,
    seg_cache: [Option<CachedSegment<W>>; SEGMENT_CACHE_SIZE],
    cache_iter: usize,
    /// LR/SC reservation address.
    pub(crate) reservation: Option<u64>,
}

impl<const W: usize> Default for Cpu<W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const W: usize> Cpu<W> {
    pub fn new() -> Self {
        Self {
            regs: Registers::default(),
            counter: 0,
            current: None,
            seg_cache: [const { None }; SEGMENT_CACHE_SIZE],
            cache_iter: 0,
            reservation: None,
        }
    }

    /// Number of instructions retired so far.
    #[inline(always)]
    pub fn instruction_counter(&self) -> u64 {
        self.counter
    }

    pub fn set_instruction_counter(&mut self, value: u64) {
        self.counter = value;
    }

    /// Jump target alignment mask: 2-byte with compressed instructions,
    /// else 4-byte.
    #[inline(always)]
    pub(crate) const fn pc_alignment_mask() -> u64 {
        if cfg!(feature = "compressed") {
            0x1
        } else {
            0x3
        }
    }

    /// True when the current segment covers `pc` and is still valid.
    #[inline(always)]
    pub(crate) fn current_segment_valid(&self, pc: u64, generation: u64) -> bool {
        match &self.current {
            Some(cached) => cached.generation == generation && cached.seg.contains(pc),
            None => false,
        }
    }

    /// Consults the recently-used cache for a valid segment covering
    /// `pc`.
    pub(crate) fn lookup_cached_segment(
        &self,
        pc: u64,
        generation: u64,
    ) -> Option<CachedSegment<W>> {
        self.seg_cache
            .iter()
            .flatten()
            .find(|cached| cached.generation == generation && cached.seg.contains(pc))
            .cloned()
    }

    /// Makes `seg` current and remembers it in the recently-used cache.
    pub(crate) fn install_segment(
        &mut self,
        seg: Arc<DecodedExecuteSegment<W>>,
        generation: u64,
    ) {
        let cached = CachedSegment { seg, generation };
        self.seg_cache[self.cache_iter % SEGMENT_CACHE_SIZE] = Some(cached.clone());
        self.cache_iter += 1;
        self.current = Some(cached);
    }

    /// Drops every cached segment reference, forcing re-resolution.
    pub(crate) fn flush_segment_caches(&mut self) {
        self.current = None;
        self.seg_cache = [const { None }; SEGMENT_CACHE_SIZE];
    }
}

impl<const W: usize> std::fmt::Debug for Cpu<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cpu")
            .field("pc", &format_args!("0x{:x}", self.regs.pc))
            .field("counter", &self.counter)
            .finish()
    }
}
