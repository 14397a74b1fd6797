//! The flat read/write arena: a contiguous host allocation backing the
//! low range of guest addresses, bypassing the page map on the hot path.

use serde::de::{SeqAccess, Visitor};
use serde::ser::SerializeTuple;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::memory::page::{PAGE_SHIFT, PAGE_SIZE};

/// Default start of the fast-write region: writes below this address
/// always take the paged path, so the null page and early read-only data
/// keep their protection.
pub const RWREAD_BEGIN: u64 = 0x1000;

/// A contiguous zero-initialized buffer covering `[0, len)` of the guest
/// address space, with two monotonically decreasing boundaries.
///
/// Reads of `[addr, addr+size)` with `addr + size <= read_boundary` go
/// straight to the buffer. Writes additionally require
/// `addr >= initial_rodata_end` and `addr + size <= write_boundary`.
/// Any conflicting page attribute, trap or execute mapping lowers the
/// boundaries so the affected range falls back to the paged path.
pub struct Arena {
    data: Vec<u8>,
    read_boundary: u64,
    write_boundary: u64,
    initial_rodata_end: u64,
}

impl Arena {
    /// An arena of `pages` zeroed pages. `pages == 0` disables the fast
    /// path entirely.
    pub fn new(pages: usize) -> Self {
        let len = pages * PAGE_SIZE;
        Self {
            data: vec![0u8; len],
            read_boundary: len as u64,
            write_boundary: len as u64,
            initial_rodata_end: RWREAD_BEGIN,
        }
    }

    #[inline(always)]
    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn pages(&self) -> usize {
        self.data.len() >> PAGE_SHIFT
    }

    /// True when the whole `[addr, addr+len)` range lies inside the arena
    /// allocation (independent of the boundaries).
    #[inline(always)]
    pub fn contains(&self, addr: u64, len: usize) -> bool {
        addr.checked_add(len as u64)
            .is_some_and(|end| end <= self.len())
    }

    #[inline(always)]
    pub fn readable(&self, addr: u64, len: usize) -> bool {
        addr + (len as u64) <= self.read_boundary
    }

    #[inline(always)]
    pub fn writable(&self, addr: u64, len: usize) -> bool {
        addr >= self.initial_rodata_end && addr + (len as u64) <= self.write_boundary
    }

    #[inline(always)]
    pub fn slice(&self, addr: u64, len: usize) -> &[u8] {
        &self.data[addr as usize..addr as usize + len]
    }

    #[inline(always)]
    pub fn slice_mut(&mut self, addr: u64, len: usize) -> &mut [u8] {
        &mut self.data[addr as usize..addr as usize + len]
    }

    #[inline]
    pub fn read_boundary(&self) -> u64 {
        self.read_boundary
    }

    #[inline]
    pub fn write_boundary(&self) -> u64 {
        self.write_boundary
    }

    #[inline]
    pub fn initial_rodata_end(&self) -> u64 {
        self.initial_rodata_end
    }

    /// Lowers the read fast path so `[addr, ..)` takes the paged path.
    pub fn lower_read_boundary(&mut self, addr: u64) {
        self.read_boundary = self.read_boundary.min(addr);
        // Writes must never outlive readability of the same range.
        self.write_boundary = self.write_boundary.min(addr);
    }

    /// Lowers the write fast path so `[addr, ..)` takes the paged path.
    pub fn lower_write_boundary(&mut self, addr: u64) {
        self.write_boundary = self.write_boundary.min(addr);
    }

    /// Extends the read-only guard at the bottom of the arena up to
    /// `addr`. Used by the loader for the initial rodata and by RELRO.
    pub fn extend_rodata_guard(&mut self, addr: u64) {
        self.initial_rodata_end = self.initial_rodata_end.max(addr);
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("pages", &self.pages())
            .field("read_boundary", &self.read_boundary)
            .field("write_boundary", &self.write_boundary)
            .field("initial_rodata_end", &self.initial_rodata_end)
            .finish()
    }
}

// The arena is almost always a sea of zeros past the loaded image, so the
// serialized form is (total_len, boundaries, non-zero prefix).
impl Serialize for Arena {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let prefix_len = self
            .data
            .iter()
            .rposition(|&b| b != 0)
            .map_or(0, |pos| pos + 1);
        let mut tup = serializer.serialize_tuple(5)?;
        tup.serialize_element(&(self.data.len() as u64))?;
        tup.serialize_element(&self.read_boundary)?;
        tup.serialize_element(&self.write_boundary)?;
        tup.serialize_element(&self.initial_rodata_end)?;
        tup.serialize_element(&self.data[..prefix_len])?;
        tup.end()
    }
}

impl<'de> Deserialize<'de> for Arena {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ArenaVisitor;

        impl<'de> Visitor<'de> for ArenaVisitor {
            type Value = Arena;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("an arena tuple (len, boundaries, prefix bytes)")
            }

            fn visit_seq<V>(self, mut seq: V) -> Result<Arena, V::Error>
            where
                V: SeqAccess<'de>,
            {
                use serde::de::Error;
                let len: u64 = seq
                    .next_element()?
                    .ok_or_else(|| V::Error::custom("missing arena length"))?;
                let read_boundary = seq
                    .next_element()?
                    .ok_or_else(|| V::Error::custom("missing read boundary"))?;
                let write_boundary = seq
                    .next_element()?
                    .ok_or_else(|| V::Error::custom("missing write boundary"))?;
                let initial_rodata_end = seq
                    .next_element()?
                    .ok_or_else(|| V::Error::custom("missing rodata end"))?;
                let prefix: Vec<u8> = seq
                    .next_element()?
                    .ok_or_else(|| V::Error::custom("missing arena data"))?;
                if prefix.len() as u64 > len {
                    return Err(V::Error::custom("arena prefix longer than arena"));
                }
                let mut data = vec![0u8; len as usize];
                data[..prefix.len()].copy_from_slice(&prefix);
                Ok(Arena {
                    data,
                    read_boundary,
                    write_boundary,
                    initial_rodata_end,
                })
            }
        }

        deserializer.deserialize_tuple(5, ArenaVisitor)
    }
}

impl Clone for Arena {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            read_boundary: self.read_boundary,
            write_boundary: self.write_boundary,
            initial_rodata_end: self.initial_rodata_end,
        }
    }
}
