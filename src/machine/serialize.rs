//! Machine state snapshots: serializing a paused machine and restoring
//! it onto a machine built from the same binary.
//!
//! Trap callbacks and replaced page handlers are capabilities, not data;
//! they are not part of a snapshot and must be re-installed after
//! restoring.

use serde::{Deserialize, Serialize};

use crate::cpu::registers::Registers;
use crate::error::MachineError;
use crate::machine::Machine;
use crate::memory::arena::Arena;
use crate::memory::mmap::MmapAllocator;
use crate::memory::page::{Page, PageAttributes, PageData, PAGE_SIZE};

/// Backing data of one serialized page.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum PageBytes {
    Owned(Vec<u8>),
    /// Data lives in the (separately serialized) arena.
    Arena(u64),
    /// Read-only window into the ELF image.
    Binary(u64),
    Zero,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PageSnapshot {
    pageno: u64,
    attr: PageAttributes,
    data: PageBytes,
}

/// A complete serialized machine state.
#[derive(Serialize, Deserialize)]
pub struct MachineSnapshot {
    width: u8,
    regs: Registers<8>,
    counter: u64,
    pages: Vec<PageSnapshot>,
    arena: Arena,
    mmap: MmapAllocator,
    start_address: u64,
    stack_address: u64,
    exit_address: u64,
    heap_address: u64,
}

impl<const W: usize> Machine<W> {
    /// Serializes the paused machine's CPU state, reachable memory and
    /// mmap allocator state.
    pub fn serialize_to(&self) -> Result<Vec<u8>, MachineError> {
        let pages = self
            .memory
            .page_map()
            .iter()
            .map(|(pageno, page)| {
                let data = match &page.data {
                    PageData::Owned(buf) => PageBytes::Owned(buf.to_vec()),
                    PageData::Arena(off) => PageBytes::Arena(*off as u64),
                    PageData::Binary(off) => PageBytes::Binary(*off as u64),
                    PageData::Zero => PageBytes::Zero,
                };
                PageSnapshot {
                    pageno: *pageno,
                    attr: page.attr,
                    data,
                }
            })
            .collect();

        // Registers are stored width-agnostically; values are already
        // canonical for the machine width.
        let mut regs = Registers::<8>::default();
        regs.pc = self.cpu.regs.pc;
        regs.fpr = self.cpu.regs.fpr;
        regs.fcsr = self.cpu.regs.fcsr;
        for i in 1..32 {
            regs.set(i, self.cpu.regs.get(i));
        }

        let snapshot = MachineSnapshot {
            width: W as u8,
            regs,
            counter: self.cpu.counter,
            pages,
            arena: self.memory.arena.clone(),
            mmap: self.memory.mmap.clone(),
            start_address: self.memory.start_address(),
            stack_address: self.memory.stack_initial(),
            exit_address: self.memory.exit_address(),
            heap_address: self.memory.heap_address(),
        };
        bincode::serialize(&snapshot)
            .map_err(|_| MachineError::InvalidProgram("snapshot encoding failed"))
    }

    /// Restores a snapshot produced by [`Machine::serialize_to`] from a
    /// machine loaded from the same binary.
    pub fn deserialize_from(&mut self, bytes: &[u8]) -> Result<(), MachineError> {
        let snapshot: MachineSnapshot = bincode::deserialize(bytes)
            .map_err(|_| MachineError::InvalidProgram("malformed snapshot"))?;
        if snapshot.width as usize != W {
            return Err(MachineError::InvalidProgram("snapshot width mismatch"));
        }
        if snapshot.arena.len() != self.memory.arena.len() {
            return Err(MachineError::InvalidProgram("snapshot arena size mismatch"));
        }

        self.cpu.regs.pc = snapshot.regs.pc;
        for i in 1..32 {
            self.cpu.regs.set(i, snapshot.regs.get(i));
        }
        self.cpu.regs.fpr = snapshot.regs.fpr;
        self.cpu.regs.fcsr = snapshot.regs.fcsr;
        self.cpu.counter = snapshot.counter;
        self.cpu.reservation = None;
        self.cpu.flush_segment_caches();

        self.memory.clear_all_pages();
        self.memory.arena = snapshot.arena;
        self.memory.mmap = snapshot.mmap;
        self.memory.start_address = snapshot.start_address;
        self.memory.stack_address = snapshot.stack_address;
        self.memory.exit_address = snapshot.exit_address;
        self.memory.heap_address = snapshot.heap_address;
        self.memory.evict_execute_segments();

        let binary_len = self.memory.binary().len() as u64;
        for page in snapshot.pages {
            let data = match page.data {
                PageBytes::Owned(bytes) => {
                    if bytes.len() != PAGE_SIZE {
                        return Err(MachineError::InvalidProgram("snapshot page size mismatch"));
                    }
                    let mut buf = [0u8; PAGE_SIZE];
                    buf.copy_from_slice(&bytes);
                    PageData::Owned(std::sync::Arc::new(buf))
                }
                PageBytes::Arena(off) => {
                    if off + PAGE_SIZE as u64 > self.memory.arena.len() {
                        return Err(MachineError::InvalidProgram("snapshot page outside arena"));
                    }
                    PageData::Arena(off as usize)
                }
                PageBytes::Binary(off) => {
                    if off + PAGE_SIZE as u64 > binary_len {
                        return Err(MachineError::InvalidProgram("snapshot page outside binary"));
                    }
                    PageData::Binary(off as usize)
                }
                PageBytes::Zero => PageData::Zero,
            };
            self.memory.insert_page(
                page.pageno,
                Page {
                    attr: page.attr,
                    data,
                    trap_cb: None,
                },
            );
        }
        Ok(())
    }
}
