//! ELF validation and loading: maps PT_LOAD segments into guest memory,
//! applies dynamic relocations and establishes the initial memory layout
//! (heap, brk window, mmap region, stack).

pub(crate) mod relocation;

use elf::abi::{EM_RISCV, ET_DYN, ET_EXEC, PF_R, PF_W, PF_X, PT_DYNAMIC, PT_GNU_RELRO, PT_LOAD};
use elf::endian::LittleEndian;
use elf::file::Class;
use elf::segment::ProgramHeader;
use elf::ElfBytes;

use crate::error::MachineError;
use crate::memory::mmap::MmapAllocator;
use crate::memory::page::{page_align_up, PageAttributes, PAGE_SIZE};
use crate::memory::{Memory, BRK_MAX, DYLINK_BASE};

/// Validates the binary held by `mem` and builds the initial memory
/// layout. On return `start_address`, `heap_address`, the mmap allocator
/// and the stack/exit addresses are established.
pub(crate) fn load_binary<const W: usize>(mem: &mut Memory<W>) -> Result<(), MachineError> {
    let binary = std::sync::Arc::clone(mem.binary());
    let elf = ElfBytes::<LittleEndian>::minimal_parse(&binary)
        .map_err(|_| MachineError::InvalidProgram("not a RISC-V ELF binary"))?;

    match (W, elf.ehdr.class) {
        (4, Class::ELF32) | (8, Class::ELF64) => {}
        _ => {
            return Err(MachineError::InvalidProgram(
                "ELF class does not match the machine width",
            ))
        }
    }
    if elf.ehdr.e_machine != EM_RISCV {
        return Err(MachineError::InvalidProgram("not a RISC-V binary"));
    }
    let is_dynamic = elf.ehdr.e_type == ET_DYN;
    if elf.ehdr.e_type != ET_EXEC && !is_dynamic {
        return Err(MachineError::InvalidProgram("not an executable"));
    }

    let segments = elf
        .segments()
        .ok_or(MachineError::InvalidProgram("missing program headers"))?;

    // Zero-based dynamic images are rebased to the dynamic link base.
    let base = if is_dynamic && elf.ehdr.e_entry < DYLINK_BASE {
        DYLINK_BASE
    } else {
        0
    };
    mem.is_dynamic = is_dynamic;

    let mut max_vaddr = 0u64;
    let mut rodata_end = 0u64;
    let mut has_dynamic = false;
    let mut relro_ranges: Vec<(u64, u64)> = Vec::new();

    for phdr in segments.iter() {
        match phdr.p_type {
            PT_LOAD => {
                load_segment(mem, &binary, &phdr, base, &mut max_vaddr, &mut rodata_end)?;
            }
            PT_DYNAMIC => has_dynamic = true,
            PT_GNU_RELRO => {
                let vaddr = phdr
                    .p_vaddr
                    .checked_add(base)
                    .ok_or(MachineError::InvalidProgram("program header overflow"))?;
                relro_ranges.push((vaddr, phdr.p_memsz));
            }
            _ => {}
        }
    }
    if max_vaddr == 0 {
        return Err(MachineError::InvalidProgram("no loadable segments"));
    }

    mem.arena.extend_rodata_guard(rodata_end);

    if has_dynamic {
        relocation::apply_dynamic::<W>(mem, &elf, &binary, base)?;
    }

    // RELRO only takes effect after relocations are in place.
    for (vaddr, len) in relro_ranges {
        tracing::debug!(
            vaddr = format_args!("0x{vaddr:x}"),
            len,
            "stripping write permission from RELRO range"
        );
        mem.set_page_attr(vaddr, len, PageAttributes::rwx(true, false, false))?;
    }

    let entry = elf
        .ehdr
        .e_entry
        .checked_add(base)
        .ok_or(MachineError::InvalidProgram("entry point overflow"))?;
    if entry >= mem.max_memory() {
        return Err(MachineError::InvalidProgram("entry point outside guest memory"));
    }
    mem.start_address = entry & Memory::<W>::ADDR_MASK;
    mem.heap_address = page_align_up(max_vaddr);
    mem.mmap = MmapAllocator::new(mem.heap_address + BRK_MAX);
    // Stack grows down from the top of addressable memory; the page
    // below it doubles as the vmcall return sentinel.
    mem.stack_address = mem.max_memory();
    mem.exit_address = mem.max_memory() - (PAGE_SIZE as u64);

    if mem.heap_address + BRK_MAX >= mem.max_memory() {
        return Err(MachineError::InvalidProgram("image leaves no room for the heap"));
    }

    tracing::debug!(
        entry = format_args!("0x{:x}", mem.start_address),
        heap = format_args!("0x{:x}", mem.heap_address),
        mmap = format_args!("0x{:x}", mem.mmap_start()),
        stack = format_args!("0x{:x}", mem.stack_address),
        dynamic = is_dynamic,
        "loaded RISC-V ELF image"
    );
    Ok(())
}

fn load_segment<const W: usize>(
    mem: &mut Memory<W>,
    binary: &[u8],
    phdr: &ProgramHeader,
    base: u64,
    max_vaddr: &mut u64,
    rodata_end: &mut u64,
) -> Result<(), MachineError> {
    if phdr.p_memsz == 0 {
        return Ok(());
    }
    let vaddr = phdr
        .p_vaddr
        .checked_add(base)
        .ok_or(MachineError::InvalidProgram("program header overflow"))?;
    let file_end = phdr
        .p_offset
        .checked_add(phdr.p_filesz)
        .ok_or(MachineError::InvalidProgram("program header overflow"))?;
    if file_end > binary.len() as u64 {
        return Err(MachineError::InvalidProgram("segment data outside the binary"));
    }
    if phdr.p_filesz > phdr.p_memsz {
        return Err(MachineError::InvalidProgram("segment file size exceeds memory size"));
    }

    let attr = PageAttributes::rwx(
        phdr.p_flags & PF_R != 0 || phdr.p_flags & PF_X != 0,
        phdr.p_flags & PF_W != 0,
        phdr.p_flags & PF_X != 0,
    );
    tracing::debug!(
        vaddr = format_args!("0x{vaddr:x}"),
        filesz = phdr.p_filesz,
        memsz = phdr.p_memsz,
        r = attr.read,
        w = attr.write,
        x = attr.exec,
        "mapping PT_LOAD segment"
    );

    let data = &binary[phdr.p_offset as usize..file_end as usize];
    mem.install_segment(vaddr, phdr.p_offset as usize, data, phdr.p_memsz, attr)?;

    let end = vaddr + phdr.p_memsz;
    *max_vaddr = (*max_vaddr).max(end);
    if !attr.write {
        // Initial read-only data extends the arena's low write guard.
        *rodata_end = (*rodata_end).max(page_align_up(end));
    } else if attr.exec {
        // Writable code cannot use the arena write fast path: every
        // store must pass the decoder-invalidation check.
        mem.arena.lower_write_boundary(vaddr);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    // A minimal ELF64 image with one executable PT_LOAD at 0x10000.
    fn minimal_elf64(entry: u64, code: &[u8]) -> Vec<u8> {
        let mut image = vec![0u8; 0x1000 + code.len()];
        // e_ident
        image[0..4].copy_from_slice(b"\x7fELF");
        image[4] = 2; // ELFCLASS64
        image[5] = 1; // little endian
        image[6] = 1; // EV_CURRENT
        let set16 = |img: &mut [u8], off: usize, v: u16| {
            img[off..off + 2].copy_from_slice(&v.to_le_bytes())
        };
        let set32 = |img: &mut [u8], off: usize, v: u32| {
            img[off..off + 4].copy_from_slice(&v.to_le_bytes())
        };
        let set64 = |img: &mut [u8], off: usize, v: u64| {
            img[off..off + 8].copy_from_slice(&v.to_le_bytes())
        };
        set16(&mut image, 16, 2); // e_type = ET_EXEC
        set16(&mut image, 18, 243); // e_machine = EM_RISCV
        set32(&mut image, 20, 1); // e_version
        set64(&mut image, 24, entry);
        set64(&mut image, 32, 64); // e_phoff
        set16(&mut image, 52, 64); // e_ehsize
        set16(&mut image, 54, 56); // e_phentsize
        set16(&mut image, 56, 1); // e_phnum
        // program header at 64: PT_LOAD, R+X, offset 0x1000 -> 0x10000
        set32(&mut image, 64, PT_LOAD);
        set32(&mut image, 68, PF_R | PF_X);
        set64(&mut image, 72, 0x1000); // p_offset
        set64(&mut image, 80, 0x10000); // p_vaddr
        set64(&mut image, 88, 0x10000); // p_paddr
        set64(&mut image, 96, code.len() as u64); // p_filesz
        set64(&mut image, 104, code.len() as u64); // p_memsz
        set64(&mut image, 112, 0x1000); // p_align
        image[0x1000..].copy_from_slice(code);
        image
    }

    fn load(image: &[u8]) -> Result<Memory<8>, MachineError> {
        let mut mem = Memory::<8>::empty(Arc::from(image), 64 << 20);
        load_binary(&mut mem)?;
        Ok(mem)
    }

    #[test]
    fn loads_a_minimal_image() {
        let code = 0x0000_0073u32.to_le_bytes(); // ecall
        let mem = load(&minimal_elf64(0x10000, &code)).unwrap();
        assert_eq!(mem.start_address(), 0x10000);
        assert_eq!(mem.heap_address(), 0x11000);
        assert_eq!(mem.mmap_start(), 0x11000 + BRK_MAX);
        assert!(mem.get_pageno(0x10).attr.exec);
        assert!(!mem.get_pageno(0x10).attr.write);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut image = minimal_elf64(0x10000, &[0; 4]);
        image[0] = 0x7e;
        assert!(matches!(
            load(&image),
            Err(MachineError::InvalidProgram(_))
        ));
    }

    #[test]
    fn rejects_wrong_class() {
        let mut image = minimal_elf64(0x10000, &[0; 4]);
        image[4] = 1; // ELFCLASS32
        assert!(matches!(
            load(&image),
            Err(MachineError::InvalidProgram(_))
        ));
    }

    #[test]
    fn rejects_wrong_machine() {
        let mut image = minimal_elf64(0x10000, &[0; 4]);
        image[18..20].copy_from_slice(&62u16.to_le_bytes()); // EM_X86_64
        assert!(matches!(
            load(&image),
            Err(MachineError::InvalidProgram(_))
        ));
    }

    #[test]
    fn rejects_truncated_files() {
        let image = minimal_elf64(0x10000, &[0; 4]);
        assert!(load(&image[..40]).is_err());
        // Segment pointing past the end of the file.
        let mut image = minimal_elf64(0x10000, &[0; 4]);
        image[96..104].copy_from_slice(&0x10_0000u64.to_le_bytes()); // p_filesz
        image[104..112].copy_from_slice(&0x10_0000u64.to_le_bytes()); // p_memsz
        assert!(matches!(
            load(&image),
            Err(MachineError::InvalidProgram(_))
        ));
    }

    #[test]
    fn read_only_pages_map_into_the_image() {
        use crate::memory::page::PageData;

        // A full page of segment data: wholly file-backed and read-only,
        // so the loader borrows the image instead of copying.
        let mut code = vec![0u8; PAGE_SIZE];
        for (i, byte) in code.iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
        let mut mem = load(&minimal_elf64(0x10000, &code)).unwrap();
        assert!(matches!(mem.get_page(0x10000).data, PageData::Binary(_)));

        // The arena mirror and the image window agree.
        let expected = u32::from_le_bytes(code[0..4].try_into().unwrap());
        assert_eq!(mem.read::<u32>(0x10000).unwrap(), expected);

        // A writable alias copies the page out of the image; both the
        // paged view and the fast path observe the new bytes.
        mem.set_page_attr(0x10000, PAGE_SIZE as u64, PageAttributes::rwx(true, true, true))
            .unwrap();
        mem.write::<u32>(0x10000, 0x1234_5678).unwrap();
        assert!(!matches!(mem.get_page(0x10000).data, PageData::Binary(_)));
        assert_eq!(mem.read::<u32>(0x10000).unwrap(), 0x1234_5678);
        assert_eq!(mem.read::<u32>(0x10004).unwrap(), {
            u32::from_le_bytes(code[4..8].try_into().unwrap())
        });
    }

    #[test]
    fn code_is_protected_from_fast_path_writes() {
        let code = 0x0000_0073u32.to_le_bytes();
        let mut mem = load(&minimal_elf64(0x10000, &code)).unwrap();
        // The rodata guard covers the executable image.
        assert!(mem.arena.initial_rodata_end() >= 0x11000);
        let err = mem.write::<u32>(0x10000, 0).unwrap_err();
        assert_eq!(err, MachineError::ProtectionFault(0x10000));
    }
}
