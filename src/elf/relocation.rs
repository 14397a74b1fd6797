//! RELA relocation processing for dynamic executables.

use elf::abi::{DT_JMPREL, DT_PLTRELSZ, DT_RELA, DT_RELASZ, DT_SYMTAB, PT_LOAD};
use elf::endian::LittleEndian;
use elf::ElfBytes;

use crate::error::MachineError;
use crate::memory::Memory;

const R_RISCV_NONE: u32 = 0;
const R_RISCV_32: u32 = 1;
const R_RISCV_64: u32 = 2;
const R_RISCV_RELATIVE: u32 = 3;
const R_RISCV_JUMP_SLOT: u32 = 5;

/// One parsed RELA entry.
struct Rela {
    offset: u64,
    rtype: u32,
    sym: u32,
    addend: i64,
}

/// Applies the RELA tables referenced from PT_DYNAMIC: `.rela.dyn`
/// (DT_RELA) and `.rela.plt` (DT_JMPREL). Unknown relocation types are
/// logged and skipped.
pub(crate) fn apply_dynamic<const W: usize>(
    mem: &mut Memory<W>,
    elf: &ElfBytes<LittleEndian>,
    binary: &[u8],
    base: u64,
) -> Result<(), MachineError> {
    let Some(dynamic) = elf
        .dynamic()
        .map_err(|_| MachineError::InvalidProgram("malformed dynamic section"))?
    else {
        return Ok(());
    };

    let mut rela: Option<u64> = None;
    let mut rela_size = 0u64;
    let mut jmprel: Option<u64> = None;
    let mut jmprel_size = 0u64;
    let mut symtab: Option<u64> = None;
    for entry in dynamic.iter() {
        match entry.d_tag {
            DT_RELA => rela = Some(entry.d_ptr()),
            DT_RELASZ => rela_size = entry.d_val(),
            DT_JMPREL => jmprel = Some(entry.d_ptr()),
            DT_PLTRELSZ => jmprel_size = entry.d_val(),
            DT_SYMTAB => symtab = Some(entry.d_ptr()),
            _ => {}
        }
    }

    if let Some(table) = rela {
        apply_table::<W>(mem, elf, binary, base, table, rela_size, symtab)?;
    }
    if let Some(table) = jmprel {
        apply_table::<W>(mem, elf, binary, base, table, jmprel_size, symtab)?;
    }
    Ok(())
}

fn apply_table<const W: usize>(
    mem: &mut Memory<W>,
    elf: &ElfBytes<LittleEndian>,
    binary: &[u8],
    base: u64,
    table_vaddr: u64,
    table_size: u64,
    symtab_vaddr: Option<u64>,
) -> Result<(), MachineError> {
    let entsize = if W == 4 { 12 } else { 24 };
    let table_off = vaddr_to_offset(elf, table_vaddr)
        .ok_or(MachineError::InvalidProgram("relocation table outside image"))?;
    let count = (table_size / entsize as u64) as usize;
    tracing::debug!(count, "applying RELA relocations");

    for i in 0..count {
        let off = table_off + i * entsize;
        let rela = parse_rela::<W>(binary, off)?;
        let target = rela
            .offset
            .checked_add(base)
            .ok_or(MachineError::InvalidProgram("relocation offset overflow"))?;
        match rela.rtype {
            R_RISCV_NONE => {}
            R_RISCV_RELATIVE => {
                let value = base.wrapping_add(rela.addend as u64);
                poke_word::<W>(mem, target, value)?;
            }
            R_RISCV_32 => {
                let sym = symbol_value::<W>(elf, binary, symtab_vaddr, rela.sym)?;
                let value = (base + sym).wrapping_add(rela.addend as u64);
                mem.poke_bytes(target, &(value as u32).to_le_bytes())?;
            }
            R_RISCV_64 if W == 8 => {
                let sym = symbol_value::<W>(elf, binary, symtab_vaddr, rela.sym)?;
                let value = (base + sym).wrapping_add(rela.addend as u64);
                mem.poke_bytes(target, &value.to_le_bytes())?;
            }
            R_RISCV_JUMP_SLOT => {
                let sym = symbol_value::<W>(elf, binary, symtab_vaddr, rela.sym)?;
                poke_word::<W>(mem, target, base + sym)?;
            }
            other => {
                tracing::warn!(rtype = other, offset = format_args!("0x{target:x}"),
                    "skipping unsupported relocation type");
            }
        }
    }
    Ok(())
}

/// Writes an address-width word.
fn poke_word<const W: usize>(mem: &mut Memory<W>, addr: u64, value: u64) -> Result<(), MachineError> {
    if W == 4 {
        mem.poke_bytes(addr, &(value as u32).to_le_bytes())
    } else {
        mem.poke_bytes(addr, &value.to_le_bytes())
    }
}

fn parse_rela<const W: usize>(binary: &[u8], off: usize) -> Result<Rela, MachineError> {
    let entsize = if W == 4 { 12 } else { 24 };
    let bytes = binary
        .get(off..off + entsize)
        .ok_or(MachineError::InvalidProgram("relocation table outside the binary"))?;
    if W == 4 {
        let offset = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as u64;
        let info = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        let addend = i32::from_le_bytes(bytes[8..12].try_into().unwrap()) as i64;
        Ok(Rela {
            offset,
            rtype: info & 0xff,
            sym: info >> 8,
            addend,
        })
    } else {
        let offset = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
        let info = u64::from_le_bytes(bytes[8..16].try_into().unwrap());
        let addend = i64::from_le_bytes(bytes[16..24].try_into().unwrap());
        Ok(Rela {
            offset,
            rtype: info as u32,
            sym: (info >> 32) as u32,
            addend,
        })
    }
}

/// Reads `st_value` of the given dynamic symbol, 0 for the null symbol.
fn symbol_value<const W: usize>(
    elf: &ElfBytes<LittleEndian>,
    binary: &[u8],
    symtab_vaddr: Option<u64>,
    index: u32,
) -> Result<u64, MachineError> {
    if index == 0 {
        return Ok(0);
    }
    let symtab = symtab_vaddr
        .ok_or(MachineError::InvalidProgram("relocation needs a missing symbol table"))?;
    let symtab_off = vaddr_to_offset(elf, symtab)
        .ok_or(MachineError::InvalidProgram("symbol table outside image"))?;
    let (entsize, value_off, value_len) = if W == 4 { (16, 4, 4) } else { (24, 8, 8) };
    let off = symtab_off + index as usize * entsize + value_off;
    let bytes = binary
        .get(off..off + value_len)
        .ok_or(MachineError::InvalidProgram("symbol outside the binary"))?;
    Ok(if W == 4 {
        u32::from_le_bytes(bytes.try_into().unwrap()) as u64
    } else {
        u64::from_le_bytes(bytes.try_into().unwrap())
    })
}

/// Translates an image-relative virtual address to a file offset via the
/// containing PT_LOAD segment.
fn vaddr_to_offset(elf: &ElfBytes<LittleEndian>, vaddr: u64) -> Option<usize> {
    let segments = elf.segments()?;
    for phdr in segments.iter() {
        if phdr.p_type == PT_LOAD
            && vaddr >= phdr.p_vaddr
            && vaddr < phdr.p_vaddr + phdr.p_filesz
        {
            return Some((phdr.p_offset + (vaddr - phdr.p_vaddr)) as usize);
        }
    }
    None
}
