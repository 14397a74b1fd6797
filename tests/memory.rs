//! Memory-model scenarios driven through whole machines: copy-on-write
//! forks, decoder-cache invalidation, MMIO traps and state snapshots.

mod common;

use common::{build_elf64, rv, CODE_VADDR};
use riscv_vm::memory::page::TrapKind;
use riscv_vm::{Machine64, MachineError, MachineOptions, PageAttributes};

fn exit_machine(code: &[u32]) -> Machine64 {
    let image = build_elf64(code);
    let mut machine = Machine64::new(&image, MachineOptions::default()).unwrap();
    machine.set_syscall_handler(93, |m: &mut Machine64| {
        m.stop();
        Ok(())
    });
    machine
}

#[test]
fn fork_isolates_parent_and_child() {
    let mut parent = exit_machine(&[rv::ecall()]);
    parent.run(10).unwrap();
    let heap = parent.memory.heap_address();
    parent.memory.write::<u8>(heap, 0x11).unwrap();

    let mut child = parent.fork();
    child.memory.write::<u8>(heap, 0x22).unwrap();
    assert_eq!(parent.memory.read::<u8>(heap).unwrap(), 0x11);
    assert_eq!(child.memory.read::<u8>(heap).unwrap(), 0x22);

    // And the other direction.
    parent.memory.write::<u8>(heap, 0x33).unwrap();
    assert_eq!(child.memory.read::<u8>(heap).unwrap(), 0x22);

    // Far (page-map backed, beyond the arena) memory follows the same
    // rule through the copy-on-write path.
    let far = 300 << 20;
    let options = MachineOptions {
        max_memory: 512 << 20,
        ..MachineOptions::default()
    };
    let mut parent = Machine64::new(&build_elf64(&[rv::ecall()]), options).unwrap();
    parent.memory.write::<u64>(far, 0xAAAA).unwrap();
    let mut child = parent.fork();
    child.memory.write::<u64>(far, 0xBBBB).unwrap();
    assert_eq!(parent.memory.read::<u64>(far).unwrap(), 0xAAAA);
    assert_eq!(child.memory.read::<u64>(far).unwrap(), 0xBBBB);
}

#[test]
fn fork_shares_execute_segments() {
    let mut parent = exit_machine(&[rv::addi(10, 0, 1), rv::ecall()]);
    parent.run(10).unwrap();
    assert_eq!(parent.memory.cached_execute_segments(), 1);

    let mut child = parent.fork();
    child.set_syscall_handler(93, |m: &mut Machine64| {
        m.stop();
        Ok(())
    });
    child.registers_mut().pc = CODE_VADDR;
    child.run(10).unwrap();
    assert_eq!(child.return_value(), 1);
}

#[test]
fn writes_to_executable_pages_invalidate_decoded_code() {
    // li a0, 1; ecall
    let mut machine = exit_machine(&[rv::addi(10, 0, 1), rv::ecall()]);
    machine.run(10).unwrap();
    assert_eq!(machine.return_value(), 1);

    // Patch the immediate through a writable alias and re-run.
    machine
        .memory
        .set_page_attr(CODE_VADDR, 0x1000, PageAttributes::rwx(true, true, true))
        .unwrap();
    machine
        .memory
        .write::<u32>(CODE_VADDR, rv::addi(10, 0, 2))
        .unwrap();
    machine.registers_mut().pc = CODE_VADDR;
    machine.run(10).unwrap();
    assert_eq!(machine.return_value(), 2);
}

#[test]
fn mmio_trap_reads_and_writes_reach_the_callback() {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    let mut machine = exit_machine(&[rv::ecall()]);
    let mmio = 0x200_0000u64;
    let written = Arc::new(AtomicU64::new(0));
    let written2 = Arc::clone(&written);
    machine.memory.trap(
        mmio,
        Arc::new(move |_mem, kind, addr, value| match kind {
            TrapKind::Read(_) => Ok(0x1234_5678),
            TrapKind::Write(_) => {
                written2.store(value.wrapping_add(addr), Ordering::Relaxed);
                Ok(0)
            }
            TrapKind::Exec => Ok(0),
        }),
    );
    assert_eq!(machine.memory.read::<u32>(mmio).unwrap(), 0x1234_5678);
    machine.memory.write::<u16>(mmio + 8, 0x42).unwrap();
    assert_eq!(written.load(Ordering::Relaxed), 0x42 + mmio + 8);
}

#[test]
fn execute_trap_can_redirect_the_pc() {
    // Code: li a0, 1; ecall; li a0, 2; ecall. The execute trap on the
    // code page redirects the initial entry to the second half.
    let mut machine = exit_machine(&[
        rv::addi(10, 0, 1),
        rv::ecall(),
        rv::addi(10, 0, 2),
        rv::ecall(),
    ]);
    machine.memory.trap(
        CODE_VADDR,
        std::sync::Arc::new(move |mem, kind, addr, _value| {
            if kind == TrapKind::Exec && addr == CODE_VADDR {
                mem.set_pending_jump(CODE_VADDR + 8);
            }
            Ok(0)
        }),
    );
    machine.run(10).unwrap();
    assert_eq!(machine.return_value(), 2);
}

#[test]
fn mmap_allocate_and_unmap_recycle_ranges() {
    let mut machine = exit_machine(&[rv::ecall()]);
    let start = machine.memory.mmap_start();
    assert_eq!(machine.memory.mmap_address(), start);

    let a = machine.memory.mmap_allocate(0x3000);
    let b = machine.memory.mmap_allocate(0x1000);
    assert_eq!(a, start);
    assert_eq!(b, start + 0x3000);

    machine.memory.write::<u64>(a, 0x55).unwrap();
    assert!(machine.memory.mmap_unmap(a, 0x3000));
    // Unmapped memory reads zero again.
    assert_eq!(machine.memory.read::<u64>(a).unwrap(), 0);
    // And the range is recycled before the bump pointer moves.
    assert_eq!(machine.memory.mmap_allocate(0x1000), a);

    // Relaxing the topmost mapping lowers the bump pointer.
    assert!(machine.memory.mmap_relax(b, 0x1000, 0));
    assert_eq!(machine.memory.mmap_address(), a + 0x3000);
}

#[test]
fn snapshot_round_trips_cpu_and_memory_state() {
    let code = [rv::addi(10, 0, 42), rv::addi(28, 0, 99), rv::ecall()];
    let small = || MachineOptions {
        max_memory: 32 << 20,
        ..MachineOptions::default()
    };
    let mut machine = Machine64::new(&build_elf64(&code), small()).unwrap();
    machine.set_syscall_handler(93, |m: &mut Machine64| {
        m.stop();
        Ok(())
    });
    machine.run(10).unwrap();
    let heap = machine.memory.heap_address();
    machine.memory.write::<u64>(heap, 0xfeed).unwrap();
    machine.memory.write::<u64>(24 << 20, 0xbeef).unwrap();
    let mmap_addr = machine.memory.mmap_allocate(0x2000);

    let snapshot = machine.serialize_to().unwrap();

    // Restore onto a fresh machine built from the same image.
    let mut restored = Machine64::new(&build_elf64(&code), small()).unwrap();
    restored.set_syscall_handler(93, |m: &mut Machine64| {
        m.stop();
        Ok(())
    });
    restored.deserialize_from(&snapshot).unwrap();

    assert_eq!(restored.registers().pc, machine.registers().pc);
    assert_eq!(restored.return_value(), 42);
    assert_eq!(restored.registers().get(28), 99);
    assert_eq!(restored.instruction_counter(), machine.instruction_counter());
    assert_eq!(restored.memory.read::<u64>(heap).unwrap(), 0xfeed);
    assert_eq!(restored.memory.read::<u64>(24 << 20).unwrap(), 0xbeef);
    // The mmap allocator continues where it left off.
    assert_eq!(
        restored.memory.mmap_allocate(0x1000),
        mmap_addr + 0x2000
    );

    // The restored machine still executes.
    restored.registers_mut().pc = CODE_VADDR;
    restored.run(10).unwrap();
    assert_eq!(restored.return_value(), 42);
}

#[test]
fn snapshot_rejects_width_mismatch() {
    let machine = exit_machine(&[rv::ecall()]);
    let snapshot = machine.serialize_to().unwrap();

    let image32 = common::build_elf32(&[rv::ecall()]);
    let mut other = riscv_vm::Machine32::new(&image32, MachineOptions::default()).unwrap();
    assert!(matches!(
        other.deserialize_from(&snapshot),
        Err(MachineError::InvalidProgram(_))
    ));
}

#[test]
fn gather_spans_heap_and_mmap_pages() {
    let mut machine = exit_machine(&[rv::ecall()]);
    let heap = machine.memory.heap_address();
    machine.memory.memcpy(heap, &[7u8; 8192]).unwrap();
    let mut bufs = Vec::new();
    let count = machine
        .memory
        .gather_buffers_from_range(4, &mut bufs, heap, 8192)
        .unwrap();
    assert!(count >= 1);
    let total: usize = bufs.iter().map(|b| b.len()).sum();
    assert_eq!(total, 8192);
    assert!(bufs.iter().all(|b| b.iter().all(|&x| x == 7)));
}

#[test]
fn free_pages_resets_contents() {
    let mut machine = exit_machine(&[rv::ecall()]);
    let heap = machine.memory.heap_address();
    machine.memory.write::<u64>(heap, 0x77).unwrap();
    machine.memory.free_pages(heap, 0x1000);
    assert_eq!(machine.memory.read::<u64>(heap).unwrap(), 0);
}
