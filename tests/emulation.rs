//! End-to-end emulation scenarios: small hand-assembled guests run
//! through the full load/decode/dispatch pipeline.

mod common;

use common::{build_elf32, build_elf64, rv, CODE_VADDR};
use riscv_vm::{Machine, Machine32, Machine64, MachineError, MachineOptions};

/// Binds syscall 93 (exit) to a handler that stops the machine.
fn bind_exit<const W: usize>(machine: &mut Machine<W>) {
    machine.set_syscall_handler(93, |m: &mut Machine<W>| {
        m.stop();
        Ok(())
    });
}

#[test]
fn exit_with_42() {
    // li a0, 42; ecall
    let image = build_elf64(&[rv::addi(10, 0, 42), rv::ecall()]);
    let mut machine = Machine64::new(&image, MachineOptions::default()).unwrap();
    bind_exit(&mut machine);
    machine.run(1_000).unwrap();
    assert_eq!(machine.return_value(), 42);
    assert_eq!(machine.instruction_counter(), 2);
}

#[test]
fn exit_with_42_rv32() {
    let image = build_elf32(&[rv::addi(10, 0, 42), rv::ecall()]);
    let mut machine = Machine32::new(&image, MachineOptions::default()).unwrap();
    bind_exit(&mut machine);
    machine.run(1_000).unwrap();
    assert_eq!(machine.return_value(), 42);
    assert_eq!(machine.instruction_counter(), 2);
}

#[test]
fn tight_loop_counts_every_instruction() {
    // li t0, 1<<20 (single lui); 1: addi t0, t0, -1; bnez t0, 1b; ecall
    const N: u64 = 1 << 20;
    let image = build_elf64(&[
        rv::lui(5, (N >> 12) as u32),
        rv::addi(5, 5, -1),
        rv::bne(5, 0, -4),
        rv::ecall(),
    ]);
    let mut machine = Machine64::new(&image, MachineOptions::default()).unwrap();
    bind_exit(&mut machine);
    machine.run(4 * N).unwrap();
    // a0 was never written and reads zero.
    assert_eq!(machine.return_value(), 0);
    assert_eq!(machine.instruction_counter(), 2 + 2 * N);
}

#[test]
fn store_then_load_word_at_heap() {
    // Writes 0xDE,0xAD,0xBE,0xEF at heap_address, loads the word back
    // and exits with it in a0.
    let probe = Machine32::new(&build_elf32(&[rv::ecall()]), MachineOptions::default()).unwrap();
    let heap = probe.memory.heap_address();
    assert_eq!(heap & 0xfff, 0);

    let image = build_elf32(&[
        rv::lui(6, (heap >> 12) as u32), // t1 = heap
        rv::addi(5, 0, 0xde),
        rv::sb(6, 5, 0),
        rv::addi(5, 0, 0xad),
        rv::sb(6, 5, 1),
        rv::addi(5, 0, 0xbe),
        rv::sb(6, 5, 2),
        rv::addi(5, 0, 0xef),
        rv::sb(6, 5, 3),
        rv::lw(10, 6, 0),
        rv::ecall(),
    ]);
    let mut machine = Machine32::new(&image, MachineOptions::default()).unwrap();
    bind_exit(&mut machine);
    machine.run(100).unwrap();
    assert_eq!(machine.return_value() as u32, 0xEFBE_ADDE);
}

#[test]
fn store_to_read_only_page_faults_with_address() {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    // sw t0, 0(t1) with t1 pointing at the (read-only) code page.
    let image = build_elf64(&[
        rv::lui(6, (CODE_VADDR >> 12) as u32),
        rv::sw(6, 5, 0),
        rv::ecall(),
    ]);
    let seen = Arc::new(AtomicU64::new(0));
    let seen2 = Arc::clone(&seen);
    let options = MachineOptions {
        on_error: Some(Arc::new(move |err: &MachineError| {
            seen2.store(err.data(), Ordering::Relaxed);
        })),
        ..MachineOptions::default()
    };
    let mut machine = Machine64::new(&image, options).unwrap();
    bind_exit(&mut machine);
    let err = machine.run(100).unwrap_err();
    assert_eq!(err, MachineError::ProtectionFault(CODE_VADDR));
    assert_eq!(seen.load(Ordering::Relaxed), CODE_VADDR);
}

#[test]
fn infinite_loop_exhausts_the_budget() {
    // jal x0, 0
    let image = build_elf64(&[rv::jal(0, 0)]);
    let mut machine = Machine64::new(&image, MachineOptions::default()).unwrap();
    machine.run(1_000_000).unwrap();
    assert_eq!(machine.instruction_counter(), 1_000_000);
    // The budget is cumulative across runs.
    machine.run(10).unwrap();
    assert_eq!(machine.instruction_counter(), 1_000_010);
}

#[test]
fn writes_to_x0_are_discarded() {
    // addi x0, x0, 5; add a0, x0, x0; ecall
    let image = build_elf64(&[rv::addi(0, 0, 5), rv::add(10, 0, 0), rv::ecall()]);
    let mut machine = Machine64::new(&image, MachineOptions::default()).unwrap();
    bind_exit(&mut machine);
    machine.run(100).unwrap();
    assert_eq!(machine.return_value(), 0);
    assert_eq!(machine.registers().get(0), 0);
}

#[test]
fn unbound_syscall_is_an_error() {
    let image = build_elf64(&[rv::addi(17, 0, 214), rv::ecall()]);
    let mut machine = Machine64::new(&image, MachineOptions::default()).unwrap();
    let err = machine.run(100).unwrap_err();
    assert_eq!(err, MachineError::UnimplementedSyscall(214));
}

#[test]
fn catch_all_syscall_handler_applies() {
    let image = build_elf64(&[rv::addi(17, 0, 214), rv::ecall(), rv::ecall()]);
    let mut machine = Machine64::new(&image, MachineOptions::default()).unwrap();
    machine.set_unknown_syscall_handler(|m: &mut Machine64| {
        m.registers_mut().set(10, 7);
        m.stop();
        Ok(())
    });
    machine.run(100).unwrap();
    assert_eq!(machine.return_value(), 7);
}

#[test]
fn illegal_instruction_faults_with_the_word() {
    // An all-ones word is not a valid encoding.
    let image = build_elf64(&[0xffff_ffff, rv::ecall()]);
    let mut machine = Machine64::new(&image, MachineOptions::default()).unwrap();
    let err = machine.run(100).unwrap_err();
    assert_eq!(err, MachineError::IllegalOperation(0xffff_ffff));
    // Nothing retired.
    assert_eq!(machine.instruction_counter(), 0);
}

#[test]
fn jump_to_non_executable_memory_faults() {
    let probe = Machine64::new(&build_elf64(&[rv::ecall()]), MachineOptions::default()).unwrap();
    let heap = probe.memory.heap_address();

    // jalr x0, t1, 0 with t1 pointing at the (non-executable) heap.
    let image = build_elf64(&[
        rv::lui(6, (heap >> 12) as u32),
        rv::jalr(0, 6, 0),
    ]);
    let mut machine = Machine64::new(&image, MachineOptions::default()).unwrap();
    let err = machine.run(100).unwrap_err();
    assert_eq!(err, MachineError::ExecutionSpaceProtectionFault(heap));
}

// Without the C extension the jump alignment is 4 bytes, so a target
// with bit 1 set faults instead of decoding parcels.
#[cfg(not(feature = "compressed"))]
#[test]
fn misaligned_jump_target_faults() {
    let image = build_elf64(&[
        rv::lui(6, (CODE_VADDR >> 12) as u32),
        rv::jalr(0, 6, 2),
    ]);
    let mut machine = Machine64::new(&image, MachineOptions::default()).unwrap();
    let err = machine.run(100).unwrap_err();
    assert_eq!(err, MachineError::MisalignedInstruction(CODE_VADDR + 2));
}

#[test]
fn vmcall_invokes_a_guest_function() {
    // entry: ecall (stop). function at +4: addi a0, a0, 7; ret
    let image = build_elf64(&[rv::ecall(), rv::addi(10, 10, 7), rv::ret()]);
    let mut machine = Machine64::new(&image, MachineOptions::default()).unwrap();
    bind_exit(&mut machine);
    machine.run(10).unwrap();

    let result = machine.vmcall(CODE_VADDR + 4, &[35], 1_000).unwrap();
    assert_eq!(result, 42);
}

#[test]
fn guest_start_protocol_is_on_the_stack() {
    let image = build_elf64(&[rv::ecall()]);
    let options = MachineOptions {
        argv: vec!["prog".into(), "arg1".into()],
        envp: vec!["KEY=value".into()],
        ..MachineOptions::default()
    };
    let mut machine = Machine64::new(&image, options).unwrap();
    let sp = machine.registers().reg(riscv_vm::Register::SP);
    assert_eq!(sp % 16, 0);
    // argc
    assert_eq!(machine.memory.read::<u64>(sp).unwrap(), 2);
    // argv[0] and argv[1] point at NUL-terminated strings.
    let argv0 = machine.memory.read::<u64>(sp + 8).unwrap();
    assert_eq!(machine.memory.memstring(argv0, 64).unwrap(), "prog");
    let argv1 = machine.memory.read::<u64>(sp + 16).unwrap();
    assert_eq!(machine.memory.memstring(argv1, 64).unwrap(), "arg1");
    // argv terminator, then envp.
    assert_eq!(machine.memory.read::<u64>(sp + 24).unwrap(), 0);
    let env0 = machine.memory.read::<u64>(sp + 32).unwrap();
    assert_eq!(machine.memory.memstring(env0, 64).unwrap(), "KEY=value");
    assert_eq!(machine.memory.read::<u64>(sp + 40).unwrap(), 0);
}

#[cfg(feature = "compressed")]
#[test]
fn compressed_instructions_execute_and_count() {
    // c.li a0, 21; c.addi a0, 21; ecall
    let c_li: u16 = 0b010_0_01010_10101_01;
    let c_addi: u16 = 0b000_0_01010_10101_01;
    let mut code = Vec::new();
    code.extend_from_slice(&c_li.to_le_bytes());
    code.extend_from_slice(&c_addi.to_le_bytes());
    code.extend_from_slice(&rv::ecall().to_le_bytes());
    let image = common::build_elf64_bytes(&code);

    let mut machine = Machine64::new(&image, MachineOptions::default()).unwrap();
    bind_exit(&mut machine);
    machine.run(100).unwrap();
    assert_eq!(machine.return_value(), 42);
    assert_eq!(machine.instruction_counter(), 3);
    // The ecall PC advanced by 2+2, then 4.
    assert_eq!(machine.registers().pc, CODE_VADDR + 8);
}

#[test]
fn rv32_wraps_at_32_bits() {
    // lui t0, 0x80000 (t0 = i32::MIN); addi t0, t0, -1 wraps to i32::MAX;
    // add a0, t0, x0; ecall
    let image = build_elf32(&[
        rv::lui(5, 0x8_0000),
        rv::addi(5, 5, -1),
        rv::add(10, 5, 0),
        rv::ecall(),
    ]);
    let mut machine = Machine32::new(&image, MachineOptions::default()).unwrap();
    bind_exit(&mut machine);
    machine.run(100).unwrap();
    assert_eq!(machine.return_value(), 0x7fff_ffff);
}
