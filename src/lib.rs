//! A user-mode RISC-V emulator.
//!
//! The crate loads a statically or dynamically linked RISC-V ELF binary
//! (ELF32 or ELF64) and interprets it against a virtualized, paged,
//! copy-on-write memory model. Execution is bounded by an instruction
//! budget and can be observed and steered through system-call and
//! memory-trap callbacks.
//!
//! The address width is a const generic parameter measured in bytes:
//! [`Machine<4>`](Machine) emulates RV32, [`Machine<8>`](Machine) RV64.
//!
//! ```no_run
//! use riscv_vm::{Machine64, MachineOptions};
//!
//! let binary = std::fs::read("guest.elf").unwrap();
//! let mut machine = Machine64::new(&binary, MachineOptions::default()).unwrap();
//! machine.set_syscall_handler(93, |m: &mut Machine64| {
//!     m.stop();
//!     Ok(())
//! });
//! machine.run(1_000_000).unwrap();
//! println!("guest exited with {}", machine.return_value());
//! ```

pub mod cpu;
pub mod elf;
pub mod error;
pub mod machine;
pub mod memory;

pub use cpu::registers::{Register, Registers};
pub use error::MachineError;
pub use machine::{Machine, Machine32, Machine64, MachineOptions, Syscall};
pub use memory::page::{PageAttributes, TrapKind};
pub use memory::Memory;

/// Address width tag for RV32 machines, in bytes.
pub const RV32: usize = 4;
/// Address width tag for RV64 machines, in bytes.
pub const RV64: usize = 8;
