//! Error taxonomy shared by the loader, the memory subsystem and the
//! interpreter.

use thiserror::Error;

/// Errors raised while loading or emulating a guest program.
///
/// [`Timeout`](MachineError::Timeout) and
/// [`Stopped`](MachineError::Stopped) unwind the execute loop like any
/// other variant, but [`Machine::run`](crate::Machine::run) treats them
/// as successful completion.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineError {
    /// The binary is not a loadable RISC-V ELF of the machine's width.
    #[error("invalid program: {0}")]
    InvalidProgram(&'static str),

    /// A load or store violated the page attributes at the given address.
    #[error("memory protection fault at 0x{0:x}")]
    ProtectionFault(u64),

    /// Attempted to execute from a page without execute permission.
    #[error("execution space protection fault at 0x{0:x}")]
    ExecutionSpaceProtectionFault(u64),

    /// A jump target was not aligned to the instruction alignment.
    #[error("misaligned instruction at 0x{0:x}")]
    MisalignedInstruction(u64),

    /// A naturally-aligned access was required but not given.
    #[error("misaligned memory access at 0x{0:x}")]
    MisalignedMemory(u64),

    /// An invalid opcode, or an illegal CSR access.
    #[error("illegal operation: instruction 0x{0:08x}")]
    IllegalOperation(u32),

    /// ECALL with no handler bound for the number in a7.
    #[error("unimplemented system call {0}")]
    UnimplementedSyscall(u64),

    /// The guest exceeded the configured memory limit.
    #[error("out of guest memory")]
    OutOfMemory,

    /// The instruction budget was exhausted.
    #[error("instruction budget exhausted")]
    Timeout,

    /// Execution was stopped cooperatively via `stop()`.
    #[error("stopped")]
    Stopped,

    /// A gather operation was given too few output buffers.
    #[error("insufficient buffer capacity for memory range")]
    InsufficientBuffers,
}

impl MachineError {
    /// Short static message for the error kind, independent of context.
    pub const fn description(&self) -> &'static str {
        match self {
            MachineError::InvalidProgram(_) => "Invalid program",
            MachineError::ProtectionFault(_) => "Protection fault",
            MachineError::ExecutionSpaceProtectionFault(_) => {
                "Execution space protection fault"
            }
            MachineError::MisalignedInstruction(_) => "Misaligned instruction",
            MachineError::MisalignedMemory(_) => "Misaligned memory access",
            MachineError::IllegalOperation(_) => "Illegal operation",
            MachineError::UnimplementedSyscall(_) => "Unimplemented system call",
            MachineError::OutOfMemory => "Out of memory",
            MachineError::Timeout => "Machine timed out",
            MachineError::Stopped => "Machine stopped",
            MachineError::InsufficientBuffers => "Insufficient buffers",
        }
    }

    /// Context-specific datum: the faulting address, the offending
    /// instruction word, or the unhandled syscall number.
    pub const fn data(&self) -> u64 {
        match self {
            MachineError::ProtectionFault(addr)
            | MachineError::ExecutionSpaceProtectionFault(addr)
            | MachineError::MisalignedInstruction(addr)
            | MachineError::MisalignedMemory(addr) => *addr,
            MachineError::IllegalOperation(word) => *word as u64,
            MachineError::UnimplementedSyscall(number) => *number,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_word_carries_context() {
        assert_eq!(MachineError::ProtectionFault(0x1234).data(), 0x1234);
        assert_eq!(MachineError::IllegalOperation(0xdead_beef).data(), 0xdead_beef);
        assert_eq!(MachineError::UnimplementedSyscall(214).data(), 214);
        assert_eq!(MachineError::OutOfMemory.data(), 0);
    }

    #[test]
    fn descriptions_are_stable() {
        assert_eq!(
            MachineError::ProtectionFault(0).description(),
            "Protection fault"
        );
        assert_eq!(MachineError::Stopped.description(), "Machine stopped");
    }
}
