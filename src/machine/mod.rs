//! The machine: one CPU plus one memory, the syscall table and the
//! public run/stop/vmcall/fork surface.

mod execute;
mod serialize;
pub mod syscall;

use std::sync::Arc;

use crate::cpu::exec_segment::DecodedEntry;
use crate::cpu::registers::{Register, Registers};
use crate::cpu::Cpu;
use crate::elf::load_binary;
use crate::error::MachineError;
use crate::memory::page::{TrapKind, PAGE_SIZE};
use crate::memory::Memory;
use syscall::SyscallMap;

pub use serialize::MachineSnapshot;
pub use syscall::Syscall;

/// An RV32 machine.
pub type Machine32 = Machine<4>;
/// An RV64 machine.
pub type Machine64 = Machine<8>;

/// Error callback: receives every error `run` is about to return.
pub type ErrorCallback = Arc<dyn Fn(&MachineError) + Send + Sync>;
/// Stdout callback: receives guest output from user-bound syscalls.
pub type StdoutCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Construction options for a [`Machine`].
#[derive(Clone)]
pub struct MachineOptions {
    /// Upper bound of the guest address space; the stack sits just
    /// below it. Default 64 MiB.
    pub max_memory: u64,
    /// Guest program arguments; `argv[0]` is the program name.
    pub argv: Vec<String>,
    /// Guest environment strings, `KEY=value`.
    pub envp: Vec<String>,
    /// Invoked with every error `run` returns.
    pub on_error: Option<ErrorCallback>,
    /// Available to syscall handlers for guest output.
    pub on_stdout: Option<StdoutCallback>,
}

impl Default for MachineOptions {
    fn default() -> Self {
        Self {
            max_memory: 64 << 20,
            argv: vec!["program".to_string()],
            envp: vec!["LC_ALL=C".to_string()],
            on_error: None,
            on_stdout: None,
        }
    }
}

impl std::fmt::Debug for MachineOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineOptions")
            .field("max_memory", &self.max_memory)
            .field("argv", &self.argv)
            .field("envp", &self.envp)
            .field("on_error", &self.on_error.is_some())
            .field("on_stdout", &self.on_stdout.is_some())
            .finish()
    }
}

/// A user-mode RISC-V machine of width `W` bytes (4 = RV32, 8 = RV64).
pub struct Machine<const W: usize> {
    pub cpu: Cpu<W>,
    pub memory: Memory<W>,
    pub(crate) syscalls: SyscallMap<W>,
    pub(crate) options: MachineOptions,
    stopped: bool,
}

// ELF auxiliary vector tags pushed by the start protocol.
const AT_NULL: u64 = 0;
const AT_PAGESZ: u64 = 6;
const AT_ENTRY: u64 = 9;
const AT_RANDOM: u64 = 25;

impl<const W: usize> Machine<W> {
    /// Loads a RISC-V ELF binary and prepares it for execution: memory
    /// layout, guest stack with argv/envp/auxv, PC at the entry point.
    pub fn new(binary: &[u8], options: MachineOptions) -> Result<Self, MachineError> {
        let image: Arc<[u8]> = Arc::from(binary);
        let mut memory = Memory::<W>::empty(image, options.max_memory);
        load_binary(&mut memory)?;
        let mut machine = Self {
            cpu: Cpu::new(),
            memory,
            syscalls: SyscallMap::new(),
            options,
            stopped: false,
        };
        machine.setup_start_protocol()?;
        machine.cpu.regs.pc = machine.memory.start_address();
        Ok(machine)
    }

    /// Runs until `max_instructions` have retired, `stop` is called, or
    /// a fault unwinds the loop. Budget exhaustion and stops are
    /// successful completions.
    pub fn run(&mut self, max_instructions: u64) -> Result<(), MachineError> {
        self.stopped = false;
        let limit = self.cpu.counter.saturating_add(max_instructions);
        match self.run_loop(limit) {
            Ok(()) | Err(MachineError::Stopped | MachineError::Timeout) => Ok(()),
            Err(err) => {
                if let Some(cb) = &self.options.on_error {
                    cb(&err);
                }
                Err(err)
            }
        }
    }

    fn run_loop(&mut self, limit: u64) -> Result<(), MachineError> {
        while self.cpu.counter < limit {
            if self.stopped {
                return Ok(());
            }
            let entry = self.fetch_decoded()?;
            self.execute_entry(entry)?;
            self.cpu.counter += 1;
        }
        Ok(())
    }

    /// Resolves the decoded entry at the current PC, switching execute
    /// segments as needed.
    #[inline(always)]
    fn fetch_decoded(&mut self) -> Result<DecodedEntry, MachineError> {
        // Execute traps may redirect the PC; bound the re-resolution.
        for _ in 0..64 {
            let pc = self.cpu.regs.pc;
            let generation = self.memory.exec_generation();
            if self.cpu.current_segment_valid(pc, generation) {
                // Current-page fast path: no map lookups on straight-line
                // execution.
                let Some(cached) = &self.cpu.current else {
                    return Err(MachineError::ExecutionSpaceProtectionFault(pc));
                };
                return Ok(cached.seg.entry_at(pc));
            }
            self.change_segment(pc, generation)?;
        }
        Err(MachineError::ExecutionSpaceProtectionFault(self.cpu.regs.pc))
    }

    /// Slow path of instruction fetch: validate the PC, find or build
    /// the covering execute segment, dispatch execute traps.
    fn change_segment(&mut self, pc: u64, generation: u64) -> Result<(), MachineError> {
        if pc == self.memory.exit_address() {
            // Return-to-exit protocol: a jump to the exit address ends
            // the run successfully.
            self.stopped = true;
            return Err(MachineError::Stopped);
        }
        if pc & Cpu::<W>::pc_alignment_mask() != 0 {
            return Err(MachineError::MisalignedInstruction(pc));
        }
        if let Some(cached) = self.cpu.lookup_cached_segment(pc, generation) {
            self.cpu.current = Some(cached);
        } else {
            let seg = self.memory.exec_segment_for(pc)?;
            let generation = self.memory.exec_generation();
            self.cpu.install_segment(seg, generation);
        }

        let page = self.memory.get_page(pc);
        if page.has_trap() {
            if let Some(cb) = page.trap_cb.clone() {
                cb(&mut self.memory, TrapKind::Exec, pc, 0)?;
                if let Some(target) = self.memory.take_pending_jump() {
                    self.cpu.regs.pc = target;
                }
            }
        }
        Ok(())
    }

    /// Pushes argv, envp and the auxiliary vector onto the guest stack
    /// following the ELF start protocol, and points SP at argc.
    fn setup_start_protocol(&mut self) -> Result<(), MachineError> {
        let argv = self.options.argv.clone();
        let envp = self.options.envp.clone();
        let mut sp = self.memory.stack_initial();

        let push_bytes =
            |mem: &mut Memory<W>, sp: &mut u64, bytes: &[u8]| -> Result<u64, MachineError> {
                *sp -= bytes.len() as u64;
                mem.memcpy(*sp, bytes)?;
                Ok(*sp)
            };

        let mut argv_ptrs = Vec::with_capacity(argv.len());
        for arg in &argv {
            let mut bytes = arg.clone().into_bytes();
            bytes.push(0);
            argv_ptrs.push(push_bytes(&mut self.memory, &mut sp, &bytes)?);
        }
        let mut env_ptrs = Vec::with_capacity(envp.len());
        for env in &envp {
            let mut bytes = env.clone().into_bytes();
            bytes.push(0);
            env_ptrs.push(push_bytes(&mut self.memory, &mut sp, &bytes)?);
        }
        // 16 bytes the guest runtime may use as its AT_RANDOM seed.
        let seed: [u8; 16] = *b"riscv-vm-at-rnd\0";
        let random_ptr = push_bytes(&mut self.memory, &mut sp, &seed)?;

        let auxv = [
            (AT_ENTRY, self.memory.start_address()),
            (AT_PAGESZ, PAGE_SIZE as u64),
            (AT_RANDOM, random_ptr),
            (AT_NULL, 0),
        ];
        let word = W as u64;
        let nwords =
            1 + argv_ptrs.len() as u64 + 1 + env_ptrs.len() as u64 + 1 + auxv.len() as u64 * 2;
        let base = (sp - nwords * word) & !15;

        let mut cursor = base;
        let mut push_word = |mem: &mut Memory<W>, value: u64| -> Result<(), MachineError> {
            if W == 4 {
                mem.write::<u32>(cursor, value as u32)?;
            } else {
                mem.write::<u64>(cursor, value)?;
            }
            cursor += word;
            Ok(())
        };
        push_word(&mut self.memory, argv_ptrs.len() as u64)?;
        for ptr in &argv_ptrs {
            push_word(&mut self.memory, *ptr)?;
        }
        push_word(&mut self.memory, 0)?;
        for ptr in &env_ptrs {
            push_word(&mut self.memory, *ptr)?;
        }
        push_word(&mut self.memory, 0)?;
        for (tag, value) in auxv {
            push_word(&mut self.memory, tag)?;
            push_word(&mut self.memory, value)?;
        }

        self.memory.set_stack_initial(base);
        self.cpu.regs.set_reg(Register::SP, base);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Public surface
    // ------------------------------------------------------------------

    /// Signals the execute loop to return after the current instruction.
    /// Callable from syscall and trap handlers.
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    /// The guest's a0 register, the conventional exit/return value.
    pub fn return_value(&self) -> i64 {
        self.cpu.regs.reg(Register::A0) as i64
    }

    /// Number of instructions retired so far.
    pub fn instruction_counter(&self) -> u64 {
        self.cpu.instruction_counter()
    }

    pub fn registers(&self) -> &Registers<W> {
        &self.cpu.regs
    }

    pub fn registers_mut(&mut self) -> &mut Registers<W> {
        &mut self.cpu.regs
    }

    /// Binds a handler to the syscall number matched against a7.
    pub fn set_syscall_handler<S: Syscall<W> + 'static>(&mut self, number: u64, handler: S) {
        self.syscalls.insert(number, Arc::new(handler));
    }

    /// Binds the catch-all handler used when no number matches.
    pub fn set_unknown_syscall_handler<S: Syscall<W> + 'static>(&mut self, handler: S) {
        self.syscalls.set_fallback(Arc::new(handler));
    }

    pub(crate) fn dispatch_syscall(&mut self, number: u64) -> Result<(), MachineError> {
        match self.syscalls.lookup(number) {
            Some(handler) => handler.emulate(self),
            None => {
                tracing::debug!(number, "no handler bound for system call");
                Err(MachineError::UnimplementedSyscall(number))
            }
        }
    }

    /// The stdout callback, for syscall handlers.
    pub fn stdout(&self) -> Option<&StdoutCallback> {
        self.options.on_stdout.as_ref()
    }

    /// Calls a guest function at `addr` with up to 8 integer arguments,
    /// running until it returns (or the budget runs out). Returns a0.
    pub fn vmcall(
        &mut self,
        addr: u64,
        args: &[u64],
        max_instructions: u64,
    ) -> Result<u64, MachineError> {
        let exit = self.memory.exit_address();
        let stack = self.memory.stack_initial();
        let regs = &mut self.cpu.regs;
        regs.set_reg(Register::RA, exit);
        regs.set_reg(Register::SP, stack & !15);
        for (i, arg) in args.iter().take(8).enumerate() {
            regs.set(Register::A0.index() + i, *arg);
        }
        let target = addr & Memory::<W>::ADDR_MASK;
        if target & Cpu::<W>::pc_alignment_mask() != 0 {
            return Err(MachineError::MisalignedInstruction(target));
        }
        regs.pc = target;
        self.run(max_instructions)?;
        Ok(self.cpu.regs.reg(Register::A0))
    }

    /// Forks the machine: the child shares execute segments and page
    /// buffers with the parent, cloning pages on first write on either
    /// side.
    pub fn fork(&mut self) -> Self {
        self.memory.prepare_fork();
        Self {
            cpu: self.cpu.clone(),
            memory: self.memory.fork_clone(),
            syscalls: self.syscalls.clone(),
            options: self.options.clone(),
            stopped: false,
        }
    }
}

impl<const W: usize> std::fmt::Debug for Machine<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("width", &W)
            .field("cpu", &self.cpu)
            .field("stopped", &self.stopped)
            .finish()
    }
}
