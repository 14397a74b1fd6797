//! System-call dispatch: a trait-object map keyed by the guest's a7
//! register, with an optional catch-all handler.

use std::sync::Arc;

use hashbrown::HashMap;
use nohash_hasher::BuildNoHashHasher;

use crate::error::MachineError;
use crate::machine::Machine;

/// A system call implementation, invoked on ECALL with the matching
/// number in a7.
///
/// Handlers read their arguments from registers a0..a6, write results
/// back (conventionally a0), and may call
/// [`Machine::stop`] or raise any [`MachineError`]. The program counter
/// already points past the ECALL when the handler runs; a handler may
/// redirect it.
pub trait Syscall<const W: usize>: Send + Sync {
    fn emulate(&self, machine: &mut Machine<W>) -> Result<(), MachineError>;
}

impl<const W: usize, F> Syscall<W> for F
where
    F: Fn(&mut Machine<W>) -> Result<(), MachineError> + Send + Sync,
{
    fn emulate(&self, machine: &mut Machine<W>) -> Result<(), MachineError> {
        self(machine)
    }
}

/// The per-machine syscall table. Forks share handler instances.
pub(crate) struct SyscallMap<const W: usize> {
    handlers: HashMap<u64, Arc<dyn Syscall<W>>, BuildNoHashHasher<u64>>,
    fallback: Option<Arc<dyn Syscall<W>>>,
}

impl<const W: usize> SyscallMap<W> {
    pub(crate) fn new() -> Self {
        Self {
            handlers: HashMap::default(),
            fallback: None,
        }
    }

    pub(crate) fn insert(&mut self, number: u64, handler: Arc<dyn Syscall<W>>) {
        self.handlers.insert(number, handler);
    }

    pub(crate) fn set_fallback(&mut self, handler: Arc<dyn Syscall<W>>) {
        self.fallback = Some(handler);
    }

    /// The handler bound to `number`, or the catch-all.
    pub(crate) fn lookup(&self, number: u64) -> Option<Arc<dyn Syscall<W>>> {
        self.handlers
            .get(&number)
            .or(self.fallback.as_ref())
            .cloned()
    }
}

impl<const W: usize> Clone for SyscallMap<W> {
    fn clone(&self) -> Self {
        Self {
            handlers: self.handlers.clone(),
            fallback: self.fallback.clone(),
        }
    }
}

impl<const W: usize> Default for SyscallMap<W> {
    fn default() -> Self {
        Self::new()
    }
}
