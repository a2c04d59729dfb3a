//! Thread-private state for section execution.
//!
//! Everything in this module belongs to exactly one thread and needs no
//! synchronization: the per-thread runtime flags, and the register checkpoint slots
//! written at section entry and consumed at the phase boundary.

use strum::{EnumCount, IntoEnumIterator};

use crate::{
    engine::{MachineContext, Register, RegisterMask},
    Error, Result,
};

/// Identity of an application thread, assigned by the host engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub u64);

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "thread-{}", self.0)
    }
}

/// Per-thread runtime flags for the protection mechanism.
///
/// `active` is non-none exactly while the thread executes the native (second) phase
/// of some section instance; it holds the region identity for lookup only and never
/// frees the record it leads to.
#[derive(Debug)]
pub struct ThreadRuntimeState {
    /// Identity of the owning thread.
    pub id: ThreadId,
    /// Whether this thread has a kernel-level descriptor registration.
    pub registered: bool,
    /// The region whose native phase this thread is currently inside, if any.
    pub active: Option<crate::manager::RegionId>,
}

impl ThreadRuntimeState {
    /// Create the runtime state for a thread that has not registered yet.
    #[must_use]
    pub fn new(id: ThreadId) -> Self {
        ThreadRuntimeState {
            id,
            registered: false,
            active: None,
        }
    }

    /// Returns `true` while the thread is inside the native phase of a section.
    #[must_use]
    pub fn in_native_phase(&self) -> bool {
        self.active.is_some()
    }
}

/// Saved register values for one section entry, reused across entries.
///
/// Slots are written at section entry for every general-purpose register the section
/// body writes, and consumed exactly once immediately before the native phase is
/// entered. After consumption they are stale until the next capture; consuming stale
/// slots is an error, never a silent reuse.
///
/// # Examples
///
/// ```rust,ignore
/// let mut slots = RegisterCheckpointSlots::new();
/// slots.capture(&machine, written_registers);
/// // ... first phase runs, clobbering the written registers ...
/// slots.consume_into(&mut machine)?;   // restores pre-entry values
/// ```
#[derive(Debug)]
pub struct RegisterCheckpointSlots {
    values: [u64; Register::COUNT],
    mask: RegisterMask,
    stale: bool,
}

impl Default for RegisterCheckpointSlots {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterCheckpointSlots {
    /// Create empty, stale slots.
    #[must_use]
    pub fn new() -> Self {
        RegisterCheckpointSlots {
            values: [0; Register::COUNT],
            mask: RegisterMask::EMPTY,
            stale: true,
        }
    }

    /// Capture the current values of the given registers from machine state.
    ///
    /// ## Arguments
    /// * 'machine' - The thread's machine context
    /// * 'mask'    - The registers the section body writes
    pub fn capture(&mut self, machine: &dyn MachineContext, mask: RegisterMask) {
        for register in Register::iter() {
            if mask.contains(register) {
                self.values[register.index()] = machine.register(register);
            }
        }

        self.mask = mask;
        self.stale = false;
    }

    /// Restore the captured values into machine state and mark the slots stale.
    ///
    /// ## Arguments
    /// * 'machine' - The thread's machine context
    ///
    /// # Errors
    /// Returns [`crate::Error::StaleCheckpoint`] if the slots were already consumed
    /// or never captured.
    pub fn consume_into(&mut self, machine: &mut dyn MachineContext) -> Result<()> {
        if self.stale {
            return Err(Error::StaleCheckpoint);
        }

        machine.restore_registers(self);
        self.stale = true;
        Ok(())
    }

    /// Returns `true` if the slots have been consumed or never captured.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    /// The registers covered by the current capture.
    #[must_use]
    pub fn mask(&self) -> RegisterMask {
        self.mask
    }

    /// Iterate the captured `(register, value)` pairs in canonical order.
    pub fn entries(&self) -> impl Iterator<Item = (Register, u64)> + '_ {
        self.mask
            .iter()
            .map(move |register| (register, self.values[register.index()]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct MockMachine {
        registers: HashMap<Register, u64>,
        slot: u64,
    }

    impl MachineContext for MockMachine {
        fn register(&self, register: Register) -> u64 {
            self.registers.get(&register).copied().unwrap_or(0)
        }

        fn set_register(&mut self, register: Register, value: u64) {
            self.registers.insert(register, value);
        }

        fn write_descriptor_slot(&mut self, _offset: u64, value: u64) {
            self.slot = value;
        }

        fn read_descriptor_slot(&self, _offset: u64) -> u64 {
            self.slot
        }
    }

    #[test]
    fn capture_restore_cycle() {
        let mut machine = MockMachine::default();
        machine.set_register(Register::R2, 0xAA);
        machine.set_register(Register::R5, 0xBB);

        let mut slots = RegisterCheckpointSlots::new();
        slots.capture(&machine, RegisterMask::of(&[Register::R2, Register::R5]));

        // First phase clobbers the registers.
        machine.set_register(Register::R2, 1);
        machine.set_register(Register::R5, 2);

        slots.consume_into(&mut machine).unwrap();
        assert_eq!(machine.register(Register::R2), 0xAA);
        assert_eq!(machine.register(Register::R5), 0xBB);
        assert!(slots.is_stale());
    }

    #[test]
    fn double_consume_rejected() {
        let mut machine = MockMachine::default();
        let mut slots = RegisterCheckpointSlots::new();
        slots.capture(&machine, RegisterMask::of(&[Register::R0]));

        slots.consume_into(&mut machine).unwrap();
        assert!(matches!(
            slots.consume_into(&mut machine),
            Err(Error::StaleCheckpoint)
        ));
    }

    #[test]
    fn never_captured_is_stale() {
        let mut machine = MockMachine::default();
        let mut slots = RegisterCheckpointSlots::new();

        assert!(matches!(
            slots.consume_into(&mut machine),
            Err(Error::StaleCheckpoint)
        ));
    }

    #[test]
    fn recapture_after_consume() {
        let mut machine = MockMachine::default();
        machine.set_register(Register::R1, 7);

        let mut slots = RegisterCheckpointSlots::new();
        slots.capture(&machine, RegisterMask::of(&[Register::R1]));
        slots.consume_into(&mut machine).unwrap();

        machine.set_register(Register::R1, 9);
        slots.capture(&machine, RegisterMask::of(&[Register::R1]));
        machine.set_register(Register::R1, 0);
        slots.consume_into(&mut machine).unwrap();

        assert_eq!(machine.register(Register::R1), 9);
    }
}
