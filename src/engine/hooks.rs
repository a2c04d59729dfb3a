//! Seams between this subsystem and the host rewriting engine.
//!
//! Everything this crate needs from its host is expressed through the traits in this
//! module: client instrumentation applied during the first phase, and the per-thread
//! machine state accessed at the phase boundary. The host implements these against its
//! real code cache and thread structures; the test suite implements them against an
//! in-memory mock.

use crate::{
    engine::instruction::{Instruction, Register},
    thread::RegisterCheckpointSlots,
};

/// An instrumentation operation inserted by the client around an application instruction.
///
/// Opaque to this subsystem apart from its encoded size, which participates in
/// address resolution when the region is patched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOp {
    /// Label for the instrumentation operation, chosen by the client.
    pub mnemonic: &'static str,
    /// Original address of the application instruction this op observes.
    pub address: u64,
    /// Encoded size of the instrumentation in bytes.
    pub size: u64,
}

/// Client instrumentation applied to each application instruction in the first phase.
///
/// The instrumenter sees every instruction of a section body *before* store elision:
/// an elided store has been observed by instrumentation even though its write never
/// reaches memory in the first phase.
pub trait Instrumenter {
    /// Produce the instrumentation to insert ahead of the given instruction.
    ///
    /// ## Arguments
    /// * 'instruction' - The application instruction about to be compiled
    fn instrument(&self, instruction: &Instruction) -> Vec<ClientOp>;
}

/// Instrumenter that inserts nothing.
///
/// The store-elision scheme is applied regardless; sections compiled with this
/// instrumenter still execute their body twice.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoInstrumentation;

impl Instrumenter for NoInstrumentation {
    fn instrument(&self, _instruction: &Instruction) -> Vec<ClientOp> {
        Vec::new()
    }
}

/// Per-thread machine state, as seen from the host engine.
///
/// The registration manager goes through this trait for the two machine-visible actions
/// of the phase boundary: writing the thread's kernel descriptor-pointer slot, and
/// restoring checkpointed registers into machine state.
pub trait MachineContext {
    /// Read the current value of a general-purpose register.
    fn register(&self, register: Register) -> u64;

    /// Set a general-purpose register to a value.
    fn set_register(&mut self, register: Register, value: u64);

    /// Write the thread's kernel descriptor-pointer slot at the resolved storage offset.
    ///
    /// ## Arguments
    /// * 'offset' - The process-wide descriptor storage offset
    /// * 'value'  - The record address to publish, or zero to clear
    fn write_descriptor_slot(&mut self, offset: u64, value: u64);

    /// Read the thread's kernel descriptor-pointer slot.
    ///
    /// ## Arguments
    /// * 'offset' - The process-wide descriptor storage offset
    fn read_descriptor_slot(&self, offset: u64) -> u64;

    /// Restore every checkpointed register into machine state.
    ///
    /// Provided for convenience; the default implementation walks the checkpoint
    /// mask and calls [`MachineContext::set_register`] per register.
    ///
    /// ## Arguments
    /// * 'slots' - The checkpoint to restore from
    fn restore_registers(&mut self, slots: &RegisterCheckpointSlots) {
        for (register, value) in slots.entries() {
            self.set_register(register, value);
        }
    }
}
