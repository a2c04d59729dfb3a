//! The per-thread section-instance state machine.
//!
//! Each thread progresses through its own instance of a section independently:
//! `Outside → FirstPhase → CommitReached → SecondPhase → {Completed | Aborted}`.
//! The two-phase replay is modeled as this explicit machine (a distinct,
//! explicitly entered and explicitly exited state per phase) rather than as
//! control-flow tricks; there are no recursive re-entries anywhere in the scheme.
//!
//! No instance state is shared across threads. The machine owns the ordering
//! guarantees of one instance: the register checkpoint is captured at entry, the
//! first phase completes for all blocks before the second begins, and the
//! checkpoint restore happens atomically with the transfer into the second phase
//! (inside [`crate::manager::RegistrationManager::enter_second_phase`]).
//!
//! An externally delivered abort, the kernel redirecting the thread into the
//! region's trampoline, may preempt the second phase at any point. Handling it
//! clears the thread's descriptor pointer and hands control to the application's
//! abort handler, still under host-engine control. There is no user-initiated
//! cancellation; only kernel abort delivery ends an instance early.

use std::sync::Arc;

use crate::{
    emitter::EmittedRegion,
    engine::MachineContext,
    manager::{CriticalSectionRecord, RegionId, RegistrationManager},
    registry::SectionDescriptor,
    thread::{RegisterCheckpointSlots, ThreadRuntimeState},
    Error, Result,
};

/// The states of one section instance on one thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionPhase {
    /// Not inside any section.
    Outside,
    /// Executing the instrumented, store-elided pass.
    FirstPhase,
    /// The instrumented pass has reached the commit point; the native pass has
    /// not started.
    CommitReached,
    /// Executing the native registered pass.
    SecondPhase,
    /// The instance ran to its commit instruction natively.
    Completed,
    /// The kernel aborted the native pass and the abort handler took over.
    Aborted,
}

impl SectionPhase {
    /// Returns `true` for the two terminal states.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, SectionPhase::Completed | SectionPhase::Aborted)
    }
}

/// One thread's execution of one section instance.
///
/// Drives the transitions and delegates the machine-visible work of each boundary
/// to the [`RegistrationManager`].
#[derive(Debug)]
pub struct SectionExecution {
    region: RegionId,
    descriptor: Arc<SectionDescriptor>,
    phase: SectionPhase,
}

impl SectionExecution {
    /// Enter a section: capture the register checkpoint and start the first phase.
    ///
    /// The checkpoint covers every register the section body writes, using the
    /// pre-entry values: the state the native pass (and any abort handler the
    /// kernel redirects to) must observe, since the first phase's stores were
    /// elided rather than performed.
    ///
    /// ## Arguments
    /// * 'region'  - The section-ending region this instance will run
    /// * 'slots'   - The thread's checkpoint slots
    /// * 'machine' - The thread's machine context
    #[must_use]
    pub fn begin(
        region: &EmittedRegion,
        slots: &mut RegisterCheckpointSlots,
        machine: &dyn MachineContext,
    ) -> Self {
        slots.capture(machine, region.written_registers);

        SectionExecution {
            region: region.region,
            descriptor: Arc::clone(&region.descriptor),
            phase: SectionPhase::FirstPhase,
        }
    }

    /// Current phase of this instance.
    #[must_use]
    pub fn phase(&self) -> SectionPhase {
        self.phase
    }

    /// The region this instance runs.
    #[must_use]
    pub fn region(&self) -> RegionId {
        self.region
    }

    /// The section's boundaries.
    #[must_use]
    pub fn descriptor(&self) -> &Arc<SectionDescriptor> {
        &self.descriptor
    }

    /// Mark the instrumented pass complete: the commit point has been reached.
    ///
    /// # Errors
    /// Returns [`crate::Error::Error`] unless the instance is in the first phase.
    pub fn reach_commit(&mut self) -> Result<()> {
        if self.phase != SectionPhase::FirstPhase {
            return Err(self.transition_error("reach_commit"));
        }

        self.phase = SectionPhase::CommitReached;
        Ok(())
    }

    /// Cross the phase boundary into the native registered pass.
    ///
    /// Restores the entry checkpoint and publishes the registration through the
    /// manager; on success the thread is inside the second phase and its
    /// descriptor-pointer slot references the region's record.
    ///
    /// ## Arguments
    /// * 'manager'     - The process's registration manager
    /// * 'thread'      - The calling thread's runtime state
    /// * 'slots'       - The checkpoint captured at entry
    /// * 'machine'     - The thread's machine context
    /// * 'slot_offset' - The resolved descriptor storage offset
    ///
    /// # Errors
    /// Returns [`crate::Error::Error`] unless the commit point has been reached,
    /// plus anything [`RegistrationManager::enter_second_phase`] reports; the
    /// instance stays at the boundary on failure.
    pub fn enter_native(
        &mut self,
        manager: &RegistrationManager,
        thread: &mut ThreadRuntimeState,
        slots: &mut RegisterCheckpointSlots,
        machine: &mut dyn MachineContext,
        slot_offset: u64,
    ) -> Result<Arc<CriticalSectionRecord>> {
        if self.phase != SectionPhase::CommitReached {
            return Err(self.transition_error("enter_native"));
        }

        let record =
            manager.enter_second_phase(thread, slots, machine, slot_offset, self.region)?;
        self.phase = SectionPhase::SecondPhase;
        Ok(record)
    }

    /// Finish the native pass at its commit instruction.
    ///
    /// ## Arguments
    /// * 'manager'     - The process's registration manager
    /// * 'thread'      - The calling thread's runtime state
    /// * 'machine'     - The thread's machine context
    /// * 'slot_offset' - The resolved descriptor storage offset
    ///
    /// # Errors
    /// Returns [`crate::Error::Error`] unless the instance is in the second phase.
    pub fn complete(
        &mut self,
        manager: &RegistrationManager,
        thread: &mut ThreadRuntimeState,
        machine: &mut dyn MachineContext,
        slot_offset: u64,
    ) -> Result<()> {
        if self.phase != SectionPhase::SecondPhase {
            return Err(self.transition_error("complete"));
        }

        manager.clear(thread, machine, slot_offset);
        self.phase = SectionPhase::Completed;
        Ok(())
    }

    /// Handle a kernel-delivered abort: the thread arrived at the trampoline.
    ///
    /// Clears the registration and returns the application abort handler's
    /// original address, which the host engine continues execution at, under its
    /// own control, through the trampoline's transfer.
    ///
    /// ## Arguments
    /// * 'manager'     - The process's registration manager
    /// * 'thread'      - The calling thread's runtime state
    /// * 'machine'     - The thread's machine context
    /// * 'slot_offset' - The resolved descriptor storage offset
    ///
    /// # Errors
    /// Returns [`crate::Error::Error`] unless the instance is in the second phase;
    /// the kernel only redirects threads whose registration is live.
    pub fn abort(
        &mut self,
        manager: &RegistrationManager,
        thread: &mut ThreadRuntimeState,
        machine: &mut dyn MachineContext,
        slot_offset: u64,
    ) -> Result<u64> {
        if self.phase != SectionPhase::SecondPhase {
            return Err(self.transition_error("abort"));
        }

        manager.clear(thread, machine, slot_offset);
        self.phase = SectionPhase::Aborted;
        Ok(self.descriptor.abort)
    }

    fn transition_error(&self, operation: &str) -> Error {
        Error::Error(format!(
            "{} invalid in phase {:?} for {}",
            operation, self.phase, self.region
        ))
    }
}
