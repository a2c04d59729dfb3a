//! # rseqgate Prelude
//!
//! This module provides a convenient prelude for the most commonly used types and
//! traits from the rseqgate library. Import this module to get quick access to the
//! essential types for running restartable sequences under binary rewriting.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all rseqgate operations
pub use crate::Error;

/// The result type used throughout rseqgate
pub use crate::Result;

/// Process-wide configuration for critical-section handling
pub use crate::RseqConfig;

// ================================================================================================
// Main Entry Points
// ================================================================================================

/// Process-wide state of the protection mechanism
pub use crate::RseqRuntime;

/// Low-level file parsing utilities
pub use crate::{File, Parser};

// ================================================================================================
// Section Discovery
// ================================================================================================

/// Section boundaries and their registry
pub use crate::registry::{
    DescriptorFlags, SectionDescriptor, SequenceRegistry, DESCRIPTOR_SIZE, DESCRIPTOR_VERSION,
};

// ================================================================================================
// Host Engine Interface
// ================================================================================================

/// The instruction model and host seams
pub use crate::engine::{
    BasicBlock, ClientOp, EffectFlags, FlowType, Instruction, Instrumenter, MachineContext,
    NoInstrumentation, Operand, Register, RegisterMask,
};

// ================================================================================================
// The Two-Phase Pipeline
// ================================================================================================

/// First-phase compilation
pub use crate::compiler::{CompiledSection, FirstPhaseCompiler};

/// Second-phase emission
pub use crate::emitter::{EmittedOp, EmittedRegion, EncodingWidth, SecondPhaseEmitter};

/// Post-emission patching
pub use crate::patch::PatchController;

// ================================================================================================
// Lifetime and Thread State
// ================================================================================================

/// Record ownership and the phase boundary
pub use crate::manager::{CriticalSectionRecord, RegionId, RegistrationManager};

/// The per-thread section state machine
pub use crate::execution::{SectionExecution, SectionPhase};

/// Thread-private state
pub use crate::thread::{RegisterCheckpointSlots, ThreadId, ThreadRuntimeState};

/// The process-wide accept/reject policy
pub use crate::fallback::{FallbackController, FallbackReason, RegistrationOutcome};

/// Storage-offset resolution
pub use crate::locator::{ThreadLocator, TrialOutcome, TrialRegistration};
