//! Operations of an emitted section-ending region.
//!
//! Generated code is modeled as a stream of [`EmittedOp`] values. The host engine's
//! encoder lowers each op into machine bytes; this subsystem only needs the op kinds
//! and their encoded sizes, which are fixed by the engine's encoding conventions and
//! participate in address resolution when the region is patched.

use crate::engine::{ClientOp, Instruction};

/// Encoded width of the record-address placeholder load.
///
/// The load materializes the critical-section record's address for the descriptor
/// slot write at the phase boundary. Which encoding fits depends on how far the
/// record lives from the load site in the code cache, a distance that is only known
/// at patch time, and that differs per region *instance*. The chosen width is
/// recorded with the region so any address-independent recreation of the region
/// reproduces the same choice instead of re-deriving it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodingWidth {
    /// Single instruction-pointer-relative load; the record is within reach.
    Single,
    /// Padded two-instruction absolute-immediate pair for out-of-reach records.
    Padded,
}

/// Bytes reserved for the record-address load, sized for the widest encoding.
///
/// The slot size never changes when the load is patched: the single-instruction
/// form fills the remainder with padding, so every address behind the load stays
/// where the emission pass placed it.
pub const RECORD_LOAD_SLOT: u64 = 14;

impl EncodingWidth {
    /// Length in bytes of the load sequence itself, excluding slot padding.
    #[must_use]
    pub fn encoded_size(self) -> u64 {
        match self {
            EncodingWidth::Single => 7,
            EncodingWidth::Padded => 14,
        }
    }

    /// Select the width for a load site and record address pair.
    ///
    /// ## Arguments
    /// * 'load_site' - Cache address of the placeholder load
    /// * 'record'    - Address of the critical-section record
    #[must_use]
    pub fn for_distance(load_site: u64, record: u64) -> Self {
        let distance = load_site.abs_diff(record);
        if distance <= i32::MAX as u64 {
            EncodingWidth::Single
        } else {
            EncodingWidth::Padded
        }
    }
}

/// Address-independence transformation applied to a natively re-emitted instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mangling {
    /// The instruction was copied unchanged.
    None,
    /// An instruction-pointer-relative memory operand was resolved to its absolute
    /// original address.
    AbsolutizedPcRelative,
    /// A segment-based memory operand was rewritten against the thread storage base.
    SegmentLowered,
}

/// One operation of a generated section-ending region.
///
/// The region layout, in op order, is: the instrumented (store-elided) commit block,
/// the record-address load and phase barrier, the uninstrumented native copy of the
/// full section body, and the abort trampoline with its embedded handler address.
#[derive(Debug, Clone, PartialEq)]
pub enum EmittedOp {
    /// A translated application instruction of the instrumented first phase.
    App(Instruction),

    /// Client instrumentation inserted ahead of an application instruction.
    Client(ClientOp),

    /// An uninstrumented copy of an original instruction in the native body.
    NativeApp {
        /// The re-derived instruction, with position-dependent operands resolved.
        instruction: Instruction,
        /// The address-independence transformation that was applied.
        mangling: Mangling,
        /// Marks a branch whose target stays inside this copy, so the region
        /// builder does not treat it as a region exit requiring re-entry into
        /// the compiler.
        intra_copy: bool,
    },

    /// Immediate load of the critical-section record's address.
    ///
    /// Emitted with a zero placeholder and the maximum-width reservation; the patch
    /// step rewrites both fields once the record exists and the region's cache
    /// address is known.
    RecordAddressLoad {
        /// Encoding chosen for this region instance.
        width: EncodingWidth,
        /// The record address, or zero before patching.
        address: u64,
    },

    /// The application state barrier at the phase boundary.
    ///
    /// Lowered by the engine to a call that restores the thread's checkpointed
    /// registers and publishes the record through the descriptor slot, with nothing
    /// executing between the restore and entry into the native copy.
    PhaseBarrier,

    /// The application abort-handler address, carried as inert data immediately
    /// preceding the trampoline entry.
    ///
    /// Encoded as the 8-byte immediate operand of a no-effect instruction so a
    /// code-consuming fragment decoder walks over it safely.
    InertHandlerAddress {
        /// Original address of the application's abort handler.
        handler: u64,
    },

    /// Abort trampoline entry, reachable only through kernel-driven redirection.
    ///
    /// Transfers control to the application's abort handler while keeping the
    /// region under the host engine's control.
    TrampolineEntry {
        /// Original address of the application's abort handler.
        handler: u64,
    },
}

impl EmittedOp {
    /// Encoded size of this op in bytes, under the engine's encoding conventions.
    #[must_use]
    pub fn encoded_size(&self) -> u64 {
        match self {
            EmittedOp::App(instruction) => instruction.size,
            EmittedOp::Client(op) => op.size,
            EmittedOp::NativeApp { instruction, .. } => instruction.size,
            EmittedOp::RecordAddressLoad { .. } => RECORD_LOAD_SLOT,
            EmittedOp::PhaseBarrier => 5,
            EmittedOp::InertHandlerAddress { .. } => 10,
            EmittedOp::TrampolineEntry { .. } => 5,
        }
    }
}
