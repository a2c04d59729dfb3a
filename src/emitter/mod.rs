//! Second-phase emission: the native replay copy and abort trampoline.
//!
//! When first-phase compilation reaches a section's commit block, this module builds
//! the section-ending region: the instrumented (store-elided) commit block, followed
//! as unconditional fall-through by an *uninstrumented* copy of the entire section
//! body, followed by the abort trampoline. The native copy is re-derived from the
//! original instructions with only the minimal address-independence transformations
//! applied (resolving position-dependent operands and segment references), never
//! client instrumentation.
//!
//! Internal branches within the copy are marked so the region builder does not treat
//! them as ordinary exits requiring re-entry into the compiler. An indirect branch
//! inside the body is rejected here: its target could lie inside the copy, which is
//! unsupported, and rejection routes the section to the process-wide fallback.
//! Rejection drops all partially built emission state with the returned error.
//!
//! The trampoline is reachable only through kernel-driven redirection. Its entry
//! transfers control to the application's abort handler while keeping the region
//! under the host engine's control; the handler address itself is carried as inert
//! data immediately preceding the entry, encoded so a code-consuming fragment
//! decoder skips over it safely.

mod ops;

pub use ops::{EmittedOp, EncodingWidth, Mangling, RECORD_LOAD_SLOT};

use std::sync::Arc;

use tracing::debug;

use crate::{
    compiler::CompiledSection,
    engine::{FlowType, Instruction, Operand, RegisterMask},
    manager::RegionId,
    registry::SectionDescriptor,
    Error, Result,
};

/// Patch results recorded against a region instance.
///
/// Written once by the patch step; consulted by any later address-independent
/// recreation of the region so both representations agree on the placeholder
/// encoding that was used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchInfo {
    /// Cache base address the region was emitted at.
    pub base: u64,
    /// Placeholder encoding chosen for this region instance.
    pub width: EncodingWidth,
    /// Address of the region's critical-section record.
    pub record_address: u64,
}

/// A complete section-ending region, as handed to the code cache.
///
/// Op indices locate the structural points the patch step must resolve: the
/// placeholder record load, the native copy's first op, and the trampoline entry.
#[derive(Debug)]
pub struct EmittedRegion {
    /// Identity of the generated region, assigned by the host engine.
    pub region: RegionId,
    /// The section this region ends.
    pub descriptor: Arc<SectionDescriptor>,
    /// The op stream of the whole region.
    pub ops: Vec<EmittedOp>,
    /// Union of registers the section body writes; sizes the entry checkpoint.
    pub written_registers: RegisterMask,
    record_load: usize,
    native_start: usize,
    inert_data: usize,
    trampoline_entry: usize,
    patch: Option<PatchInfo>,
}

impl EmittedRegion {
    /// Op index of the placeholder record-address load.
    #[must_use]
    pub fn record_load(&self) -> usize {
        self.record_load
    }

    /// Op index of the native copy's first instruction.
    #[must_use]
    pub fn native_start(&self) -> usize {
        self.native_start
    }

    /// Op index of the inert handler-address data.
    #[must_use]
    pub fn inert_data(&self) -> usize {
        self.inert_data
    }

    /// Op index of the trampoline entry.
    #[must_use]
    pub fn trampoline_entry(&self) -> usize {
        self.trampoline_entry
    }

    /// The patch results, once the region has been patched.
    #[must_use]
    pub fn patch_info(&self) -> Option<PatchInfo> {
        self.patch
    }

    pub(crate) fn set_patch_info(&mut self, info: PatchInfo) {
        self.patch = Some(info);
    }

    pub(crate) fn set_record_load(&mut self, width: EncodingWidth, address: u64) {
        self.ops[self.record_load] = EmittedOp::RecordAddressLoad { width, address };
    }

    /// Cache address of the op at `index`, given the region's base address.
    ///
    /// ## Arguments
    /// * 'base'  - Cache address the region starts at
    /// * 'index' - Op index within the region
    #[must_use]
    pub fn op_address(&self, base: u64, index: usize) -> u64 {
        let prefix: u64 = self.ops[..index].iter().map(EmittedOp::encoded_size).sum();
        base + prefix
    }

    /// Encoded size of the native copy in bytes.
    ///
    /// This is the post-commit offset of the kernel contract: the distance from the
    /// native copy's start to the address just past its commit instruction.
    #[must_use]
    pub fn native_copy_size(&self) -> u64 {
        self.ops[self.native_start..self.inert_data]
            .iter()
            .map(EmittedOp::encoded_size)
            .sum()
    }

    /// Total encoded size of the region in bytes.
    #[must_use]
    pub fn encoded_size(&self) -> u64 {
        self.ops.iter().map(EmittedOp::encoded_size).sum()
    }
}

/// Builder of section-ending regions.
pub struct SecondPhaseEmitter;

impl SecondPhaseEmitter {
    /// Emit the section-ending region for a compiled section.
    ///
    /// ## Arguments
    /// * 'region'  - Identity the host engine assigned to the region
    /// * 'section' - The first-phase compilation result, commit block included
    ///
    /// # Errors
    /// Returns [`crate::Error::UnsupportedConstruct`] when the body contains an
    /// indirect branch (its target could lie inside the native copy) and
    /// [`crate::Error::Error`] when the compiled section carries no commit block.
    /// On error no region exists; all partial emission state is released.
    pub fn emit(region: RegionId, section: &CompiledSection) -> Result<EmittedRegion> {
        let Some(commit_block) = section.blocks.iter().find(|b| b.contains_commit) else {
            return Err(Error::Error(format!(
                "section at {:#x} has no compiled commit block",
                section.descriptor.start
            )));
        };

        let mut ops = commit_block.ops.clone();

        // The phase boundary: materialize the record address, then the barrier that
        // restores the entry checkpoint and publishes the registration. The load is
        // a placeholder with the maximum-width reservation until the patch step.
        let record_load = ops.len();
        ops.push(EmittedOp::RecordAddressLoad {
            width: EncodingWidth::Padded,
            address: 0,
        });
        ops.push(EmittedOp::PhaseBarrier);

        let native_start = ops.len();
        for instruction in &section.originals {
            ops.push(Self::reemit_native(instruction, &section.descriptor)?);
        }

        let inert_data = ops.len();
        ops.push(EmittedOp::InertHandlerAddress {
            handler: section.descriptor.abort,
        });
        let trampoline_entry = ops.len();
        ops.push(EmittedOp::TrampolineEntry {
            handler: section.descriptor.abort,
        });

        debug!(
            region = %region,
            start = section.descriptor.start,
            ops = ops.len(),
            "emitted section-ending region"
        );

        Ok(EmittedRegion {
            region,
            descriptor: Arc::clone(&section.descriptor),
            ops,
            written_registers: section.written_registers,
            record_load,
            native_start,
            inert_data,
            trampoline_entry,
            patch: None,
        })
    }

    /// Re-derive one original instruction for the native copy.
    fn reemit_native(
        instruction: &Instruction,
        descriptor: &SectionDescriptor,
    ) -> Result<EmittedOp> {
        if instruction.flow_type == FlowType::IndirectBranch {
            return Err(Error::UnsupportedConstruct(
                "indirect branch inside a section body",
            ));
        }

        let (operand, mangling) = match instruction.operand {
            Operand::PcRelative(displacement) => {
                // The copy runs at a cache address; an ip-relative operand must be
                // resolved against the original instruction's location.
                let resolved = instruction.end().wrapping_add_signed(displacement);
                (Operand::Absolute(resolved), Mangling::AbsolutizedPcRelative)
            }
            Operand::Segment(displacement) => {
                (Operand::Segment(displacement), Mangling::SegmentLowered)
            }
            other => (other, Mangling::None),
        };

        let intra_copy = instruction
            .branch_target()
            .is_some_and(|target| descriptor.contains(target));

        let mut native = instruction.clone();
        native.operand = operand;

        Ok(EmittedOp::NativeApp {
            instruction: native,
            mangling,
            intra_copy,
        })
    }
}
