//! First-phase compilation of critical-section bodies.
//!
//! The first phase runs the section body under full client instrumentation but with
//! its plain memory writes removed: every instruction is observed by instrumentation,
//! yet the body leaves no memory effect behind. The real effect happens in the second
//! (native) phase, so an abort there makes the kernel's restart semantics hold: the
//! body's stores have not happened yet.
//!
//! The elision rule is deliberately narrow. An application instruction is removed
//! only when its *sole* recognized effect is a plain memory write; a store that also
//! updates condition codes or writes a register is kept whole, which keeps its write
//! too. That is imprecise but safe for the inputs this mechanism targets. Sections
//! that read back an elided store's value within the same execution are not
//! correctness targets; the compiler still elides for them, which is documented as
//! unsound for such inputs.
//!
//! A section is only protected when compilation enters it exactly at its start
//! address. Entry anywhere else inside the range compiles as ordinary code without
//! the mechanism, a deliberate scope limitation.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::{
    emitter::EmittedOp,
    engine::{BasicBlock, FlowType, Instruction, Instrumenter, RegisterMask},
    registry::SectionDescriptor,
    Error, Result,
};

/// One section-body block after first-phase compilation.
#[derive(Debug)]
pub struct CompiledBlock {
    /// Original address of the block's first instruction.
    pub address: u64,
    /// The compiled op stream: instrumentation plus non-elided application
    /// instructions.
    pub ops: Vec<EmittedOp>,
    /// Whether this block ends at the section's commit point.
    pub contains_commit: bool,
}

/// A fully compiled section body, ready for second-phase emission.
#[derive(Debug)]
pub struct CompiledSection {
    /// The section's boundaries.
    pub descriptor: Arc<SectionDescriptor>,
    /// The compiled blocks, in compilation order; the last one contains the commit.
    pub blocks: Vec<CompiledBlock>,
    /// The original instructions of the whole body, in address order, kept for
    /// the uninstrumented native re-emission.
    pub originals: Vec<Instruction>,
    /// Union of the general-purpose registers the body writes; sizes the register
    /// checkpoint taken at section entry.
    pub written_registers: RegisterMask,
    /// Number of application instructions whose store was elided.
    pub elided: usize,
}

/// Per-section state of the first-phase compiler.
///
/// Created when block compilation reaches a registered section's start address and
/// fed each body block in turn until the commit block has been compiled.
///
/// # Examples
///
/// ```rust,ignore
/// let Some(mut compiler) = FirstPhaseCompiler::begin(entry, descriptor, &instrumenter)
/// else {
///     // Entry is not at the section start: compile as ordinary, unprotected code.
///     return ordinary_compilation(block);
/// };
///
/// compiler.compile_block(&block)?;
/// let section = compiler.finish()?;
/// ```
pub struct FirstPhaseCompiler<'a> {
    descriptor: Arc<SectionDescriptor>,
    instrumenter: &'a dyn Instrumenter,
    blocks: Vec<CompiledBlock>,
    originals: Vec<Instruction>,
    written: RegisterMask,
    elided: usize,
    commit_reached: bool,
}

impl<'a> FirstPhaseCompiler<'a> {
    /// Start first-phase compilation of a section, if the entry address permits it.
    ///
    /// Returns `None` when `entry` is anywhere other than the section's start
    /// address; such an entry does not use this mechanism and the section runs as
    /// ordinary code.
    ///
    /// ## Arguments
    /// * 'entry'        - The address compilation is entering the region at
    /// * 'descriptor'   - The section's boundaries
    /// * 'instrumenter' - Client instrumentation to apply per instruction
    #[must_use]
    pub fn begin(
        entry: u64,
        descriptor: Arc<SectionDescriptor>,
        instrumenter: &'a dyn Instrumenter,
    ) -> Option<Self> {
        if entry != descriptor.start {
            debug!(
                entry,
                start = descriptor.start,
                "section entered mid-body, compiling unprotected"
            );
            return None;
        }

        Some(FirstPhaseCompiler {
            descriptor,
            instrumenter,
            blocks: Vec::new(),
            originals: Vec::new(),
            written: RegisterMask::EMPTY,
            elided: 0,
            commit_reached: false,
        })
    }

    /// The section being compiled.
    #[must_use]
    pub fn descriptor(&self) -> &Arc<SectionDescriptor> {
        &self.descriptor
    }

    /// Whether the commit block has been compiled.
    #[must_use]
    pub fn commit_reached(&self) -> bool {
        self.commit_reached
    }

    /// Compile one body block: instrument every instruction, then elide the plain
    /// stores.
    ///
    /// ## Arguments
    /// * 'block' - The next body block, as discovered by the host engine
    ///
    /// # Errors
    /// Returns [`crate::Error::UnsupportedConstruct`] when the block leaves the
    /// section body before the commit point: a branch targeting outside the body,
    /// a return, a call, or a trap. How application logic that inspects would-be-
    /// elided state after such an exit should behave is unresolved, so the section
    /// is not protected rather than guessing. Also returned when a block arrives
    /// after the commit block or lies outside the body.
    pub fn compile_block(&mut self, block: &BasicBlock) -> Result<()> {
        if self.commit_reached {
            return Err(Error::Error(format!(
                "block at {:#x} compiled after the commit point",
                block.address
            )));
        }

        if !self.descriptor.contains(block.address) || block.end() > self.descriptor.commit {
            return Err(Error::UnsupportedConstruct(
                "block extends outside the section body",
            ));
        }

        let ends_at_commit = block.end() == self.descriptor.commit;
        let mut ops = Vec::with_capacity(block.instructions.len() * 2);

        for instruction in &block.instructions {
            self.check_exit(instruction, ends_at_commit)?;

            for client_op in self.instrumenter.instrument(instruction) {
                ops.push(EmittedOp::Client(client_op));
            }

            self.written.union_with(instruction.writes);
            self.originals.push(instruction.clone());

            if instruction.is_plain_store() {
                // Instrumentation has already observed the store; the write itself
                // is deferred to the native phase.
                trace!(address = instruction.address, "elided plain store");
                self.elided += 1;
            } else {
                ops.push(EmittedOp::App(instruction.clone()));
            }
        }

        self.commit_reached = ends_at_commit;
        self.blocks.push(CompiledBlock {
            address: block.address,
            ops,
            contains_commit: ends_at_commit,
        });

        Ok(())
    }

    fn check_exit(&self, instruction: &Instruction, ends_at_commit: bool) -> Result<()> {
        match instruction.flow_type {
            FlowType::Return | FlowType::Call | FlowType::Syscall => {
                return Err(Error::UnsupportedConstruct(
                    "section body exits before its commit point",
                ));
            }
            FlowType::ConditionalBranch | FlowType::UnconditionalBranch => {
                if let Some(target) = instruction.branch_target() {
                    if !self.descriptor.contains(target)
                        && !(ends_at_commit && target == self.descriptor.commit)
                    {
                        return Err(Error::UnsupportedConstruct(
                            "section body exits before its commit point",
                        ));
                    }
                }
            }
            // Indirect branches are judged at native re-emission, where the copy
            // they must not target exists.
            FlowType::IndirectBranch | FlowType::Sequential => {}
        }

        Ok(())
    }

    /// Finish compilation and hand the section over for second-phase emission.
    ///
    /// # Errors
    /// Returns [`crate::Error::Error`] if the commit block has not been compiled.
    pub fn finish(self) -> Result<CompiledSection> {
        if !self.commit_reached {
            return Err(Error::Error(format!(
                "section at {:#x} finished before its commit point",
                self.descriptor.start
            )));
        }

        debug!(
            start = self.descriptor.start,
            blocks = self.blocks.len(),
            elided = self.elided,
            written = self.written.count(),
            "first phase compiled"
        );

        Ok(CompiledSection {
            descriptor: self.descriptor,
            blocks: self.blocks,
            originals: self.originals,
            written_registers: self.written,
            elided: self.elided,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        engine::{EffectFlags, NoInstrumentation, Operand, Register},
        registry::{DescriptorFlags, DESCRIPTOR_VERSION},
    };

    fn descriptor(start: u64, len: u64, abort: u64) -> Arc<SectionDescriptor> {
        Arc::new(SectionDescriptor {
            version: DESCRIPTOR_VERSION,
            flags: DescriptorFlags::empty(),
            start,
            commit: start + len,
            abort,
        })
    }

    fn instr(
        address: u64,
        size: u64,
        mnemonic: &'static str,
        flow_type: FlowType,
        operand: Operand,
        effects: EffectFlags,
        writes: RegisterMask,
    ) -> Instruction {
        Instruction {
            address,
            size,
            mnemonic,
            flow_type,
            operand,
            effects,
            reads: RegisterMask::EMPTY,
            writes,
        }
    }

    fn simple_body(start: u64) -> BasicBlock {
        BasicBlock::new(
            0,
            start,
            vec![
                instr(
                    start,
                    4,
                    "add",
                    FlowType::Sequential,
                    Operand::None,
                    EffectFlags::REGISTER_WRITE | EffectFlags::CONDITION_CODES,
                    RegisterMask::of(&[Register::R1]),
                ),
                instr(
                    start + 4,
                    4,
                    "store",
                    FlowType::Sequential,
                    Operand::None,
                    EffectFlags::MEMORY_WRITE,
                    RegisterMask::EMPTY,
                ),
            ],
        )
    }

    #[test]
    fn mid_body_entry_is_unprotected() {
        let desc = descriptor(0x1000, 8, 0x2000);
        assert!(FirstPhaseCompiler::begin(0x1004, desc, &NoInstrumentation).is_none());
    }

    #[test]
    fn plain_store_elided_commit_detected() {
        let desc = descriptor(0x1000, 8, 0x2000);
        let mut compiler = FirstPhaseCompiler::begin(0x1000, desc, &NoInstrumentation).unwrap();

        compiler.compile_block(&simple_body(0x1000)).unwrap();
        assert!(compiler.commit_reached());

        let section = compiler.finish().unwrap();
        assert_eq!(section.elided, 1);
        assert_eq!(section.originals.len(), 2);
        assert!(section.written_registers.contains(Register::R1));

        // Only the non-store instruction survives as an App op.
        let commit_block = &section.blocks[0];
        assert!(commit_block.contains_commit);
        let app_count = commit_block
            .ops
            .iter()
            .filter(|op| matches!(op, EmittedOp::App(_)))
            .count();
        assert_eq!(app_count, 1);
    }

    #[test]
    fn store_with_side_effects_kept() {
        let desc = descriptor(0x1000, 4, 0x2000);
        let mut compiler = FirstPhaseCompiler::begin(0x1000, desc, &NoInstrumentation).unwrap();

        let block = BasicBlock::new(
            0,
            0x1000,
            vec![instr(
                0x1000,
                4,
                "push",
                FlowType::Sequential,
                Operand::None,
                EffectFlags::MEMORY_WRITE | EffectFlags::REGISTER_WRITE,
                RegisterMask::of(&[Register::R4]),
            )],
        );

        compiler.compile_block(&block).unwrap();
        let section = compiler.finish().unwrap();
        assert_eq!(section.elided, 0);
        assert_eq!(section.blocks[0].ops.len(), 1);
    }

    #[test]
    fn early_exit_rejected() {
        let desc = descriptor(0x1000, 12, 0x2000);
        let mut compiler = FirstPhaseCompiler::begin(0x1000, desc, &NoInstrumentation).unwrap();

        let block = BasicBlock::new(
            0,
            0x1000,
            vec![instr(
                0x1000,
                4,
                "jmp",
                FlowType::UnconditionalBranch,
                Operand::Target(0x5000),
                EffectFlags::empty(),
                RegisterMask::EMPTY,
            )],
        );

        assert!(matches!(
            compiler.compile_block(&block),
            Err(Error::UnsupportedConstruct(_))
        ));
    }

    #[test]
    fn internal_branch_allowed() {
        let desc = descriptor(0x1000, 12, 0x2000);
        let mut compiler = FirstPhaseCompiler::begin(0x1000, desc, &NoInstrumentation).unwrap();

        let block = BasicBlock::new(
            0,
            0x1000,
            vec![instr(
                0x1000,
                4,
                "jcc",
                FlowType::ConditionalBranch,
                Operand::Target(0x1008),
                EffectFlags::empty(),
                RegisterMask::EMPTY,
            )],
        );

        compiler.compile_block(&block).unwrap();
        assert!(!compiler.commit_reached());
    }

    #[test]
    fn finish_before_commit_rejected() {
        let desc = descriptor(0x1000, 12, 0x2000);
        let mut compiler = FirstPhaseCompiler::begin(0x1000, desc, &NoInstrumentation).unwrap();

        compiler
            .compile_block(&BasicBlock::new(
                0,
                0x1000,
                vec![instr(
                    0x1000,
                    4,
                    "add",
                    FlowType::Sequential,
                    Operand::None,
                    EffectFlags::REGISTER_WRITE,
                    RegisterMask::EMPTY,
                )],
            ))
            .unwrap();

        assert!(compiler.finish().is_err());
    }
}
