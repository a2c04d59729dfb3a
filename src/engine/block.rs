//! Basic block representation for section bodies.

use crate::engine::instruction::Instruction;

/// A sequence of instructions with a single entry and a single exit.
///
/// Blocks are produced by the host engine's block discovery and handed to the
/// first-phase compiler one at a time as compilation reaches them. The block
/// carries its original start address; instruction addresses inside it are
/// contiguous.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    /// Identifier assigned by the host engine's block discovery.
    pub id: usize,
    /// Original virtual address of the first instruction.
    pub address: u64,
    /// The decoded instructions of this block, in address order.
    pub instructions: Vec<Instruction>,
}

impl BasicBlock {
    /// Create a block from decoded instructions.
    ///
    /// ## Arguments
    /// * 'id'           - Identifier assigned by block discovery
    /// * 'address'      - Original address of the first instruction
    /// * 'instructions' - The decoded instructions, in address order
    #[must_use]
    pub fn new(id: usize, address: u64, instructions: Vec<Instruction>) -> Self {
        BasicBlock {
            id,
            address,
            instructions,
        }
    }

    /// Total size of the block's instructions in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.instructions.iter().map(|i| i.size).sum()
    }

    /// Address of the byte following the last instruction.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.address + self.size()
    }

    /// The last instruction of the block, if any.
    #[must_use]
    pub fn terminator(&self) -> Option<&Instruction> {
        self.instructions.last()
    }
}
