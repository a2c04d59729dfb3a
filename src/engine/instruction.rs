//! Machine-level instruction model shared with the host rewriting engine.
//!
//! The host engine decodes original application code into the representation defined
//! here before handing blocks to this crate. The model is deliberately minimal: it
//! carries exactly the semantic facts the two-phase scheme needs: control-flow kind,
//! recognized effects, the registers an instruction touches, and the one operand class
//! that matters for address-independent re-emission.
//!
//! # Key Types
//!
//! - [`Instruction`] - A decoded application instruction
//! - [`FlowType`] - How an instruction affects control flow
//! - [`EffectFlags`] - The recognized effects of an instruction
//! - [`Operand`] - The operand classes relevant to mangling and patching
//! - [`Register`] / [`RegisterMask`] - General-purpose register identities and sets

use bitflags::bitflags;
use strum::{EnumCount, EnumIter, IntoEnumIterator};

/// General-purpose register identity, in the host engine's canonical numbering.
///
/// The numbering is ISA-neutral; the host engine maps `R0`..`R15` onto the machine
/// registers of its target. Sixteen registers cover every target the engine supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumCount, EnumIter)]
#[allow(missing_docs)]
pub enum Register {
    R0,
    R1,
    R2,
    R3,
    R4,
    R5,
    R6,
    R7,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

impl Register {
    /// Index of this register in the canonical numbering.
    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }
}

/// A set of general-purpose registers, stored as a 16-bit mask.
///
/// Used for the registers an instruction reads and writes, and for sizing the
/// per-thread register checkpoint taken at section entry.
///
/// # Examples
///
/// ```rust
/// use rseqgate::engine::{Register, RegisterMask};
///
/// let mut mask = RegisterMask::EMPTY;
/// mask.insert(Register::R3);
/// mask.insert(Register::R7);
///
/// assert!(mask.contains(Register::R3));
/// assert_eq!(mask.count(), 2);
/// assert_eq!(mask.iter().collect::<Vec<_>>(), vec![Register::R3, Register::R7]);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegisterMask(u16);

impl RegisterMask {
    /// The empty register set.
    pub const EMPTY: RegisterMask = RegisterMask(0);

    /// Build a mask from a list of registers.
    #[must_use]
    pub fn of(registers: &[Register]) -> RegisterMask {
        let mut mask = RegisterMask::EMPTY;
        for reg in registers {
            mask.insert(*reg);
        }
        mask
    }

    /// Add a register to the set.
    pub fn insert(&mut self, register: Register) {
        self.0 |= 1 << register.index();
    }

    /// Returns `true` if the register is in the set.
    #[must_use]
    pub fn contains(self, register: Register) -> bool {
        self.0 & (1 << register.index()) != 0
    }

    /// Merge another set into this one.
    pub fn union_with(&mut self, other: RegisterMask) {
        self.0 |= other.0;
    }

    /// Number of registers in the set.
    #[must_use]
    pub fn count(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Returns `true` if the set is empty.
    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Iterate the registers in the set, in canonical order.
    pub fn iter(self) -> impl Iterator<Item = Register> {
        Register::iter().filter(move |reg| self.contains(*reg))
    }
}

impl std::ops::BitOr for RegisterMask {
    type Output = RegisterMask;

    fn bitor(self, rhs: RegisterMask) -> RegisterMask {
        RegisterMask(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for RegisterMask {
    fn bitor_assign(&mut self, rhs: RegisterMask) {
        self.0 |= rhs.0;
    }
}

bitflags! {
    /// The recognized effects of an application instruction.
    ///
    /// The first-phase compiler elides an instruction only when its *sole* recognized
    /// effect is a plain memory write; any additional effect keeps the whole
    /// instruction, including the write.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EffectFlags: u8 {
        /// The instruction writes memory.
        const MEMORY_WRITE = 0x01;

        /// The instruction reads memory.
        const MEMORY_READ = 0x02;

        /// The instruction updates condition codes that later instructions may consume.
        const CONDITION_CODES = 0x04;

        /// The instruction writes one or more general-purpose registers.
        const REGISTER_WRITE = 0x08;
    }
}

/// How an instruction affects control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowType {
    /// Normal execution continues to the next instruction.
    Sequential,
    /// Conditional branch to another location.
    ConditionalBranch,
    /// Always branches to another location (unconditional jump).
    UnconditionalBranch,
    /// Branch through a register or memory operand; the target is unknown statically.
    IndirectBranch,
    /// Call to another routine.
    Call,
    /// Return from the current routine.
    Return,
    /// Trap into the kernel.
    Syscall,
}

/// The operand classes that matter for re-emission of a section body.
///
/// Only position-dependent operand forms are distinguished; everything else is
/// opaque to this subsystem and carried as [`Operand::None`] or [`Operand::Immediate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    /// No operand relevant to this subsystem.
    None,
    /// A plain immediate value.
    Immediate(u64),
    /// A direct branch target, as an absolute original address.
    Target(u64),
    /// A memory operand addressed relative to the instruction pointer.
    ///
    /// The displacement is relative to the address of the *next* instruction.
    PcRelative(i64),
    /// A memory operand addressed through the thread segment register, at the
    /// given displacement from the segment base.
    Segment(u64),
    /// An absolute memory address, the result of resolving a position-dependent form.
    Absolute(u64),
}

/// A decoded application instruction, as handed over by the host engine.
///
/// # Examples
///
/// ```rust
/// use rseqgate::engine::{EffectFlags, FlowType, Instruction, Operand, RegisterMask};
///
/// let store = Instruction {
///     address: 0x1000,
///     size: 4,
///     mnemonic: "store",
///     flow_type: FlowType::Sequential,
///     operand: Operand::None,
///     effects: EffectFlags::MEMORY_WRITE,
///     reads: RegisterMask::EMPTY,
///     writes: RegisterMask::EMPTY,
/// };
///
/// assert!(store.is_plain_store());
/// assert!(!store.is_branch());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    /// Original virtual address of this instruction.
    pub address: u64,
    /// Size of this instruction in bytes.
    pub size: u64,
    /// Human-readable instruction mnemonic (e.g. "store", "jcc", "add").
    pub mnemonic: &'static str,
    /// How this instruction affects control flow.
    pub flow_type: FlowType,
    /// The operand relevant to this subsystem, if any.
    pub operand: Operand,
    /// The recognized effects of this instruction.
    pub effects: EffectFlags,
    /// General-purpose registers this instruction reads.
    pub reads: RegisterMask,
    /// General-purpose registers this instruction writes.
    pub writes: RegisterMask,
}

impl Instruction {
    /// Address of the byte following this instruction.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.address + self.size
    }

    /// Returns `true` if the only recognized effect is a plain memory write.
    ///
    /// Such instructions are the elision candidates of the first phase: their write is
    /// dropped after instrumentation has seen it. A store that also updates condition
    /// codes or writes a register is not a plain store and is kept whole.
    #[must_use]
    pub fn is_plain_store(&self) -> bool {
        self.effects == EffectFlags::MEMORY_WRITE
    }

    /// Returns `true` for any instruction that can alter control flow by branching.
    #[must_use]
    pub fn is_branch(&self) -> bool {
        matches!(
            self.flow_type,
            FlowType::ConditionalBranch | FlowType::UnconditionalBranch | FlowType::IndirectBranch
        )
    }

    /// The direct branch target, if this instruction has one.
    #[must_use]
    pub fn branch_target(&self) -> Option<u64> {
        if self.is_branch() {
            if let Operand::Target(target) = self.operand {
                return Some(target);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::EnumCount;

    fn store_at(address: u64, effects: EffectFlags) -> Instruction {
        Instruction {
            address,
            size: 4,
            mnemonic: "store",
            flow_type: FlowType::Sequential,
            operand: Operand::None,
            effects,
            reads: RegisterMask::of(&[Register::R1]),
            writes: RegisterMask::EMPTY,
        }
    }

    #[test]
    fn plain_store_detection() {
        assert!(store_at(0x10, EffectFlags::MEMORY_WRITE).is_plain_store());
        assert!(!store_at(
            0x10,
            EffectFlags::MEMORY_WRITE | EffectFlags::CONDITION_CODES
        )
        .is_plain_store());
        assert!(!store_at(
            0x10,
            EffectFlags::MEMORY_WRITE | EffectFlags::REGISTER_WRITE
        )
        .is_plain_store());
    }

    #[test]
    fn register_mask_roundtrip() {
        let mask = RegisterMask::of(&[Register::R0, Register::R15]);

        assert_eq!(mask.count(), 2);
        assert!(mask.contains(Register::R0));
        assert!(mask.contains(Register::R15));
        assert!(!mask.contains(Register::R8));

        let collected: Vec<Register> = mask.iter().collect();
        assert_eq!(collected, vec![Register::R0, Register::R15]);
    }

    #[test]
    fn register_count_matches_mask_width() {
        assert_eq!(Register::COUNT, 16);
    }

    #[test]
    fn branch_target_extraction() {
        let branch = Instruction {
            address: 0x100,
            size: 2,
            mnemonic: "jcc",
            flow_type: FlowType::ConditionalBranch,
            operand: Operand::Target(0x120),
            effects: EffectFlags::empty(),
            reads: RegisterMask::EMPTY,
            writes: RegisterMask::EMPTY,
        };

        assert_eq!(branch.branch_target(), Some(0x120));
        assert_eq!(store_at(0x100, EffectFlags::MEMORY_WRITE).branch_target(), None);
    }
}
