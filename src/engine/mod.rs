//! Interfaces and shared data model between this subsystem and the host engine.
//!
//! The host rewriting engine owns block discovery, code-cache management, signal
//! delivery, and thread bookkeeping. This module defines the narrow surface the
//! critical-section machinery consumes from it:
//!
//! - The instruction model blocks are delivered in ([`Instruction`], [`BasicBlock`])
//! - The client instrumentation hook ([`Instrumenter`])
//! - The per-thread machine seam ([`MachineContext`])
//!
//! # Example
//!
//! ```rust
//! use rseqgate::engine::{EffectFlags, FlowType, Instruction, Operand, RegisterMask};
//!
//! // The host engine hands over decoded instructions in this form.
//! let instr = Instruction {
//!     address: 0x4010,
//!     size: 3,
//!     mnemonic: "load",
//!     flow_type: FlowType::Sequential,
//!     operand: Operand::PcRelative(0x80),
//!     effects: EffectFlags::MEMORY_READ | EffectFlags::REGISTER_WRITE,
//!     reads: RegisterMask::EMPTY,
//!     writes: RegisterMask::EMPTY,
//! };
//! assert_eq!(instr.end(), 0x4013);
//! ```

mod block;
mod hooks;
mod instruction;

pub use block::BasicBlock;
pub use hooks::{ClientOp, Instrumenter, MachineContext, NoInstrumentation};
pub use instruction::{EffectFlags, FlowType, Instruction, Operand, Register, RegisterMask};
