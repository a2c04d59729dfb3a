// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![allow(dead_code)]
#![allow(clippy::too_many_arguments)]
//#![deny(unsafe_code)]
// - 'file/mod.rs' uses mmap to map a binary into memory

//! # rseqgate
//!
//! [![Crates.io](https://img.shields.io/crates/v/rseqgate.svg)](https://crates.io/crates/rseqgate)
//! [![Documentation](https://docs.rs/rseqgate/badge.svg)](https://docs.rs/rseqgate)
//! [![License](https://img.shields.io/badge/license-Apache--2.0-blue.svg)](https://github.com/BinFlip/rseqgate/blob/main/LICENSE-APACHE)
//!
//! Correct execution of OS-level restartable sequences (Linux `rseq` critical
//! sections) under dynamic binary rewriting. Built in pure Rust, `rseqgate`
//! implements the hardest reconciliation a rewriting engine faces: the kernel
//! identifies critical sections purely by *original* instruction addresses and may
//! redirect control asynchronously anywhere inside them, while the engine never
//! runs original code in place.
//!
//! ## The Two-Phase Scheme
//!
//! A recognized critical section executes twice per instance:
//!
//! 1. **First phase** - the section body runs relocated and fully instrumented,
//!    but with every plain memory write elided: instrumentation observes each
//!    instruction, yet no store lands.
//! 2. **Second phase** - at the commit point the thread's pre-entry registers are
//!    restored, a kernel-visible descriptor is published through the thread's
//!    descriptor-pointer slot, and an *uninstrumented* native copy of the body
//!    runs for real effect. An abort in this phase redirects, via the kernel,
//!    into a generated trampoline that hands control to the application's abort
//!    handler, still under the engine's control.
//!
//! Because every first-phase store was elided, the kernel's restart contract
//! holds: until the native copy commits, the section has had no memory effect.
//!
//! ## Features
//!
//! - **📦 Ahead-of-execution discovery** - Parses the binary's static descriptor
//!   table into a range-searchable registry before any section runs
//! - **🔍 Store-elided instrumentation** - First-phase compilation keeps client
//!   instrumentation intact while deferring memory effects
//! - **⚡ Native replay emission** - Uninstrumented section copies with minimal
//!   address-independence mangling, plus the abort trampoline
//! - **🔧 Deterministic patching** - Post-emission resolution of descriptor
//!   addresses with reproducible placeholder encodings
//! - **🛡️ Structural lifetime safety** - Two-step epoch reclamation guarantees a
//!   descriptor record is never freed while a thread could observe it
//! - **🧩 Narrow host interface** - The rewriting engine integrates through a
//!   handful of traits; nothing here depends on a specific ISA
//!
//! ## Quick Start
//!
//! Add `rseqgate` to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! rseqgate = "0.1"
//! ```
//!
//! ### Using the Prelude
//!
//! ```rust
//! use rseqgate::prelude::*;
//!
//! // Attach with boundaries supplied by the host's loader plumbing.
//! let registry = SequenceRegistry::from_descriptors(vec![SectionDescriptor {
//!     version: DESCRIPTOR_VERSION,
//!     flags: DescriptorFlags::empty(),
//!     start: 0x1000,
//!     commit: 0x1010,
//!     abort: 0x2000,
//! }])?;
//! let runtime = RseqRuntime::with_registry(registry, RseqConfig::default());
//!
//! assert!(runtime.section_at_start(0x1000).is_some());
//! assert!(runtime.section_containing(0x100F).is_some());
//! # Ok::<(), rseqgate::Error>(())
//! ```
//!
//! ### Attaching to a Binary
//!
//! ```rust,ignore
//! use rseqgate::{RseqConfig, RseqRuntime};
//!
//! // Parses the static descriptor table lazily, on first observed registration.
//! let runtime = RseqRuntime::from_file("a.out".as_ref(), RseqConfig::default())?;
//!
//! match runtime.observe_registration(0x40) {
//!     rseqgate::fallback::RegistrationOutcome::Accepted => { /* protected */ }
//!     rseqgate::fallback::RegistrationOutcome::NotSupported => { /* ordinary code */ }
//! }
//! # Ok::<(), rseqgate::Error>(())
//! ```
//!
//! ## Architecture
//!
//! `rseqgate` is organized along the pipeline a section moves through:
//!
//! - [`registry`] - Static descriptor-table parsing and range lookup
//! - [`locator`] - Once-per-process resolution of the descriptor storage offset
//! - [`compiler`] - First-phase (instrumented, store-elided) compilation
//! - [`emitter`] - Second-phase native copy and abort trampoline emission
//! - [`patch`] - Post-emission address resolution and descriptor patching
//! - [`manager`] - Record ownership, the phase boundary, epoch reclamation
//! - [`execution`] - The per-thread section-instance state machine
//! - [`fallback`] - The process-wide accept/reject policy
//! - [`engine`] - The narrow interface to the host rewriting engine
//! - [`runtime`] - The process-wide facade over all of the above
//!
//! ## Scope
//!
//! Sections whose boundaries cannot be statically enumerated, sections entered
//! mid-body, sections containing indirect branches that may target themselves,
//! and threads with non-static descriptor storage are *not* supported; such
//! requests are answered with a not-supported outcome and the affected code runs
//! as ordinary generated code. The fallback is deliberately coarse (one mode per
//! process) because fine-grained detection of these violations is not solvable
//! in general.
//!
//! ## Error Handling
//!
//! All operations return [`Result<T, Error>`](Result). Failures never surface to
//! the application being rewritten; they only decide whether the protection
//! mechanism is engaged:
//!
//! ```rust
//! use rseqgate::{Error, RseqConfig, RseqRuntime};
//!
//! match RseqRuntime::from_mem(vec![0u8; 4], RseqConfig::default()) {
//!     Ok(_) => println!("attached"),
//!     Err(Error::GoblinErr(_)) => println!("not a parseable binary"),
//!     Err(e) => println!("error: {e}"),
//! }
//! ```
#[macro_use]
pub(crate) mod error;
pub(crate) mod file;

/// Convenient re-exports of the most commonly used types and traits.
///
/// # Example
///
/// ```rust
/// use rseqgate::prelude::*;
///
/// let runtime = RseqRuntime::detached(RseqConfig::strict());
/// assert!(runtime.fallback().is_rejecting());
/// ```
pub mod prelude;

/// Process-wide configuration for critical-section handling.
pub mod config;

/// Interfaces and shared data model between this subsystem and the host engine.
pub mod engine;

/// Discovery of critical-section boundaries ahead of execution.
pub mod registry;

/// Resolution of the per-thread descriptor storage offset.
pub mod locator;

/// First-phase compilation: instrumented, store-elided section bodies.
pub mod compiler;

/// Second-phase emission: native replay copies and abort trampolines.
pub mod emitter;

/// Post-emission address resolution and descriptor patching.
pub mod patch;

/// Descriptor-record ownership, the lifetime table, and the phase boundary.
pub mod manager;

/// The per-thread section-instance state machine.
pub mod execution;

/// Process-wide fallback policy for unsupported critical sections.
pub mod fallback;

/// Thread-private state for section execution.
pub mod thread;

/// The process-wide entry point tying the pipeline together.
pub mod runtime;

/// `rseqgate` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is
/// always [`Error`]. This is used consistently throughout the crate for all
/// fallible operations.
pub type Result<T> = std::result::Result<T, Error>;

/// `rseqgate` Error type
///
/// The main error type for all operations in this crate. Provides detailed error
/// information for descriptor-table parsing, section compilation, and lifetime
/// management.
pub use error::Error;

/// Process-wide configuration for critical-section handling.
pub use config::RseqConfig;

/// Main entry point: the process-wide state of the protection mechanism.
pub use runtime::RseqRuntime;

/// Provides access to low-level file and memory parsing utilities.
pub use file::{parser::Parser, File, SectionInfo};
