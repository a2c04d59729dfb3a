//! The process-wide entry point tying the pipeline together.
//!
//! [`RseqRuntime`] owns one of everything with process lifetime: the section
//! registry, the storage-offset locator, the registration manager, and the fallback
//! controller. The host engine holds a single shared instance and calls into it
//! from its block compiler, its emission hook, its deletion and flush callbacks,
//! and its registration-interception path.
//!
//! Registry construction is lazy and single-flight: the first observed registration
//! request (or the first explicit access) builds it, concurrent callers wait on the
//! same build, and a binary whose table is absent or unusable yields an empty
//! registry with the fallback engaged, never an error surfaced to the application.

use std::{path::Path, sync::Arc, sync::OnceLock};

use tracing::warn;

use crate::{
    compiler::FirstPhaseCompiler,
    config::RseqConfig,
    emitter::{EmittedRegion, SecondPhaseEmitter},
    engine::{BasicBlock, Instrumenter},
    fallback::{FallbackController, FallbackReason, RegistrationOutcome},
    file::File,
    locator::{ThreadLocator, TrialRegistration},
    manager::{RegionId, RegistrationManager},
    registry::{SectionDescriptor, SequenceRegistry},
    Error, Result,
};

/// Process-wide state of the critical-section protection mechanism.
///
/// # Examples
///
/// ```rust,ignore
/// use rseqgate::{RseqConfig, RseqRuntime};
///
/// let runtime = RseqRuntime::from_file("a.out".as_ref(), RseqConfig::default())?;
///
/// // Intercepted registration request carrying the thread's storage offset:
/// let outcome = runtime.observe_registration(0x40);
/// # Ok::<(), rseqgate::Error>(())
/// ```
pub struct RseqRuntime {
    file: Option<File>,
    registry: OnceLock<SequenceRegistry>,
    locator: ThreadLocator,
    manager: RegistrationManager,
    fallback: FallbackController,
    config: RseqConfig,
}

impl RseqRuntime {
    /// Attach to a binary on disk.
    ///
    /// The registry builds lazily on first use; only the binary itself is loaded
    /// here.
    ///
    /// ## Arguments
    /// * 'path'   - Path to the application binary
    /// * 'config' - Process configuration
    ///
    /// # Errors
    /// Returns [`crate::Error::FileError`] or [`crate::Error::GoblinErr`] when the
    /// binary cannot be loaded at all. An unusable *descriptor table* inside a
    /// loadable binary is not an error; it engages the fallback later.
    pub fn from_file(path: &Path, config: RseqConfig) -> Result<Self> {
        Ok(Self::with_file(Some(File::from_file(path)?), config))
    }

    /// Attach to a binary already loaded into memory.
    ///
    /// ## Arguments
    /// * 'data'   - The full binary image
    /// * 'config' - Process configuration
    ///
    /// # Errors
    /// Returns [`crate::Error::GoblinErr`] or [`crate::Error::Empty`] when the
    /// image cannot be parsed as a binary.
    pub fn from_mem(data: Vec<u8>, config: RseqConfig) -> Result<Self> {
        Ok(Self::with_file(Some(File::from_mem(data)?), config))
    }

    /// Create a runtime with no attached binary.
    ///
    /// No sections are ever recognized; every registration request is answered
    /// not-supported once the (empty) registry is consulted.
    #[must_use]
    pub fn detached(config: RseqConfig) -> Self {
        Self::with_file(None, config)
    }

    /// Create a runtime over an already-built registry.
    ///
    /// For hosts that obtain section boundaries through their own loader plumbing
    /// rather than from the binary's descriptor-table section.
    ///
    /// ## Arguments
    /// * 'registry' - The pre-built section registry
    /// * 'config'   - Process configuration
    #[must_use]
    pub fn with_registry(registry: SequenceRegistry, config: RseqConfig) -> Self {
        let runtime = Self::with_file(None, config);
        // A freshly constructed OnceLock; the set cannot fail.
        let _ = runtime.registry.set(registry);
        runtime
    }

    fn with_file(file: Option<File>, config: RseqConfig) -> Self {
        let manager = RegistrationManager::new(&config);
        let fallback = FallbackController::new(config.reject_unsupported_sections);

        RseqRuntime {
            file,
            registry: OnceLock::new(),
            locator: ThreadLocator::new(),
            manager,
            fallback,
            config,
        }
    }

    /// The section registry, built on first access.
    ///
    /// Single-flight: the first caller parses the static descriptor table,
    /// concurrent callers wait for that parse. Failure produces the empty registry
    /// and engages the fallback.
    pub fn registry(&self) -> &SequenceRegistry {
        self.registry.get_or_init(|| match &self.file {
            Some(file) => match SequenceRegistry::from_file(file) {
                Ok(registry) => registry,
                Err(error) => {
                    let reason = match error {
                        Error::UnsupportedConstruct(_) | Error::Empty => {
                            FallbackReason::MissingTable
                        }
                        _ => FallbackReason::MalformedTable,
                    };
                    warn!(%error, "descriptor table unusable, no sections recognized");
                    self.fallback.engage(reason);
                    SequenceRegistry::empty()
                }
            },
            None => {
                self.fallback.engage(FallbackReason::MissingTable);
                SequenceRegistry::empty()
            }
        })
    }

    /// Handle an intercepted registration request from an application thread.
    ///
    /// Builds the registry if this is the first observation, then records or
    /// verifies the thread's descriptor storage offset. An offset disagreeing with
    /// the resolved process-wide value engages the fallback process-wide.
    ///
    /// ## Arguments
    /// * 'offset' - The storage offset named by the request
    #[must_use]
    pub fn observe_registration(&self, offset: u64) -> RegistrationOutcome {
        self.registry();

        if self.fallback.is_rejecting() {
            return RegistrationOutcome::NotSupported;
        }

        match self.locator.observe(offset) {
            Ok(_) => RegistrationOutcome::Accepted,
            Err(_) => {
                self.fallback.engage(FallbackReason::OffsetMismatch);
                RegistrationOutcome::NotSupported
            }
        }
    }

    /// Resolve the storage offset at attach time, when no registration has been
    /// observed yet.
    ///
    /// ## Arguments
    /// * 'candidates' - Candidate offsets satisfying the descriptor alignment
    /// * 'trial'      - The host's trial registration primitive
    ///
    /// # Errors
    /// Propagates [`crate::locator::ThreadLocator::probe`] failures after engaging
    /// the fallback; an unresolved probe leaves the process in reject mode.
    pub fn probe_offset(
        &self,
        candidates: &[u64],
        trial: &dyn TrialRegistration,
    ) -> Result<u64> {
        match self
            .locator
            .probe(candidates, self.config.storage_alignment, trial)
        {
            Ok(offset) => Ok(offset),
            Err(error) => {
                let reason = match error {
                    Error::AssumptionViolation { .. } => FallbackReason::OffsetMismatch,
                    _ => FallbackReason::ProbeAmbiguity,
                };
                self.fallback.engage(reason);
                Err(error)
            }
        }
    }

    /// The section starting exactly at `address`, unless the process is rejecting.
    ///
    /// ## Arguments
    /// * 'address' - An original virtual address
    #[must_use]
    pub fn section_at_start(&self, address: u64) -> Option<Arc<SectionDescriptor>> {
        if self.fallback.is_rejecting() {
            return None;
        }

        self.registry().locate_start(address)
    }

    /// The section containing `address`, unless the process is rejecting.
    ///
    /// ## Arguments
    /// * 'address' - An original virtual address
    #[must_use]
    pub fn section_containing(&self, address: u64) -> Option<Arc<SectionDescriptor>> {
        if self.fallback.is_rejecting() {
            return None;
        }

        self.registry().locate(address)
    }

    /// Compile a whole section and emit its section-ending region.
    ///
    /// Convenience over the per-block pipeline for hosts whose block discovery
    /// delivers a section's blocks together. Returns `Ok(None)`, meaning ordinary
    /// unprotected compilation, when the entry is not a recognized section start
    /// or when the section violates a discoverability assumption; the latter also
    /// engages the fallback. The returned region still needs
    /// [`crate::patch::PatchController::resolve`] at its post-emission control
    /// point.
    ///
    /// ## Arguments
    /// * 'region'       - Identity the host assigned to the section-ending region
    /// * 'entry'        - The address compilation is entering at
    /// * 'blocks'       - The section's body blocks, in compilation order
    /// * 'instrumenter' - Client instrumentation to apply
    ///
    /// # Errors
    /// Returns ordering violations from the first-phase compiler (blocks outside
    /// the body, blocks after the commit point); these are host bugs, not section defects.
    pub fn compile_section(
        &self,
        region: RegionId,
        entry: u64,
        blocks: &[BasicBlock],
        instrumenter: &dyn Instrumenter,
    ) -> Result<Option<EmittedRegion>> {
        let Some(descriptor) = self.section_at_start(entry) else {
            return Ok(None);
        };

        let Some(mut compiler) = FirstPhaseCompiler::begin(entry, descriptor, instrumenter)
        else {
            return Ok(None);
        };

        for block in blocks {
            match compiler.compile_block(block) {
                Ok(()) => {}
                Err(Error::UnsupportedConstruct(reason)) => {
                    warn!(entry, reason, "section not protected");
                    self.fallback.engage(FallbackReason::MidBodyExit);
                    return Ok(None);
                }
                Err(error) => return Err(error),
            }
        }

        let section = compiler.finish()?;

        match SecondPhaseEmitter::emit(region, &section) {
            Ok(emitted) => Ok(Some(emitted)),
            Err(Error::UnsupportedConstruct(reason)) => {
                warn!(entry, reason, "section not protected");
                self.fallback.engage(FallbackReason::IndirectBranch);
                Ok(None)
            }
            Err(error) => Err(error),
        }
    }

    /// The process's registration manager.
    #[must_use]
    pub fn manager(&self) -> &RegistrationManager {
        &self.manager
    }

    /// The process's fallback controller.
    #[must_use]
    pub fn fallback(&self) -> &FallbackController {
        &self.fallback
    }

    /// The process's storage-offset locator.
    #[must_use]
    pub fn locator(&self) -> &ThreadLocator {
        &self.locator
    }

    /// The configuration this runtime was created with.
    #[must_use]
    pub fn config(&self) -> &RseqConfig {
        &self.config
    }
}
