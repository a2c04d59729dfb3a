//! Resolution of the per-thread descriptor storage offset.
//!
//! The kernel finds a thread's active section descriptor through a pointer slot in
//! that thread's static per-thread storage. The rewriting engine is never told where
//! that slot is; it has to determine the offset itself, once per process, and the
//! whole mechanism rests on the assumption that the offset is the same for every
//! thread. This module owns that single resolved value and its
//! init-once/verify-forever lifecycle.
//!
//! Two resolution paths exist:
//!
//! - **Observed registration**: the first registration request a process makes
//!   carries the slot's offset directly; it is recorded through a single-writer path.
//! - **Attach-time probe**: when the engine attaches to a process that registered
//!   before it was being observed, the small set of alignment-satisfying candidate
//!   offsets is disambiguated using the distinguishing error behavior of a trial
//!   registration call: re-registering at the already-registered slot fails as
//!   *busy*, anywhere else as *invalid*.
//!
//! Once resolved, every later registration is verified against the stored offset.
//! A mismatch is a hard assumption violation answered with a process-wide fallback,
//! never a silent resync.

use std::sync::OnceLock;

use tracing::{info, warn};

use crate::{Error, Result};

/// The once-resolved descriptor storage offset for this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadLocatorState {
    /// Byte offset of the descriptor-pointer slot from the per-thread storage base.
    pub offset: u64,
}

/// Outcome of a trial registration call at a candidate offset.
///
/// Mirrors the error behavior of the kernel's registration interface when a
/// registration already exists for the calling thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialOutcome {
    /// The candidate matches the live registration; the kernel answers "busy".
    Busy,
    /// The candidate does not match the live registration.
    Invalid,
    /// The thread had no live registration; the trial call registered it.
    ///
    /// The probe cannot confirm an offset from this outcome.
    Accepted,
}

/// A trial registration primitive, provided by the host engine.
///
/// The probe never interprets the call beyond its [`TrialOutcome`]; issuing the
/// actual syscall-equivalent and undoing an accidental [`TrialOutcome::Accepted`]
/// registration are the host's business.
pub trait TrialRegistration {
    /// Attempt a registration naming the slot at `offset`.
    ///
    /// ## Arguments
    /// * 'offset' - Candidate byte offset from the per-thread storage base
    fn attempt(&self, offset: u64) -> TrialOutcome;
}

/// Owner of the process-wide storage-offset value.
///
/// Construction is single-flight: concurrent first observers race through
/// [`OnceLock`] set semantics, the first writer wins, and every loser verifies
/// against the winning value.
#[derive(Debug, Default)]
pub struct ThreadLocator {
    state: OnceLock<ThreadLocatorState>,
}

impl ThreadLocator {
    /// Create an unresolved locator.
    #[must_use]
    pub fn new() -> Self {
        ThreadLocator {
            state: OnceLock::new(),
        }
    }

    /// The resolved offset, if resolution has happened.
    #[must_use]
    pub fn resolved(&self) -> Option<u64> {
        self.state.get().map(|s| s.offset)
    }

    /// Record or verify the storage offset carried by a registration request.
    ///
    /// The first call records the offset as the process-wide constant; every later
    /// call verifies against it.
    ///
    /// ## Arguments
    /// * 'offset' - The offset observed in the registration request
    ///
    /// # Errors
    /// Returns [`crate::Error::AssumptionViolation`] when the observed offset
    /// disagrees with the resolved value. Callers must treat this as fatal to the
    /// mechanism for the whole process.
    pub fn observe(&self, offset: u64) -> Result<u64> {
        let state = self.state.get_or_init(|| {
            info!(offset, "resolved per-thread descriptor storage offset");
            ThreadLocatorState { offset }
        });

        if state.offset != offset {
            warn!(
                expected = state.offset,
                observed = offset,
                "descriptor storage offset mismatch"
            );
            return Err(Error::AssumptionViolation {
                expected: state.offset,
                observed: offset,
            });
        }

        Ok(state.offset)
    }

    /// Resolve the offset at attach time by probing candidate offsets.
    ///
    /// Candidates violating the required alignment are discarded; the rest are
    /// disambiguated by trial registration. Exactly one *busy* answer names the
    /// live slot. The resolved offset is recorded as if it had been observed.
    ///
    /// ## Arguments
    /// * 'candidates' - Candidate byte offsets from the per-thread storage base
    /// * 'alignment'  - Required slot alignment in bytes
    /// * 'trial'      - The trial registration primitive
    ///
    /// # Errors
    /// Returns [`crate::Error::UnsupportedConstruct`] when zero or more than one
    /// candidate answers busy, or when a trial call registered the thread itself
    /// (the thread had no registration to find). Returns
    /// [`crate::Error::AssumptionViolation`] if a concurrent observation resolved
    /// a different offset first.
    pub fn probe(
        &self,
        candidates: &[u64],
        alignment: u64,
        trial: &dyn TrialRegistration,
    ) -> Result<u64> {
        let mut confirmed = None;

        for &candidate in candidates {
            if alignment != 0 && candidate % alignment != 0 {
                continue;
            }

            match trial.attempt(candidate) {
                TrialOutcome::Busy => {
                    if confirmed.is_some() {
                        return Err(Error::UnsupportedConstruct(
                            "storage offset probe is ambiguous",
                        ));
                    }
                    confirmed = Some(candidate);
                }
                TrialOutcome::Invalid => {}
                TrialOutcome::Accepted => {
                    return Err(Error::UnsupportedConstruct(
                        "thread had no live registration to probe",
                    ));
                }
            }
        }

        let Some(offset) = confirmed else {
            return Err(Error::UnsupportedConstruct(
                "no probe candidate matched the live registration",
            ));
        };

        self.observe(offset)
    }
}
