//! Process-wide fallback policy for unsupported critical sections.
//!
//! Fine-grained detection of every discoverability violation is not solvable in
//! general, so the policy here is deliberately coarse: one binary mode per process,
//! accept or reject. In reject mode every registration request is answered with a
//! not-supported outcome and the affected code runs as ordinary generated code,
//! without the protection mechanism. That is correctness-risky for the application
//! but never a host-engine failure.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::warn;

/// Why the process was switched into reject mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    /// The binary has no static descriptor table.
    MissingTable,
    /// The static descriptor table exists but could not be parsed.
    MalformedTable,
    /// A registration disagreed with the resolved per-thread storage offset.
    OffsetMismatch,
    /// The attach-time storage-offset probe could not be disambiguated.
    ProbeAmbiguity,
    /// A section body contains an indirect branch.
    IndirectBranch,
    /// A section body exits before its commit point.
    MidBodyExit,
    /// Record allocation failed while finishing a section-ending region.
    RecordAllocation,
    /// Reject mode was requested through configuration.
    Operator,
}

impl FallbackReason {
    /// Short stable label for logging.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            FallbackReason::MissingTable => "missing-table",
            FallbackReason::MalformedTable => "malformed-table",
            FallbackReason::OffsetMismatch => "offset-mismatch",
            FallbackReason::ProbeAmbiguity => "probe-ambiguity",
            FallbackReason::IndirectBranch => "indirect-branch",
            FallbackReason::MidBodyExit => "mid-body-exit",
            FallbackReason::RecordAllocation => "record-allocation",
            FallbackReason::Operator => "operator",
        }
    }
}

/// Outcome of a registration request, as answered to the host engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationOutcome {
    /// The registration is accepted; the two-phase scheme applies to this thread.
    Accepted,
    /// The registration is not supported; the thread runs without the mechanism.
    NotSupported,
}

/// The process-wide accept/reject switch.
///
/// Engagement is one-way: once any violation has put the process into reject mode
/// it stays there, matching the process-global nature of the assumptions that were
/// violated. The mode is read on every registration request, so engagement from any
/// thread takes effect for all of them.
#[derive(Debug)]
pub struct FallbackController {
    reject: AtomicBool,
}

impl FallbackController {
    /// Create a controller in the given starting mode.
    ///
    /// ## Arguments
    /// * 'reject' - Start in reject mode (`true`) or accept mode (`false`)
    #[must_use]
    pub fn new(reject: bool) -> Self {
        if reject {
            warn!(reason = FallbackReason::Operator.as_str(), "critical-section protection disabled");
        }

        FallbackController {
            reject: AtomicBool::new(reject),
        }
    }

    /// Returns `true` while the process is in reject mode.
    #[must_use]
    pub fn is_rejecting(&self) -> bool {
        self.reject.load(Ordering::Acquire)
    }

    /// Switch the process into reject mode.
    ///
    /// ## Arguments
    /// * 'reason' - The violation that forced the switch
    pub fn engage(&self, reason: FallbackReason) {
        let was_rejecting = self.reject.swap(true, Ordering::AcqRel);
        if !was_rejecting {
            warn!(
                reason = reason.as_str(),
                "engaging process-wide fallback, critical sections run unprotected"
            );
        }
    }

    /// Answer a registration request under the current mode.
    #[must_use]
    pub fn answer(&self) -> RegistrationOutcome {
        if self.is_rejecting() {
            RegistrationOutcome::NotSupported
        } else {
            RegistrationOutcome::Accepted
        }
    }
}
