//! Configuration for the protection mechanism.

/// Process-wide configuration for critical-section handling.
///
/// The one operator-visible switch is [`RseqConfig::reject_unsupported_sections`],
/// selecting the starting mode of the [`crate::fallback::FallbackController`]. The
/// remaining fields tune internal allocation and probing and keep their defaults in
/// normal operation.
///
/// # Examples
///
/// ```rust
/// use rseqgate::RseqConfig;
///
/// let config = RseqConfig::default();
/// assert!(!config.reject_unsupported_sections);
///
/// let strict = RseqConfig::strict();
/// assert!(strict.reject_unsupported_sections);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RseqConfig {
    /// Start the process in reject mode: every registration request is answered
    /// with a not-supported outcome and no two-phase regions are built.
    pub reject_unsupported_sections: bool,

    /// Address at which critical-section record allocations are placed.
    ///
    /// Records are laid out contiguously from this base; the address of a record is
    /// what gets written into a thread's descriptor-pointer slot and loaded by the
    /// patched placeholder in its region.
    pub record_base: u64,

    /// Upper bound on live critical-section records, if any.
    ///
    /// Exceeding the bound makes record reservation fail with
    /// [`crate::Error::AllocationFailure`] and the affected section falls back.
    pub max_live_records: Option<usize>,

    /// Required alignment of the per-thread descriptor storage, in bytes.
    ///
    /// Constrains the candidate set of the attach-time storage-offset probe.
    pub storage_alignment: u64,
}

impl Default for RseqConfig {
    fn default() -> Self {
        RseqConfig {
            reject_unsupported_sections: false,
            record_base: 0x7F00_0000_0000,
            max_live_records: None,
            storage_alignment: 32,
        }
    }
}

impl RseqConfig {
    /// Configuration that accepts registrations and builds two-phase regions.
    #[must_use]
    pub fn permissive() -> Self {
        RseqConfig::default()
    }

    /// Configuration that rejects every registration request from the start.
    ///
    /// The safe choice for binaries known to violate discoverability assumptions.
    #[must_use]
    pub fn strict() -> Self {
        RseqConfig {
            reject_unsupported_sections: true,
            ..RseqConfig::default()
        }
    }
}
