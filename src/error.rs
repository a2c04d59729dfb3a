use thiserror::Error;

use crate::manager::RegionId;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// This enum covers all possible error conditions that can occur while parsing a binary's
/// static descriptor table, compiling the two-phase execution scheme for a critical section,
/// and managing descriptor lifetimes. Each variant provides specific context about the
/// failure mode to enable appropriate error handling.
///
/// None of these errors surface to the application being rewritten. They decide whether the
/// restartable-sequence protection mechanism is engaged for a section, a thread, or the
/// whole process; a rejected section simply runs as ordinary (unprotected) generated code.
///
/// # Error Categories
///
/// ## File Parsing Errors
/// - [`Error::InvalidOffset`] - Invalid file offset during parsing
/// - [`Error::Malformed`] - Corrupted or invalid file structure
/// - [`Error::OutOfBounds`] - Attempted to read beyond file boundaries
/// - [`Error::NotSupported`] - Unsupported file format or feature
/// - [`Error::Empty`] - Empty input provided
///
/// ## I/O and External Errors
/// - [`Error::FileError`] - Filesystem I/O errors
/// - [`Error::GoblinErr`] - ELF parsing errors from the goblin crate
///
/// ## Protection Mechanism Errors
/// - [`Error::UnsupportedConstruct`] - A discoverability assumption does not hold
/// - [`Error::AssumptionViolation`] - A previously resolved process-wide value disagrees
/// - [`Error::AllocationFailure`] - A critical-section record could not be allocated
/// - [`Error::RegionUnlinked`] - A generated region was referenced after unlinking
/// - [`Error::StaleCheckpoint`] - Register checkpoint slots consumed more than once
/// - [`Error::LockError`] - Thread synchronization failure
#[derive(Error, Debug)]
pub enum Error {
    // File parsing Errors
    /// Encountered an invalid offset while parsing file structures.
    ///
    /// This error occurs when the parser encounters an offset that is invalid
    /// for the current file context, such as a virtual address that does not
    /// fall inside any mapped section of the binary.
    #[error("Could not retrieve a valid offset!")]
    InvalidOffset,

    /// The file is damaged and could not be parsed.
    ///
    /// This error indicates that a structure is corrupted or doesn't conform to the
    /// documented static descriptor table convention. The error includes the source
    /// location where the malformation was detected for debugging purposes.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of what was malformed
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted while parsing the file.
    ///
    /// This error occurs when trying to read data beyond the end of the file
    /// or section. It's a safety check to prevent buffer overruns during parsing.
    #[error("Out of Bound read would have occurred!")]
    OutOfBounds,

    /// This file type is not supported.
    ///
    /// Indicates that the input binary is not an ELF executable, or uses
    /// features that are not yet implemented in this library.
    #[error("This file type is not supported")]
    NotSupported,

    /// Provided input was empty.
    ///
    /// This error occurs when an empty file, buffer, or descriptor table section
    /// was provided where actual data was expected.
    #[error("Provided input was empty")]
    Empty,

    /// File I/O error.
    ///
    /// Wraps standard I/O errors that can occur during file operations
    /// such as reading from disk, permission issues, or filesystem errors.
    #[error("{0}")]
    FileError(#[from] std::io::Error),

    /// Generic error for miscellaneous failures.
    ///
    /// Used for errors that don't fit into other categories, such as violations
    /// of the per-thread section state machine ordering.
    #[error("{0}")]
    Error(String),

    /// Error from the goblin crate during ELF parsing.
    ///
    /// The goblin crate is used for low-level ELF container parsing.
    /// This error wraps any failures from that parsing layer.
    #[error("{0}")]
    GoblinErr(#[from] goblin::error::Error),

    /// A critical section violates a discoverability assumption of the mechanism.
    ///
    /// Raised for indirect branches inside a section body, exits from a section body
    /// before its commit point, an absent or unusable static descriptor table, or an
    /// attach-time storage-offset probe that could not be disambiguated.
    ///
    /// Recovery is routing the request to the [`crate::fallback::FallbackController`]:
    /// the affected section, thread, or binary runs without the protection mechanism.
    /// This never crashes the host engine.
    #[error("Unsupported critical section construct - {0}")]
    UnsupportedConstruct(&'static str),

    /// A process-wide assumption was contradicted after it had been resolved.
    ///
    /// The per-thread descriptor-storage offset is resolved once per process and verified
    /// on every later registration. A disagreeing observation is fatal to the protection
    /// mechanism for the whole process; the fallback goes process-wide rather than
    /// attempting a per-thread resync.
    ///
    /// # Fields
    ///
    /// * `expected` - The offset resolved on first observation
    /// * `observed` - The conflicting offset seen later
    #[error("Descriptor storage offset mismatch - expected {expected:#x}, observed {observed:#x}")]
    AssumptionViolation {
        /// The offset resolved on first observation
        expected: u64,
        /// The conflicting offset seen later
        observed: u64,
    },

    /// A [`crate::manager::CriticalSectionRecord`] could not be allocated.
    ///
    /// The section-ending region must never be emitted referencing a record that does
    /// not exist; compilation of that region is abandoned, partially built emission
    /// state is released, and the section falls back to unprotected execution.
    #[error("Failed to allocate a critical section record")]
    AllocationFailure,

    /// A generated region was referenced after it had been unlinked.
    ///
    /// Entering the native phase requires a live lifetime-table entry for the region.
    #[error("Generated region was already unlinked - {0}")]
    RegionUnlinked(RegionId),

    /// Register checkpoint slots were consumed while stale.
    ///
    /// Checkpoint slots are written at section entry and consumed exactly once,
    /// immediately before entering the native phase.
    #[error("Register checkpoint slots are stale")]
    StaleCheckpoint,

    /// Failed to lock target.
    ///
    /// This error occurs when thread synchronization fails, typically
    /// when trying to acquire a mutex that is in an invalid state.
    #[error("Failed to lock target")]
    LockError,
}
