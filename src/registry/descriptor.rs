//! Critical-section descriptor rows and their wire format.
//!
//! The static descriptor table is a toolchain-emitted convention, not an executable
//! structure: contiguous 32-byte rows of `{version, flags, start address,
//! post-commit offset, abort address}`, all little-endian, placed in a well-known
//! section and aligned to the row size. This module parses single rows and enforces
//! the row-level invariants; assembling rows into the lookup structure is the
//! registry's job.

use bitflags::bitflags;

use crate::{file::io::read_le_at, Result};

/// Size of one descriptor row in bytes.
pub const DESCRIPTOR_SIZE: usize = 32;

/// Required alignment of the descriptor table and of each row.
pub const DESCRIPTOR_ALIGN: u64 = 32;

/// The descriptor version this implementation understands.
pub const DESCRIPTOR_VERSION: u32 = 0;

bitflags! {
    /// Kernel trigger-selection flag bits carried by a descriptor.
    ///
    /// Each bit asks the kernel *not* to abort the section for one trigger type.
    /// This implementation parses and preserves the bits but never changes its
    /// behavior based on them: the section body is always run a second time. This
    /// is a known divergence from the descriptor contract.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DescriptorFlags: u32 {
        /// Do not abort the section on preemption.
        const NO_RESTART_ON_PREEMPT = 0x01;

        /// Do not abort the section on signal delivery.
        const NO_RESTART_ON_SIGNAL = 0x02;

        /// Do not abort the section on CPU migration.
        const NO_RESTART_ON_MIGRATE = 0x04;
    }
}

/// One critical section's boundaries, as declared by the binary.
///
/// Immutable for the process lifetime once the registry is built. The section body
/// spans `[start, commit)`; `commit` is the address just past the section's commit
/// instruction, and `abort` is the application's abort handler, which the row-level
/// invariant requires to lie strictly outside the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionDescriptor {
    /// Declared descriptor version.
    pub version: u32,
    /// Kernel trigger-selection flags (parsed, preserved, not honored).
    pub flags: DescriptorFlags,
    /// Original address of the section's first instruction.
    pub start: u64,
    /// Original address just past the commit instruction.
    pub commit: u64,
    /// Original address of the application's abort handler.
    pub abort: u64,
}

impl SectionDescriptor {
    /// Read one 32-byte descriptor row at the given offset, advancing the offset.
    ///
    /// Parses the wire layout:
    /// 1. **Version** (4 bytes): must equal [`DESCRIPTOR_VERSION`]
    /// 2. **Flags** (4 bytes): trigger-selection bits; unknown bits are malformed
    /// 3. **Start address** (8 bytes): first instruction of the body
    /// 4. **Post-commit offset** (8 bytes): body length, must be non-zero
    /// 5. **Abort address** (8 bytes): must lie strictly outside the body
    ///
    /// ## Arguments
    /// * 'data'   - Buffer containing the descriptor table
    /// * 'offset' - Current read position (updated by this method)
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] on a truncated row and
    /// [`crate::Error::Malformed`] when a row-level invariant fails.
    pub fn row_read(data: &[u8], offset: &mut usize) -> Result<Self> {
        let row_start = *offset;

        let version = read_le_at::<u32>(data, offset)?;
        let raw_flags = read_le_at::<u32>(data, offset)?;
        let start = read_le_at::<u64>(data, offset)?;
        let post_commit_offset = read_le_at::<u64>(data, offset)?;
        let abort = read_le_at::<u64>(data, offset)?;

        if version != DESCRIPTOR_VERSION {
            return Err(malformed_error!(
                "Descriptor row at {:#x} has unknown version {}",
                row_start,
                version
            ));
        }

        let Some(flags) = DescriptorFlags::from_bits(raw_flags) else {
            return Err(malformed_error!(
                "Descriptor row at {:#x} carries unknown flag bits {:#x}",
                row_start,
                raw_flags
            ));
        };

        if post_commit_offset == 0 {
            return Err(malformed_error!(
                "Descriptor row at {:#x} declares an empty section body",
                row_start
            ));
        }

        let Some(commit) = start.checked_add(post_commit_offset) else {
            return Err(malformed_error!(
                "Descriptor row at {:#x} overflows the address space",
                row_start
            ));
        };

        if abort >= start && abort < commit {
            return Err(malformed_error!(
                "Descriptor row at {:#x} places its abort handler {:#x} inside the body [{:#x}, {:#x})",
                row_start,
                abort,
                start,
                commit
            ));
        }

        Ok(SectionDescriptor {
            version,
            flags,
            start,
            commit,
            abort,
        })
    }

    /// Length of the section body in bytes.
    #[must_use]
    pub fn body_len(&self) -> u64 {
        self.commit - self.start
    }

    /// Returns `true` if the given original address falls inside the body.
    #[must_use]
    pub fn contains(&self, address: u64) -> bool {
        address >= self.start && address < self.commit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crafted_row(version: u32, flags: u32, start: u64, post_commit: u64, abort: u64) -> Vec<u8> {
        let mut data = Vec::with_capacity(DESCRIPTOR_SIZE);
        data.extend_from_slice(&version.to_le_bytes());
        data.extend_from_slice(&flags.to_le_bytes());
        data.extend_from_slice(&start.to_le_bytes());
        data.extend_from_slice(&post_commit.to_le_bytes());
        data.extend_from_slice(&abort.to_le_bytes());
        data
    }

    #[test]
    fn crafted_valid() {
        let data = crafted_row(0, 0x03, 0x1000, 0x20, 0x2000);
        let mut offset = 0;

        let row = SectionDescriptor::row_read(&data, &mut offset).unwrap();
        assert_eq!(offset, DESCRIPTOR_SIZE);
        assert_eq!(row.version, 0);
        assert_eq!(
            row.flags,
            DescriptorFlags::NO_RESTART_ON_PREEMPT | DescriptorFlags::NO_RESTART_ON_SIGNAL
        );
        assert_eq!(row.start, 0x1000);
        assert_eq!(row.commit, 0x1020);
        assert_eq!(row.abort, 0x2000);
        assert_eq!(row.body_len(), 0x20);
        assert!(row.contains(0x1000));
        assert!(row.contains(0x101F));
        assert!(!row.contains(0x1020));
    }

    #[test]
    fn crafted_unknown_version() {
        let data = crafted_row(7, 0, 0x1000, 0x20, 0x2000);
        let mut offset = 0;

        assert!(SectionDescriptor::row_read(&data, &mut offset).is_err());
    }

    #[test]
    fn crafted_unknown_flags() {
        let data = crafted_row(0, 0x80, 0x1000, 0x20, 0x2000);
        let mut offset = 0;

        assert!(SectionDescriptor::row_read(&data, &mut offset).is_err());
    }

    #[test]
    fn crafted_abort_inside_body() {
        let data = crafted_row(0, 0, 0x1000, 0x20, 0x1010);
        let mut offset = 0;

        assert!(SectionDescriptor::row_read(&data, &mut offset).is_err());
    }

    #[test]
    fn crafted_abort_at_commit_is_valid() {
        // The body is half-open; the first address past the commit instruction
        // is outside it.
        let data = crafted_row(0, 0, 0x1000, 0x20, 0x1020);
        let mut offset = 0;

        assert!(SectionDescriptor::row_read(&data, &mut offset).is_ok());
    }

    #[test]
    fn crafted_empty_body() {
        let data = crafted_row(0, 0, 0x1000, 0, 0x2000);
        let mut offset = 0;

        assert!(SectionDescriptor::row_read(&data, &mut offset).is_err());
    }

    #[test]
    fn crafted_truncated() {
        let data = crafted_row(0, 0, 0x1000, 0x20, 0x2000);
        let mut offset = 0;

        assert!(SectionDescriptor::row_read(&data[..16], &mut offset).is_err());
    }
}
