//! Discovery of critical-section boundaries ahead of execution.
//!
//! The kernel identifies critical sections purely by original instruction addresses,
//! so the rewriting engine must know every section's boundaries *before* it compiles
//! the code: once execution is inside a relocated copy, the original addresses are
//! gone. The [`SequenceRegistry`] provides that knowledge: it parses the binary's
//! static descriptor table into a sorted collection keyed by start address and
//! answers range lookups during block compilation.
//!
//! # Failure Policy
//!
//! The registry fails closed. A binary without the table section, or with a table
//! that violates any row- or table-level invariant, produces no recognized sections;
//! callers route every later registration request for such a binary through the
//! process-wide fallback. The registry is built once and never rebuilt; sections in
//! dynamically loaded code are an explicit limitation.
//!
//! # Table Conventions
//!
//! Two toolchain conventions are parsed:
//!
//! - The descriptor-array section ([`RSEQ_CS_SECTION`]): contiguous 32-byte rows.
//! - The pointer-array section ([`RSEQ_CS_PTR_ARRAY_SECTION`]): one 8-byte virtual
//!   address per element, each referencing a row inside the descriptor-array
//!   section. When present it names the authoritative row set.
//!
//! # Examples
//!
//! ```rust,ignore
//! use rseqgate::{File, registry::SequenceRegistry};
//!
//! let file = File::from_file("a.out".as_ref())?;
//! let registry = SequenceRegistry::from_file(&file)?;
//!
//! if let Some(section) = registry.locate(0x1234) {
//!     println!("inside section starting at {:#x}", section.start);
//! }
//! # Ok::<(), rseqgate::Error>(())
//! ```

mod descriptor;

pub use descriptor::{
    DescriptorFlags, SectionDescriptor, DESCRIPTOR_ALIGN, DESCRIPTOR_SIZE, DESCRIPTOR_VERSION,
};

use std::{ops::Bound, sync::Arc};

use crossbeam_skiplist::SkipMap;
use tracing::{debug, info};

use crate::{file::parser::Parser, file::File, Error, Result};

/// Section name of the descriptor-array table.
pub const RSEQ_CS_SECTION: &str = "__rseq_cs";

/// Section name of the pointer array referencing descriptor rows.
pub const RSEQ_CS_PTR_ARRAY_SECTION: &str = "__rseq_cs_ptr_array";

/// Sorted, immutable-after-build collection of a binary's critical sections.
///
/// Storage is a lock-free skip list keyed by section start address, supporting the
/// two lookups compilation needs: exact match at a section start, and containing
/// section for an arbitrary address. The registry is written only during
/// construction; all later access is read-only and needs no synchronization.
pub struct SequenceRegistry {
    sections: SkipMap<u64, Arc<SectionDescriptor>>,
}

impl SequenceRegistry {
    /// Build an empty registry recognizing no sections.
    ///
    /// The state a binary without a usable descriptor table ends up in.
    #[must_use]
    pub fn empty() -> Self {
        SequenceRegistry {
            sections: SkipMap::new(),
        }
    }

    /// Build the registry from a binary's static descriptor table.
    ///
    /// Locates the table through the binary's section metadata, preferring the
    /// pointer-array convention when both are present, and parses every row.
    ///
    /// ## Arguments
    /// * 'file' - The loaded binary
    ///
    /// # Errors
    /// Returns [`crate::Error::UnsupportedConstruct`] if the binary carries no
    /// descriptor-table section, [`crate::Error::Malformed`] if the table violates
    /// an invariant, and [`crate::Error::Empty`] for a zero-length table. Callers
    /// treat every error as "no sections recognized" and engage the fallback.
    pub fn from_file(file: &File) -> Result<Self> {
        let Some(table) = file.section(RSEQ_CS_SECTION) else {
            return Err(Error::UnsupportedConstruct("no static descriptor table"));
        };

        if table.size == 0 {
            return Err(Error::Empty);
        }

        if table.address % DESCRIPTOR_ALIGN != 0 {
            return Err(malformed_error!(
                "Descriptor table at {:#x} is not {}-byte aligned",
                table.address,
                DESCRIPTOR_ALIGN
            ));
        }

        if table.size % DESCRIPTOR_SIZE as u64 != 0 {
            return Err(malformed_error!(
                "Descriptor table size {:#x} is not a multiple of the row size",
                table.size
            ));
        }

        let table_offset = usize::try_from(table.offset).map_err(|_| Error::InvalidOffset)?;
        let table_size = usize::try_from(table.size).map_err(|_| Error::InvalidOffset)?;
        let table_data = file.data_slice(table_offset, table_size)?;

        let registry = SequenceRegistry::empty();

        if let Some(ptr_array) = file.section(RSEQ_CS_PTR_ARRAY_SECTION) {
            registry.parse_ptr_array(file, table_data, table.address, ptr_array)?;
        } else {
            let mut offset = 0;
            while offset < table_data.len() {
                let row = SectionDescriptor::row_read(table_data, &mut offset)?;
                registry.insert(row)?;
            }
        }

        info!(
            sections = registry.len(),
            "built critical-section registry from static descriptor table"
        );

        Ok(registry)
    }

    /// Build a registry from already-validated descriptors.
    ///
    /// Used by hosts that obtain boundaries through their own loader plumbing.
    ///
    /// ## Arguments
    /// * 'descriptors' - The section descriptors to register
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for duplicate start addresses.
    pub fn from_descriptors<I>(descriptors: I) -> Result<Self>
    where
        I: IntoIterator<Item = SectionDescriptor>,
    {
        let registry = SequenceRegistry::empty();
        for descriptor in descriptors {
            registry.insert(descriptor)?;
        }
        Ok(registry)
    }

    fn parse_ptr_array(
        &self,
        file: &File,
        table_data: &[u8],
        table_address: u64,
        ptr_array: &crate::file::SectionInfo,
    ) -> Result<()> {
        if ptr_array.size % 8 != 0 {
            return Err(malformed_error!(
                "Descriptor pointer array size {:#x} is not a multiple of 8",
                ptr_array.size
            ));
        }

        let array_offset = usize::try_from(ptr_array.offset).map_err(|_| Error::InvalidOffset)?;
        let array_size = usize::try_from(ptr_array.size).map_err(|_| Error::InvalidOffset)?;
        let array_data = file.data_slice(array_offset, array_size)?;

        let mut entries = Parser::new(array_data);
        while entries.has_more_data() {
            let entry_va = entries.read_le::<u64>()?;

            if entry_va < table_address
                || entry_va + DESCRIPTOR_SIZE as u64 > table_address + table_data.len() as u64
            {
                return Err(malformed_error!(
                    "Descriptor pointer {:#x} points outside the descriptor table",
                    entry_va
                ));
            }

            if (entry_va - table_address) % DESCRIPTOR_SIZE as u64 != 0 {
                return Err(malformed_error!(
                    "Descriptor pointer {:#x} is not row-aligned",
                    entry_va
                ));
            }

            let mut row_offset = usize::try_from(entry_va - table_address)
                .map_err(|_| Error::InvalidOffset)?;
            let row = SectionDescriptor::row_read(table_data, &mut row_offset)?;
            self.insert(row)?;
        }

        Ok(())
    }

    fn insert(&self, descriptor: SectionDescriptor) -> Result<()> {
        if self.sections.contains_key(&descriptor.start) {
            return Err(malformed_error!(
                "Duplicate descriptor for section start {:#x}",
                descriptor.start
            ));
        }

        debug!(
            start = descriptor.start,
            commit = descriptor.commit,
            abort = descriptor.abort,
            flags = descriptor.flags.bits(),
            "registered critical section"
        );
        self.sections.insert(descriptor.start, Arc::new(descriptor));
        Ok(())
    }

    /// Number of sections recognized in this binary.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sections.len()
    }

    /// Returns `true` if no sections are recognized.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    /// Find the section containing the given original address, if any.
    ///
    /// ## Arguments
    /// * 'address' - An original virtual address
    #[must_use]
    pub fn locate(&self, address: u64) -> Option<Arc<SectionDescriptor>> {
        let entry = self.sections.upper_bound(Bound::Included(&address))?;
        let descriptor = entry.value();

        if descriptor.contains(address) {
            Some(Arc::clone(descriptor))
        } else {
            None
        }
    }

    /// Find the section starting exactly at the given original address, if any.
    ///
    /// The first-phase compiler only protects sections entered at their start; this
    /// is the lookup it performs when a new code region begins.
    ///
    /// ## Arguments
    /// * 'address' - An original virtual address
    #[must_use]
    pub fn locate_start(&self, address: u64) -> Option<Arc<SectionDescriptor>> {
        self.sections
            .get(&address)
            .map(|entry| Arc::clone(entry.value()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(start: u64, len: u64, abort: u64) -> SectionDescriptor {
        SectionDescriptor {
            version: DESCRIPTOR_VERSION,
            flags: DescriptorFlags::empty(),
            start,
            commit: start + len,
            abort,
        }
    }

    #[test]
    fn range_lookup() {
        let registry = SequenceRegistry::from_descriptors(vec![
            descriptor(0x1000, 0x20, 0x2000),
            descriptor(0x3000, 0x10, 0x2000),
        ])
        .unwrap();

        assert_eq!(registry.len(), 2);

        let inside = registry.locate(0x1010).unwrap();
        assert_eq!(inside.start, 0x1000);

        assert!(registry.locate(0x1020).is_none());
        assert!(registry.locate(0x2FFF).is_none());
        assert!(registry.locate(0x0FFF).is_none());

        let exact = registry.locate_start(0x3000).unwrap();
        assert_eq!(exact.commit, 0x3010);
        assert!(registry.locate_start(0x3001).is_none());
    }

    #[test]
    fn duplicate_start_rejected() {
        let result = SequenceRegistry::from_descriptors(vec![
            descriptor(0x1000, 0x20, 0x2000),
            descriptor(0x1000, 0x10, 0x2000),
        ]);

        assert!(result.is_err());
    }

    #[test]
    fn empty_registry_locates_nothing() {
        let registry = SequenceRegistry::empty();
        assert!(registry.is_empty());
        assert!(registry.locate(0x1000).is_none());
    }
}
