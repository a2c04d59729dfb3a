//! Binary loading and section resolution for descriptor-table discovery.
//!
//! This module provides [`crate::file::File`], the access layer over the binary whose
//! critical sections are being rewritten. The binary is opened either from disk
//! (memory-mapped) or from a caller-provided buffer; its ELF section headers are parsed
//! once with goblin and copied into an owned table so later lookups never re-enter the
//! container parser.
//!
//! The only structures this subsystem ever reads out of a binary are the static
//! critical-section descriptor table and the optional pointer array referencing it,
//! both located through their well-known section names (see [`crate::registry`]).
//!
//! # Key Components
//!
//! - [`crate::file::File`] - Owned view of the binary: data access plus section lookup
//! - [`crate::file::SectionInfo`] - One ELF section: name, virtual address, offset, size
//! - [`crate::file::Backend`] - Storage abstraction (memory-mapped file or owned buffer)
//! - [`crate::file::parser::Parser`] - Cursor-based reader over raw bytes
//! - [`crate::file::io`] - Endian-aware bounds-checked read/write primitives
//!
//! # Usage Examples
//!
//! ```rust,ignore
//! use rseqgate::File;
//! use std::path::Path;
//!
//! let file = File::from_file(Path::new("a.out"))?;
//! if let Some(section) = file.section("__rseq_cs") {
//!     println!("descriptor table at {:#x}, {} bytes", section.address, section.size);
//! }
//! # Ok::<(), rseqgate::Error>(())
//! ```

pub mod io;
pub mod parser;

use std::{fs, path::Path};

use goblin::elf::Elf;
use memmap2::Mmap;

use crate::{
    Error::{Error, FileError, NotSupported, OutOfBounds},
    Result,
};

/// Storage abstraction for the bytes of a loaded binary.
///
/// Implemented by the memory-mapped disk backend and the owned-buffer backend.
/// All access is bounds-checked.
pub trait Backend: Send + Sync {
    /// Returns a slice of the data at the given offset and length.
    ///
    /// ## Arguments
    /// * 'offset' - The starting offset within the data
    /// * 'len'    - The length of the slice in bytes
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the range exceeds the data.
    fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]>;

    /// Returns the complete underlying data.
    fn data(&self) -> &[u8];

    /// Returns the total data length in bytes.
    fn len(&self) -> usize;
}

/// Input binary backed by a read-only memory mapping.
#[derive(Debug)]
struct Physical {
    data: Mmap,
}

impl Physical {
    /// Memory-map the file at the given path, read-only and shared.
    ///
    /// ## Arguments
    /// * 'path' - Path to the binary on disk
    fn new(path: &Path) -> Result<Physical> {
        let file = fs::File::open(path).map_err(FileError)?;

        // Mapping is read-only; the binary is never modified through this crate.
        let data = unsafe {
            Mmap::map(&file).map_err(|_| Error("Failed to memory-map input binary".to_string()))?
        };

        Ok(Physical { data })
    }
}

impl Backend for Physical {
    fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let Some(offset_end) = offset.checked_add(len) else {
            return Err(OutOfBounds);
        };

        if offset_end > self.data.len() {
            return Err(OutOfBounds);
        }

        Ok(&self.data[offset..offset_end])
    }

    fn data(&self) -> &[u8] {
        &self.data
    }

    fn len(&self) -> usize {
        self.data.len()
    }
}

/// Input binary backed by an owned buffer.
#[derive(Debug)]
struct Memory {
    data: Vec<u8>,
}

impl Backend for Memory {
    fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let Some(offset_end) = offset.checked_add(len) else {
            return Err(OutOfBounds);
        };

        if offset_end > self.data.len() {
            return Err(OutOfBounds);
        }

        Ok(&self.data[offset..offset_end])
    }

    fn data(&self) -> &[u8] {
        self.data.as_slice()
    }

    fn len(&self) -> usize {
        self.data.len()
    }
}

/// One section of the loaded binary, copied out of the ELF section headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionInfo {
    /// Section name from the section-header string table.
    pub name: String,
    /// Virtual address the section is mapped at (`sh_addr`).
    pub address: u64,
    /// File offset of the section contents (`sh_offset`).
    pub offset: u64,
    /// Size of the section contents in bytes (`sh_size`).
    pub size: u64,
}

impl SectionInfo {
    /// Returns `true` if the given virtual address falls inside this section.
    #[must_use]
    pub fn contains(&self, va: u64) -> bool {
        va >= self.address && va < self.address.saturating_add(self.size)
    }
}

/// Owned view of the binary being rewritten.
///
/// Combines a [`Backend`] holding the raw bytes with the owned section table parsed
/// from the ELF headers at construction time. The goblin parse happens exactly once;
/// everything later is slice arithmetic over the copied section table.
///
/// # Examples
///
/// ```rust,ignore
/// use rseqgate::File;
///
/// let binary = std::fs::read("a.out")?;
/// let file = File::from_mem(binary)?;
/// println!("{} sections", file.sections().count());
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct File {
    data: Box<dyn Backend>,
    sections: Vec<SectionInfo>,
}

impl File {
    /// Load a binary from disk using memory-mapped I/O.
    ///
    /// ## Arguments
    /// * 'file' - Path to the ELF binary
    ///
    /// # Errors
    /// Returns [`crate::Error::FileError`] if the file cannot be opened,
    /// [`crate::Error::GoblinErr`] if the ELF container is invalid, or
    /// [`crate::Error::Empty`] for an empty file.
    pub fn from_file(file: &Path) -> Result<File> {
        let backend = Physical::new(file)?;
        let sections = Self::parse_sections(backend.data())?;

        Ok(File {
            data: Box::new(backend),
            sections,
        })
    }

    /// Load a binary from a memory buffer.
    ///
    /// ## Arguments
    /// * 'data' - The buffer holding the full binary image
    ///
    /// # Errors
    /// Returns [`crate::Error::GoblinErr`] if the ELF container is invalid or
    /// [`crate::Error::Empty`] for an empty buffer.
    pub fn from_mem(data: Vec<u8>) -> Result<File> {
        let backend = Memory { data };
        let sections = Self::parse_sections(backend.data())?;

        Ok(File {
            data: Box::new(backend),
            sections,
        })
    }

    fn parse_sections(data: &[u8]) -> Result<Vec<SectionInfo>> {
        if data.is_empty() {
            return Err(crate::Error::Empty);
        }

        let elf = Elf::parse(data)?;
        if elf.section_headers.is_empty() {
            return Err(NotSupported);
        }

        let mut sections = Vec::with_capacity(elf.section_headers.len());
        for header in &elf.section_headers {
            let name = elf
                .shdr_strtab
                .get_at(header.sh_name)
                .unwrap_or_default()
                .to_string();

            sections.push(SectionInfo {
                name,
                address: header.sh_addr,
                offset: header.sh_offset,
                size: header.sh_size,
            });
        }

        Ok(sections)
    }

    /// Total length of the binary image in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the binary image is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.len() == 0
    }

    /// The complete binary image.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        self.data.data()
    }

    /// A bounds-checked slice of the binary image.
    ///
    /// ## Arguments
    /// * 'offset' - Starting file offset
    /// * 'len'    - Length in bytes
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the range exceeds the image.
    pub fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.data.data_slice(offset, len)
    }

    /// Iterate over all sections of the binary.
    pub fn sections(&self) -> impl Iterator<Item = &SectionInfo> {
        self.sections.iter()
    }

    /// Look up a section by name.
    ///
    /// ## Arguments
    /// * 'name' - Exact section name, e.g. `"__rseq_cs"`
    #[must_use]
    pub fn section(&self, name: &str) -> Option<&SectionInfo> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// Translate a virtual address to a file offset.
    ///
    /// ## Arguments
    /// * 'va' - The virtual address to translate
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidOffset`] if the address falls in no section.
    pub fn va_to_offset(&self, va: u64) -> Result<usize> {
        for section in &self.sections {
            if section.contains(va) {
                let offset = section.offset + (va - section.address);
                return usize::try_from(offset).map_err(|_| crate::Error::InvalidOffset);
            }
        }

        Err(crate::Error::InvalidOffset)
    }
}
