use thiserror::Error;

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("malformed ELF file: {0}")]
    Elf(#[from] goblin::error::Error),
    #[error("section {name} lies outside the file ({offset:#x}+{size:#x})")]
    SectionOutOfBounds { name: String, offset: u64, size: u64 },
    #[error("sections {first} and {second} overlap at {addr:#x}")]
    SectionOverlap {
        first: String,
        second: String,
        addr: u64,
    },
    #[error("loadable sections span {span:#x} bytes, which is too large for a flat image")]
    SpanTooLarge { span: u64 },
}

/// One entry of a binary's section header table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    pub addr: u64,
    pub offset: u64,
    pub size: u64,
    /// Occupies memory at run time (`SHF_ALLOC`).
    pub alloc: bool,
    /// Zero-fill section with no bytes in the file (`SHT_NOBITS`).
    pub nobits: bool,
}

impl Section {
    #[must_use]
    pub fn is_file_backed(&self) -> bool {
        self.alloc && !self.nobits
    }
}

pub mod elf;
