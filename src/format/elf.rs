use goblin::elf::section_header::{SHF_ALLOC, SHT_NOBITS, SHT_NULL};
use goblin::elf::Elf;

use crate::format::{FormatError, Section};

/// Flat images larger than this cannot belong to an 8-bit target.
const MAX_FLAT_SPAN: u64 = 16 * 1024 * 1024;

/// A linked binary: its section table plus the file bytes the sections
/// point into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binary {
    sections: Vec<Section>,
    data: Vec<u8>,
}

impl Binary {
    /// Builds a binary from an explicit section table. `data` is the file
    /// image that `Section::offset` indexes into.
    ///
    /// # Errors
    /// Returns `FormatError::SectionOutOfBounds` when a file-backed section
    /// does not fit inside `data`.
    pub fn from_sections(sections: Vec<Section>, data: Vec<u8>) -> Result<Self, FormatError> {
        for section in &sections {
            check_bounds(section, data.len())?;
        }
        Ok(Self { sections, data })
    }

    #[must_use]
    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    #[must_use]
    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// Lays the file-backed sections out by address, from the lowest start
    /// to the highest end, zero-filling gaps.
    ///
    /// # Errors
    /// Returns `FormatError` when two sections overlap or the span is
    /// unreasonably large.
    pub fn flatten(&self) -> Result<Vec<u8>, FormatError> {
        let mut loadable = self
            .sections
            .iter()
            .filter(|s| s.is_file_backed() && s.size > 0)
            .collect::<Vec<_>>();
        if loadable.is_empty() {
            return Ok(Vec::new());
        }
        loadable.sort_by_key(|s| (s.addr, s.size));

        let base = loadable[0].addr;
        let end = loadable
            .iter()
            .map(|s| s.addr.saturating_add(s.size))
            .max()
            .unwrap_or(base);
        let span = end - base;
        if span > MAX_FLAT_SPAN {
            return Err(FormatError::SpanTooLarge { span });
        }

        for pair in loadable.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            if a.addr.saturating_add(a.size) > b.addr {
                return Err(FormatError::SectionOverlap {
                    first: a.name.clone(),
                    second: b.name.clone(),
                    addr: b.addr,
                });
            }
        }

        let mut out = vec![0u8; span as usize];
        for s in loadable {
            let src = s.offset as usize;
            let dst = (s.addr - base) as usize;
            let len = s.size as usize;
            out[dst..dst + len].copy_from_slice(&self.data[src..src + len]);
        }
        Ok(out)
    }
}

/// Reads the section header table of a 32- or 64-bit ELF file.
///
/// # Errors
/// Returns `FormatError` when the file is not valid ELF or a section points
/// past the end of the file.
pub fn parse_elf(bytes: &[u8]) -> Result<Binary, FormatError> {
    let elf = Elf::parse(bytes)?;
    let mut sections = Vec::with_capacity(elf.section_headers.len());
    for sh in &elf.section_headers {
        if sh.sh_type == SHT_NULL {
            continue;
        }
        let name = elf.shdr_strtab.get_at(sh.sh_name).unwrap_or("").to_string();
        sections.push(Section {
            name,
            addr: sh.sh_addr,
            offset: sh.sh_offset,
            size: sh.sh_size,
            alloc: sh.sh_flags & u64::from(SHF_ALLOC) != 0,
            nobits: sh.sh_type == SHT_NOBITS,
        });
    }
    Binary::from_sections(sections, bytes.to_vec())
}

fn check_bounds(section: &Section, file_len: usize) -> Result<(), FormatError> {
    if !section.is_file_backed() {
        return Ok(());
    }
    let end = section.offset.checked_add(section.size);
    match end {
        Some(end) if end <= file_len as u64 => Ok(()),
        _ => Err(FormatError::SectionOutOfBounds {
            name: section.name.clone(),
            offset: section.offset,
            size: section.size,
        }),
    }
}

/// Hand-assembled little-endian ELF32 files for tests.
#[cfg(test)]
pub(crate) mod testelf {
    pub(crate) enum Body {
        /// Allocated, file-backed.
        Bytes(Vec<u8>),
        /// Allocated zero-fill of the given size.
        Zero(u32),
        /// Not allocated (comments, debug info).
        Note(Vec<u8>),
    }

    pub(crate) struct TestSection {
        pub name: &'static str,
        pub addr: u32,
        pub body: Body,
    }

    pub(crate) fn sect(name: &'static str, addr: u32, body: Body) -> TestSection {
        TestSection { name, addr, body }
    }

    pub(crate) fn build(sections: &[TestSection]) -> Vec<u8> {
        const EHSIZE: usize = 52;
        const SHENTSIZE: usize = 40;

        let mut shstrtab = vec![0u8];
        let mut name_offsets = Vec::new();
        for s in sections {
            name_offsets.push(shstrtab.len() as u32);
            shstrtab.extend_from_slice(s.name.as_bytes());
            shstrtab.push(0);
        }
        let shstrtab_name = shstrtab.len() as u32;
        shstrtab.extend_from_slice(b".shstrtab\0");

        let mut out = vec![0u8; EHSIZE];
        let mut headers = Vec::new();
        // null section
        headers.push([0u32; 10]);
        for (s, name) in sections.iter().zip(name_offsets) {
            let offset = out.len() as u32;
            let (sh_type, flags, size) = match &s.body {
                Body::Bytes(bytes) => {
                    out.extend_from_slice(bytes);
                    (1u32, 0x2u32 | 0x4, bytes.len() as u32)
                }
                Body::Zero(size) => (8u32, 0x2 | 0x1, *size),
                Body::Note(bytes) => {
                    out.extend_from_slice(bytes);
                    (1u32, 0, bytes.len() as u32)
                }
            };
            headers.push([name, sh_type, flags, s.addr, offset, size, 0, 0, 1, 0]);
        }
        let strtab_offset = out.len() as u32;
        out.extend_from_slice(&shstrtab);
        headers.push([
            shstrtab_name,
            3,
            0,
            0,
            strtab_offset,
            shstrtab.len() as u32,
            0,
            0,
            1,
            0,
        ]);
        while out.len() % 4 != 0 {
            out.push(0);
        }
        let shoff = out.len() as u32;
        for h in &headers {
            for v in h {
                out.extend_from_slice(&v.to_le_bytes());
            }
        }

        let shnum = headers.len() as u16;
        let mut eh = Vec::with_capacity(EHSIZE);
        eh.extend_from_slice(&[0x7f, b'E', b'L', b'F', 1, 1, 1, 0]);
        eh.extend_from_slice(&[0u8; 8]);
        eh.extend_from_slice(&2u16.to_le_bytes()); // ET_EXEC
        eh.extend_from_slice(&0u16.to_le_bytes());
        eh.extend_from_slice(&1u32.to_le_bytes());
        eh.extend_from_slice(&0u32.to_le_bytes()); // entry
        eh.extend_from_slice(&0u32.to_le_bytes()); // phoff
        eh.extend_from_slice(&shoff.to_le_bytes());
        eh.extend_from_slice(&0u32.to_le_bytes()); // flags
        eh.extend_from_slice(&(EHSIZE as u16).to_le_bytes());
        eh.extend_from_slice(&32u16.to_le_bytes());
        eh.extend_from_slice(&0u16.to_le_bytes());
        eh.extend_from_slice(&(SHENTSIZE as u16).to_le_bytes());
        eh.extend_from_slice(&shnum.to_le_bytes());
        eh.extend_from_slice(&(shnum - 1).to_le_bytes());
        out[..EHSIZE].copy_from_slice(&eh);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::testelf::{build, sect, Body};
    use super::{parse_elf, Binary};
    use crate::format::{FormatError, Section};

    #[test]
    fn reads_section_table_from_elf32() {
        let bytes = build(&[
            sect(".text", 0x1000, Body::Bytes(vec![0xa9, 0x00, 0x60])),
            sect(".bss", 0x1003, Body::Zero(0x20)),
            sect(".comment", 0, Body::Note(b"clang".to_vec())),
        ]);
        let binary = parse_elf(&bytes).expect("parse");

        let text = binary.section(".text").expect("text");
        assert_eq!(text.addr, 0x1000);
        assert_eq!(text.size, 3);
        assert!(text.is_file_backed());

        let bss = binary.section(".bss").expect("bss");
        assert!(bss.alloc);
        assert!(bss.nobits);
        assert_eq!(bss.size, 0x20);

        assert!(!binary.section(".comment").expect("comment").alloc);
        assert!(binary.section(".shstrtab").is_some());
    }

    #[test]
    fn flattens_loadable_sections_with_gaps() {
        let bytes = build(&[
            sect(".text", 0x0800, Body::Bytes(vec![1, 2])),
            sect(".rodata", 0x0804, Body::Bytes(vec![3])),
            sect(".bss", 0x0805, Body::Zero(0x100)),
        ]);
        let binary = parse_elf(&bytes).expect("parse");
        assert_eq!(binary.flatten().expect("flatten"), vec![1, 2, 0, 0, 3]);
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(parse_elf(b"not an elf"), Err(FormatError::Elf(_))));
    }

    #[test]
    fn rejects_overlapping_sections() {
        let mk = |name: &str, addr: u64, offset: u64| Section {
            name: name.to_string(),
            addr,
            offset,
            size: 4,
            alloc: true,
            nobits: false,
        };
        let binary = Binary::from_sections(vec![mk("a", 0, 0), mk("b", 2, 4)], vec![0; 8])
            .expect("in bounds");
        assert!(matches!(
            binary.flatten(),
            Err(FormatError::SectionOverlap { addr: 2, .. })
        ));
    }

    #[test]
    fn rejects_section_past_end_of_file() {
        let section = Section {
            name: ".text".to_string(),
            addr: 0,
            offset: 4,
            size: 8,
            alloc: true,
            nobits: false,
        };
        assert!(matches!(
            Binary::from_sections(vec![section], vec![0; 8]),
            Err(FormatError::SectionOutOfBounds { .. })
        ));
    }
}
