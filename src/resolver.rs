use std::collections::BTreeMap;

use serde::Deserialize;

use crate::error::ImageError;
use crate::format::elf::Binary;

/// Which sections count towards a binary's size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SizeRule {
    /// Every `SHF_ALLOC` section, zero-fill included: the run-time footprint.
    #[default]
    Allocated,
    /// Allocated sections that occupy file bytes: the flat image size.
    FileBacked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeConstant {
    pub symbol: String,
    pub value: u32,
    /// Per-section contributions, for diagnostics.
    pub counted: BTreeMap<String, u64>,
}

/// Sums the lengths of the sections selected by `rule`.
#[must_use]
pub fn section_size(binary: &Binary, rule: SizeRule) -> u64 {
    counted_sections(binary, rule).values().sum()
}

/// Measures `binary` and packages the result as the value of `symbol` for
/// the final link.
///
/// # Errors
/// Returns `ImageError::Config` when the size does not fit a 32-bit symbol.
pub fn resolve(binary: &Binary, symbol: &str, rule: SizeRule) -> Result<SizeConstant, ImageError> {
    let counted = counted_sections(binary, rule);
    let total: u64 = counted.values().sum();
    let value = u32::try_from(total)
        .map_err(|_| {
            ImageError::config(format!("{symbol} value {total:#x} does not fit in 32 bits"))
        })?;
    Ok(SizeConstant {
        symbol: symbol.to_string(),
        value,
        counted,
    })
}

/// Checks that the final link kept the size the prelink measured. A
/// mismatch is reported, never re-resolved.
///
/// # Errors
/// Returns `ImageError::SizeResolution` when the sizes disagree.
pub fn verify(
    constant: &SizeConstant,
    relinked: &Binary,
    rule: SizeRule,
) -> Result<(), ImageError> {
    let measured = section_size(relinked, rule);
    if measured == u64::from(constant.value) {
        return Ok(());
    }
    Err(ImageError::SizeResolution {
        symbol: constant.symbol.clone(),
        prelink: constant.value,
        relinked: u32::try_from(measured).unwrap_or(u32::MAX),
    })
}

fn counted_sections(binary: &Binary, rule: SizeRule) -> BTreeMap<String, u64> {
    let mut counted = BTreeMap::new();
    for section in binary.sections() {
        let selected = match rule {
            SizeRule::Allocated => section.alloc,
            SizeRule::FileBacked => section.is_file_backed(),
        };
        if selected && section.size > 0 {
            let entry = counted.entry(section.name.clone()).or_insert(0u64);
            *entry = entry.saturating_add(section.size);
        }
    }
    counted
}
