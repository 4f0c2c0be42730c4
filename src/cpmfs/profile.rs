use serde::Deserialize;

use crate::error::ImageError;

/// Bytes per directory slot.
pub const DIR_ENTRY_SIZE: usize = 32;
/// CP/M record; `RC` counts these.
pub const RECORD_SIZE: usize = 128;
/// Bytes addressed by one logical extent.
pub const LOGICAL_EXTENT: usize = 16 * 1024;
/// Directory slots whose user byte is this are empty.
pub const ERASED: u8 = 0xe5;

const MAX_DIR_BLOCKS: usize = 16;
/// CP/M allocation blocks top out at 16K.
const MAX_BLOCK_SIZE: usize = 16 * 1024;
/// Largest image the packer will build in memory.
pub const MAX_IMAGE_LEN: usize = 16 * 1024 * 1024;
const MAX_EXTENT_NUMBER: usize = 0x7ff;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CpmVersion {
    /// Lengths are kept to 128-byte record granularity.
    #[default]
    Cpm22,
    /// Exact lengths: `S1` holds the byte count of the last record.
    Cpm3,
}

/// Disk geometry and directory layout of one filesystem format.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FormatProfile {
    #[serde(default = "custom_name")]
    pub name: String,
    pub block_size: usize,
    pub total_blocks: usize,
    pub boot_blocks: usize,
    pub dir_entries: usize,
    #[serde(default)]
    pub version: CpmVersion,
    /// Fill byte for unused directory slots. Defaults to `0xE5`, which
    /// CP/M reads as empty, rather than a zero-filled directory; set it to
    /// 0 to get one.
    #[serde(default = "erased_byte")]
    pub erased: u8,
}

fn custom_name() -> String {
    "custom".to_string()
}

fn erased_byte() -> u8 {
    ERASED
}

const BUILTIN: &[(&str, usize, usize, usize, usize)] = &[
    // name, block size, total blocks, boot blocks, directory entries
    // 35 tracks x 16 x 256, three boot tracks
    ("appleiie", 1024, 140, 12, 64),
    // 40 tracks x 10 x 512, one boot track
    ("kaypro2", 1024, 200, 5, 64),
];

impl FormatProfile {
    /// Looks up a built-in profile by name.
    ///
    /// # Errors
    /// Returns `ImageError::Config` for an unknown name.
    pub fn builtin(name: &str) -> Result<Self, ImageError> {
        let Some(&(name, block_size, total_blocks, boot_blocks, dir_entries)) =
            BUILTIN.iter().find(|(n, ..)| *n == name)
        else {
            return Err(ImageError::config(format!(
                "unknown filesystem format '{name}' (known: {})",
                Self::builtin_names().join(", ")
            )));
        };
        Ok(Self {
            name: name.to_string(),
            block_size,
            total_blocks,
            boot_blocks,
            dir_entries,
            version: CpmVersion::Cpm22,
            erased: ERASED,
        })
    }

    #[must_use]
    pub fn builtin_names() -> Vec<&'static str> {
        BUILTIN.iter().map(|(n, ..)| *n).collect()
    }

    /// # Errors
    /// Returns `ImageError::Config` when the geometry cannot hold a CP/M
    /// filesystem.
    pub fn validate(&self) -> Result<(), ImageError> {
        let name = &self.name;
        if self.block_size < RECORD_SIZE
            || self.block_size > MAX_BLOCK_SIZE
            || !self.block_size.is_power_of_two()
        {
            return Err(ImageError::config(format!(
                "format {name}: block size {} must be a power of two from {RECORD_SIZE} to \
                 {MAX_BLOCK_SIZE}",
                self.block_size
            )));
        }
        match self.total_blocks.checked_mul(self.block_size) {
            Some(len) if len <= MAX_IMAGE_LEN => {}
            _ => {
                return Err(ImageError::config(format!(
                    "format {name}: {} blocks of {} bytes exceed the {MAX_IMAGE_LEN}-byte \
                     image limit",
                    self.total_blocks, self.block_size
                )));
            }
        }
        if self.boot_blocks >= self.total_blocks {
            return Err(ImageError::config(format!(
                "format {name}: boot region ({} blocks) leaves no room in a {}-block disk",
                self.boot_blocks, self.total_blocks
            )));
        }
        if self.dir_entries == 0 {
            return Err(ImageError::config(format!(
                "format {name}: directory needs at least one entry"
            )));
        }
        if self.dir_entries > self.image_len() / DIR_ENTRY_SIZE {
            return Err(ImageError::config(format!(
                "format {name}: {} directory entries do not fit the disk",
                self.dir_entries
            )));
        }
        if self.data_blocks() > 0x1_0000 {
            return Err(ImageError::config(format!(
                "format {name}: {} data blocks exceed 16-bit block numbers",
                self.data_blocks()
            )));
        }
        if self.dir_blocks() > MAX_DIR_BLOCKS || self.dir_blocks() >= self.data_blocks() {
            return Err(ImageError::config(format!(
                "format {name}: directory of {} blocks does not fit the data region",
                self.dir_blocks()
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn image_len(&self) -> usize {
        self.total_blocks * self.block_size
    }

    #[must_use]
    pub fn boot_len(&self) -> usize {
        self.boot_blocks * self.block_size
    }

    /// Blocks after the boot region; directory blocks included.
    #[must_use]
    pub fn data_blocks(&self) -> usize {
        self.total_blocks.saturating_sub(self.boot_blocks)
    }

    #[must_use]
    pub fn dir_blocks(&self) -> usize {
        (self.dir_entries * DIR_ENTRY_SIZE).div_ceil(self.block_size)
    }

    /// Blocks a file may occupy.
    #[must_use]
    pub fn allocatable_blocks(&self) -> usize {
        self.data_blocks().saturating_sub(self.dir_blocks())
    }

    #[must_use]
    pub fn wide_pointers(&self) -> bool {
        self.data_blocks() > 256
    }

    #[must_use]
    pub fn blocks_per_entry(&self) -> usize {
        if self.wide_pointers() {
            8
        } else {
            16
        }
    }

    /// Bytes one directory slot can address.
    #[must_use]
    pub fn entry_capacity(&self) -> usize {
        self.blocks_per_entry() * self.block_size
    }

    /// Bytes per logical extent; smaller than 16K only for tiny blocks.
    #[must_use]
    pub fn extent_len(&self) -> usize {
        self.entry_capacity().min(LOGICAL_EXTENT)
    }

    #[must_use]
    pub fn extents_per_entry(&self) -> usize {
        self.entry_capacity() / self.extent_len()
    }

    /// Largest file the extent numbering can describe.
    #[must_use]
    pub fn max_file_len(&self) -> usize {
        (MAX_EXTENT_NUMBER + 1) * self.extent_len()
    }

    /// Byte offset of data-region block `block` within the image.
    #[must_use]
    pub fn block_offset(&self, block: usize) -> usize {
        (self.boot_blocks + block) * self.block_size
    }

    /// Byte offset of the directory within the image.
    #[must_use]
    pub fn dir_offset(&self) -> usize {
        self.block_offset(0)
    }
}
