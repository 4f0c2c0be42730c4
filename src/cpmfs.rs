//! CP/M filesystem images: a reserved boot region, a directory of 32-byte
//! slots, and file data in allocation blocks.
//!
//! Images are built in memory in one pass and only handed back once every
//! item has been placed, so a failed pack never yields a partial image.

use indexmap::IndexMap;
use log::debug;

use crate::error::{ImageError, Region};

mod dir;
mod name;
pub mod profile;

use dir::Slot;
pub use name::CpmName;
pub use profile::{CpmVersion, FormatProfile};
use profile::DIR_ENTRY_SIZE;

/// Destination name to file contents, packed in insertion order.
pub type PackItems = IndexMap<String, Vec<u8>>;

/// A file placed on the disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub name: CpmName,
    /// Length in bytes, padding excluded.
    pub length: usize,
    /// Block numbers per directory slot, relative to the data region.
    pub extents: Vec<Vec<u16>>,
}

impl DirectoryEntry {
    pub fn blocks(&self) -> impl Iterator<Item = u16> + '_ {
        self.extents.iter().flatten().copied()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilesystemImage {
    bytes: Vec<u8>,
    entries: Vec<DirectoryEntry>,
    free_blocks: usize,
    free_slots: usize,
}

impl FilesystemImage {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    #[must_use]
    pub fn entries(&self) -> &[DirectoryEntry] {
        &self.entries
    }

    #[must_use]
    pub fn free_blocks(&self) -> usize {
        self.free_blocks
    }

    #[must_use]
    pub fn free_slots(&self) -> usize {
        self.free_slots
    }
}

/// First-fit over blocks that have never been handed out.
struct BlockAllocator {
    used: Vec<bool>,
}

impl BlockAllocator {
    fn new(profile: &FormatProfile) -> Self {
        let mut used = vec![false; profile.data_blocks()];
        for block in used.iter_mut().take(profile.dir_blocks()) {
            *block = true;
        }
        Self { used }
    }

    fn free(&self) -> usize {
        self.used.iter().filter(|u| !**u).count()
    }

    fn allocate(&mut self, count: usize) -> Result<Vec<u16>, ImageError> {
        let available = self.free();
        if count > available {
            return Err(ImageError::Capacity {
                region: Region::Data,
                needed: count,
                available,
            });
        }
        let mut blocks = Vec::with_capacity(count);
        for (index, used) in self.used.iter_mut().enumerate() {
            if blocks.len() == count {
                break;
            }
            if !*used {
                *used = true;
                blocks.push(index as u16);
            }
        }
        Ok(blocks)
    }
}

/// Builds a complete disk image: `bootimage` in the reserved region, then a
/// directory entry and data blocks for every item.
///
/// # Errors
/// Returns `ImageError::Config` for an invalid profile, `ImageError::Name`
/// for a bad or duplicate name, and `ImageError::Capacity` when the boot
/// region, directory or data region is too small.
pub fn pack(
    profile: &FormatProfile,
    bootimage: &[u8],
    items: &PackItems,
) -> Result<FilesystemImage, ImageError> {
    profile.validate()?;
    if bootimage.len() > profile.boot_len() {
        return Err(ImageError::Capacity {
            region: Region::Boot,
            needed: bootimage.len(),
            available: profile.boot_len(),
        });
    }

    let mut bytes = vec![0u8; profile.image_len()];
    bytes[..bootimage.len()].copy_from_slice(bootimage);

    let mut allocator = BlockAllocator::new(profile);
    let mut entries: Vec<DirectoryEntry> = Vec::with_capacity(items.len());
    let mut slots = Vec::new();

    for (dest, contents) in items {
        let name = CpmName::parse(dest)?;
        if entries.iter().any(|e| e.name == name) {
            return Err(ImageError::name(dest, "duplicates an earlier item"));
        }
        if contents.len() > profile.max_file_len() {
            return Err(ImageError::Capacity {
                region: Region::Data,
                needed: contents.len(),
                available: profile.max_file_len(),
            });
        }

        let block_count = contents.len().div_ceil(profile.block_size);
        let slot_count = block_count.div_ceil(profile.blocks_per_entry()).max(1);
        let free_slots = profile.dir_entries - slots.len();
        if slot_count > free_slots {
            return Err(ImageError::Capacity {
                region: Region::Directory,
                needed: slot_count,
                available: free_slots,
            });
        }
        let blocks = allocator.allocate(block_count)?;

        for (block, chunk) in blocks.iter().zip(contents.chunks(profile.block_size)) {
            let offset = profile.block_offset(usize::from(*block));
            bytes[offset..offset + chunk.len()].copy_from_slice(chunk);
        }

        let extents = if blocks.is_empty() {
            vec![Vec::new()]
        } else {
            blocks
                .chunks(profile.blocks_per_entry())
                .map(<[u16]>::to_vec)
                .collect::<Vec<_>>()
        };
        for (index, extent) in extents.iter().enumerate() {
            let is_last = index + 1 == extents.len();
            slots.push(Slot::for_file(profile, name, index, extent, contents.len(), is_last));
        }
        debug!(
            "{name}: {} bytes in {} block(s), {} slot(s)",
            contents.len(),
            blocks.len(),
            extents.len()
        );
        entries.push(DirectoryEntry {
            name,
            length: contents.len(),
            extents,
        });
    }

    let dir = profile.dir_offset();
    let dir_len = profile.dir_entries * DIR_ENTRY_SIZE;
    bytes[dir..dir + dir_len].fill(profile.erased);
    for (index, slot) in slots.iter().enumerate() {
        let at = dir + index * DIR_ENTRY_SIZE;
        bytes[at..at + DIR_ENTRY_SIZE].copy_from_slice(&slot.encode(profile));
    }

    Ok(FilesystemImage {
        bytes,
        entries,
        free_blocks: allocator.free(),
        free_slots: profile.dir_entries - slots.len(),
    })
}

/// Decodes the directory of a packed image, one entry per file in the
/// order its first slot appears.
///
/// # Errors
/// Returns `ImageError::Config` when `image` is not the profile's size or
/// the profile is invalid.
pub fn read_directory(
    profile: &FormatProfile,
    image: &[u8],
) -> Result<Vec<DirectoryEntry>, ImageError> {
    profile.validate()?;
    if image.len() != profile.image_len() {
        return Err(ImageError::config(format!(
            "image is {} bytes but format {} is {} bytes",
            image.len(),
            profile.name,
            profile.image_len()
        )));
    }

    let dir = profile.dir_offset();
    let raw_dir = &image[dir..dir + profile.dir_entries * DIR_ENTRY_SIZE];
    let mut files = IndexMap::<CpmName, Vec<Slot>>::new();
    for raw in raw_dir.chunks_exact(DIR_ENTRY_SIZE) {
        if let Some(slot) = Slot::decode(profile, raw) {
            files.entry(slot.name).or_default().push(slot);
        }
    }

    let mut entries = Vec::with_capacity(files.len());
    for (name, mut slots) in files {
        slots.sort_by_key(|s| s.extent);
        let length = slots.last().map_or(0, |s| s.implied_len(profile));
        let extents = slots.into_iter().map(|s| s.blocks).collect();
        entries.push(DirectoryEntry {
            name,
            length,
            extents,
        });
    }
    Ok(entries)
}

/// Returns the contents of `entry`, truncated to its recorded length.
///
/// # Errors
/// Returns `ImageError::Config` when a block lies outside the image or the
/// profile is invalid.
pub fn read_file(
    profile: &FormatProfile,
    image: &[u8],
    entry: &DirectoryEntry,
) -> Result<Vec<u8>, ImageError> {
    profile.validate()?;
    let mut out = Vec::with_capacity(entry.length);
    for block in entry.blocks() {
        let offset = profile.block_offset(usize::from(block));
        let Some(data) = image.get(offset..offset + profile.block_size) else {
            return Err(ImageError::config(format!(
                "{}: block {block} is outside the image",
                entry.name
            )));
        };
        out.extend_from_slice(data);
    }
    out.truncate(entry.length);
    Ok(out)
}
