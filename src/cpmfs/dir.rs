use super::name::CpmName;
use super::profile::{CpmVersion, FormatProfile, DIR_ENTRY_SIZE, RECORD_SIZE};

/// One 32-byte directory slot in decoded form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct Slot {
    pub name: CpmName,
    /// Logical extent number (`EX` + `S2`).
    pub extent: usize,
    pub s1: u8,
    pub rc: u8,
    pub blocks: Vec<u16>,
}

impl Slot {
    /// Describes slot `index` of a file of `file_len` bytes.
    pub fn for_file(
        profile: &FormatProfile,
        name: CpmName,
        index: usize,
        blocks: &[u16],
        file_len: usize,
        is_last: bool,
    ) -> Self {
        let capacity = profile.entry_capacity();
        let extent_len = profile.extent_len();
        let in_slot = file_len.saturating_sub(index * capacity).min(capacity);

        let used_extents = in_slot.div_ceil(extent_len).max(1);
        let tail = in_slot - (used_extents - 1) * extent_len;
        let rc = tail.div_ceil(RECORD_SIZE);
        let s1 = if is_last && profile.version == CpmVersion::Cpm3 {
            (file_len % RECORD_SIZE) as u8
        } else {
            0
        };

        Self {
            name,
            extent: index * profile.extents_per_entry() + used_extents - 1,
            s1,
            rc: rc as u8,
            blocks: blocks.to_vec(),
        }
    }

    pub fn encode(&self, profile: &FormatProfile) -> [u8; DIR_ENTRY_SIZE] {
        let mut raw = [0u8; DIR_ENTRY_SIZE];
        raw[0] = self.name.user;
        raw[1..9].copy_from_slice(&self.name.name);
        raw[9..12].copy_from_slice(&self.name.ext);
        raw[12] = (self.extent & 0x1f) as u8;
        raw[13] = self.s1;
        raw[14] = ((self.extent >> 5) & 0x3f) as u8;
        raw[15] = self.rc;
        let pointers = &mut raw[16..];
        if profile.wide_pointers() {
            for (chunk, block) in pointers.chunks_exact_mut(2).zip(&self.blocks) {
                chunk.copy_from_slice(&block.to_le_bytes());
            }
        } else {
            for (slot, block) in pointers.iter_mut().zip(&self.blocks) {
                *slot = *block as u8;
            }
        }
        raw
    }

    /// Decodes a slot; `None` for empty slots.
    pub fn decode(profile: &FormatProfile, raw: &[u8]) -> Option<Self> {
        let user = raw[0];
        if user > 15 || raw[1] == 0 {
            return None;
        }
        let mut name = [0u8; 8];
        let mut ext = [0u8; 3];
        for (dst, src) in name.iter_mut().zip(&raw[1..9]) {
            *dst = src & 0x7f;
        }
        for (dst, src) in ext.iter_mut().zip(&raw[9..12]) {
            *dst = src & 0x7f;
        }
        let extent = usize::from(raw[12] & 0x1f) | (usize::from(raw[14] & 0x3f) << 5);
        let pointers = &raw[16..DIR_ENTRY_SIZE];
        let blocks = if profile.wide_pointers() {
            pointers
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .filter(|b| *b != 0)
                .collect()
        } else {
            pointers.iter().filter(|b| **b != 0).map(|b| u16::from(*b)).collect()
        };
        Some(Self {
            name: CpmName { user, name, ext },
            extent,
            s1: raw[13],
            rc: raw[15],
            blocks,
        })
    }

    /// File length implied by this slot if it is the file's last one.
    pub fn implied_len(&self, profile: &FormatProfile) -> usize {
        let records = self.extent * profile.extent_len() + usize::from(self.rc) * RECORD_SIZE;
        if profile.version == CpmVersion::Cpm3 && self.s1 != 0 && self.rc != 0 {
            records - RECORD_SIZE + usize::from(self.s1)
        } else {
            records
        }
    }
}
