use std::fmt;

use crate::error::ImageError;

/// Logical block placed at each physical sector position of a track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterleaveMap {
    order: Vec<usize>,
}

impl InterleaveMap {
    /// Parses a hex-digit map, one digit per physical position.
    ///
    /// # Errors
    /// Returns `ImageError::Config` unless the digits form a permutation of
    /// `0..blockspertrack`.
    pub fn parse(map: &str, blockspertrack: usize) -> Result<Self, ImageError> {
        let order = map
            .chars()
            .map(|c| {
                c.to_digit(16)
                    .map(|d| d as usize)
                    .ok_or_else(|| {
                        ImageError::config(format!(
                            "interleave map '{map}' has non-hex digit '{c}'"
                        ))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_order(order, blockspertrack)
    }

    /// # Errors
    /// Returns `ImageError::Config` unless `order` is a permutation of
    /// `0..blockspertrack`.
    pub fn from_order(order: Vec<usize>, blockspertrack: usize) -> Result<Self, ImageError> {
        if order.len() != blockspertrack {
            return Err(ImageError::config(format!(
                "interleave map has {} entries but a track has {blockspertrack} blocks",
                order.len()
            )));
        }
        let mut seen = vec![false; blockspertrack];
        for &logical in &order {
            if logical >= blockspertrack {
                return Err(ImageError::config(format!(
                    "interleave map entry {logical} is out of range 0..{blockspertrack}"
                )));
            }
            if std::mem::replace(&mut seen[logical], true) {
                return Err(ImageError::config(format!(
                    "interleave map places logical block {logical} twice"
                )));
            }
        }
        Ok(Self { order })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Logical block stored at physical position `physical`.
    #[must_use]
    pub fn logical_at(&self, physical: usize) -> usize {
        self.order[physical]
    }

    /// The map that undoes this one.
    #[must_use]
    pub fn inverse(&self) -> Self {
        let mut order = vec![0; self.order.len()];
        for (physical, &logical) in self.order.iter().enumerate() {
            order[logical] = physical;
        }
        Self { order }
    }
}

impl fmt::Display for InterleaveMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &v in &self.order {
            write!(f, "{v:x}")?;
        }
        Ok(())
    }
}

/// Reorders the blocks of every track so that physical position `p` holds
/// the track's logical block `map[p]`.
///
/// # Errors
/// Returns `ImageError::Config` when the geometry is empty, `data` is not a
/// positive whole number of tracks, or `map` does not match the geometry.
pub fn shuffle(
    data: &[u8],
    blocksize: usize,
    blockspertrack: usize,
    map: &InterleaveMap,
) -> Result<Vec<u8>, ImageError> {
    let track_len = track_len(blocksize, blockspertrack)?;
    if map.len() != blockspertrack {
        return Err(ImageError::config(format!(
            "interleave map has {} entries but a track has {blockspertrack} blocks",
            map.len()
        )));
    }
    if data.is_empty() || data.len() % track_len != 0 {
        return Err(ImageError::config(format!(
            "image of {} bytes is not a whole number of {track_len}-byte tracks",
            data.len()
        )));
    }

    let mut out = Vec::with_capacity(data.len());
    for track in data.chunks_exact(track_len) {
        for physical in 0..blockspertrack {
            let begin = map.logical_at(physical) * blocksize;
            out.extend_from_slice(&track[begin..begin + blocksize]);
        }
    }
    Ok(out)
}

/// Undoes [`shuffle`] with the same map.
///
/// # Errors
/// Same conditions as [`shuffle`].
pub fn unshuffle(
    data: &[u8],
    blocksize: usize,
    blockspertrack: usize,
    map: &InterleaveMap,
) -> Result<Vec<u8>, ImageError> {
    shuffle(data, blocksize, blockspertrack, &map.inverse())
}

/// Zero-pads `data` up to the next whole track. Already aligned input is
/// returned unchanged; empty input becomes one blank track.
///
/// # Errors
/// Returns `ImageError::Config` for an empty geometry.
pub fn pad_to_tracks(
    data: &[u8],
    blocksize: usize,
    blockspertrack: usize,
) -> Result<Vec<u8>, ImageError> {
    let track_len = track_len(blocksize, blockspertrack)?;
    let tracks = data.len().div_ceil(track_len).max(1);
    let mut out = data.to_vec();
    out.resize(tracks * track_len, 0);
    Ok(out)
}

fn track_len(blocksize: usize, blockspertrack: usize) -> Result<usize, ImageError> {
    if blocksize == 0 || blockspertrack == 0 {
        return Err(ImageError::config(format!(
            "invalid track geometry: blocksize={blocksize} blockspertrack={blockspertrack}"
        )));
    }
    blocksize
        .checked_mul(blockspertrack)
        .ok_or_else(|| ImageError::config("track size overflows"))
}
