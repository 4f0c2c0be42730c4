use std::fmt;

use crate::error::ImageError;

const FORBIDDEN: &[u8] = b"<>.,;:=?*[]|/\\\"";
const MAX_USER: u8 = 15;

/// A CP/M directory name: user area plus space-padded 8.3 name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CpmName {
    pub user: u8,
    pub name: [u8; 8],
    pub ext: [u8; 3],
}

impl CpmName {
    /// Parses `[user:]name[.ext]`, upper-casing the result.
    ///
    /// # Errors
    /// Returns `ImageError::Name` when the user number, name or extension is
    /// out of range or contains a character CP/M reserves.
    pub fn parse(input: &str) -> Result<Self, ImageError> {
        let (user, file) = match input.split_once(':') {
            Some((user, file)) => {
                let user = user
                    .parse::<u8>()
                    .ok()
                    .filter(|u| *u <= MAX_USER)
                    .ok_or_else(|| ImageError::name(input, "user number must be 0-15"))?;
                (user, file)
            }
            None => (0, input),
        };
        let (stem, ext) = file.split_once('.').unwrap_or((file, ""));
        if stem.is_empty() {
            return Err(ImageError::name(input, "name is empty"));
        }
        if stem.len() > 8 {
            return Err(ImageError::name(input, "name is longer than 8 characters"));
        }
        if ext.len() > 3 {
            return Err(ImageError::name(input, "extension is longer than 3 characters"));
        }
        for b in stem.bytes().chain(ext.bytes()) {
            if !b.is_ascii_graphic() || FORBIDDEN.contains(&b) {
                return Err(ImageError::name(input, "contains a character CP/M does not allow"));
            }
        }

        let mut name = [b' '; 8];
        let mut extension = [b' '; 3];
        name[..stem.len()].copy_from_slice(stem.to_ascii_uppercase().as_bytes());
        extension[..ext.len()].copy_from_slice(ext.to_ascii_uppercase().as_bytes());
        Ok(Self {
            user,
            name,
            ext: extension,
        })
    }
}

impl fmt::Display for CpmName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stem = String::from_utf8_lossy(&self.name);
        let ext = String::from_utf8_lossy(&self.ext);
        let (stem, ext) = (stem.trim_end(), ext.trim_end());
        if ext.is_empty() {
            write!(f, "{}:{stem}", self.user)
        } else {
            write!(f, "{}:{stem}.{ext}", self.user)
        }
    }
}
