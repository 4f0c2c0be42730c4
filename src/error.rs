use std::fmt;

use thiserror::Error;

/// Region of a disk image that ran out of room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    Boot,
    Directory,
    Data,
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Boot => f.write_str("boot region"),
            Self::Directory => f.write_str("directory"),
            Self::Data => f.write_str("data region"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ImageError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("invalid file name '{name}': {reason}")]
    Name { name: String, reason: &'static str },
    #[error("{region} is full: need {needed}, only {available} available")]
    Capacity {
        region: Region,
        needed: usize,
        available: usize,
    },
    #[error(
        "final link changed {symbol}: prelink measured {prelink:#x}, \
         final binary measures {relinked:#x}"
    )]
    SizeResolution {
        symbol: String,
        prelink: u32,
        relinked: u32,
    },
}

impl ImageError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub(crate) fn name(name: &str, reason: &'static str) -> Self {
        Self::Name {
            name: name.to_string(),
            reason,
        }
    }
}
