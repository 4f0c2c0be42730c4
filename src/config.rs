use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::Deserialize;

use crate::cpmfs::FormatProfile;
use crate::error::ImageError;
use crate::resolver::SizeRule;
use crate::shuffle::InterleaveMap;

/// A `RawConfig` is the project file as deserialized; paths are still
/// relative and the interleave maps and formats are unchecked.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    toolchain: RawToolchain,
    targets: IndexMap<String, RawTarget>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawToolchain {
    #[serde(default = "default_cc")]
    cc: String,
    #[serde(default = "default_ld")]
    ld: String,
    #[serde(default)]
    cflags: Vec<String>,
    #[serde(default)]
    ldflags: Vec<String>,
    #[serde(default = "default_build_dir")]
    build_dir: PathBuf,
}

impl Default for RawToolchain {
    fn default() -> Self {
        Self {
            cc: default_cc(),
            ld: default_ld(),
            cflags: Vec::new(),
            ldflags: Vec::new(),
            build_dir: default_build_dir(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTarget {
    sources: Vec<PathBuf>,
    #[serde(default)]
    cflags: Vec<String>,
    prelink_script: PathBuf,
    link_script: PathBuf,
    #[serde(default = "default_size_symbol")]
    size_symbol: String,
    #[serde(default = "default_placeholder")]
    placeholder: u32,
    #[serde(default)]
    size_rule: SizeRule,
    output: PathBuf,
    shuffle: Option<RawShuffle>,
    filesystem: Option<RawFilesystem>,
    #[serde(default)]
    items: IndexMap<String, String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawShuffle {
    blocksize: usize,
    blockspertrack: usize,
    map: String,
    #[serde(default)]
    pad: bool,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFilesystem {
    format: Option<String>,
    geometry: Option<FormatProfile>,
}

fn default_cc() -> String {
    "clang".to_string()
}

fn default_ld() -> String {
    "ld.lld".to_string()
}

fn default_build_dir() -> PathBuf {
    PathBuf::from("build")
}

fn default_size_symbol() -> String {
    "BIOS_SIZE".to_string()
}

fn default_placeholder() -> u32 {
    0x4000
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolchainConfig {
    pub cc: String,
    pub ld: String,
    pub cflags: Vec<String>,
    pub ldflags: Vec<String>,
    pub build_dir: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Shuffle {
    pub blocksize: usize,
    pub blockspertrack: usize,
    pub map: InterleaveMap,
    /// Zero-pad the boot image to whole tracks instead of rejecting it.
    pub pad: bool,
}

/// Pipeline stage whose output can be placed on the disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    /// Flattened final binary.
    Bios,
    /// Boot image after padding and shuffling.
    Boot,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ItemSource {
    File(PathBuf),
    Artifact(Stage),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Target {
    pub name: String,
    pub sources: Vec<PathBuf>,
    pub cflags: Vec<String>,
    pub prelink_script: PathBuf,
    pub link_script: PathBuf,
    pub size_symbol: String,
    pub placeholder: u32,
    pub size_rule: SizeRule,
    pub output: PathBuf,
    pub shuffle: Option<Shuffle>,
    pub filesystem: Option<FormatProfile>,
    pub items: IndexMap<String, ItemSource>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub toolchain: ToolchainConfig,
    pub targets: IndexMap<String, Target>,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let base = path.parent().unwrap_or(Path::new("."));
        Self::from_toml(&text, base).with_context(|| format!("in {}", path.display()))
    }

    /// Parses a project file whose relative paths are anchored at `base`.
    pub fn from_toml(text: &str, base: &Path) -> Result<Self> {
        let raw: RawConfig = toml::from_str(text)?;
        let toolchain = ToolchainConfig {
            cc: raw.toolchain.cc,
            ld: raw.toolchain.ld,
            cflags: raw.toolchain.cflags,
            ldflags: raw.toolchain.ldflags,
            build_dir: base.join(raw.toolchain.build_dir),
        };

        let mut targets = IndexMap::new();
        for (name, t) in raw.targets {
            let target = resolve_target(&name, t, base).with_context(|| format!("target {name}"))?;
            targets.insert(name, target);
        }
        Ok(Self { toolchain, targets })
    }
}

fn resolve_target(name: &str, t: RawTarget, base: &Path) -> Result<Target, ImageError> {
    if t.sources.is_empty() {
        return Err(ImageError::config("no sources"));
    }
    let shuffle = t
        .shuffle
        .map(|s| {
            Ok::<_, ImageError>(Shuffle {
                map: InterleaveMap::parse(&s.map, s.blockspertrack)?,
                blocksize: s.blocksize,
                blockspertrack: s.blockspertrack,
                pad: s.pad,
            })
        })
        .transpose()?;

    let filesystem = match t.filesystem {
        None => None,
        Some(RawFilesystem {
            format: Some(format),
            geometry: None,
        }) => Some(FormatProfile::builtin(&format)?),
        Some(RawFilesystem {
            format: None,
            geometry: Some(geometry),
        }) => {
            geometry.validate()?;
            Some(geometry)
        }
        Some(_) => {
            return Err(ImageError::config(
                "filesystem needs exactly one of `format` or `geometry`",
            ))
        }
    };
    if filesystem.is_none() && !t.items.is_empty() {
        return Err(ImageError::config("items given but no filesystem declared"));
    }

    let mut items = IndexMap::new();
    for (dest, src) in t.items {
        items.insert(dest, parse_item_source(&src, base)?);
    }

    Ok(Target {
        name: name.to_string(),
        sources: t.sources.into_iter().map(|p| base.join(p)).collect(),
        cflags: t.cflags,
        prelink_script: base.join(t.prelink_script),
        link_script: base.join(t.link_script),
        size_symbol: t.size_symbol,
        placeholder: t.placeholder,
        size_rule: t.size_rule,
        output: base.join(t.output),
        shuffle,
        filesystem,
        items,
    })
}

fn parse_item_source(src: &str, base: &Path) -> Result<ItemSource, ImageError> {
    match src.strip_prefix('+') {
        Some("bios") => Ok(ItemSource::Artifact(Stage::Bios)),
        Some("boot") => Ok(ItemSource::Artifact(Stage::Boot)),
        Some(other) => Err(ImageError::config(format!(
            "unknown artifact '+{other}' (expected +bios or +boot)"
        ))),
        None => Ok(ItemSource::File(base.join(src))),
    }
}
