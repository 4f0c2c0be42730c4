use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::resolver::SizeRule;

fn parse_usize_with_hex(input: &str) -> Result<usize, String> {
    let s = input.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        usize::from_str_radix(hex, 16).map_err(|e| format!("invalid hex value '{input}': {e}"))
    } else {
        s.parse::<usize>()
            .map_err(|e| format!("invalid decimal value '{input}': {e}"))
    }
}

fn parse_item(input: &str) -> Result<(String, PathBuf), String> {
    let (dest, src) = input
        .split_once('=')
        .ok_or_else(|| format!("item '{input}' must look like NAME=PATH"))?;
    if dest.is_empty() || src.is_empty() {
        return Err(format!("item '{input}' must look like NAME=PATH"));
    }
    Ok((dest.to_string(), PathBuf::from(src)))
}

#[derive(Debug, Parser)]
#[command(name = "diskasm", version, about = "Assemble bootable 8-bit disk images")]
pub struct Args {
    #[arg(long = "verbose", short = 'v', global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Cmd,
}

#[derive(Debug, Subcommand)]
pub enum Cmd {
    /// Run the full pipeline for targets declared in a project file.
    Build {
        #[arg(short = 'c', long = "config", default_value = "diskasm.toml")]
        config: PathBuf,
        /// Build only these targets (repeatable); all when omitted.
        #[arg(short = 't', long = "target")]
        targets: Vec<String>,
    },
    /// Interleave (or de-interleave) the blocks of a raw image.
    Shuffle {
        input: PathBuf,
        #[arg(short = 'o', long = "output")]
        output: PathBuf,
        #[arg(long, value_parser = parse_usize_with_hex)]
        blocksize: usize,
        #[arg(long, value_parser = parse_usize_with_hex)]
        blockspertrack: usize,
        #[arg(long)]
        map: String,
        /// Apply the inverse map.
        #[arg(long)]
        inverse: bool,
        /// Zero-pad the input to whole tracks first.
        #[arg(long)]
        pad: bool,
    },
    /// Pack a boot image and files into a CP/M filesystem image.
    Pack {
        #[arg(short = 'f', long = "format")]
        format: String,
        #[arg(short = 'b', long = "boot")]
        boot: Option<PathBuf>,
        #[arg(short = 'o', long = "output")]
        output: PathBuf,
        /// `[user:]name.ext=host/path`, packed in the order given.
        #[arg(value_name = "ITEM", value_parser = parse_item)]
        items: Vec<(String, PathBuf)>,
    },
    /// Print the size constant of a linked ELF file.
    Size {
        input: PathBuf,
        #[arg(long, value_enum, default_value_t = RuleArg::Allocated)]
        rule: RuleArg,
        #[arg(long, default_value = "BIOS_SIZE")]
        symbol: String,
    },
    /// List the directory of a CP/M filesystem image.
    Ls {
        #[arg(short = 'f', long = "format")]
        format: String,
        image: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RuleArg {
    Allocated,
    FileBacked,
}

impl From<RuleArg> for SizeRule {
    fn from(rule: RuleArg) -> Self {
        match rule {
            RuleArg::Allocated => Self::Allocated,
            RuleArg::FileBacked => Self::FileBacked,
        }
    }
}
