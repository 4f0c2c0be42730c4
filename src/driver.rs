use std::path::Path;

use anyhow::{bail, Context, Result};
use log::{error, info};

use crate::assembler::{build_all, publish};
use crate::cli::{Args, Cmd};
use crate::config::Config;
use crate::cpmfs::{pack, read_directory, FormatProfile, PackItems};
use crate::format::elf::parse_elf;
use crate::resolver;
use crate::shuffle::{pad_to_tracks, shuffle, unshuffle, InterleaveMap};
use crate::toolchain::CommandToolchain;

pub fn run(args: Args) -> Result<()> {
    match args.command {
        Cmd::Build { config, targets } => run_build(&config, &targets),
        Cmd::Shuffle {
            input,
            output,
            blocksize,
            blockspertrack,
            map,
            inverse,
            pad,
        } => {
            let map = InterleaveMap::parse(&map, blockspertrack)?;
            let mut data = read(&input)?;
            if pad {
                data = pad_to_tracks(&data, blocksize, blockspertrack)?;
            }
            let out = if inverse {
                unshuffle(&data, blocksize, blockspertrack, &map)?
            } else {
                shuffle(&data, blocksize, blockspertrack, &map)?
            };
            publish(&output, &out)
        }
        Cmd::Pack {
            format,
            boot,
            output,
            items,
        } => {
            let profile = FormatProfile::builtin(&format)?;
            let boot = match boot {
                Some(path) => read(&path)?,
                None => Vec::new(),
            };
            let mut contents = PackItems::with_capacity(items.len());
            for (dest, src) in items {
                if contents.contains_key(&dest) {
                    bail!("item {dest} given twice");
                }
                let bytes = read(&src)?;
                contents.insert(dest, bytes);
            }
            let image = pack(&profile, &boot, &contents)?;
            info!(
                "{} file(s), {} block(s) and {} directory slot(s) free",
                image.entries().len(),
                image.free_blocks(),
                image.free_slots()
            );
            publish(&output, image.as_bytes())
        }
        Cmd::Size {
            input,
            rule,
            symbol,
        } => {
            let binary = parse_elf(&read(&input)?)
                .with_context(|| format!("parsing {}", input.display()))?;
            let constant = resolver::resolve(&binary, &symbol, rule.into())?;
            for (section, size) in &constant.counted {
                info!("{section}: {size:#x}");
            }
            println!("--defsym={}={:#x}", constant.symbol, constant.value);
            Ok(())
        }
        Cmd::Ls { format, image } => {
            let profile = FormatProfile::builtin(&format)?;
            let bytes = read(&image)?;
            for entry in read_directory(&profile, &bytes)? {
                let blocks = entry.blocks().count();
                println!(
                    "{:<14} {:>8} {:>4} block(s)",
                    entry.name.to_string(),
                    entry.length,
                    blocks
                );
            }
            Ok(())
        }
    }
}

fn run_build(config_path: &Path, targets: &[String]) -> Result<()> {
    let config = Config::from_file(config_path)?;
    let toolchain = CommandToolchain::from_config(&config.toolchain);
    let reports = build_all(&toolchain, &config, targets)?;

    let mut failed = 0usize;
    for report in &reports {
        if let Err(err) = &report.result {
            error!("{err:#}");
            failed += 1;
        }
    }
    if failed > 0 {
        bail!("{failed} of {} target(s) failed", reports.len());
    }
    Ok(())
}

fn read(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}
