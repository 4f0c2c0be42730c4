use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use indexmap::IndexSet;
use log::{debug, info};

use crate::config::{Config, ItemSource, Stage, Target};
use crate::cpmfs::{self, DirectoryEntry, PackItems};
use crate::format::elf::{parse_elf, Binary};
use crate::resolver::{self, SizeConstant};
use crate::shuffle::{pad_to_tracks, shuffle};
use crate::toolchain::Toolchain;

/// Everything one target pipeline produced.
#[derive(Debug, Clone)]
pub struct TargetArtifacts {
    pub size: SizeConstant,
    /// Flattened final binary.
    pub bios: Vec<u8>,
    /// Boot image after padding and interleaving.
    pub boot: Vec<u8>,
    /// Bytes published to the target's output path.
    pub image: Vec<u8>,
    pub directory: Vec<DirectoryEntry>,
}

#[derive(Debug)]
pub struct TargetReport {
    pub name: String,
    pub result: Result<TargetArtifacts>,
}

/// Runs every stage of one target in memory. Nothing is written outside
/// `build_dir`.
pub fn build_target<T: Toolchain + ?Sized>(
    toolchain: &T,
    build_dir: &Path,
    target: &Target,
) -> Result<TargetArtifacts> {
    let name = &target.name;
    let work = build_dir.join(name);
    let obj_dir = work.join("obj");
    std::fs::create_dir_all(&obj_dir)
        .with_context(|| format!("failed to create {}", obj_dir.display()))?;

    let objects = compile_sources(toolchain, target, &obj_dir)?;

    let prelink_path = work.join("prelink.elf");
    let prelink = link(
        toolchain,
        &objects,
        &target.prelink_script,
        (target.size_symbol.as_str(), target.placeholder),
        &prelink_path,
    )
    .context("prelink")?;
    let size = resolver::resolve(&prelink, &target.size_symbol, target.size_rule)?;
    info!("{name}: {} = {:#x}", size.symbol, size.value);
    for (section, bytes) in &size.counted {
        debug!("{name}:   {section}: {bytes:#x}");
    }

    let final_path = work.join("final.elf");
    let relinked = link(
        toolchain,
        &objects,
        &target.link_script,
        (target.size_symbol.as_str(), size.value),
        &final_path,
    )
    .context("final link")?;
    resolver::verify(&size, &relinked, target.size_rule)?;

    let bios = relinked.flatten().with_context(|| format!("flattening {}", final_path.display()))?;
    let boot = match &target.shuffle {
        Some(s) => {
            let padded = if s.pad {
                pad_to_tracks(&bios, s.blocksize, s.blockspertrack)?
            } else {
                bios.clone()
            };
            debug!("{name}: interleaving {} bytes with map {}", padded.len(), s.map);
            shuffle(&padded, s.blocksize, s.blockspertrack, &s.map)?
        }
        None => bios.clone(),
    };

    let (image, directory) = match &target.filesystem {
        Some(profile) => {
            let items = load_items(target, &bios, &boot)?;
            let fs = cpmfs::pack(profile, &boot, &items)?;
            info!(
                "{name}: packed {} file(s) into {}, {} block(s) free",
                fs.entries().len(),
                profile.name,
                fs.free_blocks()
            );
            let directory = fs.entries().to_vec();
            (fs.into_bytes(), directory)
        }
        None => (boot.clone(), Vec::new()),
    };

    Ok(TargetArtifacts {
        size,
        bios,
        boot,
        image,
        directory,
    })
}

/// Builds one target and publishes its image.
pub fn assemble<T: Toolchain + ?Sized>(
    toolchain: &T,
    build_dir: &Path,
    target: &Target,
) -> Result<TargetArtifacts> {
    let artifacts = build_target(toolchain, build_dir, target)?;
    publish(&target.output, &artifacts.image)?;
    info!("{}: wrote {} ({} bytes)", target.name, target.output.display(), artifacts.image.len());
    Ok(artifacts)
}

/// Builds the named targets (all of them when `names` is empty), each on
/// its own thread. Repeated names build once. A failing target does not
/// stop the others.
pub fn build_all<T: Toolchain + ?Sized>(
    toolchain: &T,
    config: &Config,
    names: &[String],
) -> Result<Vec<TargetReport>> {
    let targets = select_targets(config, names)?;
    let build_dir = config.toolchain.build_dir.as_path();
    let reports = std::thread::scope(|scope| {
        let handles = targets
            .iter()
            .map(|target| {
                let handle = scope.spawn(move || assemble(toolchain, build_dir, target));
                (target.name.clone(), handle)
            })
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|(name, handle)| {
                let result = handle
                    .join()
                    .unwrap_or_else(|_| Err(anyhow::anyhow!("pipeline panicked")))
                    .with_context(|| format!("target {name}"));
                TargetReport { name, result }
            })
            .collect::<Vec<_>>()
    });
    Ok(reports)
}

fn select_targets<'a>(config: &'a Config, names: &[String]) -> Result<Vec<&'a Target>> {
    if names.is_empty() {
        return Ok(config.targets.values().collect());
    }
    names
        .iter()
        .collect::<IndexSet<_>>()
        .into_iter()
        .map(|n| {
            config
                .targets
                .get(n)
                .ok_or_else(|| anyhow::anyhow!("no target named {n}"))
        })
        .collect()
}

/// Writes `bytes` to a temporary file next to `path` and renames it into
/// place, so readers see either the old file or the complete new one.
///
/// The published file keeps the mode of the file it replaces. A new file
/// gets 0644 rather than the temporary file's owner-only 0600.
pub fn publish(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to create temporary file in {}", dir.display()))?;
    tmp.write_all(bytes)?;
    let permissions = match std::fs::metadata(path) {
        Ok(existing) => existing.permissions(),
        Err(_) => default_permissions(tmp.as_file())?,
    };
    tmp.as_file()
        .set_permissions(permissions)
        .with_context(|| format!("failed to set permissions for {}", path.display()))?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(unix)]
fn default_permissions(_file: &std::fs::File) -> Result<std::fs::Permissions> {
    use std::os::unix::fs::PermissionsExt;
    Ok(std::fs::Permissions::from_mode(0o644))
}

#[cfg(not(unix))]
fn default_permissions(file: &std::fs::File) -> Result<std::fs::Permissions> {
    Ok(file.metadata()?.permissions())
}

fn compile_sources<T: Toolchain + ?Sized>(
    toolchain: &T,
    target: &Target,
    obj_dir: &Path,
) -> Result<Vec<PathBuf>> {
    let mut seen = HashSet::new();
    let mut objects = Vec::with_capacity(target.sources.len());
    for source in &target.sources {
        let stem = source
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| anyhow::anyhow!("source has no file name: {}", source.display()))?;
        if !seen.insert(stem.to_string()) {
            bail!("two sources compile to {stem}.o");
        }
        let object = obj_dir.join(format!("{stem}.o"));
        toolchain
            .compile(source, &target.cflags, &object)
            .with_context(|| format!("compiling {}", source.display()))?;
        objects.push(object);
    }
    Ok(objects)
}

fn link<T: Toolchain + ?Sized>(
    toolchain: &T,
    objects: &[PathBuf],
    script: &Path,
    (symbol, value): (&str, u32),
    output: &Path,
) -> Result<Binary> {
    toolchain.link(objects, script, &[(symbol.to_string(), value)], output)?;
    let bytes =
        std::fs::read(output).with_context(|| format!("failed to read {}", output.display()))?;
    parse_elf(&bytes).with_context(|| format!("parsing {}", output.display()))
}

fn load_items(target: &Target, bios: &[u8], boot: &[u8]) -> Result<PackItems> {
    let mut items = PackItems::with_capacity(target.items.len());
    for (dest, source) in &target.items {
        let contents = match source {
            ItemSource::File(path) => std::fs::read(path)
                .with_context(|| format!("item {dest}: failed to read {}", path.display()))?,
            ItemSource::Artifact(Stage::Bios) => bios.to_vec(),
            ItemSource::Artifact(Stage::Boot) => boot.to_vec(),
        };
        items.insert(dest.clone(), contents);
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    use anyhow::Result;
    use indexmap::IndexMap;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::{assemble, build_all, publish};
    use crate::config::{Config, ItemSource, Shuffle, Stage, Target, ToolchainConfig};
    use crate::cpmfs::{read_directory, read_file, FormatProfile};
    use crate::error::ImageError;
    use crate::format::elf::testelf::{build, sect, Body};
    use crate::resolver::SizeRule;
    use crate::shuffle::{unshuffle, InterleaveMap};
    use crate::toolchain::Toolchain;

    /// "Compiles" by copying the source and "links" by concatenating objects
    /// into `.text` with a fixed `.bss`. `drift` bytes are added to `.text`
    /// when linking with a script named `final.ld`.
    struct FakeToolchain {
        drift: usize,
        links: Mutex<Vec<(String, Vec<(String, u32)>)>>,
    }

    impl FakeToolchain {
        fn new(drift: usize) -> Self {
            Self {
                drift,
                links: Mutex::new(Vec::new()),
            }
        }
    }

    impl Toolchain for FakeToolchain {
        fn compile(&self, source: &Path, _cflags: &[String], object: &Path) -> Result<()> {
            std::fs::copy(source, object)?;
            Ok(())
        }

        fn link(
            &self,
            objects: &[PathBuf],
            script: &Path,
            defsyms: &[(String, u32)],
            output: &Path,
        ) -> Result<()> {
            let script_name = script.file_name().and_then(|s| s.to_str()).unwrap_or("").to_string();
            self.links.lock().unwrap().push((script_name.clone(), defsyms.to_vec()));
            let mut text = Vec::new();
            for obj in objects {
                text.extend(std::fs::read(obj)?);
            }
            if script_name == "final.ld" {
                text.extend(std::iter::repeat(0xea).take(self.drift));
            }
            let bss_at = 0x0800 + text.len() as u32;
            let elf = build(&[
                sect(".text", 0x0800, Body::Bytes(text)),
                sect(".bss", bss_at, Body::Zero(0x40)),
            ]);
            std::fs::write(output, elf)?;
            Ok(())
        }
    }

    fn target(dir: &Path, name: &str) -> Target {
        std::fs::write(dir.join("bios.S"), [0xa9u8; 0x300]).expect("write source");
        std::fs::write(dir.join("ccp.com"), [0xc3u8; 2000]).expect("write ccp");
        let mut items = IndexMap::new();
        items.insert("0:ccp.sys".to_string(), ItemSource::File(dir.join("ccp.com")));
        items.insert("0:bios.sys".to_string(), ItemSource::Artifact(Stage::Bios));
        Target {
            name: name.to_string(),
            sources: vec![dir.join("bios.S")],
            cflags: Vec::new(),
            prelink_script: dir.join("prelink.ld"),
            link_script: dir.join("final.ld"),
            size_symbol: "BIOS_SIZE".to_string(),
            placeholder: 0x4000,
            size_rule: SizeRule::Allocated,
            output: dir.join("out").join(format!("{name}.img")),
            shuffle: Some(Shuffle {
                blocksize: 256,
                blockspertrack: 16,
                map: InterleaveMap::parse("02468ace13579bdf", 16).expect("map"),
                pad: true,
            }),
            filesystem: Some(FormatProfile::builtin("appleiie").expect("profile")),
            items,
        }
    }

    fn config(dir: &Path, targets: &[Target]) -> Config {
        Config {
            toolchain: ToolchainConfig {
                cc: "cc".to_string(),
                ld: "ld".to_string(),
                cflags: Vec::new(),
                ldflags: Vec::new(),
                build_dir: dir.join("build"),
            },
            targets: targets.iter().map(|t| (t.name.clone(), t.clone())).collect(),
        }
    }

    #[test]
    fn builds_bootable_filesystem_image() {
        let tmp = TempDir::new().expect("tempdir");
        let tc = FakeToolchain::new(0);
        let t = target(tmp.path(), "apple2e");
        let out = assemble(&tc, &tmp.path().join("build"), &t).expect("assemble");

        assert_eq!(out.size.value, 0x340);
        let links = tc.links.lock().unwrap().clone();
        assert_eq!(
            links,
            vec![
                ("prelink.ld".to_string(), vec![("BIOS_SIZE".to_string(), 0x4000)]),
                ("final.ld".to_string(), vec![("BIOS_SIZE".to_string(), 0x340)]),
            ]
        );

        let written = std::fs::read(&t.output).expect("published");
        assert_eq!(written, out.image);
        let profile = t.filesystem.as_ref().expect("fs");
        assert_eq!(written.len(), profile.image_len());

        assert_eq!(out.boot.len(), 4096);
        let boot = unshuffle(&written[..4096], 256, 16, &t.shuffle.as_ref().expect("shuffle").map)
            .expect("unshuffle");
        assert_eq!(&boot[..0x300], &out.bios[..]);
        assert!(boot[0x300..].iter().all(|b| *b == 0));

        let entries = read_directory(profile, &written).expect("directory");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name.to_string(), "0:CCP.SYS");
        assert_eq!(entries[1].name.to_string(), "0:BIOS.SYS");
        let bios = read_file(profile, &written, &entries[1]).expect("bios.sys");
        assert_eq!(bios, out.bios);
    }

    #[test]
    fn rebuilding_produces_identical_image() {
        let tmp = TempDir::new().expect("tempdir");
        let tc = FakeToolchain::new(0);
        let t = target(tmp.path(), "apple2e");
        let first = assemble(&tc, &tmp.path().join("build"), &t).expect("first");
        let second = assemble(&tc, &tmp.path().join("build"), &t).expect("second");
        assert_eq!(first.image, second.image);
    }

    #[test]
    fn size_drift_in_final_link_is_an_error() {
        let tmp = TempDir::new().expect("tempdir");
        let tc = FakeToolchain::new(2);
        let t = target(tmp.path(), "apple2e");
        let err = assemble(&tc, &tmp.path().join("build"), &t).expect_err("drift");
        assert_eq!(
            err.downcast_ref::<ImageError>(),
            Some(&ImageError::SizeResolution {
                symbol: "BIOS_SIZE".to_string(),
                prelink: 0x340,
                relinked: 0x342,
            })
        );
        assert!(!t.output.exists());
        assert_eq!(tc.links.lock().unwrap().len(), 2);
    }

    #[test]
    fn unpadded_partial_track_is_rejected() {
        let tmp = TempDir::new().expect("tempdir");
        let tc = FakeToolchain::new(0);
        let mut t = target(tmp.path(), "apple2e");
        if let Some(s) = t.shuffle.as_mut() {
            s.pad = false;
        }
        let err = assemble(&tc, &tmp.path().join("build"), &t).expect_err("partial track");
        assert!(matches!(err.downcast_ref::<ImageError>(), Some(ImageError::Config(_))));
        assert!(!t.output.exists());
    }

    #[test]
    fn plain_target_publishes_flat_binary() {
        let tmp = TempDir::new().expect("tempdir");
        let tc = FakeToolchain::new(0);
        let mut t = target(tmp.path(), "tty540b");
        t.shuffle = None;
        t.filesystem = None;
        t.items.clear();
        let out = assemble(&tc, &tmp.path().join("build"), &t).expect("assemble");
        assert_eq!(std::fs::read(&t.output).expect("published"), vec![0xa9; 0x300]);
        assert_eq!(out.image, out.bios);
    }

    #[test]
    fn failing_target_does_not_stop_others() {
        let tmp = TempDir::new().expect("tempdir");
        let good = target(tmp.path(), "good");
        let mut bad = target(tmp.path(), "bad");
        bad.items
            .insert("0:gone.com".to_string(), ItemSource::File(tmp.path().join("missing.com")));

        let config = config(tmp.path(), &[good.clone(), bad.clone()]);

        let tc = FakeToolchain::new(0);
        let reports = build_all(&tc, &config, &[]).expect("reports");
        assert_eq!(reports.len(), 2);
        assert!(reports[0].result.is_ok());
        let err = reports[1].result.as_ref().expect_err("bad fails");
        assert!(format!("{err:#}").contains("missing.com"));
        assert!(good.output.exists());
        assert!(!bad.output.exists());

        assert!(build_all(&tc, &config, &["nope".to_string()]).is_err());
    }

    #[test]
    fn repeated_target_names_build_once() {
        let tmp = TempDir::new().expect("tempdir");
        let t = target(tmp.path(), "apple2e");
        let config = config(tmp.path(), &[t.clone()]);

        let tc = FakeToolchain::new(0);
        let names = vec!["apple2e".to_string(), "apple2e".to_string()];
        let reports = build_all(&tc, &config, &names).expect("reports");
        assert_eq!(reports.len(), 1);
        assert!(reports[0].result.is_ok());
        assert_eq!(tc.links.lock().unwrap().len(), 2);
    }

    #[cfg(unix)]
    #[test]
    fn published_image_is_world_readable() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().expect("tempdir");
        let fresh = tmp.path().join("fresh.img");
        publish(&fresh, b"image").expect("publish");
        let mode = std::fs::metadata(&fresh).expect("stat").permissions().mode();
        assert_eq!(mode & 0o777, 0o644);

        let kept = tmp.path().join("kept.img");
        std::fs::write(&kept, b"old").expect("seed");
        std::fs::set_permissions(&kept, std::fs::Permissions::from_mode(0o640)).expect("chmod");
        publish(&kept, b"new").expect("publish");
        let mode = std::fs::metadata(&kept).expect("stat").permissions().mode();
        assert_eq!(mode & 0o777, 0o640);
    }

    #[test]
    fn publish_replaces_existing_file() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("disk.img");
        std::fs::write(&path, b"old").expect("seed");
        publish(&path, b"new image").expect("publish");
        assert_eq!(std::fs::read(&path).expect("read"), b"new image");
        let leftovers = std::fs::read_dir(tmp.path()).expect("ls").count();
        assert_eq!(leftovers, 1);
    }
}
