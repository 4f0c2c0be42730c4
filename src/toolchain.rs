use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};
use log::debug;

use crate::config::ToolchainConfig;

/// The external compiler and linker.
pub trait Toolchain: Sync {
    /// Compiles one source file into `object`.
    fn compile(&self, source: &Path, cflags: &[String], object: &Path) -> Result<()>;

    /// Links `objects` with `script` into an ELF file, binding each
    /// `defsyms` name to its value.
    fn link(
        &self,
        objects: &[PathBuf],
        script: &Path,
        defsyms: &[(String, u32)],
        output: &Path,
    ) -> Result<()>;
}

/// Runs a cc/ld pair found on `PATH` (clang and ld.lld by default).
#[derive(Debug, Clone)]
pub struct CommandToolchain {
    cc: String,
    ld: String,
    cflags: Vec<String>,
    ldflags: Vec<String>,
}

impl CommandToolchain {
    #[must_use]
    pub fn from_config(cfg: &ToolchainConfig) -> Self {
        Self {
            cc: cfg.cc.clone(),
            ld: cfg.ld.clone(),
            cflags: cfg.cflags.clone(),
            ldflags: cfg.ldflags.clone(),
        }
    }
}

impl Toolchain for CommandToolchain {
    fn compile(&self, source: &Path, cflags: &[String], object: &Path) -> Result<()> {
        let mut cmd = Command::new(&self.cc);
        cmd.arg("-c")
            .arg(source)
            .arg("-o")
            .arg(object)
            .args(&self.cflags)
            .args(cflags);
        run(cmd)
    }

    fn link(
        &self,
        objects: &[PathBuf],
        script: &Path,
        defsyms: &[(String, u32)],
        output: &Path,
    ) -> Result<()> {
        let mut cmd = Command::new(&self.ld);
        cmd.arg("-T").arg(script);
        for (name, value) in defsyms {
            cmd.arg(format!("--defsym={name}={value:#x}"));
        }
        cmd.args(objects).arg("-o").arg(output).args(&self.ldflags);
        run(cmd)
    }
}

fn run(mut cmd: Command) -> Result<()> {
    debug!("running {cmd:?}");
    let out = cmd
        .output()
        .with_context(|| format!("failed to run {:?}", cmd.get_program()))?;
    if !out.status.success() {
        let stderr = String::from_utf8_lossy(&out.stderr);
        bail!(
            "{:?} failed ({}): {}",
            cmd.get_program(),
            out.status,
            stderr.trim()
        );
    }
    Ok(())
}
