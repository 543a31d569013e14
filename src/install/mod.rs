//! Module installation into the kernel's module tree.
//!
//! Every existing copy of the module under `/lib/modules/<version>` is backed
//! up and replaced. With no existing copy the module goes to `extra/`. The
//! dependency index is refreshed afterwards in all cases.

pub mod nvidia;
pub mod state;

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::host::{self, HostRoot};
use crate::process::{Cmd, CommandRunner};

pub use state::{InstallAttempt, InstallState};

/// Compression suffixes distributions ship modules with.
pub const COMPRESSED_SUFFIXES: &[&str] = &[".xz", ".zst", ".gz"];

const MODULE_MODE: u32 = 0o644;
const CONFIG_MODE: u32 = 0o644;

/// One replaced copy of the module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Replacement {
    /// Where the pre-existing file was.
    pub original: PathBuf,
    /// Pre-install content of `original`.
    pub backup: PathBuf,
    /// Where the new module was written.
    pub installed: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstallReport {
    pub installed: Vec<PathBuf>,
    pub replacements: Vec<Replacement>,
    /// True when no copy existed and `extra/` was used.
    pub fallback: bool,
}

/// File names a copy of `name` may carry: both `-` and `_` spellings, plain
/// or compressed.
pub fn module_file_names(name: &str) -> Vec<String> {
    let mut spellings = vec![name.to_string()];
    for alt in [name.replace('-', "_"), name.replace('_', "-")] {
        if !spellings.contains(&alt) {
            spellings.push(alt);
        }
    }

    let mut names = Vec::new();
    for spelling in &spellings {
        names.push(format!("{}.ko", spelling));
        for suffix in COMPRESSED_SUFFIXES {
            names.push(format!("{}.ko{}", spelling, suffix));
        }
    }
    names
}

/// Every file under `modules_dir` that is a copy of module `name`.
///
/// Symlinked directories (`build`, `source`) are not followed.
pub fn find_installed_modules(modules_dir: &Path, name: &str) -> Result<Vec<PathBuf>> {
    if !modules_dir.is_dir() {
        return Ok(Vec::new());
    }
    let names = module_file_names(name);

    let mut found = Vec::new();
    for entry in WalkDir::new(modules_dir).follow_links(false).sort_by_file_name() {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                log::warn!("install: skipping unreadable entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy();
        if names.iter().any(|n| n.as_str() == file_name) {
            found.push(entry.path().to_path_buf());
        }
    }
    Ok(found)
}

/// `<file>.backup.<stamp>`, with `.<n>` appended if that name is taken.
pub fn backup_path(file: &Path, stamp: &str) -> PathBuf {
    let base = format!("{}.backup.{}", file.display(), stamp);
    let mut candidate = PathBuf::from(&base);
    let mut counter = 1;
    while candidate.exists() {
        candidate = PathBuf::from(format!("{}.{}", base, counter));
        counter += 1;
    }
    candidate
}

fn compression_suffix(path: &Path) -> Option<&'static str> {
    let name = path.file_name()?.to_string_lossy().into_owned();
    COMPRESSED_SUFFIXES
        .iter()
        .copied()
        .find(|suffix| name.ends_with(&format!(".ko{}", suffix)))
}

/// Install `object` as module `name` for the kernel at `modules_dir`.
pub fn install_module(
    modules_dir: &Path,
    name: &str,
    object: &Path,
    stamp: &str,
) -> Result<InstallReport> {
    let existing = find_installed_modules(modules_dir, name)?;
    let mut report = InstallReport::default();

    if existing.is_empty() {
        let dest = modules_dir.join("extra").join(format!("{}.ko", name));
        log::info!("install: no existing {} module, installing to {}", name, dest.display());
        place(object, &dest)?;
        report.installed.push(dest);
        report.fallback = true;
        return Ok(report);
    }

    for original in existing {
        let backup = backup_path(&original, stamp);
        let dest = match compression_suffix(&original) {
            Some(suffix) => {
                let name = original
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let plain = name.trim_end_matches(suffix).to_string();
                fs::rename(&original, &backup).with_context(|| {
                    format!(
                        "moving compressed module '{}' to backup '{}'",
                        original.display(),
                        backup.display()
                    )
                })?;
                original.with_file_name(plain)
            }
            None => {
                fs::copy(&original, &backup).with_context(|| {
                    format!(
                        "backing up '{}' to '{}'",
                        original.display(),
                        backup.display()
                    )
                })?;
                original.clone()
            }
        };
        log::info!(
            "install: replacing {} (backup {})",
            original.display(),
            backup.display()
        );
        place(object, &dest)?;
        if !report.installed.contains(&dest) {
            report.installed.push(dest.clone());
        }
        report.replacements.push(Replacement {
            original,
            backup,
            installed: dest,
        });
    }
    Ok(report)
}

fn place(object: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating module directory '{}'", parent.display()))?;
    }
    fs::copy(object, dest).with_context(|| {
        format!(
            "installing '{}' to '{}'",
            object.display(),
            dest.display()
        )
    })?;
    host::set_mode(dest, MODULE_MODE)
}

/// Run `depmod -a` for `version`, against the sysroot when it is not `/`.
pub fn refresh_dependencies(
    runner: &dyn CommandRunner,
    host: &HostRoot,
    version: &str,
) -> Result<()> {
    log::info!("install: running depmod for {}", version);
    let mut cmd = Cmd::new("depmod").arg("-a");
    if !host.is_system() {
        cmd = cmd.arg("-b").arg_path(host.root());
    }
    cmd.arg(version)
        .error_msg("depmod failed. Install: sudo dnf install kmod")
        .run(runner)?;
    Ok(())
}

/// `/etc/modules-load.d/<name>.conf`.
pub fn write_autoload(host: &HostRoot, name: &str) -> Result<PathBuf> {
    let path = host.path("/etc/modules-load.d").join(format!("{}.conf", name));
    host::write_file_mode(&path, format!("{}\n", name).as_bytes(), CONFIG_MODE)?;
    log::info!("install: autoload entry {}", path.display());
    Ok(path)
}

/// `/etc/modprobe.d/<name>.conf` with an `options` line.
pub fn write_modprobe_options(host: &HostRoot, name: &str, options: &str) -> Result<PathBuf> {
    let path = host.path("/etc/modprobe.d").join(format!("{}.conf", name));
    let contents = format!("options {} {}\n", name.replace('-', "_"), options.trim());
    host::write_file_mode(&path, contents.as_bytes(), CONFIG_MODE)?;
    log::info!("install: module options {}", path.display());
    Ok(path)
}
