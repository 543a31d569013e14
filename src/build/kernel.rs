//! Target kernel resolution.
//!
//! Finds the release the module is built for and a directory holding that
//! kernel's build headers and `scripts/sign-file`.
//!
//! # Usage
//!
//! ```rust,ignore
//! use kmod_provision::build::kernel::{detect_kernel_version, resolve_kernel_target};
//!
//! let version = detect_kernel_version(&host, &runner, None, "/lib/modules")?;
//! let target = resolve_kernel_target(&host, &version, "/lib/modules", "/usr/src/kernels")?;
//! println!("building against {}", target.build_dir.display());
//! ```

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::host::HostRoot;
use crate::process::{Cmd, CommandRunner};

/// The kernel a module is built and installed for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KernelTarget {
    /// Release string, e.g. `6.11.5-300.fc41.x86_64`.
    pub version: String,
    /// Directory with the kernel's build headers and `Makefile`.
    pub build_dir: PathBuf,
    /// False when `build_dir` is a fallback tree for another release.
    pub exact: bool,
}

impl KernelTarget {
    /// The kernel's own module signing utility.
    pub fn sign_file(&self) -> PathBuf {
        self.build_dir.join("scripts/sign-file")
    }
}

/// Determine the kernel release to build for.
///
/// Order: explicit override, then `uname -r` when `/lib/modules/<release>`
/// exists, then the newest release directory under `/lib/modules`. Inside a
/// container build the running kernel belongs to the build host, so the image's
/// own module tree is the better answer when they disagree.
pub fn detect_kernel_version(
    host: &HostRoot,
    runner: &dyn CommandRunner,
    configured: Option<&str>,
    modules_root: &str,
) -> Result<String> {
    if let Some(version) = configured.map(str::trim).filter(|v| !v.is_empty()) {
        return Ok(version.to_string());
    }

    let running = Cmd::new("uname")
        .arg("-r")
        .allow_fail()
        .run(runner)
        .ok()
        .filter(|r| r.success())
        .map(|r| r.stdout.trim().to_string())
        .filter(|v| !v.is_empty());

    if let Some(version) = &running {
        if host.modules_dir(modules_root, version).is_dir() {
            return Ok(version.clone());
        }
    }

    let installed = installed_releases(&host.path(modules_root))?;
    if let Some(newest) = installed.last() {
        if let Some(running) = &running {
            log::warn!(
                "kernel: running kernel {} has no module tree; using image kernel {}",
                running,
                newest
            );
        }
        return Ok(newest.clone());
    }

    match running {
        Some(version) => Ok(version),
        None => bail!(
            "could not determine the target kernel release: `uname -r` failed and {} is empty.\n\
             Set kernel.version in the config or {}",
            host.path(modules_root).display(),
            crate::pipeline::config::KERNEL_ENV
        ),
    }
}

/// Release directories under `modules_root`, sorted ascending.
fn installed_releases(modules_root: &Path) -> Result<Vec<String>> {
    if !modules_root.is_dir() {
        return Ok(Vec::new());
    }
    let mut releases = Vec::new();
    for entry in fs::read_dir(modules_root)
        .with_context(|| format!("reading module root '{}'", modules_root.display()))?
    {
        let entry = entry
            .with_context(|| format!("reading entry under '{}'", modules_root.display()))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.contains('.') && entry.path().is_dir() {
            releases.push(name);
        }
    }
    releases.sort_by(|a, b| compare_releases(a, b));
    Ok(releases)
}

/// Compare releases numerically where both sides have digits.
fn compare_releases(a: &str, b: &str) -> std::cmp::Ordering {
    let split = |s: &str| -> Vec<String> {
        s.split(|c: char| c == '.' || c == '-' || c == '_')
            .map(str::to_string)
            .collect()
    };
    let (pa, pb) = (split(a), split(b));
    for (x, y) in pa.iter().zip(pb.iter()) {
        let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
            (Ok(nx), Ok(ny)) => nx.cmp(&ny),
            _ => x.cmp(y),
        };
        if ord != std::cmp::Ordering::Equal {
            return ord;
        }
    }
    pa.len().cmp(&pb.len())
}

/// Locate the build directory for `version`.
///
/// Candidates: `/lib/modules/<version>/build`, `<search_root>/<version>`, then
/// any tree under `<search_root>` configured for `<version>`, then the first
/// usable tree there. A tree is usable when it has a `Makefile`. Nothing is
/// written here, so a failure leaves the host untouched.
pub fn resolve_kernel_target(
    host: &HostRoot,
    version: &str,
    modules_root: &str,
    search_root: &str,
) -> Result<KernelTarget> {
    let exact_candidates = [
        host.modules_dir(modules_root, version).join("build"),
        host.path(search_root).join(version),
    ];
    for candidate in &exact_candidates {
        if is_usable_tree(candidate) {
            log::info!("kernel: build headers for {} at {}", version, candidate.display());
            return Ok(KernelTarget {
                version: version.to_string(),
                build_dir: candidate.clone(),
                exact: true,
            });
        }
    }

    let search_dir = host.path(search_root);
    let trees = usable_trees(&search_dir)?;
    let releases: Vec<Option<String>> = trees.iter().map(|tree| tree_release(tree)).collect();

    if let Some(index) = releases.iter().position(|r| r.as_deref() == Some(version)) {
        log::info!(
            "kernel: build headers for {} at {} (configured release)",
            version,
            trees[index].display()
        );
        return Ok(KernelTarget {
            version: version.to_string(),
            build_dir: trees[index].clone(),
            exact: true,
        });
    }

    if let Some(fallback) = trees.into_iter().next() {
        log::warn!(
            "kernel: no build headers for {}; falling back to {} configured for {}",
            version,
            fallback.display(),
            releases[0].as_deref().unwrap_or("an unknown release")
        );
        return Ok(KernelTarget {
            version: version.to_string(),
            build_dir: fallback,
            exact: false,
        });
    }

    bail!(
        "kernel build headers for {} not found.\n\
         Looked in:\n  {}\n  {}\n  any directory under {}\n\
         Install: kernel-devel-{}",
        version,
        exact_candidates[0].display(),
        exact_candidates[1].display(),
        search_dir.display(),
        version
    )
}

fn is_usable_tree(dir: &Path) -> bool {
    dir.join("Makefile").is_file()
}

fn usable_trees(search_dir: &Path) -> Result<Vec<PathBuf>> {
    if !search_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut trees = Vec::new();
    for entry in fs::read_dir(search_dir)
        .with_context(|| format!("reading kernel source root '{}'", search_dir.display()))?
    {
        let entry = entry
            .with_context(|| format!("reading entry under '{}'", search_dir.display()))?;
        let path = entry.path();
        if is_usable_tree(&path) {
            trees.push(path);
        }
    }
    trees.sort();
    Ok(trees)
}

/// Release a build tree was configured for: `include/config/kernel.release`
/// when the tree has been prepared, else the version fields of its `Makefile`.
pub fn tree_release(build_dir: &Path) -> Option<String> {
    if let Ok(release) = fs::read_to_string(build_dir.join("include/config/kernel.release")) {
        let release = release.trim();
        if !release.is_empty() {
            return Some(release.to_string());
        }
    }

    let makefile = fs::read_to_string(build_dir.join("Makefile")).ok()?;
    let field = |name: &str| {
        makefile.lines().find_map(|line| {
            let (key, value) = line.split_once('=')?;
            (key.trim() == name).then(|| value.trim().to_string())
        })
    };
    let version = field("VERSION").filter(|v| !v.is_empty())?;
    let patchlevel = field("PATCHLEVEL").filter(|v| !v.is_empty())?;
    let sublevel = field("SUBLEVEL").unwrap_or_default();
    let extraversion = field("EXTRAVERSION").unwrap_or_default();
    if sublevel.is_empty() {
        Some(format!("{}.{}{}", version, patchlevel, extraversion))
    } else {
        Some(format!("{}.{}.{}{}", version, patchlevel, sublevel, extraversion))
    }
}
