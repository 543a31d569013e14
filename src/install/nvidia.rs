//! Re-signing of proprietary NVIDIA kernel objects with the module key.
//!
//! On a fresh image the driver may not have been compiled yet (akmods builds
//! it on first boot), so finding nothing is expected and only reported.

use anyhow::Result;
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;

use crate::build::sign::{sign_module, ModuleSigner};
use crate::host::HostRoot;
use crate::install::COMPRESSED_SUFFIXES;
use crate::keys::SigningKeyPair;

/// Directories searched for `nvidia*.ko`; `{kernel}` is the target release.
pub const DEFAULT_SEARCH_PATHS: &[&str] = &[
    "/lib/modules/{kernel}/extra/nvidia",
    "/lib/modules/{kernel}/extra",
    "/lib/modules/{kernel}/updates",
    "/lib/modules/{kernel}/updates/dkms",
    "/lib/modules/{kernel}/kernel/drivers/video",
    "/usr/lib/modules/{kernel}/extra/nvidia",
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NvidiaObjects {
    pub plain: Vec<PathBuf>,
    /// Compressed objects cannot be signed in place.
    pub compressed: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NvidiaSigning {
    pub signed: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
    /// Objects whose signing failed, with the error.
    pub failed: Vec<(PathBuf, String)>,
}

impl NvidiaSigning {
    pub fn is_empty(&self) -> bool {
        self.signed.is_empty() && self.skipped.is_empty() && self.failed.is_empty()
    }
}

fn is_nvidia_object(name: &str) -> bool {
    name.starts_with("nvidia") && name.ends_with(".ko")
}

fn is_compressed_nvidia_object(name: &str) -> bool {
    name.starts_with("nvidia")
        && COMPRESSED_SUFFIXES
            .iter()
            .any(|suffix| name.ends_with(&format!(".ko{}", suffix)))
}

/// NVIDIA objects directly inside each search path. The same file reached
/// through `/lib` and `/usr/lib` is reported once.
pub fn find_nvidia_modules(
    host: &HostRoot,
    kernel: &str,
    search_paths: &[String],
) -> Result<NvidiaObjects> {
    let mut seen = HashSet::new();
    let mut objects = NvidiaObjects::default();

    for pattern in search_paths {
        let dir = host.path(pattern.replace("{kernel}", kernel));
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => {
                log::debug!("nvidia: {} not present", dir.display());
                continue;
            }
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect();
        paths.sort();

        for path in paths {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let plain = is_nvidia_object(&name);
            if !plain && !is_compressed_nvidia_object(&name) {
                continue;
            }
            let identity = fs::canonicalize(&path).unwrap_or_else(|_| path.clone());
            if !seen.insert(identity) {
                continue;
            }
            if plain {
                objects.plain.push(path);
            } else {
                objects.compressed.push(path);
            }
        }
    }
    Ok(objects)
}

/// Sign every NVIDIA object found. Individual failures are collected, not
/// raised: the hp-wmi module is already installed at this point.
pub fn sign_nvidia_modules(
    host: &HostRoot,
    kernel: &str,
    search_paths: &[String],
    signer: &dyn ModuleSigner,
    keys: &SigningKeyPair,
) -> Result<NvidiaSigning> {
    let objects = find_nvidia_modules(host, kernel, search_paths)?;
    let mut outcome = NvidiaSigning {
        skipped: objects.compressed,
        ..NvidiaSigning::default()
    };

    for object in objects.plain {
        match sign_module(Some(signer), &object, keys) {
            Ok(_) => outcome.signed.push(object),
            Err(e) => {
                log::warn!("nvidia: signing {} failed: {:#}", object.display(), e);
                outcome.failed.push((object, format!("{:#}", e)));
            }
        }
    }
    Ok(outcome)
}

/// Search paths as they apply to `kernel`, for messages.
pub fn describe_search_paths(search_paths: &[String], kernel: &str) -> String {
    search_paths
        .iter()
        .map(|p| p.replace("{kernel}", kernel))
        .collect::<Vec<_>>()
        .join(", ")
}
