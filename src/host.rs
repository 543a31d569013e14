//! Host filesystem handle.
//!
//! All absolute paths the pipeline touches (`/etc/pki/...`, `/lib/modules/...`,
//! `/proc/modules`) are resolved through a [`HostRoot`]. In production the root
//! is `/`; tests point it at a temporary directory.

use anyhow::{Context, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRoot {
    root: PathBuf,
}

impl HostRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The running system.
    pub fn system() -> Self {
        Self::new("/")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_system(&self) -> bool {
        self.root == Path::new("/")
    }

    /// Map an absolute host path into this root.
    pub fn path(&self, absolute: impl AsRef<Path>) -> PathBuf {
        let absolute = absolute.as_ref();
        let relative = absolute.strip_prefix("/").unwrap_or(absolute);
        self.root.join(relative)
    }

    /// Inverse of [`HostRoot::path`]: where `path` lives on the host.
    pub fn unmap(&self, path: &Path) -> PathBuf {
        match path.strip_prefix(&self.root) {
            Ok(relative) => Path::new("/").join(relative),
            Err(_) => path.to_path_buf(),
        }
    }

    /// `<modules_root>/<version>` under this root.
    pub fn modules_dir(&self, modules_root: &str, version: &str) -> PathBuf {
        self.path(modules_root).join(version)
    }
}

/// Write `contents` to `path`, creating parent directories and applying `mode`.
pub fn write_file_mode(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating directory '{}'", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("writing '{}'", path.display()))?;
    set_mode(path, mode)
}

pub fn set_mode(path: &Path, mode: u32) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .with_context(|| format!("setting mode {:o} on '{}'", mode, path.display()))
}

/// Create a directory (and parents) and apply `mode` to the leaf.
pub fn create_dir_mode(path: &Path, mode: u32) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("creating directory '{}'", path.display()))?;
    set_mode(path, mode)
}

/// Sorted file names in `dir`, for diagnostics.
pub fn list_dir_names(dir: &Path) -> Vec<String> {
    let mut names = match fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect::<Vec<_>>(),
        Err(_) => Vec::new(),
    };
    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_path_maps_absolute_into_root() {
        let host = HostRoot::new("/tmp/sysroot");
        assert_eq!(
            host.path("/etc/pki/module-signing"),
            PathBuf::from("/tmp/sysroot/etc/pki/module-signing")
        );
        assert_eq!(
            host.modules_dir("/lib/modules", "6.11.5-300.fc41.x86_64"),
            PathBuf::from("/tmp/sysroot/lib/modules/6.11.5-300.fc41.x86_64")
        );
    }

    #[test]
    fn test_unmap_reverses_path() {
        let host = HostRoot::new("/tmp/sysroot");
        let mapped = host.path("/lib/modules/6.11.5-300.fc41.x86_64/extra/hp-wmi.ko");
        assert_eq!(
            host.unmap(&mapped),
            PathBuf::from("/lib/modules/6.11.5-300.fc41.x86_64/extra/hp-wmi.ko")
        );
        assert_eq!(host.unmap(Path::new("/elsewhere")), PathBuf::from("/elsewhere"));
        assert_eq!(
            HostRoot::system().unmap(Path::new("/etc/modules-load.d/hp-wmi.conf")),
            PathBuf::from("/etc/modules-load.d/hp-wmi.conf")
        );
    }

    #[test]
    fn test_system_root_is_identity() {
        let host = HostRoot::system();
        assert!(host.is_system());
        assert_eq!(host.path("/proc/modules"), PathBuf::from("/proc/modules"));
    }

    #[test]
    fn test_write_file_mode_sets_permissions() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("etc/pki/module-signing/module-signing.key");

        write_file_mode(&path, b"secret", 0o600).unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"secret");
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_list_dir_names_sorted_and_tolerates_missing() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("b.o"), "").unwrap();
        fs::write(temp.path().join("a.c"), "").unwrap();
        assert_eq!(list_dir_names(temp.path()), vec!["a.c", "b.o"]);
        assert!(list_dir_names(&temp.path().join("missing")).is_empty());
    }
}
