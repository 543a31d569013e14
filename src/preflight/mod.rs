//! Preflight checks for the module pipeline.
//!
//! Validates that the host has the tools the later stages shell out to, so a
//! missing `depmod` is reported up front rather than after a module was built.
//!
//! # Example
//!
//! ```rust,ignore
//! use kmod_provision::preflight::check_required_tools;
//! use kmod_provision::process::HostRunner;
//!
//! let tools = &[("make", "make"), ("openssl", "openssl")];
//! if let Err(e) = check_required_tools(&HostRunner, tools) {
//!     eprintln!("{}", e);
//! }
//! ```

use anyhow::{bail, Result};
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use crate::process::CommandRunner;

/// Check if a command exists on the host system.
pub fn command_exists(runner: &dyn CommandRunner, cmd: &str) -> bool {
    runner.locate(cmd).is_some()
}

/// Tools the build, sign and install stages need.
///
/// Each tuple is (command_name, package_name).
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[
    ("make", "make"),
    ("gcc", "gcc"),
    ("openssl", "openssl"),
    ("depmod", "kmod"),
];

/// Tools only the operator commands need.
pub const MOK_TOOLS: &[(&str, &str)] = &[("mokutil", "mokutil"), ("modprobe", "kmod")];

/// Check that specific tools are available.
///
/// # Returns
///
/// * `Ok(())` if all tools are found
/// * `Err` with list of missing tools and their packages
pub fn check_required_tools(runner: &dyn CommandRunner, tools: &[(&str, &str)]) -> Result<()> {
    let mut missing = Vec::new();

    for (tool, package) in tools {
        if !command_exists(runner, tool) {
            missing.push((*tool, *package));
        }
    }

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }

    Ok(())
}

/// Whether the process runs with an effective UID of 0.
///
/// `/proc/self` is owned by the effective UID of the reading process. An
/// unreadable `/proc` counts as not root.
pub fn running_as_root() -> bool {
    owner_uid(Path::new("/proc/self")) == Some(0)
}

fn owner_uid(path: &Path) -> Option<u32> {
    fs::metadata(path).ok().map(|meta| meta.uid())
}

/// Check all tools in [`REQUIRED_TOOLS`].
pub fn check_host_tools(runner: &dyn CommandRunner) -> Result<()> {
    check_required_tools(runner, REQUIRED_TOOLS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::HostRunner;
    use crate::testing::FakeRunner;
    use std::os::unix::fs::MetadataExt;
    use tempfile::TempDir;

    #[test]
    fn test_owner_uid_matches_own_files() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("owned");
        fs::write(&path, "").unwrap();
        let expected = fs::metadata(temp.path()).unwrap().uid();
        assert_eq!(owner_uid(&path), Some(expected));
        assert_eq!(owner_uid(&temp.path().join("missing")), None);
    }

    #[test]
    fn test_running_as_root_follows_proc_self() {
        let proc_uid = fs::metadata("/proc/self").map(|m| m.uid()).ok();
        assert_eq!(running_as_root(), proc_uid == Some(0));
    }

    #[test]
    fn test_command_exists() {
        // 'ls' should exist on any Unix system
        assert!(command_exists(&HostRunner, "ls"));
        assert!(!command_exists(&HostRunner, "definitely_not_a_real_command_12345"));
    }

    #[test]
    fn test_check_required_tools_success() {
        let tools = &[("ls", "coreutils"), ("cat", "coreutils")];
        assert!(check_required_tools(&HostRunner, tools).is_ok());
    }

    #[test]
    fn test_check_host_tools_lists_missing() {
        let runner = FakeRunner::new().with_tools(&["make", "gcc"]);
        let err = check_host_tools(&runner).unwrap_err().to_string();
        assert!(err.contains("Missing required host tools:"));
        assert!(err.contains("  openssl (install: openssl)"));
        assert!(err.contains("  depmod (install: kmod)"));
        assert!(!err.contains("make (install"));
    }

    #[test]
    fn test_check_host_tools_all_present() {
        let runner = FakeRunner::new().with_tools(&["make", "gcc", "openssl", "depmod"]);
        assert!(check_host_tools(&runner).is_ok());
    }
}
