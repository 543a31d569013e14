//! Operator commands against the firmware trust store (MOK).
//!
//! Each command stands alone and touches only its own piece of state:
//!
//! | command     | effect                                                   |
//! |-------------|----------------------------------------------------------|
//! | `enroll`    | `mokutil --import <der>`, confirmed at next boot         |
//! | `check`     | `mokutil --list-enrolled`, looks for the common name     |
//! | `remove`    | `mokutil --delete <der>`, confirmed at next boot         |
//!
//! `enroll` and `remove` ask `mokutil --test-key` about the DER itself, so a
//! rotated certificate that kept the old common name is still imported.
//! | `test-load` | `modprobe -r`, `modprobe`, then `/proc/modules`          |
//! | `status`    | `mokutil --sb-state` plus `check`                        |
//!
//! Results come back as a [`CheckReport`]; the binary prints the lines and
//! exits 0 or 1 from [`CheckReport::ok`].

pub mod recipes;

use anyhow::{bail, Result};
use std::fs;
use std::path::Path;

use crate::host::HostRoot;
use crate::keys::{certificate_fingerprint, SigningKeyPair};
use crate::pipeline::config::ModuleConfig;
use crate::process::{Cmd, CommandRunner};

/// Queries and mutations of the MOK database.
pub trait TrustStore {
    /// Human-readable listing of enrolled certificates.
    fn list_enrolled(&self) -> Result<String>;
    /// Queue `der` for enrollment; prompts for a one-time password.
    fn import(&self, der: &Path) -> Result<()>;
    /// Queue `der` for deletion; prompts for a one-time password.
    fn delete(&self, der: &Path) -> Result<()>;
    fn secure_boot_state(&self) -> Result<String>;
    /// Where this exact certificate stands in the database.
    fn key_status(&self, der: &Path) -> Result<KeyStatus>;
}

/// Enrollment status of one certificate, as reported by `mokutil --test-key`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStatus {
    Enrolled,
    /// Queued by an earlier `--import`, waiting for MokManager.
    PendingEnrollment,
    NotEnrolled,
}

/// Parse `mokutil --test-key` output. The exit status differs between
/// mokutil releases, so only the message is trusted.
pub fn parse_key_status(output: &str) -> Option<KeyStatus> {
    if output.contains("already in the enrollment request") {
        Some(KeyStatus::PendingEnrollment)
    } else if output.contains("is already enrolled") {
        Some(KeyStatus::Enrolled)
    } else if output.contains("is not enrolled") {
        Some(KeyStatus::NotEnrolled)
    } else {
        None
    }
}

pub struct Mokutil<'a> {
    runner: &'a dyn CommandRunner,
}

impl<'a> Mokutil<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self { runner }
    }
}

impl TrustStore for Mokutil<'_> {
    fn list_enrolled(&self) -> Result<String> {
        // Exits non-zero when MokListRT is empty.
        let result = Cmd::new("mokutil")
            .arg("--list-enrolled")
            .allow_fail()
            .run(self.runner)?;
        Ok(result.stdout)
    }

    fn import(&self, der: &Path) -> Result<()> {
        Cmd::new("mokutil")
            .arg("--import")
            .arg_path(der)
            .error_msg("mokutil --import failed")
            .run_interactive(self.runner)?;
        Ok(())
    }

    fn delete(&self, der: &Path) -> Result<()> {
        Cmd::new("mokutil")
            .arg("--delete")
            .arg_path(der)
            .error_msg("mokutil --delete failed")
            .run_interactive(self.runner)?;
        Ok(())
    }

    fn secure_boot_state(&self) -> Result<String> {
        let result = Cmd::new("mokutil")
            .arg("--sb-state")
            .allow_fail()
            .run(self.runner)?;
        Ok(result.combined_output())
    }

    fn key_status(&self, der: &Path) -> Result<KeyStatus> {
        let result = Cmd::new("mokutil")
            .arg("--test-key")
            .arg_path(der)
            .allow_fail()
            .run(self.runner)?;
        let output = result.combined_output();
        match parse_key_status(&output) {
            Some(status) => Ok(status),
            None => bail!(
                "could not read enrollment state of {} from mokutil --test-key: {}",
                der.display(),
                output.trim()
            ),
        }
    }
}

/// Outcome of an operator command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckReport {
    pub ok: bool,
    pub lines: Vec<String>,
}

impl CheckReport {
    fn new(ok: bool) -> Self {
        Self {
            ok,
            lines: Vec::new(),
        }
    }

    fn line(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }
}

/// Whether a `mokutil --list-enrolled` listing has a subject whose common
/// name is exactly `common_name`. Tolerates both `CN=x` and `CN = x`.
pub fn is_enrolled(listing: &str, common_name: &str) -> bool {
    let wanted = common_name.trim();
    listing
        .lines()
        .filter_map(|line| line.trim().strip_prefix("Subject:"))
        .any(|subject| subject_common_names(subject).any(|cn| cn == wanted))
}

fn subject_common_names(subject: &str) -> impl Iterator<Item = &str> {
    subject.split(',').filter_map(|rdn| {
        let (attr, value) = rdn.split_once('=')?;
        (attr.trim() == "CN").then(|| value.trim())
    })
}

/// The operator command set for one module and key pair.
pub struct MokCommands<'a> {
    pub host: &'a HostRoot,
    pub runner: &'a dyn CommandRunner,
    pub store: &'a dyn TrustStore,
    pub module: &'a ModuleConfig,
    pub keys: &'a SigningKeyPair,
    pub common_name: &'a str,
}

impl MokCommands<'_> {
    fn require_der(&self) -> Result<()> {
        if !self.keys.der.is_file() {
            bail!(
                "signing certificate not found at {}\nRun `kmod-provision keys` or rebuild the image first",
                self.keys.der.display()
            );
        }
        Ok(())
    }

    fn enrolled(&self) -> Result<bool> {
        Ok(is_enrolled(&self.store.list_enrolled()?, self.common_name))
    }

    pub fn enroll(&self) -> Result<CheckReport> {
        self.require_der()?;
        match self.store.key_status(&self.keys.der)? {
            KeyStatus::Enrolled => {
                let mut report = CheckReport::new(true);
                report.line(format!("{} is already enrolled", self.keys.der.display()));
                return Ok(report);
            }
            KeyStatus::PendingEnrollment => {
                let mut report = CheckReport::new(true);
                report.line(format!("{} is already queued for enrollment", self.keys.der.display()));
                report.line("Reboot and choose \"Enroll MOK\" in MokManager to finish.");
                return Ok(report);
            }
            KeyStatus::NotEnrolled => {}
        }
        let fingerprint = certificate_fingerprint(&self.keys.der)?;
        log::info!("mok: importing {}", self.keys.der.display());
        self.store.import(&self.keys.der)?;

        let mut report = CheckReport::new(true);
        report.line(format!("Queued '{}' for enrollment.", self.common_name));
        report.line(format!("SHA-256 fingerprint: {}", fingerprint));
        report.line("Reboot and choose \"Enroll MOK\" in MokManager, then enter the password you just set.");
        Ok(report)
    }

    pub fn check(&self) -> Result<CheckReport> {
        let enrolled = self.enrolled()?;
        let mut report = CheckReport::new(enrolled);
        if enrolled {
            report.line(format!("'{}' is enrolled", self.common_name));
        } else {
            report.line(format!("'{}' is NOT enrolled", self.common_name));
        }
        match certificate_fingerprint(&self.keys.der) {
            Ok(fingerprint) => report.line(format!("SHA-256 fingerprint: {}", fingerprint)),
            Err(_) => report.line(format!(
                "certificate {} is missing",
                self.keys.der.display()
            )),
        }
        Ok(report)
    }

    pub fn remove(&self) -> Result<CheckReport> {
        self.require_der()?;
        if self.store.key_status(&self.keys.der)? != KeyStatus::Enrolled {
            let mut report = CheckReport::new(true);
            report.line(format!("{} is not enrolled; nothing to remove", self.keys.der.display()));
            return Ok(report);
        }
        log::info!("mok: requesting deletion of {}", self.keys.der.display());
        self.store.delete(&self.keys.der)?;

        let mut report = CheckReport::new(true);
        report.line(format!("Queued '{}' for removal.", self.common_name));
        report.line("Reboot and choose \"Delete MOK\" in MokManager to confirm.");
        Ok(report)
    }

    /// Reload the module and confirm it appears in `/proc/modules`.
    pub fn test_load(&self) -> Result<CheckReport> {
        let module = self.module.name.as_str();
        // Not loaded is fine here.
        Cmd::new("modprobe")
            .args(["-r", module])
            .allow_fail()
            .run(self.runner)?;
        let load = Cmd::new("modprobe")
            .arg(module)
            .allow_fail()
            .run(self.runner)?;

        let loaded = is_loaded(self.host, &self.module.loaded_name());
        let mut report = CheckReport::new(load.success() && loaded);

        if report.ok {
            report.line(format!("{} loaded successfully", module));
            let signer = Cmd::new("modinfo")
                .args(["-F", "signer", module])
                .allow_fail()
                .run(self.runner)?;
            let signer = signer.stdout.trim();
            if !signer.is_empty() {
                report.line(format!("signed by: {}", signer));
            }
        } else {
            report.line(format!("{} failed to load", module));
            let output = load.combined_output();
            let untrusted =
                output.contains("Key was rejected") || output.contains("Required key not available");
            if !output.is_empty() {
                report.line(output);
            }
            if untrusted {
                report.line("The signing certificate is not trusted yet; run the enroll command and reboot.");
            }
        }
        Ok(report)
    }

    pub fn status(&self) -> Result<CheckReport> {
        let state = self.store.secure_boot_state()?;
        let mut report = self.check()?;
        report.lines.insert(0, state.trim().to_string());
        report.ok = true;
        Ok(report)
    }
}

/// Whether `name` (underscore spelling) is listed in `/proc/modules`.
pub fn is_loaded(host: &HostRoot, name: &str) -> bool {
    fs::read_to_string(host.path("/proc/modules"))
        .map(|table| {
            table
                .lines()
                .any(|line| line.split_whitespace().next() == Some(name))
        })
        .unwrap_or(false)
}
