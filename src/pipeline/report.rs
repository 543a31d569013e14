//! JSON summary of a provisioning run.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::host;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelSummary {
    pub version: String,
    pub build_dir: PathBuf,
    /// False when a fallback build directory was used.
    pub exact: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySummary {
    /// `injected (<source>)`, `existing` or `generated`.
    pub origin: String,
    pub key: PathBuf,
    pub crt: PathBuf,
    pub der: PathBuf,
    /// SHA-256 of the DER certificate.
    pub fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupSummary {
    pub original: PathBuf,
    pub backup: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NvidiaSummary {
    pub signed: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionReport {
    pub tool_version: String,
    /// Compact UTC timestamp of the run.
    pub generated_at: String,
    pub module: String,
    pub kernel: KernelSummary,
    pub keys: KeySummary,
    pub signed: bool,
    /// Final install state, e.g. `dependencies refreshed (signed)`.
    pub state: String,
    pub installed: Vec<PathBuf>,
    pub backups: Vec<BackupSummary>,
    pub fallback_install: bool,
    pub autoload: Option<PathBuf>,
    pub options: Option<PathBuf>,
    pub recipes: Option<PathBuf>,
    pub nvidia: Option<NvidiaSummary>,
    pub warnings: Vec<String>,
}

impl ProvisionReport {
    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self).context("serializing provisioning report")?;
        host::write_file_mode(path, &json, 0o644)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)
            .with_context(|| format!("reading provisioning report '{}'", path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing provisioning report '{}'", path.display()))
    }

    /// One-paragraph summary for the terminal.
    pub fn summary_lines(&self) -> Vec<String> {
        let mut lines = vec![
            format!(
                "{} for kernel {}: {}",
                self.module, self.kernel.version, self.state
            ),
            format!("key: {} ({})", self.keys.der.display(), self.keys.origin),
            format!("SHA-256 fingerprint: {}", self.keys.fingerprint),
        ];
        for path in &self.installed {
            lines.push(format!("installed: {}", path.display()));
        }
        for backup in &self.backups {
            lines.push(format!("backup: {}", backup.backup.display()));
        }
        for warning in &self.warnings {
            lines.push(format!("warning: {}", warning));
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> ProvisionReport {
        ProvisionReport {
            tool_version: "0.1.0".to_string(),
            generated_at: "20241015T134640Z".to_string(),
            module: "hp-wmi".to_string(),
            kernel: KernelSummary {
                version: "6.11.5-300.fc41.x86_64".to_string(),
                build_dir: PathBuf::from("/lib/modules/6.11.5-300.fc41.x86_64/build"),
                exact: true,
            },
            keys: KeySummary {
                origin: "generated".to_string(),
                key: PathBuf::from("/etc/pki/module-signing/module-signing.key"),
                crt: PathBuf::from("/etc/pki/module-signing/module-signing.crt"),
                der: PathBuf::from("/etc/pki/module-signing/module-signing.der"),
                fingerprint: "AB:CD".to_string(),
            },
            signed: false,
            state: "dependencies refreshed (unsigned)".to_string(),
            installed: vec![PathBuf::from(
                "/lib/modules/6.11.5-300.fc41.x86_64/extra/hp-wmi.ko",
            )],
            backups: Vec::new(),
            fallback_install: true,
            autoload: Some(PathBuf::from("/etc/modules-load.d/hp-wmi.conf")),
            options: None,
            recipes: None,
            nvidia: None,
            warnings: vec!["sign-file not found".to_string()],
        }
    }

    #[test]
    fn test_write_then_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("usr/share/kmod-provision/report.json");
        let report = sample();

        report.write(&path).unwrap();
        assert_eq!(ProvisionReport::load(&path).unwrap(), report);

        let raw: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["keys"]["origin"], "generated");
        assert_eq!(raw["fallback_install"], true);
    }

    #[test]
    fn test_load_rejects_garbage() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("report.json");
        fs::write(&path, "not json").unwrap();
        let msg = format!("{:#}", ProvisionReport::load(&path).unwrap_err());
        assert!(msg.contains("parsing provisioning report"));
    }

    #[test]
    fn test_summary_mentions_warnings() {
        let lines = sample().summary_lines();
        assert_eq!(
            lines[0],
            "hp-wmi for kernel 6.11.5-300.fc41.x86_64: dependencies refreshed (unsigned)"
        );
        assert!(lines.contains(&"warning: sign-file not found".to_string()));
    }
}
