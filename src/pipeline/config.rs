use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Config file read when `--config` is not given. Optional: built-in defaults
/// apply when it does not exist.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/kmod-provision/provision.toml";

pub const SYSROOT_ENV: &str = "KMOD_PROVISION_SYSROOT";
pub const KERNEL_ENV: &str = "KMOD_PROVISION_KERNEL";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProvisionConfig {
    /// Directory treated as `/` for every host path.
    pub sysroot: PathBuf,
    /// Host path of the scratch area for module builds.
    pub work_dir: String,
    pub module: ModuleConfig,
    pub kernel: KernelConfig,
    pub packages: PackagesConfig,
    pub keys: KeysConfig,
    pub install: InstallConfig,
    pub nvidia: NvidiaConfig,
    pub recipes: RecipesConfig,
    pub report: ReportConfig,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            sysroot: PathBuf::from("/"),
            work_dir: "/var/tmp/kmod-provision".to_string(),
            module: ModuleConfig::default(),
            kernel: KernelConfig::default(),
            packages: PackagesConfig::default(),
            keys: KeysConfig::default(),
            install: InstallConfig::default(),
            nvidia: NvidiaConfig::default(),
            recipes: RecipesConfig::default(),
            report: ReportConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModuleConfig {
    /// Module name as used for the object file (`hp-wmi` -> `hp-wmi.ko`).
    pub name: String,
    /// Host path of the single-file module source.
    pub source: String,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            name: "hp-wmi".to_string(),
            source: "/tmp/hp-wmi/hp-wmi.c".to_string(),
        }
    }
}

impl ModuleConfig {
    pub fn object_file_name(&self) -> String {
        format!("{}.ko", self.name)
    }

    /// Name as it appears in `/proc/modules` and `lsmod`.
    pub fn loaded_name(&self) -> String {
        self.name.replace('-', "_")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KernelConfig {
    /// Target kernel release; detected when unset.
    pub version: Option<String>,
    /// Where kernel-devel trees live (`/usr/src/kernels/<version>`).
    pub search_root: String,
    pub modules_root: String,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            version: None,
            search_root: "/usr/src/kernels".to_string(),
            modules_root: "/lib/modules".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PackagesConfig {
    pub skip: bool,
    /// Install command prefix; package names are appended.
    pub manager: Vec<String>,
    /// `{kernel}` is replaced with the target kernel release.
    pub required: Vec<String>,
    /// Installed one at a time; failures are warnings.
    pub optional: Vec<String>,
}

impl Default for PackagesConfig {
    fn default() -> Self {
        Self {
            skip: false,
            manager: vec!["dnf".into(), "install".into(), "-y".into()],
            required: vec![
                "kernel-devel-{kernel}".into(),
                "gcc".into(),
                "make".into(),
                "elfutils-libelf-devel".into(),
                "kmod".into(),
                "openssl".into(),
            ],
            optional: vec!["mokutil".into()],
        }
    }
}

/// Where injected signing material comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeySourceKind {
    /// Nothing injected: reuse the on-disk pair or generate one.
    Generate,
    /// Build secret files (`podman build --secret`).
    SecretMount,
    /// Build arguments exposed to the build step as variables.
    BuildArg,
    /// Plain environment variables.
    Environment,
}

impl KeySourceKind {
    /// Default names of the key, certificate and DER pieces for this source.
    pub fn default_names(self) -> [&'static str; 3] {
        match self {
            KeySourceKind::Generate => ["", "", ""],
            KeySourceKind::SecretMount => ["mok_key", "mok_crt", "mok_der"],
            KeySourceKind::BuildArg => ["MOK_KEY_B64", "MOK_CRT_B64", "MOK_DER_B64"],
            KeySourceKind::Environment => [
                "MODULE_SIGNING_KEY",
                "MODULE_SIGNING_CRT",
                "MODULE_SIGNING_DER",
            ],
        }
    }
}

impl std::fmt::Display for KeySourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeySourceKind::Generate => write!(f, "generate"),
            KeySourceKind::SecretMount => write!(f, "secret-mount"),
            KeySourceKind::BuildArg => write!(f, "build-arg"),
            KeySourceKind::Environment => write!(f, "environment"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KeysConfig {
    pub dir: String,
    /// File stem: `<basename>.key`, `<basename>.crt`, `<basename>.der`.
    pub basename: String,
    pub source: KeySourceKind,
    /// Host directory holding secret files for `secret-mount`.
    pub secrets_dir: String,
    pub key_name: Option<String>,
    pub crt_name: Option<String>,
    pub der_name: Option<String>,
    pub common_name: String,
    pub organization: Option<String>,
    pub bits: u32,
    pub days: u32,
    /// Append the build timestamp to the common name of generated keys.
    pub temporary_stamp: bool,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            dir: "/etc/pki/module-signing".to_string(),
            basename: "module-signing".to_string(),
            source: KeySourceKind::Generate,
            secrets_dir: "/run/secrets".to_string(),
            key_name: None,
            crt_name: None,
            der_name: None,
            common_name: "hp-wmi Module Signing Key".to_string(),
            organization: None,
            bits: 2048,
            days: 3650,
            temporary_stamp: false,
        }
    }
}

impl KeysConfig {
    /// Key, certificate and DER names for the configured source, with overrides.
    pub fn piece_names(&self) -> [String; 3] {
        let [key, crt, der] = self.source.default_names();
        [
            self.key_name.clone().unwrap_or_else(|| key.to_string()),
            self.crt_name.clone().unwrap_or_else(|| crt.to_string()),
            self.der_name.clone().unwrap_or_else(|| der.to_string()),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InstallConfig {
    /// Write `/etc/modules-load.d/<module>.conf`.
    pub autoload: bool,
    /// Parameters for `/etc/modprobe.d/<module>.conf`, e.g. `debug=1`.
    pub options: Option<String>,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            autoload: true,
            options: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NvidiaConfig {
    pub sign: bool,
    /// Host directories searched for `nvidia*.ko`; `{kernel}` is substituted.
    pub search_paths: Vec<String>,
}

impl Default for NvidiaConfig {
    fn default() -> Self {
        Self {
            sign: false,
            search_paths: crate::install::nvidia::DEFAULT_SEARCH_PATHS
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecipesConfig {
    pub enabled: bool,
    pub dir: String,
    /// Ordering prefix of the `.just` file name.
    pub prefix: String,
    /// Path of this binary as seen from the booted system.
    pub binary: String,
}

impl Default for RecipesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: "/usr/share/ublue-os/just".to_string(),
            prefix: "60".to_string(),
            binary: "/usr/bin/kmod-provision".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReportConfig {
    pub path: Option<String>,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            path: Some("/usr/share/kmod-provision/report.json".to_string()),
        }
    }
}

impl ProvisionConfig {
    /// Load from `path`, or from [`DEFAULT_CONFIG_PATH`] when it exists, or
    /// fall back to defaults. An explicit path must exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_PATH);
                if default_path.is_file() {
                    Self::from_file(default_path)?
                } else {
                    log::debug!(
                        "no config at {}, using built-in defaults",
                        default_path.display()
                    );
                    Self::default()
                }
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading provisioning config '{}'", path.display()))?;
        Self::from_toml(&raw)
            .with_context(|| format!("parsing provisioning config '{}'", path.display()))
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Apply `KMOD_PROVISION_*` overrides.
    pub fn apply_env_overrides(&mut self, env: &dyn Fn(&str) -> Option<String>) {
        if let Some(sysroot) = env(SYSROOT_ENV).filter(|v| !v.trim().is_empty()) {
            self.sysroot = PathBuf::from(sysroot.trim());
        }
        if let Some(kernel) = env(KERNEL_ENV).filter(|v| !v.trim().is_empty()) {
            self.kernel.version = Some(kernel.trim().to_string());
        }
    }

    pub fn validate(&self) -> Result<()> {
        let name = self.module.name.trim();
        if name.is_empty() {
            bail!("invalid config: module.name must not be empty");
        }
        if name.contains('/') || name.contains(char::is_whitespace) || name.ends_with(".ko") {
            bail!(
                "invalid config: module.name '{}' must be a bare module name like 'hp-wmi'",
                self.module.name
            );
        }
        if !Path::new(&self.module.source).is_absolute() {
            bail!(
                "invalid config: module.source must be an absolute path, got '{}'",
                self.module.source
            );
        }
        if self.keys.bits < 2048 {
            bail!(
                "invalid config: keys.bits must be at least 2048, got {}",
                self.keys.bits
            );
        }
        if self.keys.days == 0 {
            bail!("invalid config: keys.days must be positive");
        }
        if self.keys.common_name.trim().is_empty() {
            bail!("invalid config: keys.common_name must not be empty");
        }
        if self.keys.basename.trim().is_empty() || self.keys.basename.contains('/') {
            bail!(
                "invalid config: keys.basename '{}' must be a plain file stem",
                self.keys.basename
            );
        }
        if self.keys.source != KeySourceKind::Generate
            && self.keys.piece_names().iter().any(|n| n.trim().is_empty())
        {
            bail!(
                "invalid config: key source '{}' needs non-empty key_name, crt_name and der_name",
                self.keys.source
            );
        }
        if !self.packages.skip && self.packages.manager.is_empty() {
            bail!("invalid config: packages.manager must name an install command");
        }
        Ok(())
    }
}
