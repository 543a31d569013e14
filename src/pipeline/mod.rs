//! The provisioning pipeline.
//!
//! Four stages run strictly in order, each finishing before the next starts:
//!
//! ```text
//! toolchain   detect kernel, install packages, preflight, resolve build dir
//! keys        injected > existing > generated key pair
//! build+sign  make against the build dir, sign-file
//! install     replace or add the module, depmod, autoload, nvidia, recipes
//! ```
//!
//! Everything that can fail for lack of a precondition (kernel headers, module
//! source) is checked before the key directory or module tree is written.

pub mod config;
pub mod report;

use anyhow::{Context, Result};
use std::path::PathBuf;

use crate::build::kernel::{detect_kernel_version, resolve_kernel_target, KernelTarget};
use crate::build::module::{build_module, check_source};
use crate::build::packages::install_packages;
use crate::build::sign::{sign_module, ModuleSigner, SignFile};
use crate::clock;
use crate::host::HostRoot;
use crate::install::nvidia::{describe_search_paths, sign_nvidia_modules};
use crate::install::{
    install_module, refresh_dependencies, write_autoload, write_modprobe_options, InstallAttempt,
};
use crate::keys::{provision_keys, Openssl, ProvisionedKeys};
use crate::preflight::check_host_tools;
use crate::process::CommandRunner;
use crate::trust::recipes::write_recipes;

use config::ProvisionConfig;
use report::{BackupSummary, KernelSummary, KeySummary, NvidiaSummary, ProvisionReport};

/// Logs each warning and keeps it for the report.
#[derive(Debug, Default)]
struct Warnings(Vec<String>);

impl Warnings {
    fn push(&mut self, message: impl Into<String>) {
        let message = message.into();
        log::warn!("{}", message);
        self.0.push(message);
    }
}

type EnvLookup<'a> = Box<dyn Fn(&str) -> Option<String> + 'a>;

pub struct Provisioner<'a> {
    config: &'a ProvisionConfig,
    host: HostRoot,
    runner: &'a dyn CommandRunner,
    env: EnvLookup<'a>,
    stamp: String,
}

impl<'a> Provisioner<'a> {
    pub fn new(config: &'a ProvisionConfig, runner: &'a dyn CommandRunner) -> Self {
        Self {
            config,
            host: HostRoot::new(&config.sysroot),
            runner,
            env: Box::new(|name: &str| std::env::var(name).ok()),
            stamp: clock::now_utc_compact(),
        }
    }

    /// Variable lookup for build-arg and environment key sources.
    pub fn with_env(mut self, env: impl Fn(&str) -> Option<String> + 'a) -> Self {
        self.env = Box::new(env);
        self
    }

    /// Timestamp used for backup suffixes and temporary key names.
    pub fn with_stamp(mut self, stamp: impl Into<String>) -> Self {
        self.stamp = stamp.into();
        self
    }

    pub fn host(&self) -> &HostRoot {
        &self.host
    }

    /// Stage 2 on its own.
    pub fn provision_keys(&self) -> Result<ProvisionedKeys> {
        let tool = Openssl::new(self.runner);
        provision_keys(
            &self.host,
            &self.config.keys,
            &tool,
            self.env.as_ref(),
            &self.stamp,
        )
        .context("provisioning module signing keys")
    }

    /// Stage 1: resolve the target kernel and make sure it can be built for.
    pub fn prepare_toolchain(&self, warnings: &mut Vec<String>) -> Result<KernelTarget> {
        let kernel = &self.config.kernel;
        let version = detect_kernel_version(
            &self.host,
            self.runner,
            kernel.version.as_deref(),
            &kernel.modules_root,
        )?;
        log::info!("toolchain: target kernel {}", version);

        warnings.extend(install_packages(self.runner, &self.config.packages, &version)?);
        check_host_tools(self.runner)?;

        resolve_kernel_target(&self.host, &version, &kernel.modules_root, &kernel.search_root)
    }

    /// Run all four stages.
    pub fn run(&self) -> Result<ProvisionReport> {
        let config = self.config;
        let module = &config.module;
        let mut warnings = Warnings::default();

        let mut package_warnings = Vec::new();
        let target = self.prepare_toolchain(&mut package_warnings)?;
        for warning in package_warnings {
            warnings.push(warning);
        }
        if !target.exact {
            warnings.push(format!(
                "no build headers for {}; built against fallback tree {}",
                target.version,
                target.build_dir.display()
            ));
        }
        let source = self.host.path(&module.source);
        check_source(&module.name, &source)?;

        let keys = self.provision_keys()?;
        log::info!(
            "keys: {} key pair, SHA-256 {}",
            keys.origin,
            keys.fingerprint
        );

        let mut attempt = InstallAttempt::new(module.name.as_str());
        let scratch = self.host.path(&config.work_dir).join(format!("{}-build", module.name));
        let artifact = build_module(self.runner, &target, &module.name, &source, &scratch)?;
        attempt.built()?;

        let signer = SignFile::locate(self.runner, &target);
        if signer.is_none() {
            warnings.push(format!(
                "{} is missing or not executable; installing {} unsigned. \
                 It will not load while Secure Boot is enforcing",
                target.sign_file().display(),
                module.object_file_name()
            ));
        }
        let signer_ref = signer.as_ref().map(|s| s as &dyn ModuleSigner);
        let outcome = sign_module(signer_ref, &artifact.object, &keys.pair)?;
        attempt.sign_attempted(outcome)?;

        let modules_dir = self.host.modules_dir(&config.kernel.modules_root, &target.version);
        let install = install_module(&modules_dir, &module.name, &artifact.object, &self.stamp)?;
        attempt.installed()?;

        refresh_dependencies(self.runner, &self.host, &target.version)?;
        attempt.dependencies_refreshed()?;

        let autoload = if config.install.autoload {
            Some(write_autoload(&self.host, &module.name)?)
        } else {
            None
        };
        let options = match config.install.options.as_deref().filter(|o| !o.trim().is_empty()) {
            Some(params) => Some(write_modprobe_options(&self.host, &module.name, params)?),
            None => None,
        };

        let nvidia = if config.nvidia.sign {
            Some(self.sign_nvidia(&target, signer_ref, &keys, &mut warnings)?)
        } else {
            None
        };

        let recipes = if config.recipes.enabled {
            Some(write_recipes(&self.host, &config.recipes, &module.name)?)
        } else {
            None
        };

        if let Err(e) = artifact.discard() {
            warnings.push(format!("could not remove build directory: {:#}", e));
        }

        let unmap = |p: &PathBuf| self.host.unmap(p);
        let report = ProvisionReport {
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            generated_at: self.stamp.clone(),
            module: module.name.clone(),
            kernel: KernelSummary {
                version: target.version.clone(),
                build_dir: self.host.unmap(&target.build_dir),
                exact: target.exact,
            },
            keys: KeySummary {
                origin: keys.origin.to_string(),
                key: unmap(&keys.pair.key),
                crt: unmap(&keys.pair.crt),
                der: unmap(&keys.pair.der),
                fingerprint: keys.fingerprint.clone(),
            },
            signed: attempt.state().signed(),
            state: attempt.state().to_string(),
            installed: install.installed.iter().map(unmap).collect(),
            backups: install
                .replacements
                .iter()
                .map(|r| BackupSummary {
                    original: unmap(&r.original),
                    backup: unmap(&r.backup),
                })
                .collect(),
            fallback_install: install.fallback,
            autoload: autoload.as_ref().map(unmap),
            options: options.as_ref().map(unmap),
            recipes: recipes.as_ref().map(unmap),
            nvidia,
            warnings: warnings.0,
        };

        if let Some(path) = &config.report.path {
            let path = self.host.path(path);
            report.write(&path)?;
            log::info!("report: {}", path.display());
        }
        Ok(report)
    }

    fn sign_nvidia(
        &self,
        target: &KernelTarget,
        signer: Option<&dyn ModuleSigner>,
        keys: &ProvisionedKeys,
        warnings: &mut Warnings,
    ) -> Result<NvidiaSummary> {
        let Some(signer) = signer else {
            warnings.push("NVIDIA modules left unsigned: sign-file is unavailable");
            return Ok(NvidiaSummary::default());
        };

        let paths = &self.config.nvidia.search_paths;
        let outcome =
            sign_nvidia_modules(&self.host, &target.version, paths, signer, &keys.pair)?;

        if outcome.is_empty() {
            warnings.push(format!(
                "no NVIDIA modules found (searched {}); they are probably built on first boot",
                describe_search_paths(paths, &target.version)
            ));
        }
        for path in &outcome.skipped {
            warnings.push(format!(
                "skipping compressed NVIDIA module {}",
                self.host.unmap(path).display()
            ));
        }
        for (path, error) in &outcome.failed {
            warnings.push(format!(
                "signing NVIDIA module {} failed: {}",
                self.host.unmap(path).display(),
                error
            ));
        }

        let unmap = |p: &PathBuf| self.host.unmap(p);
        Ok(NvidiaSummary {
            signed: outcome.signed.iter().map(unmap).collect(),
            skipped: outcome.skipped.iter().map(unmap).collect(),
            failed: outcome.failed.iter().map(|(p, _)| unmap(p)).collect(),
        })
    }
}
