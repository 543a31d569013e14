//! Development package installation through the host package manager.

use anyhow::{bail, Result};

use crate::pipeline::config::PackagesConfig;
use crate::process::{Cmd, CommandRunner};

/// Expand `{kernel}` in package names.
pub fn expand_packages(names: &[String], kernel: &str) -> Vec<String> {
    names.iter().map(|n| n.replace("{kernel}", kernel)).collect()
}

/// Install required packages in one transaction, then each optional package
/// on its own. Returns one warning per optional package that failed.
pub fn install_packages(
    runner: &dyn CommandRunner,
    config: &PackagesConfig,
    kernel: &str,
) -> Result<Vec<String>> {
    if config.skip {
        log::info!("packages: installation skipped by configuration");
        return Ok(Vec::new());
    }
    let Some((program, prefix)) = config.manager.split_first() else {
        bail!("packages.manager is empty; set it or enable packages.skip");
    };

    let required = expand_packages(&config.required, kernel);
    if !required.is_empty() {
        log::info!("packages: installing {}", required.join(" "));
        Cmd::new(program.as_str())
            .args(prefix)
            .args(&required)
            .error_msg(format!(
                "installing build prerequisites failed ({})",
                required.join(", ")
            ))
            .run(runner)?;
    }

    let mut warnings = Vec::new();
    for package in expand_packages(&config.optional, kernel) {
        let result = Cmd::new(program.as_str())
            .args(prefix)
            .arg(package.as_str())
            .allow_fail()
            .run(runner);
        let failure = match result {
            Ok(r) if r.success() => None,
            Ok(r) => Some(r.combined_output()),
            Err(e) => Some(format!("{:#}", e)),
        };
        if let Some(detail) = failure {
            let detail = detail.lines().last().unwrap_or("").trim().to_string();
            warnings.push(if detail.is_empty() {
                format!("optional package {} could not be installed", package)
            } else {
                format!("optional package {} could not be installed: {}", package, detail)
            });
        }
    }
    Ok(warnings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{failed, ok, FakeRunner};

    const KVER: &str = "6.11.5-300.fc41.x86_64";

    #[test]
    fn test_required_then_optional() {
        let runner = FakeRunner::new();
        let warnings = install_packages(&runner, &PackagesConfig::default(), KVER).unwrap();

        assert!(warnings.is_empty());
        let lines = runner.command_lines();
        assert_eq!(lines.len(), 2);
        assert_eq!(
            lines[0],
            "dnf install -y kernel-devel-6.11.5-300.fc41.x86_64 gcc make elfutils-libelf-devel kmod openssl"
        );
        assert_eq!(lines[1], "dnf install -y mokutil");
    }

    #[test]
    fn test_required_failure_is_fatal() {
        let runner = FakeRunner::new()
            .on("dnf", |_| Ok(failed(1, "No match for argument: kernel-devel-6.11.5")));
        let msg = format!(
            "{:#}",
            install_packages(&runner, &PackagesConfig::default(), KVER).unwrap_err()
        );
        assert!(msg.contains("installing build prerequisites failed"));
        assert!(msg.contains("No match for argument"));
        assert_eq!(runner.count("dnf"), 1);
    }

    #[test]
    fn test_optional_failure_is_warning() {
        let runner = FakeRunner::new().on("dnf", |cmd| {
            if cmd.get_args().iter().any(|a| a == "mokutil") {
                Ok(failed(1, "Error: Unable to find a match: mokutil"))
            } else {
                Ok(ok(""))
            }
        });
        let warnings = install_packages(&runner, &PackagesConfig::default(), KVER).unwrap();
        assert_eq!(
            warnings,
            vec!["optional package mokutil could not be installed: Error: Unable to find a match: mokutil"]
        );
    }

    #[test]
    fn test_skip_runs_nothing() {
        let runner = FakeRunner::new();
        let config = PackagesConfig {
            skip: true,
            ..PackagesConfig::default()
        };
        assert!(install_packages(&runner, &config, KVER).unwrap().is_empty());
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_empty_manager_rejected() {
        let runner = FakeRunner::new();
        let config = PackagesConfig {
            manager: Vec::new(),
            ..PackagesConfig::default()
        };
        assert!(install_packages(&runner, &config, KVER).is_err());
    }
}
