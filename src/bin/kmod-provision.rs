//! kmod-provision: build, sign and install an out-of-tree kernel module.
//!
//! # Usage
//!
//! ```bash
//! # Inside an image build
//! kmod-provision run
//!
//! # Against a mounted root, for a specific kernel
//! kmod-provision run --sysroot /mnt/image --kernel 6.11.5-300.fc41.x86_64
//!
//! # On the booted system
//! sudo kmod-provision mok enroll
//! sudo kmod-provision mok test-load
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use kmod_provision::host::HostRoot;
use kmod_provision::keys::{certificate_fingerprint, SigningKeyPair};
use kmod_provision::pipeline::config::ProvisionConfig;
use kmod_provision::pipeline::report::ProvisionReport;
use kmod_provision::pipeline::Provisioner;
use kmod_provision::preflight::{check_required_tools, running_as_root, MOK_TOOLS};
use kmod_provision::process::HostRunner;
use kmod_provision::trust::recipes::write_recipes;
use kmod_provision::trust::{CheckReport, MokCommands, Mokutil};

#[derive(Parser, Debug)]
#[command(name = "kmod-provision")]
#[command(version)]
#[command(about = "Build, sign and install an out-of-tree kernel module and manage its MOK enrollment")]
struct Args {
    /// Config file (default: /etc/kmod-provision/provision.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory treated as / for every path
    #[arg(long, global = true)]
    sysroot: Option<PathBuf>,

    /// Target kernel release instead of detecting it
    #[arg(long, global = true)]
    kernel: Option<String>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the whole pipeline: toolchain, keys, build and sign, install
    Run,
    /// Provision the signing key pair only
    Keys,
    /// Write the ujust recipe file only
    Recipes,
    /// Print the SHA-256 fingerprint of the signing certificate
    Fingerprint,
    /// Operator commands against the MOK database
    Mok {
        #[command(subcommand)]
        action: MokAction,
    },
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum MokAction {
    /// Queue the certificate for enrollment (confirm on next boot)
    Enroll,
    /// Report whether the certificate is enrolled
    Check,
    /// Queue the certificate for removal (confirm on next boot)
    Remove,
    /// Reload the module and confirm it is loaded
    TestLoad,
    /// Secure Boot state, enrollment and last provisioning run
    Status,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    match dispatch(&args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(args: &Args) -> Result<ProvisionConfig> {
    let mut config = ProvisionConfig::load(args.config.as_deref())?;
    config.apply_env_overrides(&|name| std::env::var(name).ok());
    if let Some(sysroot) = &args.sysroot {
        config.sysroot = sysroot.clone();
    }
    if let Some(kernel) = &args.kernel {
        config.kernel.version = Some(kernel.clone());
    }
    config.validate()?;
    Ok(config)
}

/// Returns whether the command succeeded from the operator's point of view.
fn dispatch(args: &Args) -> Result<bool> {
    let config = load_config(args)?;
    let runner = HostRunner;

    match args.command {
        Command::Run => {
            let report = Provisioner::new(&config, &runner).run()?;
            for line in report.summary_lines() {
                println!("{}", line);
            }
            Ok(true)
        }
        Command::Keys => {
            let keys = Provisioner::new(&config, &runner).provision_keys()?;
            println!("{} key pair in {}", keys.origin, keys.pair.dir().display());
            println!("SHA-256 fingerprint: {}", keys.fingerprint);
            Ok(true)
        }
        Command::Recipes => {
            let host = HostRoot::new(&config.sysroot);
            let path = write_recipes(&host, &config.recipes, &config.module.name)?;
            println!("{}", path.display());
            Ok(true)
        }
        Command::Fingerprint => {
            let host = HostRoot::new(&config.sysroot);
            let pair = SigningKeyPair::for_config(&host, &config.keys);
            println!("{}", certificate_fingerprint(&pair.der)?);
            Ok(true)
        }
        Command::Mok { action } => run_mok(&config, action),
    }
}

fn run_mok(config: &ProvisionConfig, action: MokAction) -> Result<bool> {
    if !running_as_root() {
        log::warn!("not running as root; mokutil and modprobe will likely fail");
    }

    let runner = HostRunner;
    if let Err(e) = check_required_tools(&runner, MOK_TOOLS) {
        log::warn!("{}", e);
    }

    let host = HostRoot::new(&config.sysroot);
    let pair = SigningKeyPair::for_config(&host, &config.keys);
    let store = Mokutil::new(&runner);
    let commands = MokCommands {
        host: &host,
        runner: &runner,
        store: &store,
        module: &config.module,
        keys: &pair,
        common_name: &config.keys.common_name,
    };

    let report: CheckReport = match action {
        MokAction::Enroll => commands.enroll()?,
        MokAction::Check => commands.check()?,
        MokAction::Remove => commands.remove()?,
        MokAction::TestLoad => commands.test_load()?,
        MokAction::Status => {
            let mut report = commands.status()?;
            if let Some(path) = &config.report.path {
                match ProvisionReport::load(&host.path(path)) {
                    Ok(last) => {
                        report.lines.push(format!("last provisioned {}:", last.generated_at));
                        report.lines.extend(last.summary_lines().into_iter().map(|l| format!("  {}", l)));
                    }
                    Err(e) => log::debug!("no provisioning report: {:#}", e),
                }
            }
            report
        }
    };

    for line in &report.lines {
        println!("{}", line);
    }
    Ok(report.ok)
}
