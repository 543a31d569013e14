//! Build, sign and install an out-of-tree kernel module, and manage the trust
//! of its signing certificate in the firmware MOK database.
//!
//! The pipeline runs four stages in order:
//!
//! - **Toolchain** - target kernel, development packages, build directory
//! - **Keys** - injected, existing or generated module signing key pair
//! - **Build and sign** - kbuild against the kernel tree, `sign-file`
//! - **Install** - module tree placement, `depmod`, autoload, NVIDIA signing,
//!   operator recipes
//!
//! # Architecture
//!
//! ```text
//! kmod-provision (binary)
//!     │
//!     └── pipeline::Provisioner
//!             ├── build     (kernel, packages, module, sign)
//!             ├── keys      (material, openssl)
//!             ├── install   (state, nvidia)
//!             └── trust     (mokutil, recipes)
//!
//! host::HostRoot          every filesystem path, rooted at a sysroot
//! process::CommandRunner  every external tool, swappable in tests
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use kmod_provision::pipeline::{config::ProvisionConfig, Provisioner};
//! use kmod_provision::process::HostRunner;
//!
//! let config = ProvisionConfig::load(None)?;
//! let report = Provisioner::new(&config, &HostRunner).run()?;
//! println!("installed {:?}", report.installed);
//! ```

pub mod build;
pub mod clock;
pub mod host;
pub mod install;
pub mod keys;
pub mod pipeline;
pub mod preflight;
pub mod process;
pub mod trust;

#[cfg(test)]
mod testing;

pub use pipeline::config::ProvisionConfig;
pub use pipeline::Provisioner;
pub use process::{Cmd, CommandRunner, HostRunner};
