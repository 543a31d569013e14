//! Toolchain preparation and module build.
//!
//! - [`packages`] - development package installation
//! - [`kernel`] - target kernel release and build directory
//! - [`module`] - out-of-tree compilation
//! - [`sign`] - module signing

pub mod kernel;
pub mod module;
pub mod packages;
pub mod sign;
