//! Module signing with the kernel's `scripts/sign-file`.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::build::kernel::KernelTarget;
use crate::keys::SigningKeyPair;
use crate::process::{is_executable, Cmd, CommandRunner};

/// Marker the kernel appends after a module signature.
pub const SIGNATURE_TRAILER: &[u8] = b"~Module signature appended~\n";

pub const DIGEST: &str = "sha256";

/// Signs a kernel object in place.
pub trait ModuleSigner {
    fn sign(&self, object: &Path, keys: &SigningKeyPair) -> Result<()>;
}

/// `sign-file sha256 <key> <crt> <object>`.
pub struct SignFile<'a> {
    runner: &'a dyn CommandRunner,
    tool: PathBuf,
}

impl<'a> SignFile<'a> {
    pub fn new(runner: &'a dyn CommandRunner, tool: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            tool: tool.into(),
        }
    }

    /// The target kernel's `sign-file`, if it exists and is executable.
    pub fn locate(runner: &'a dyn CommandRunner, target: &KernelTarget) -> Option<Self> {
        let tool = target.sign_file();
        if is_executable(&tool) {
            Some(Self::new(runner, tool))
        } else {
            None
        }
    }

    pub fn tool(&self) -> &Path {
        &self.tool
    }
}

impl ModuleSigner for SignFile<'_> {
    fn sign(&self, object: &Path, keys: &SigningKeyPair) -> Result<()> {
        Cmd::new(self.tool.to_string_lossy())
            .arg(DIGEST)
            .arg_path(&keys.key)
            .arg_path(&keys.crt)
            .arg_path(object)
            .error_msg(format!("signing '{}' failed", object.display()))
            .run(self.runner)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignOutcome {
    Signed,
    Unsigned,
}

impl SignOutcome {
    pub fn is_signed(self) -> bool {
        self == SignOutcome::Signed
    }
}

/// Sign `object` when a signer is available.
///
/// Without a signer the object stays unsigned and [`SignOutcome::Unsigned`]
/// is returned; the caller decides how loudly to report it. A signer that
/// succeeds without leaving a signature is an error.
pub fn sign_module(
    signer: Option<&dyn ModuleSigner>,
    object: &Path,
    keys: &SigningKeyPair,
) -> Result<SignOutcome> {
    let Some(signer) = signer else {
        return Ok(SignOutcome::Unsigned);
    };

    signer.sign(object, keys)?;
    if !is_signed(object)? {
        bail!(
            "sign-file reported success but '{}' carries no module signature",
            object.display()
        );
    }
    log::info!("sign: signed {}", object.display());
    Ok(SignOutcome::Signed)
}

/// Whether `path` ends with the kernel module signature trailer.
pub fn is_signed(path: &Path) -> Result<bool> {
    let bytes = fs::read(path).with_context(|| format!("reading '{}'", path.display()))?;
    Ok(bytes.ends_with(SIGNATURE_TRAILER))
}
