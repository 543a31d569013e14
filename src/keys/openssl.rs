//! `openssl` CLI backend for key generation and key/certificate checks.

use anyhow::{bail, Result};
use std::path::Path;

use crate::process::{Cmd, CommandRunner};

use super::SigningKeyPair;

/// Cryptographic operations the provisioning stage needs.
pub trait KeyTool {
    /// Generate a fresh RSA key and self-signed certificate (PEM and DER)
    /// at the three paths of `out`.
    fn generate(&self, out: &SigningKeyPair, subject: &str, bits: u32, days: u32) -> Result<()>;

    /// Public key embedded in a PEM certificate, PEM-encoded.
    fn certificate_public_key(&self, crt: &Path) -> Result<String>;

    /// Public key derived from a PEM private key, PEM-encoded.
    fn private_key_public_key(&self, key: &Path) -> Result<String>;
}

pub struct Openssl<'a> {
    runner: &'a dyn CommandRunner,
}

impl<'a> Openssl<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self { runner }
    }
}

impl KeyTool for Openssl<'_> {
    fn generate(&self, out: &SigningKeyPair, subject: &str, bits: u32, days: u32) -> Result<()> {
        Cmd::new("openssl")
            .args(["genpkey", "-algorithm", "RSA", "-pkeyopt"])
            .arg(format!("rsa_keygen_bits:{}", bits))
            .arg("-out")
            .arg_path(&out.key)
            .error_msg("generating module signing key failed")
            .run(self.runner)?;

        Cmd::new("openssl")
            .args(["req", "-new", "-x509", "-sha256", "-key"])
            .arg_path(&out.key)
            .arg("-out")
            .arg_path(&out.crt)
            .arg("-days")
            .arg(days.to_string())
            .arg("-subj")
            .arg(subject)
            .args([
                "-addext",
                "basicConstraints=critical,CA:FALSE",
                "-addext",
                "keyUsage=digitalSignature",
                "-addext",
                "extendedKeyUsage=codeSigning",
            ])
            .error_msg("creating self-signed module signing certificate failed")
            .run(self.runner)?;

        Cmd::new("openssl")
            .args(["x509", "-in"])
            .arg_path(&out.crt)
            .args(["-outform", "DER", "-out"])
            .arg_path(&out.der)
            .error_msg("converting module signing certificate to DER failed")
            .run(self.runner)?;

        Ok(())
    }

    fn certificate_public_key(&self, crt: &Path) -> Result<String> {
        let result = Cmd::new("openssl")
            .args(["x509", "-noout", "-pubkey", "-in"])
            .arg_path(crt)
            .error_msg("reading public key from module signing certificate failed")
            .run(self.runner)?;
        non_empty(result.stdout, crt)
    }

    fn private_key_public_key(&self, key: &Path) -> Result<String> {
        let result = Cmd::new("openssl")
            .args(["pkey", "-pubout", "-in"])
            .arg_path(key)
            .error_msg("deriving public key from module signing key failed")
            .run(self.runner)?;
        non_empty(result.stdout, key)
    }
}

fn non_empty(output: String, source: &Path) -> Result<String> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        bail!("openssl printed no public key for '{}'", source.display());
    }
    Ok(trimmed.to_string())
}
