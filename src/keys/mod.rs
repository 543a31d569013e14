//! Signing key provisioning.
//!
//! Produces the module signing key pair at a fixed location:
//!
//! ```text
//! /etc/pki/module-signing/module-signing.key   private key   0600
//! /etc/pki/module-signing/module-signing.crt   PEM cert      0644
//! /etc/pki/module-signing/module-signing.der   DER cert      0644
//! ```
//!
//! Source precedence: injected material (overwrites), then an existing pair
//! on disk (reused untouched), then fresh generation. An existing pair is
//! never rotated: modules already trusted through an enrolled MOK would stop
//! loading.
//!
//! Injected and generated pairs are staged in a sibling directory and only
//! renamed into place once the staged pair verifies, so a rejected pair
//! leaves the previous one intact.

pub mod material;
pub mod openssl;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

use crate::host::{self, HostRoot};
use crate::pipeline::config::{KeySourceKind, KeysConfig};

pub use material::KeyMaterial;
pub use openssl::{KeyTool, Openssl};

const KEY_MODE: u32 = 0o600;
const PUBLIC_MODE: u32 = 0o644;
const DIR_MODE: u32 = 0o700;

/// Paths of the private key, PEM certificate and DER certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SigningKeyPair {
    pub key: PathBuf,
    pub crt: PathBuf,
    pub der: PathBuf,
}

impl SigningKeyPair {
    pub fn in_dir(dir: &Path, basename: &str) -> Self {
        Self {
            key: dir.join(format!("{}.key", basename)),
            crt: dir.join(format!("{}.crt", basename)),
            der: dir.join(format!("{}.der", basename)),
        }
    }

    /// The configured pair, resolved under `host`.
    pub fn for_config(host: &HostRoot, config: &KeysConfig) -> Self {
        Self::in_dir(&host.path(&config.dir), &config.basename)
    }

    pub fn dir(&self) -> &Path {
        self.key.parent().unwrap_or_else(|| Path::new("/"))
    }

    fn present(&self) -> [bool; 3] {
        [self.key.is_file(), self.crt.is_file(), self.der.is_file()]
    }
}

/// Where this run's key pair came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "source")]
pub enum KeyOrigin {
    Injected(KeySourceKind),
    Existing,
    Generated,
}

impl std::fmt::Display for KeyOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyOrigin::Injected(source) => write!(f, "injected ({})", source),
            KeyOrigin::Existing => write!(f, "existing"),
            KeyOrigin::Generated => write!(f, "generated"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedKeys {
    pub pair: SigningKeyPair,
    pub origin: KeyOrigin,
    /// SHA-256 of the DER certificate, colon-separated upper-case hex.
    pub fingerprint: String,
}

/// Provision the signing key pair according to `config`.
pub fn provision_keys(
    host: &HostRoot,
    config: &KeysConfig,
    tool: &dyn KeyTool,
    env: &dyn Fn(&str) -> Option<String>,
    stamp: &str,
) -> Result<ProvisionedKeys> {
    let pair = SigningKeyPair::for_config(host, config);

    let origin = match material::read_injected(host, config, env)? {
        Some(material) => {
            log::info!(
                "keys: installing injected signing material from {} into {}",
                config.source,
                pair.dir().display()
            );
            install_injected(&pair, &material, tool).with_context(|| {
                format!(
                    "injected signing material from '{}' rejected; {} left unchanged",
                    config.source,
                    pair.dir().display()
                )
            })?;
            KeyOrigin::Injected(config.source)
        }
        None => match pair.present() {
            [true, true, true] => {
                log::info!("keys: reusing existing key pair in {}", pair.dir().display());
                KeyOrigin::Existing
            }
            [true, true, false] => {
                log::warn!(
                    "keys: {} missing, re-deriving it from {}",
                    pair.der.display(),
                    pair.crt.display()
                );
                derive_der(&pair)?;
                KeyOrigin::Existing
            }
            [false, false, false] => {
                let subject = subject_for(config, stamp);
                log::info!("keys: generating new signing key pair ({})", subject);
                generate_atomically(&pair, tool, &subject, config.bits, config.days)?;
                KeyOrigin::Generated
            }
            [key, crt, der] => bail!(
                "partial signing material in {} (key: {}, certificate: {}, DER: {}).\n\
                 Refusing to generate a new key over it; restore the missing files or \
                 remove the directory to start over.",
                pair.dir().display(),
                presence(key),
                presence(crt),
                presence(der)
            ),
        },
    };

    enforce_modes(&pair)?;
    verify_pair(&pair, tool)?;

    let fingerprint = certificate_fingerprint(&pair.der)?;
    log::info!("keys: certificate SHA-256 fingerprint {}", fingerprint);

    Ok(ProvisionedKeys {
        pair,
        origin,
        fingerprint,
    })
}

fn presence(present: bool) -> &'static str {
    if present {
        "present"
    } else {
        "missing"
    }
}

/// `/CN=<name>[ (temporary <stamp>)][/O=<org>]`
pub fn subject_for(config: &KeysConfig, stamp: &str) -> String {
    let mut common_name = config.common_name.trim().to_string();
    if config.temporary_stamp {
        common_name = format!("{} (temporary {})", common_name, stamp);
    }
    let mut subject = format!("/CN={}", escape_rdn(&common_name));
    if let Some(org) = config.organization.as_deref().filter(|o| !o.trim().is_empty()) {
        subject.push_str(&format!("/O={}", escape_rdn(org.trim())));
    }
    subject
}

fn escape_rdn(value: &str) -> String {
    value.replace('\\', "\\\\").replace('/', "\\/")
}

fn write_material(pair: &SigningKeyPair, material: &KeyMaterial) -> Result<()> {
    host::write_file_mode(&pair.key, &material.key, KEY_MODE)?;
    host::write_file_mode(&pair.crt, &material.crt, PUBLIC_MODE)?;
    host::write_file_mode(&pair.der, &material.der, PUBLIC_MODE)?;
    Ok(())
}

fn install_injected(
    pair: &SigningKeyPair,
    material: &KeyMaterial,
    tool: &dyn KeyTool,
) -> Result<()> {
    let staging = Staging::new(pair, ".inject.tmp")?;
    let staged =
        write_material(&staging.pair, material).and_then(|()| verify_pair(&staging.pair, tool));
    if let Err(e) = staged {
        staging.discard();
        return Err(e);
    }
    staging.commit(pair)
}

fn derive_der(pair: &SigningKeyPair) -> Result<()> {
    let pem = fs::read_to_string(&pair.crt)
        .with_context(|| format!("reading certificate '{}'", pair.crt.display()))?;
    let der = pem_body(&pem, "CERTIFICATE").ok_or_else(|| {
        anyhow::anyhow!(
            "'{}' is not a PEM certificate; cannot re-derive the DER form",
            pair.crt.display()
        )
    })?;
    host::write_file_mode(&pair.der, &der, PUBLIC_MODE)
}

/// A key pair under construction in a sibling of the key directory.
struct Staging {
    dir: PathBuf,
    pair: SigningKeyPair,
}

impl Staging {
    fn new(target: &SigningKeyPair, name: &str) -> Result<Self> {
        host::create_dir_mode(target.dir(), DIR_MODE)?;
        let dir = target.dir().join(name);
        if dir.exists() {
            fs::remove_dir_all(&dir)
                .with_context(|| format!("removing stale staging directory '{}'", dir.display()))?;
        }
        host::create_dir_mode(&dir, DIR_MODE)?;
        let pair = SigningKeyPair {
            key: dir.join(file_name(&target.key)?),
            crt: dir.join(file_name(&target.crt)?),
            der: dir.join(file_name(&target.der)?),
        };
        Ok(Self { dir, pair })
    }

    fn discard(self) {
        let _ = fs::remove_dir_all(&self.dir);
    }

    /// Move all three staged files over `target`.
    fn commit(self, target: &SigningKeyPair) -> Result<()> {
        for (from, to) in [
            (&self.pair.key, &target.key),
            (&self.pair.crt, &target.crt),
            (&self.pair.der, &target.der),
        ] {
            fs::rename(from, to).with_context(|| {
                format!("moving '{}' -> '{}'", from.display(), to.display())
            })?;
        }
        fs::remove_dir_all(&self.dir)
            .with_context(|| format!("removing '{}'", self.dir.display()))
    }
}

/// Generate into a staging directory and move the three files into place
/// only after all of them exist.
fn generate_atomically(
    pair: &SigningKeyPair,
    tool: &dyn KeyTool,
    subject: &str,
    bits: u32,
    days: u32,
) -> Result<()> {
    let staging = Staging::new(pair, ".generate.tmp")?;

    let generated = tool
        .generate(&staging.pair, subject, bits, days)
        .context("generating module signing key pair");
    if let Err(e) = generated {
        staging.discard();
        return Err(e);
    }

    let missing = [&staging.pair.key, &staging.pair.crt, &staging.pair.der]
        .into_iter()
        .find(|path| !path.is_file())
        .map(|path| path.file_name().unwrap_or_default().to_string_lossy().into_owned());
    if let Some(missing) = missing {
        staging.discard();
        bail!("key generation did not produce '{}'", missing);
    }
    staging.commit(pair)
}

fn file_name(path: &Path) -> Result<&std::ffi::OsStr> {
    path.file_name()
        .ok_or_else(|| anyhow::anyhow!("'{}' has no file name", path.display()))
}

fn enforce_modes(pair: &SigningKeyPair) -> Result<()> {
    host::set_mode(&pair.key, KEY_MODE)?;
    host::set_mode(&pair.crt, PUBLIC_MODE)?;
    host::set_mode(&pair.der, PUBLIC_MODE)?;
    Ok(())
}

/// The certificate must carry the public half of the private key, and the
/// DER file must be the PEM certificate's body.
fn verify_pair(pair: &SigningKeyPair, tool: &dyn KeyTool) -> Result<()> {
    let pem = fs::read_to_string(&pair.crt)
        .with_context(|| format!("reading certificate '{}'", pair.crt.display()))?;
    let der = fs::read(&pair.der)
        .with_context(|| format!("reading DER certificate '{}'", pair.der.display()))?;
    if pem_body(&pem, "CERTIFICATE").as_deref() != Some(der.as_slice()) {
        bail!(
            "'{}' and '{}' are not the same certificate",
            pair.crt.display(),
            pair.der.display()
        );
    }

    let from_cert = tool.certificate_public_key(&pair.crt)?;
    let from_key = tool.private_key_public_key(&pair.key)?;
    if from_cert != from_key {
        bail!(
            "certificate '{}' does not belong to private key '{}'",
            pair.crt.display(),
            pair.key.display()
        );
    }
    Ok(())
}

/// Decode the body of the first PEM block labelled `label`.
pub fn pem_body(pem: &str, label: &str) -> Option<Vec<u8>> {
    let begin = format!("-----BEGIN {}-----", label);
    let end = format!("-----END {}-----", label);
    let start = pem.find(&begin)? + begin.len();
    let stop = start + pem[start..].find(&end)?;
    let body: String = pem[start..stop]
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    STANDARD.decode(body.as_bytes()).ok()
}

/// SHA-256 fingerprint of a DER certificate file.
pub fn certificate_fingerprint(der: &Path) -> Result<String> {
    let bytes =
        fs::read(der).with_context(|| format!("reading DER certificate '{}'", der.display()))?;
    Ok(fingerprint_bytes(&bytes))
}

pub fn fingerprint_bytes(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}
