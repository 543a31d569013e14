//! Injected signing material: secret mounts, build arguments, environment.
//!
//! All sources carry base64-encoded payloads and decode identically. When a
//! source is configured, all three pieces are mandatory.

use anyhow::{bail, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::fs;
use std::path::PathBuf;

use crate::host::HostRoot;
use crate::pipeline::config::{KeySourceKind, KeysConfig};

use super::pem_body;

/// Decoded key, certificate and DER bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    pub key: Vec<u8>,
    pub crt: Vec<u8>,
    pub der: Vec<u8>,
}

const PIECE_LABELS: [&str; 3] = ["key", "certificate", "DER certificate"];

/// Read and decode injected material for the configured source.
///
/// Returns `Ok(None)` for [`KeySourceKind::Generate`]. Any missing, empty or
/// undecodable piece is fatal and named in the error.
pub fn read_injected(
    host: &HostRoot,
    config: &KeysConfig,
    env: &dyn Fn(&str) -> Option<String>,
) -> Result<Option<KeyMaterial>> {
    let names = config.piece_names();
    let mut decoded: Vec<Vec<u8>> = Vec::with_capacity(3);
    let mut problems = Vec::new();

    for (label, name) in PIECE_LABELS.iter().zip(names.iter()) {
        let (origin, raw) = match config.source {
            KeySourceKind::SecretMount => {
                let path: PathBuf = host.path(&config.secrets_dir).join(name);
                let raw = fs::read_to_string(&path).ok();
                (format!("secret file {}", path.display()), raw)
            }
            KeySourceKind::BuildArg => (format!("build argument {}", name), env(name)),
            KeySourceKind::Environment => (format!("environment variable {}", name), env(name)),
            KeySourceKind::Generate => return Ok(None),
        };

        match decode_piece(raw.as_deref()) {
            Ok(bytes) => decoded.push(bytes),
            Err(reason) => problems.push(format!("  {} ({}): {}", label, origin, reason)),
        }
    }

    if !problems.is_empty() {
        bail!(
            "injected signing material from '{}' is incomplete:\n{}",
            config.source,
            problems.join("\n")
        );
    }

    let der = decoded.pop().unwrap_or_default();
    let crt = decoded.pop().unwrap_or_default();
    let key = decoded.pop().unwrap_or_default();
    let material = KeyMaterial { key, crt, der };
    material.validate()?;
    Ok(Some(material))
}

fn decode_piece(raw: Option<&str>) -> std::result::Result<Vec<u8>, String> {
    let raw = raw.ok_or_else(|| "missing".to_string())?;
    let compact: String = raw.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    if compact.is_empty() {
        return Err("empty".to_string());
    }
    let bytes = STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| format!("not valid base64 ({})", e))?;
    if bytes.is_empty() {
        return Err("decodes to nothing".to_string());
    }
    Ok(bytes)
}

impl KeyMaterial {
    /// Structural checks: PEM key, PEM certificate, DER matching the PEM body.
    pub fn validate(&self) -> Result<()> {
        let key = String::from_utf8_lossy(&self.key);
        if !key.contains("PRIVATE KEY-----") {
            bail!("injected key is not a PEM private key");
        }
        let crt = String::from_utf8_lossy(&self.crt);
        let Some(crt_der) = pem_body(&crt, "CERTIFICATE") else {
            bail!("injected certificate is not a PEM certificate");
        };
        if crt_der != self.der {
            bail!("injected DER certificate does not match the injected PEM certificate");
        }
        Ok(())
    }
}
