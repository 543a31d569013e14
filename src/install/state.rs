//! Per-attempt install state.
//!
//! `NotBuilt -> Built -> SignAttempted -> Installed -> DependenciesRefreshed`.
//! There is no way back: a replaced module is only recoverable from its
//! `.backup` file, by hand.

use anyhow::{bail, Result};
use serde::Serialize;
use std::fmt;

use crate::build::sign::SignOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum InstallState {
    NotBuilt,
    Built,
    SignAttempted { signed: bool },
    Installed { signed: bool },
    DependenciesRefreshed { signed: bool },
}

impl InstallState {
    pub fn signed(self) -> bool {
        match self {
            InstallState::SignAttempted { signed }
            | InstallState::Installed { signed }
            | InstallState::DependenciesRefreshed { signed } => signed,
            InstallState::NotBuilt | InstallState::Built => false,
        }
    }
}

impl fmt::Display for InstallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let signed = |s: bool| if s { "signed" } else { "unsigned" };
        match *self {
            InstallState::NotBuilt => write!(f, "not built"),
            InstallState::Built => write!(f, "built"),
            InstallState::SignAttempted { signed: s } => write!(f, "sign attempted ({})", signed(s)),
            InstallState::Installed { signed: s } => write!(f, "installed ({})", signed(s)),
            InstallState::DependenciesRefreshed { signed: s } => {
                write!(f, "dependencies refreshed ({})", signed(s))
            }
        }
    }
}

/// Tracks one module through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallAttempt {
    module: String,
    state: InstallState,
}

impl InstallAttempt {
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            state: InstallState::NotBuilt,
        }
    }

    pub fn state(&self) -> InstallState {
        self.state
    }

    pub fn built(&mut self) -> Result<()> {
        match self.state {
            InstallState::NotBuilt => self.advance(InstallState::Built),
            other => self.reject(other, "built"),
        }
    }

    pub fn sign_attempted(&mut self, outcome: SignOutcome) -> Result<()> {
        match self.state {
            InstallState::Built => self.advance(InstallState::SignAttempted {
                signed: outcome.is_signed(),
            }),
            other => self.reject(other, "sign attempted"),
        }
    }

    pub fn installed(&mut self) -> Result<()> {
        match self.state {
            InstallState::SignAttempted { signed } => {
                self.advance(InstallState::Installed { signed })
            }
            other => self.reject(other, "installed"),
        }
    }

    pub fn dependencies_refreshed(&mut self) -> Result<()> {
        match self.state {
            InstallState::Installed { signed } => {
                self.advance(InstallState::DependenciesRefreshed { signed })
            }
            other => self.reject(other, "dependencies refreshed"),
        }
    }

    fn advance(&mut self, next: InstallState) -> Result<()> {
        log::debug!("install: {} {} -> {}", self.module, self.state, next);
        self.state = next;
        Ok(())
    }

    fn reject(&self, from: InstallState, to: &str) -> Result<()> {
        bail!(
            "internal error: module {} cannot move from '{}' to '{}'",
            self.module,
            from,
            to
        )
    }
}
