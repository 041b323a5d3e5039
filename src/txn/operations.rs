//! The transaction plan value and its state machine.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// State of the transaction record.
///
/// Transitions are driven by two actors: the daemon mutates the plan only in
/// `Prepare`; the executor moves `Prepare -> Run` and finishes in `Done`,
/// back in `Prepare` (rollback), or in `Broken` (rollback failed too).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnState {
    /// The plan is being built and may be mutated by the daemon.
    #[default]
    Prepare,
    /// The executor holds the lock and is applying the plan.
    Run,
    /// The executor completed successfully.
    Done,
    /// Execution failed and rollback failed as well; operator attention required.
    Broken,
}

impl TxnState {
    pub fn as_str(self) -> &'static str {
        match self {
            TxnState::Prepare => "Prepare",
            TxnState::Run => "Run",
            TxnState::Done => "Done",
            TxnState::Broken => "Broken",
        }
    }
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single per-host transaction plan.
///
/// Persisted as `operations.json`; the file on disk is authoritative, no
/// in-memory copy is. Sequences are set-valued under equality (staging is
/// idempotent) but insertion order is preserved and is the apply order.
/// Unknown keys are ignored on load for forward compatibility.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operations {
    #[serde(default)]
    pub(crate) state: TxnState,
    #[serde(
        rename = "packages_to_install",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub(crate) install: Vec<PathBuf>,
    #[serde(
        rename = "packages_to_remove",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub(crate) remove: Vec<String>,
    #[serde(rename = "error", default, skip_serializing_if = "Option::is_none")]
    pub(crate) err: Option<String>,
}

impl Operations {
    pub fn state(&self) -> TxnState {
        self.state
    }

    /// Pool-file paths to install, in apply order.
    pub fn packages_to_install(&self) -> &[PathBuf] {
        &self.install
    }

    /// Package names to remove, in apply order.
    pub fn packages_to_remove(&self) -> &[String] {
        &self.remove
    }

    /// Failure reason of the last attempt, if any.
    pub fn error(&self) -> Option<&str> {
        self.err.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.install.is_empty() && self.remove.is_empty()
    }

    /// Append a pool file to the install list. Duplicates are coalesced.
    pub fn stage_install(&mut self, pool_file: impl Into<PathBuf>) {
        let pool_file = pool_file.into();
        if !self.install.contains(&pool_file) {
            self.install.push(pool_file);
        }
    }

    /// Append a package name to the removal list. Duplicates are coalesced.
    pub fn stage_remove(&mut self, package: impl Into<String>) {
        let package = package.into();
        if !self.remove.contains(&package) {
            self.remove.push(package);
        }
    }

    /// Whether the staged install list references the given pool file.
    pub fn references_pool_file(&self, path: &Path) -> bool {
        self.install.iter().any(|p| p == path)
    }
}
