//! External package-manager seam.
//!
//! The host package manager is an opaque collaborator: install a package
//! file, remove a package by name, extract the `Package` field of a
//! package file. The trait is the substitution point; production shells
//! out to `apt-get` and `dpkg-deb`, tests supply scripted implementations.

use std::io;
use std::path::Path;
use std::process::Command;

use thiserror::Error;

use crate::config::Config;

#[derive(Debug, Error)]
pub enum PkgError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} failed ({status}): {stderr}")]
    CommandFailed {
        program: String,
        status: String,
        stderr: String,
    },
}

pub trait PackageManager: Send + Sync {
    /// Install a package from a package file on disk.
    fn install(&self, package_file: &Path) -> Result<(), PkgError>;

    /// Remove an installed package by name.
    fn remove(&self, package: &str) -> Result<(), PkgError>;

    /// Extract the `Package` field from a package file, trimmed.
    fn package_name(&self, package_file: &Path) -> Result<String, PkgError>;
}

/// Debian tooling implementation (`apt-get` / `dpkg-deb`). The binaries
/// are taken from the configuration so tests can substitute stubs.
pub struct Dpkg {
    apt_get: String,
    dpkg_deb: String,
}

impl Dpkg {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            apt_get: cfg.tools.apt_get.clone(),
            dpkg_deb: cfg.tools.dpkg_deb.clone(),
        }
    }
}

impl PackageManager for Dpkg {
    fn install(&self, package_file: &Path) -> Result<(), PkgError> {
        run_checked(
            Command::new(&self.apt_get)
                .arg("install")
                .arg("-y")
                .arg(package_file),
            &self.apt_get,
        )
        .map(|_| ())
    }

    fn remove(&self, package: &str) -> Result<(), PkgError> {
        run_checked(
            Command::new(&self.apt_get).arg("remove").arg("-y").arg(package),
            &self.apt_get,
        )
        .map(|_| ())
    }

    fn package_name(&self, package_file: &Path) -> Result<String, PkgError> {
        let stdout = run_checked(
            Command::new(&self.dpkg_deb)
                .arg("-f")
                .arg(package_file)
                .arg("Package"),
            &self.dpkg_deb,
        )?;
        Ok(stdout.trim().to_string())
    }
}

/// Run a command to completion, capturing output. A non-zero exit becomes
/// `CommandFailed` with the captured stderr.
fn run_checked(cmd: &mut Command, program: &str) -> Result<String, PkgError> {
    let output = cmd.output().map_err(|source| PkgError::Spawn {
        program: program.to_string(),
        source,
    })?;
    if !output.status.success() {
        return Err(PkgError::CommandFailed {
            program: program.to_string(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
