//! Pool and installed-directory operations backing the HTTP handlers.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::pkg::{PackageManager, PkgError};
use crate::txn::StoreError;

#[derive(Debug, Error)]
pub enum OpError {
    #[error("invalid filename: {0:?}")]
    InvalidFilename(String),

    #[error("file not found in pool: {0}")]
    PoolFileNotFound(String),

    #[error("file not found in installed: {0}")]
    InstalledFileNotFound(String),

    #[error("removal of the agent's own package is forbidden")]
    SelfProtected,

    #[error("pool file {0} is referenced by the staged transaction")]
    PoolFileStaged(String),

    #[error(transparent)]
    Pkg(#[from] PkgError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// A filename is accepted only when it equals its own basename: no path
/// separators, no `..`, not empty.
pub fn validate_filename(name: &str) -> Result<(), OpError> {
    let valid = !name.is_empty()
        && Path::new(name)
            .file_name()
            .is_some_and(|base| base == std::ffi::OsStr::new(name));
    if valid {
        Ok(())
    } else {
        Err(OpError::InvalidFilename(name.to_string()))
    }
}

/// Filenames in the pool, sorted. Missing directory reads as empty.
pub fn list_pool(pool_dir: &Path) -> Result<Vec<String>, OpError> {
    list_files(pool_dir, |_| true)
}

/// Package filenames in the installed directory, sorted.
pub fn list_installed(installed_dir: &Path) -> Result<Vec<String>, OpError> {
    list_files(installed_dir, |name| name.ends_with(".deb"))
}

fn list_files(dir: &Path, keep: impl Fn(&str) -> bool) -> Result<Vec<String>, OpError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut names: Vec<String> = entries
        .flatten()
        .filter(|e| e.file_type().is_ok_and(|t| t.is_file()))
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|name| keep(name))
        .collect();
    names.sort();
    Ok(names)
}

pub fn upload_pool_file(pool_dir: &Path, name: &str, body: &[u8]) -> Result<(), OpError> {
    fs::create_dir_all(pool_dir)?;
    fs::write(pool_dir.join(name), body)?;
    Ok(())
}

/// Delete a single pool file. Deleting a file that is already gone is not
/// an error.
pub fn delete_pool_file(pool_dir: &Path, name: &str) -> Result<(), OpError> {
    match fs::remove_file(pool_dir.join(name)) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

pub fn clear_pool(pool_dir: &Path) -> Result<(), OpError> {
    if pool_dir.exists() {
        fs::remove_dir_all(pool_dir)?;
    }
    fs::create_dir_all(pool_dir)?;
    Ok(())
}

/// Package names staged by a purge-all: every readable installed package
/// except the agent's own, in listing order. Unreadable files are skipped
/// with a warning rather than failing the whole purge.
pub fn purge_candidates(
    installed_dir: &Path,
    manager: &dyn PackageManager,
    self_package: &str,
) -> Result<Vec<String>, OpError> {
    let mut packages = Vec::new();
    for name in list_installed(installed_dir)? {
        let path = installed_dir.join(&name);
        match manager.package_name(&path) {
            Ok(package) if package == self_package => continue,
            Ok(package) => {
                if !packages.contains(&package) {
                    packages.push(package);
                }
            }
            Err(err) => {
                tracing::warn!(file = name, "skipping unreadable package file: {err}");
            }
        }
    }
    Ok(packages)
}

/// Absolute path of a pool file, after validation.
pub fn pool_path(pool_dir: &Path, name: &str) -> PathBuf {
    pool_dir.join(name)
}
