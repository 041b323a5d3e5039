//! Executor process body.
//!
//! Runs in its own short-lived process (`groom --execute`): claim the
//! transaction, apply the plan through the external package manager, and
//! finalize the durable state. Once `start()` has succeeded the driver is
//! no longer cancellable; abandoning mid-apply would leave the host
//! inconsistent, so the state record is the only honest way out.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use crate::config::Config;
use crate::pkg::{Dpkg, PackageManager, PkgError};

use super::executor::ExecutorStore;
use super::operations::Operations;
use super::store::StoreError;

/// Outcome of applying the plan, mapped 1:1 onto the finalizing
/// transition.
enum Outcome {
    Done,
    RolledBack(String),
    Broken(String),
}

/// Entry point for `--execute`. One transaction attempt, then exit.
///
/// Returns `Ok` for every graceful outcome, including "nothing to do" and
/// a failed-but-finalized transaction: the state record is the
/// authoritative result. An error here means state could not even be
/// transitioned.
pub fn run(cfg: &Config) -> Result<(), StoreError> {
    let manager = Dpkg::from_config(cfg);
    run_with(cfg, &manager)
}

pub fn run_with(cfg: &Config, manager: &dyn PackageManager) -> Result<(), StoreError> {
    tracing::info!("executor started");
    let store = ExecutorStore::open(&cfg.state_dir)?;

    let cancel = Arc::new(AtomicBool::new(false));
    let _ = signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&cancel));
    let _ = signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&cancel));

    match store.lock(&cancel) {
        Ok(()) => {}
        Err(StoreError::Cancelled) => {
            tracing::info!("cancelled while waiting for the transaction lock, exiting");
            return Ok(());
        }
        Err(err) => return Err(err),
    }

    let result = run_locked(&store, cfg, manager);
    store.unlock();
    result
}

fn run_locked(
    store: &ExecutorStore,
    cfg: &Config,
    manager: &dyn PackageManager,
) -> Result<(), StoreError> {
    let ops = match store.start() {
        Ok(ops) => ops,
        Err(StoreError::StateConflict { state }) => {
            tracing::warn!(%state, "transaction not in Prepare, nothing to do");
            return Ok(());
        }
        Err(err) if err.is_not_found() => {
            tracing::warn!("no transaction plan, nothing to do");
            return Ok(());
        }
        Err(err) => return Err(err),
    };

    tracing::info!(
        installs = ops.packages_to_install().len(),
        removals = ops.packages_to_remove().len(),
        "transaction claimed"
    );

    match apply_plan(&ops, cfg, manager) {
        Outcome::Done => {
            store.done()?;
            tracing::info!("transaction complete");
        }
        Outcome::RolledBack(reason) => {
            tracing::error!("transaction rolled back: {reason}");
            store.rolled_back(Some(reason))?;
        }
        Outcome::Broken(reason) => {
            tracing::error!("transaction broken: {reason}");
            store.broken(reason)?;
        }
    }
    Ok(())
}

fn apply_plan(ops: &Operations, cfg: &Config, manager: &dyn PackageManager) -> Outcome {
    for pool_file in ops.packages_to_install() {
        match install_one(pool_file, cfg, manager) {
            Ok(()) => {}
            Err(outcome) => return outcome,
        }
    }
    for package in ops.packages_to_remove() {
        tracing::info!(%package, "removing");
        if let Err(outcome) = remove_one(package, cfg, manager) {
            return outcome;
        }
    }
    Outcome::Done
}

/// Install a single pool file with backup-and-restore.
///
/// The currently installed file for the same package (if any) is moved
/// aside as `<file>.previous` before the install; on success the pool file
/// becomes the new installed file and the backup is dropped, on failure
/// the backup is re-installed and restored to its place. A rollback
/// install that fails itself breaks the transaction.
fn install_one(
    pool_file: &Path,
    cfg: &Config,
    manager: &dyn PackageManager,
) -> Result<(), Outcome> {
    let file_name = pool_file
        .file_name()
        .ok_or_else(|| Outcome::RolledBack(format!("invalid pool path {pool_file:?}")))?;

    let package = manager
        .package_name(pool_file)
        .map_err(|err| Outcome::RolledBack(err.to_string()))?;
    tracing::info!(%package, file = %pool_file.display(), "installing");

    let current = find_installed(&cfg.installed_dir, manager, &package);
    let backup = match &current {
        Some(current) => {
            let backup = backup_path(current);
            fs::rename(current, &backup)
                .map_err(|err| Outcome::RolledBack(format!("failed to back up {current:?}: {err}")))?;
            Some(backup)
        }
        None => None,
    };

    match manager.install(pool_file) {
        Ok(()) => {
            let target = cfg.installed_dir.join(file_name);
            if let Err(err) = fs::rename(pool_file, &target) {
                // The package is on the system but the record of it is
                // not; the host no longer matches the installed dir.
                return Err(Outcome::Broken(format!(
                    "installed {package} but failed to record {pool_file:?} as {target:?}: {err}"
                )));
            }
            if let Some(backup) = backup {
                let _ = fs::remove_file(backup);
            }
            Ok(())
        }
        Err(install_err) => {
            tracing::error!(%package, "install failed: {install_err}");
            rollback_install(&install_err, current, backup, manager)
        }
    }
}

fn rollback_install(
    install_err: &PkgError,
    current: Option<PathBuf>,
    backup: Option<PathBuf>,
    manager: &dyn PackageManager,
) -> Result<(), Outcome> {
    let (Some(current), Some(backup)) = (current, backup) else {
        // First install of this package: nothing to restore.
        return Err(Outcome::RolledBack(install_err.to_string()));
    };

    match manager.install(&backup) {
        Ok(()) => {
            if let Err(err) = fs::rename(&backup, &current) {
                tracing::warn!("failed to restore backup {backup:?}: {err}");
            }
            Err(Outcome::RolledBack(install_err.to_string()))
        }
        Err(rollback_err) => Err(Outcome::Broken(rollback_err.to_string())),
    }
}

/// Remove a single package and drop its installed-directory record.
///
/// Removal touches nothing before the package manager call, so a failed
/// remove rolls back trivially.
fn remove_one(package: &str, cfg: &Config, manager: &dyn PackageManager) -> Result<(), Outcome> {
    manager
        .remove(package)
        .map_err(|err| Outcome::RolledBack(err.to_string()))?;
    if let Some(path) = find_installed(&cfg.installed_dir, manager, package) {
        if let Err(err) = fs::remove_file(&path) {
            // The package is gone from the system but its record is not;
            // the host no longer matches the installed dir.
            return Err(Outcome::Broken(format!(
                "removed {package} but failed to drop its record {path:?}: {err}"
            )));
        }
    }
    Ok(())
}

fn backup_path(current: &Path) -> PathBuf {
    let mut name = current.as_os_str().to_os_string();
    name.push(".previous");
    PathBuf::from(name)
}

/// Scan the installed directory for the package file currently recorded
/// for `package`.
fn find_installed(installed_dir: &Path, manager: &dyn PackageManager, package: &str) -> Option<PathBuf> {
    let entries = fs::read_dir(installed_dir).ok()?;
    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "deb"))
        .collect();
    files.sort();
    files
        .into_iter()
        .find(|path| matches!(manager.package_name(path), Ok(name) if name == package))
}
