//! Daemon-side capability facet over the transaction store.
//!
//! The daemon must never wait on the executor: every mutation uses a
//! short-lived try-lock and fails fast with `ExecutionInProgress` when the
//! executor owns the transaction.

use std::path::Path;

use super::operations::{Operations, TxnState};
use super::store::{Store, StoreError};

pub struct ConsumerStore {
    store: Store,
}

/// Releases the advisory lock when a locked section ends, on every path.
struct LockGuard<'a>(&'a Store);

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.0.unlock();
    }
}

impl ConsumerStore {
    pub fn open(base_dir: &Path) -> Result<Self, StoreError> {
        Ok(Self {
            store: Store::open(base_dir)?,
        })
    }

    /// Read the current record without taking the lock.
    ///
    /// Used by status endpoints; the value may be immediately stale but is
    /// never torn (persist is an atomic rename).
    pub fn operations(&self) -> Result<Operations, StoreError> {
        self.store.load()
    }

    /// Stage a mutation of the plan.
    ///
    /// Takes the lock for the duration of the call, synthesizes an empty
    /// `Prepare` record when none exists yet, and refuses with
    /// `ExecutionInProgress` when the lock is busy or the record is not in
    /// `Prepare`.
    pub fn update<F>(&self, modify: F) -> Result<Operations, StoreError>
    where
        F: FnOnce(&mut Operations),
    {
        if !self.store.try_lock()? {
            return Err(StoreError::ExecutionInProgress);
        }
        let _guard = LockGuard(&self.store);

        let mut ops = self.load_or_default()?;
        if ops.state() != TxnState::Prepare {
            return Err(StoreError::ExecutionInProgress);
        }
        modify(&mut ops);
        self.store.persist(&ops)?;
        Ok(ops)
    }

    /// Reset the plan to an empty `Prepare` record.
    ///
    /// Allowed from `Prepare` and `Done`. A `Run` record is refused with
    /// `ExecutionInProgress`; a `Broken` record is refused with
    /// `StateConflict` and requires the explicit [`force_reset`]
    /// acknowledgement.
    ///
    /// [`force_reset`]: Self::force_reset
    pub fn clear(&self) -> Result<Operations, StoreError> {
        if !self.store.try_lock()? {
            return Err(StoreError::ExecutionInProgress);
        }
        let _guard = LockGuard(&self.store);

        match self.load_or_default()?.state() {
            TxnState::Run => return Err(StoreError::ExecutionInProgress),
            TxnState::Broken => {
                return Err(StoreError::StateConflict {
                    state: TxnState::Broken,
                });
            }
            TxnState::Prepare | TxnState::Done => {}
        }
        let ops = Operations::default();
        self.store.persist(&ops)?;
        Ok(ops)
    }

    /// Administrative reset to an empty `Prepare` record from any state,
    /// including `Run` and `Broken`.
    ///
    /// Lock-protected: a live executor holds the advisory lock, so the
    /// try-lock fails exactly when a reset would be unsafe. A `Run` record
    /// whose executor died no longer holds the lock and is recoverable
    /// here.
    pub fn force_reset(&self) -> Result<Operations, StoreError> {
        if !self.store.try_lock()? {
            return Err(StoreError::ExecutionInProgress);
        }
        let _guard = LockGuard(&self.store);

        let ops = Operations::default();
        self.store.persist(&ops)?;
        Ok(ops)
    }

    fn load_or_default(&self) -> Result<Operations, StoreError> {
        match self.store.load() {
            Ok(ops) => Ok(ops),
            Err(err) if err.is_not_found() => Ok(Operations::default()),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::atomic::AtomicBool;

    use tempfile::TempDir;

    use crate::txn::ExecutorStore;

    #[test]
    fn update_creates_record_lazily() {
        let tmp = TempDir::new().unwrap();
        let consumer = ConsumerStore::open(tmp.path()).unwrap();

        let ops = consumer
            .update(|ops| ops.stage_install("/pool/new-pkg.deb"))
            .unwrap();
        assert_eq!(ops.state(), TxnState::Prepare);

        let loaded = consumer.operations().unwrap();
        assert_eq!(loaded.packages_to_install(), [Path::new("/pool/new-pkg.deb")]);
    }

    #[test]
    fn update_refused_while_executor_holds_lock() {
        let tmp = TempDir::new().unwrap();
        let consumer = ConsumerStore::open(tmp.path()).unwrap();
        let executor = ExecutorStore::open(tmp.path()).unwrap();

        executor.lock(&AtomicBool::new(false)).unwrap();
        let err = consumer.update(|_| {}).unwrap_err();
        assert!(matches!(err, StoreError::ExecutionInProgress), "got {err:?}");
        executor.unlock();

        consumer.update(|_| {}).unwrap();
    }

    #[test]
    fn update_refused_outside_prepare_and_leaves_file_untouched() {
        let tmp = TempDir::new().unwrap();
        let consumer = ConsumerStore::open(tmp.path()).unwrap();
        let executor = ExecutorStore::open(tmp.path()).unwrap();

        consumer.update(|ops| ops.stage_remove("pkg")).unwrap();
        executor.lock(&AtomicBool::new(false)).unwrap();
        executor.start().unwrap();
        executor.unlock();

        let before = fs::read(tmp.path().join(super::super::store::STATE_FILE)).unwrap();
        let err = consumer.update(|ops| ops.stage_remove("other")).unwrap_err();
        assert!(matches!(err, StoreError::ExecutionInProgress), "got {err:?}");
        let after = fs::read(tmp.path().join(super::super::store::STATE_FILE)).unwrap();
        assert_eq!(before, after, "a refused update must not touch the file");
    }

    #[test]
    fn clear_resets_done_to_empty_prepare() {
        let tmp = TempDir::new().unwrap();
        let consumer = ConsumerStore::open(tmp.path()).unwrap();
        let executor = ExecutorStore::open(tmp.path()).unwrap();

        consumer.update(|ops| ops.stage_remove("pkg")).unwrap();
        executor.lock(&AtomicBool::new(false)).unwrap();
        executor.start().unwrap();
        executor.done().unwrap();
        executor.unlock();

        let ops = consumer.clear().unwrap();
        assert_eq!(ops.state(), TxnState::Prepare);
        assert!(ops.is_empty());
        assert!(ops.error().is_none());
    }

    #[test]
    fn clear_refuses_run_record() {
        let tmp = TempDir::new().unwrap();
        let consumer = ConsumerStore::open(tmp.path()).unwrap();
        let executor = ExecutorStore::open(tmp.path()).unwrap();

        consumer.update(|ops| ops.stage_remove("pkg")).unwrap();
        executor.lock(&AtomicBool::new(false)).unwrap();
        executor.start().unwrap();
        executor.unlock();

        let err = consumer.clear().unwrap_err();
        assert!(matches!(err, StoreError::ExecutionInProgress), "got {err:?}");
    }

    #[test]
    fn clear_refuses_broken_record() {
        let tmp = TempDir::new().unwrap();
        let consumer = ConsumerStore::open(tmp.path()).unwrap();
        let executor = ExecutorStore::open(tmp.path()).unwrap();

        consumer.update(|ops| ops.stage_remove("pkg")).unwrap();
        executor.lock(&AtomicBool::new(false)).unwrap();
        executor.start().unwrap();
        executor.broken("rollback failed".into()).unwrap();
        executor.unlock();

        let err = consumer.clear().unwrap_err();
        assert!(
            matches!(
                err,
                StoreError::StateConflict {
                    state: TxnState::Broken
                }
            ),
            "got {err:?}"
        );
    }

    #[test]
    fn force_reset_recovers_orphaned_run_record() {
        let tmp = TempDir::new().unwrap();
        let consumer = ConsumerStore::open(tmp.path()).unwrap();
        let executor = ExecutorStore::open(tmp.path()).unwrap();

        consumer.update(|ops| ops.stage_remove("pkg")).unwrap();
        executor.lock(&AtomicBool::new(false)).unwrap();
        executor.start().unwrap();
        // Executor dies without finalizing: the OS releases the lock but
        // the record stays in Run.
        executor.unlock();

        let err = consumer.update(|_| {}).unwrap_err();
        assert!(matches!(err, StoreError::ExecutionInProgress), "got {err:?}");

        let ops = consumer.force_reset().unwrap();
        assert_eq!(ops.state(), TxnState::Prepare);
        assert!(ops.is_empty());

        consumer.update(|ops| ops.stage_remove("pkg")).unwrap();
    }

    #[test]
    fn force_reset_refused_while_lock_is_held() {
        let tmp = TempDir::new().unwrap();
        let consumer = ConsumerStore::open(tmp.path()).unwrap();
        let executor = ExecutorStore::open(tmp.path()).unwrap();

        executor.lock(&AtomicBool::new(false)).unwrap();
        let err = consumer.force_reset().unwrap_err();
        assert!(matches!(err, StoreError::ExecutionInProgress), "got {err:?}");
        executor.unlock();
    }
}
