//! Executor-side capability facet over the transaction store.
//!
//! The executor takes exclusive control of the transaction for its whole
//! run: a blocking, cancellable lock acquisition, then durable state
//! transitions gated on lock ownership. Transitions are retried a bounded
//! number of times against transient filesystem faults.

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use super::operations::{Operations, TxnState};
use super::store::{Store, StoreError};

/// Number of times a critical state mutation is attempted.
const MAX_ATTEMPTS: u32 = 5;
/// Delay between attempts.
/// TODO: exponential backoff with jitter once the fault data justifies it.
const RETRY_DELAY: Duration = Duration::from_millis(200);

pub struct ExecutorStore {
    store: Store,
}

impl ExecutorStore {
    pub fn open(base_dir: &Path) -> Result<Self, StoreError> {
        Ok(Self {
            store: Store::open(base_dir)?,
        })
    }

    /// Acquire the advisory lock, blocking until it is free or `cancel`
    /// is raised.
    pub fn lock(&self, cancel: &AtomicBool) -> Result<(), StoreError> {
        self.store.lock(cancel)
    }

    /// Release the advisory lock. Idempotent.
    pub fn unlock(&self) {
        self.store.unlock();
    }

    /// Read the current record without interpretation.
    pub fn operations(&self) -> Result<Operations, StoreError> {
        self.store.load()
    }

    /// Transition `Prepare -> Run` and return the plan to apply.
    ///
    /// A record that is not in `Prepare` yields `StateConflict` carrying
    /// the observed state; that is not retried, the caller is expected to
    /// log and exit without touching anything.
    pub fn start(&self) -> Result<Operations, StoreError> {
        let ops = self.store.load()?;
        if ops.state() != TxnState::Prepare {
            return Err(StoreError::StateConflict { state: ops.state() });
        }
        self.with_retry(|| self.store.update_state(TxnState::Run, None))
    }

    /// Mark the transaction complete; clears any recorded failure reason.
    pub fn done(&self) -> Result<(), StoreError> {
        self.with_retry(|| self.store.update_state(TxnState::Done, None))
            .map(|_| ())
    }

    /// Return the transaction to `Prepare`, recording why the attempt was
    /// rolled back. A missing cause is substituted with a synthetic one.
    pub fn rolled_back(&self, cause: Option<String>) -> Result<(), StoreError> {
        let cause = cause.unwrap_or_else(|| "rolled back with no recorded reason".to_string());
        self.with_retry(|| self.store.update_state(TxnState::Prepare, Some(cause.clone())))
            .map(|_| ())
    }

    /// Mark the transaction broken: execution failed and rollback failed
    /// as well. The cause is mandatory.
    pub fn broken(&self, cause: String) -> Result<(), StoreError> {
        self.with_retry(|| self.store.update_state(TxnState::Broken, Some(cause.clone())))
            .map(|_| ())
    }

    fn with_retry<F>(&self, action: F) -> Result<Operations, StoreError>
    where
        F: Fn() -> Result<Operations, StoreError>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match action() {
                Ok(ops) => return Ok(ops),
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) if attempt >= MAX_ATTEMPTS => {
                    return Err(StoreError::MutationFailed {
                        attempts: attempt,
                        source: Box::new(err),
                    });
                }
                Err(err) => {
                    tracing::warn!(
                        attempt,
                        max = MAX_ATTEMPTS,
                        "state mutation failed: {err}, retrying in {:?}",
                        RETRY_DELAY
                    );
                    std::thread::sleep(RETRY_DELAY);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::atomic::AtomicBool;

    use tempfile::TempDir;

    use crate::txn::ConsumerStore;

    fn seeded(dir: &Path) -> (ConsumerStore, ExecutorStore) {
        let consumer = ConsumerStore::open(dir).unwrap();
        consumer.update(|ops| ops.stage_install("/pool/a.deb")).unwrap();
        let executor = ExecutorStore::open(dir).unwrap();
        executor.lock(&AtomicBool::new(false)).unwrap();
        (consumer, executor)
    }

    #[test]
    fn success_path_runs_to_done() {
        let tmp = TempDir::new().unwrap();
        let (_, executor) = seeded(tmp.path());

        let ops = executor.start().unwrap();
        assert_eq!(ops.state(), TxnState::Run);

        executor.done().unwrap();
        let loaded = executor.operations().unwrap();
        assert_eq!(loaded.state(), TxnState::Done);
        assert!(loaded.error().is_none());
        executor.unlock();
    }

    #[test]
    fn rolled_back_returns_to_prepare_with_reason() {
        let tmp = TempDir::new().unwrap();
        let (_, executor) = seeded(tmp.path());

        executor.start().unwrap();
        executor.rolled_back(Some("apt failed".into())).unwrap();

        let loaded = executor.operations().unwrap();
        assert_eq!(loaded.state(), TxnState::Prepare);
        assert_eq!(loaded.error(), Some("apt failed"));
        executor.unlock();
    }

    #[test]
    fn rolled_back_without_cause_records_synthetic_reason() {
        let tmp = TempDir::new().unwrap();
        let (_, executor) = seeded(tmp.path());

        executor.start().unwrap();
        executor.rolled_back(None).unwrap();

        let loaded = executor.operations().unwrap();
        assert_eq!(loaded.state(), TxnState::Prepare);
        assert!(loaded.error().is_some());
        executor.unlock();
    }

    #[test]
    fn broken_records_cause() {
        let tmp = TempDir::new().unwrap();
        let (_, executor) = seeded(tmp.path());

        executor.start().unwrap();
        executor.broken("rollback also failed".into()).unwrap();

        let loaded = executor.operations().unwrap();
        assert_eq!(loaded.state(), TxnState::Broken);
        assert_eq!(loaded.error(), Some("rollback also failed"));
        executor.unlock();
    }

    #[test]
    fn start_refuses_non_prepare_state() {
        let tmp = TempDir::new().unwrap();
        let (_, executor) = seeded(tmp.path());

        executor.start().unwrap();
        let err = executor.start().unwrap_err();
        assert!(
            matches!(
                err,
                StoreError::StateConflict {
                    state: TxnState::Run
                }
            ),
            "got {err:?}"
        );
        executor.unlock();
    }

    #[test]
    fn transitions_fail_without_lock() {
        let tmp = TempDir::new().unwrap();
        let consumer = ConsumerStore::open(tmp.path()).unwrap();
        consumer.update(|_| {}).unwrap();
        let executor = ExecutorStore::open(tmp.path()).unwrap();

        for err in [
            executor.done().unwrap_err(),
            executor.rolled_back(Some("x".into())).unwrap_err(),
            executor.broken("x".into()).unwrap_err(),
        ] {
            assert!(matches!(err, StoreError::NotLocked), "got {err:?}");
        }
    }

    #[test]
    fn missing_record_is_not_retried() {
        let tmp = TempDir::new().unwrap();
        let (_, executor) = seeded(tmp.path());
        executor.start().unwrap();

        fs::remove_file(tmp.path().join(crate::txn::store::STATE_FILE)).unwrap();
        let started = std::time::Instant::now();
        let err = executor.done().unwrap_err();
        assert!(err.is_not_found(), "got {err:?}");
        assert!(
            started.elapsed() < Duration::from_millis(500),
            "non-retryable errors must fail fast"
        );
        executor.unlock();
    }
}
