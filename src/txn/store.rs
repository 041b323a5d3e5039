//! Durable store for the transaction record plus the advisory lock.
//!
//! The base directory holds exactly two files: `operations.json` (the
//! record) and `operations.lock` (zero bytes; only the OS-level advisory
//! lock on it carries meaning). Both the daemon and the executor open the
//! same directory from independent processes, so every synchronization
//! primitive here must survive process death: the lock is a whole-file
//! advisory lock the kernel releases when the holder exits, and writes are
//! atomic temp-then-rename so readers never observe a torn record.

use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use fs4::FileExt;
use thiserror::Error;

use super::operations::{Operations, TxnState};

/// Duration between attempts to acquire the advisory lock.
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Slice of the poll interval between cancellation checks.
const LOCK_CANCEL_SLICE: Duration = Duration::from_millis(10);

pub const STATE_FILE: &str = "operations.json";
pub const LOCK_FILE: &str = "operations.lock";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no transaction record at {path:?}")]
    NotFound { path: PathBuf },

    #[error("transaction record at {path:?} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("a transaction is in progress and the plan cannot be modified")]
    ExecutionInProgress,

    #[error("transaction is in state '{state}'")]
    StateConflict { state: TxnState },

    #[error("state mutation requires the transaction lock")]
    NotLocked,

    #[error("state mutation failed after {attempts} attempts: {source}")]
    MutationFailed {
        attempts: u32,
        #[source]
        source: Box<StoreError>,
    },

    #[error("lock acquisition cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    /// Whether a bounded retry may succeed. Only transient filesystem
    /// faults qualify; logic errors such as `NotLocked` never do.
    pub(crate) fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Io(_))
    }
}

/// Low-level persistence and lock primitives shared by the two capability
/// facets ([`ConsumerStore`](super::ConsumerStore) and
/// [`ExecutorStore`](super::ExecutorStore)). Not exported: callers go
/// through a facet that exposes only its permitted verbs.
#[derive(Debug)]
pub(crate) struct Store {
    state_path: PathBuf,
    lock_path: PathBuf,
    held: Mutex<Option<File>>,
}

impl Store {
    /// Open a store rooted at `base_dir`, creating the directory with
    /// restrictive permissions if needed.
    pub(crate) fn open(base_dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(base_dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(base_dir, fs::Permissions::from_mode(0o750))?;
        }
        Ok(Self {
            state_path: base_dir.join(STATE_FILE),
            lock_path: base_dir.join(LOCK_FILE),
            held: Mutex::new(None),
        })
    }

    pub(crate) fn state_path(&self) -> &Path {
        &self.state_path
    }

    fn held(&self) -> MutexGuard<'_, Option<File>> {
        self.held.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Load the current record. A missing file is `NotFound`, an
    /// unparseable file is `Corrupt`; neither is ever silently recovered
    /// here.
    pub(crate) fn load(&self) -> Result<Operations, StoreError> {
        let bytes = match fs::read(&self.state_path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound {
                    path: self.state_path.clone(),
                });
            }
            Err(err) => return Err(err.into()),
        };
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
            path: self.state_path.clone(),
            source,
        })
    }

    /// Atomically replace `operations.json` with the serialized record.
    ///
    /// Writes to a sibling temp file, flushes, then renames over the
    /// target so a partial write is never observable. The temp file is
    /// removed on any error before the rename.
    pub(crate) fn persist(&self, ops: &Operations) -> Result<(), StoreError> {
        let tmp_path = self.state_path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(ops)
            .map_err(|err| StoreError::Io(io::Error::new(ErrorKind::InvalidData, err)))?;

        if let Err(err) = write_sync(&tmp_path, &data) {
            let _ = fs::remove_file(&tmp_path);
            return Err(err.into());
        }
        fs::rename(&tmp_path, &self.state_path)?;

        // fsync the directory so the rename itself is durable.
        #[cfg(unix)]
        if let Some(dir) = self.state_path.parent() {
            if let Ok(dir) = File::open(dir) {
                let _ = dir.sync_all();
            }
        }
        Ok(())
    }

    /// Non-blocking acquisition of the advisory lock. Returns `true` when
    /// acquired, `false` when another process (or this one) holds it.
    pub(crate) fn try_lock(&self) -> Result<bool, StoreError> {
        let file = open_lock_file(&self.lock_path)?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                *self.held() = Some(file);
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Blocking acquisition, polling [`try_lock`](Self::try_lock) until it
    /// succeeds or `cancel` is raised. The flag is checked both before each
    /// attempt and while waiting: the poll interval is slept in small
    /// slices so a cancelled caller returns within one slice, not one
    /// interval.
    pub(crate) fn lock(&self, cancel: &AtomicBool) -> Result<(), StoreError> {
        loop {
            if cancel.load(Ordering::Relaxed) {
                return Err(StoreError::Cancelled);
            }
            if self.try_lock()? {
                return Ok(());
            }
            let mut waited = Duration::ZERO;
            while waited < LOCK_POLL_INTERVAL {
                if cancel.load(Ordering::Relaxed) {
                    return Err(StoreError::Cancelled);
                }
                std::thread::sleep(LOCK_CANCEL_SLICE);
                waited += LOCK_CANCEL_SLICE;
            }
        }
    }

    /// Release the advisory lock. Idempotent; a no-op when not held.
    pub(crate) fn unlock(&self) {
        if let Some(file) = self.held().take() {
            let _ = FileExt::unlock(&file);
        }
    }

    pub(crate) fn is_locked(&self) -> bool {
        self.held().is_some()
    }

    /// Load, assign state and failure reason, persist, and return the new
    /// record. Fails with `NotLocked` before any I/O when the caller does
    /// not hold the lock.
    pub(crate) fn update_state(
        &self,
        state: TxnState,
        err: Option<String>,
    ) -> Result<Operations, StoreError> {
        if !self.is_locked() {
            return Err(StoreError::NotLocked);
        }
        let mut ops = self.load()?;
        ops.state = state;
        ops.err = err;
        self.persist(&ops)?;
        Ok(ops)
    }
}

fn write_sync(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(data)?;
    file.sync_all()
}

fn open_lock_file(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.read(true).write(true).create(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;
    use tempfile::TempDir;

    fn sample_ops() -> Operations {
        let mut ops = Operations::default();
        ops.stage_install("/pool/pkg_1.0_amd64.deb");
        ops.stage_remove("old-package");
        ops
    }

    #[test]
    fn open_creates_base_directory() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("state");
        Store::open(&dir).unwrap();
        assert!(dir.is_dir());
    }

    #[test]
    fn persist_then_load_round_trips() {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(tmp.path()).unwrap();
        let ops = sample_ops();
        store.persist(&ops).unwrap();
        assert_eq!(store.load().unwrap(), ops);
    }

    #[test]
    fn persist_leaves_no_temp_files() {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(tmp.path()).unwrap();
        store.persist(&sample_ops()).unwrap();

        for entry in fs::read_dir(tmp.path()).unwrap() {
            let name = entry.unwrap().file_name();
            assert!(
                !name.to_string_lossy().ends_with(".tmp"),
                "temp file left behind: {name:?}"
            );
        }
    }

    #[test]
    fn load_missing_file_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(tmp.path()).unwrap();
        let err = store.load().unwrap_err();
        assert!(err.is_not_found(), "got {err:?}");
    }

    #[test]
    fn load_garbage_is_corrupt() {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(tmp.path()).unwrap();
        fs::write(store.state_path(), b"{not json").unwrap();
        let err = store.load().unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }), "got {err:?}");
    }

    #[test]
    fn update_state_requires_lock() {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(tmp.path()).unwrap();
        store.persist(&Operations::default()).unwrap();

        let err = store.update_state(TxnState::Run, None).unwrap_err();
        assert!(matches!(err, StoreError::NotLocked), "got {err:?}");
    }

    #[test]
    fn try_lock_excludes_second_holder() {
        let tmp = TempDir::new().unwrap();
        let a = Store::open(tmp.path()).unwrap();
        let b = Store::open(tmp.path()).unwrap();

        assert!(a.try_lock().unwrap());
        assert!(!b.try_lock().unwrap(), "lock should be busy");

        a.unlock();
        assert!(b.try_lock().unwrap(), "lock should be free after release");
        b.unlock();
    }

    #[test]
    fn unlock_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(tmp.path()).unwrap();
        assert!(store.try_lock().unwrap());
        store.unlock();
        store.unlock();
        assert!(store.try_lock().unwrap());
        store.unlock();
    }

    #[test]
    fn lock_returns_cancelled_when_flag_fires() {
        let tmp = TempDir::new().unwrap();
        let holder = Store::open(tmp.path()).unwrap();
        assert!(holder.try_lock().unwrap());

        let waiter = Store::open(tmp.path()).unwrap();
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancel);
        let timer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(300));
            flag.store(true, Ordering::Relaxed);
        });

        let start = Instant::now();
        let err = waiter.lock(&cancel).unwrap_err();
        assert!(matches!(err, StoreError::Cancelled), "got {err:?}");
        // The flag fires at ~300ms; a cancelled waiter must return within
        // one cancellation slice of that, not wait out a full poll
        // interval.
        assert!(
            start.elapsed() < Duration::from_millis(500),
            "cancellation took {:?}, should fire within one slice",
            start.elapsed()
        );
        timer.join().unwrap();
        holder.unlock();
    }

    #[test]
    fn lock_acquires_once_released() {
        let tmp = TempDir::new().unwrap();
        let holder = Store::open(tmp.path()).unwrap();
        assert!(holder.try_lock().unwrap());

        let dir = tmp.path().to_path_buf();
        let waiter = std::thread::spawn(move || {
            let store = Store::open(&dir).unwrap();
            let cancel = AtomicBool::new(false);
            store.lock(&cancel).unwrap();
            store.unlock();
        });

        std::thread::sleep(Duration::from_millis(250));
        holder.unlock();
        waiter.join().unwrap();
    }
}
