//! Advisory file locks shared between orchestrator processes.
//!
//! - [`MergeSlotLock`]: exclusive, held by the integration pipeline while one
//!   item runs merge, validate, and commit-or-rollback. Guarantees a single
//!   mainline writer across processes.
//! - [`StoreLock`]: shared for loading the persisted graph, exclusive for
//!   saving it.

use crate::error::ErrorCode;
use fs2::FileExt;
use std::{
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

/// Poll interval while waiting for a contended lock.
const POLL: Duration = Duration::from_millis(10);

/// Advisory lock errors.
#[derive(Debug)]
pub enum LockError {
    Timeout { path: PathBuf, waited: Duration },
    IoError(io::Error),
}

impl From<io::Error> for LockError {
    fn from(err: io::Error) -> Self {
        Self::IoError(err)
    }
}

impl LockError {
    /// Machine-readable code associated with this lock error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Timeout { .. } => ErrorCode::LockContention,
            Self::IoError(_) => ErrorCode::StorageFailure,
        }
    }

    #[must_use]
    pub const fn hint(&self) -> Option<&'static str> {
        self.code().hint()
    }
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout { path, waited } => write!(
                f,
                "{}: lock on {} not acquired after {:?}",
                self.code().code(),
                path.display(),
                waited
            ),
            Self::IoError(err) => write!(f, "{}: {}", self.code().code(), err),
        }
    }
}

impl std::error::Error for LockError {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug)]
struct FileGuard {
    file: File,
    path: PathBuf,
}

impl FileGuard {
    fn acquire(path: &Path, timeout: Duration, mode: LockMode) -> Result<Self, LockError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;

        let start = Instant::now();
        loop {
            // Spelled out: newer std has inherent `File` lock methods with a
            // different error type.
            let locked = match mode {
                LockMode::Shared => FileExt::try_lock_shared(&file).is_ok(),
                LockMode::Exclusive => FileExt::try_lock_exclusive(&file).is_ok(),
            };
            if locked {
                return Ok(Self {
                    file,
                    path: path.to_path_buf(),
                });
            }

            let waited = start.elapsed();
            if waited >= timeout {
                return Err(LockError::Timeout {
                    path: path.to_path_buf(),
                    waited,
                });
            }
            thread::sleep(POLL);
        }
    }
}

impl Drop for FileGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Cross-process merge slot. Released on drop.
#[derive(Debug)]
pub struct MergeSlotLock {
    guard: FileGuard,
}

impl MergeSlotLock {
    /// Lock file name inside the state directory.
    pub const FILE_NAME: &'static str = "merge.lock";

    /// Take the merge slot under `state_dir`, waiting up to `timeout`.
    ///
    /// # Errors
    ///
    /// [`LockError::Timeout`] while another process integrates.
    pub fn acquire(state_dir: &Path, timeout: Duration) -> Result<Self, LockError> {
        let guard = FileGuard::acquire(
            &state_dir.join(Self::FILE_NAME),
            timeout,
            LockMode::Exclusive,
        )?;
        Ok(Self { guard })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.guard.path
    }
}

/// Lock guarding the persisted graph database.
#[derive(Debug)]
pub struct StoreLock {
    guard: FileGuard,
    mode: LockMode,
}

impl StoreLock {
    /// Lock the sibling `<database>.lock` file in `mode`.
    ///
    /// # Errors
    ///
    /// [`LockError::Timeout`] when a conflicting holder does not release in
    /// time.
    pub fn acquire(database: &Path, mode: LockMode, timeout: Duration) -> Result<Self, LockError> {
        let mut name = database.as_os_str().to_owned();
        name.push(".lock");
        let guard = FileGuard::acquire(Path::new(&name), timeout, mode)?;
        Ok(Self { guard, mode })
    }

    #[must_use]
    pub const fn mode(&self) -> LockMode {
        self.mode
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.guard.path
    }
}
