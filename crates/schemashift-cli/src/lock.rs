use fs2::FileExt;
use schemashift_core::ErrorCode;
use std::{
    ffi::OsString,
    fs::{File, OpenOptions},
    io,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use crate::output::CliError;

/// How long `migrate` waits for another run to release the database.
pub const LOCK_WAIT: Duration = Duration::from_secs(2);

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

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout { path, waited } => {
                write!(f, "lock timed out after {waited:?} at {}", path.display())
            }
            Self::IoError(err) => write!(f, "lock file: {err}"),
        }
    }
}

impl std::error::Error for LockError {}

impl From<LockError> for CliError {
    fn from(err: LockError) -> Self {
        let code = match err {
            LockError::Timeout { .. } => ErrorCode::LockContention,
            LockError::IoError(_) => ErrorCode::ConfigInvalid,
        };
        Self::new(code, err.to_string())
    }
}

/// RAII guard for the exclusive `<database>.migrate.lock` file held while
/// a migration runs. Released on drop; the file itself stays.
#[derive(Debug)]
pub struct MigrationLock {
    file: File,
    path: PathBuf,
}

impl MigrationLock {
    /// Lock file path for a database file.
    pub fn path_for(database: &Path) -> PathBuf {
        let mut name = database
            .file_name()
            .map_or_else(|| OsString::from("database"), ToOwned::to_owned);
        name.push(".migrate.lock");
        database.with_file_name(name)
    }

    /// Take the lock, retrying until `timeout` passes.
    pub fn acquire(database: &Path, timeout: Duration) -> Result<Self, LockError> {
        let path = Self::path_for(database);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let start = Instant::now();
        loop {
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&path)?;

            if file.try_lock_exclusive().is_ok() {
                return Ok(Self { file, path });
            }

            if start.elapsed() >= timeout {
                return Err(LockError::Timeout {
                    path,
                    waited: start.elapsed(),
                });
            }

            thread::sleep(Duration::from_millis(10));
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for MigrationLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_file_sits_next_to_the_database() {
        let path = MigrationLock::path_for(Path::new("/srv/board/gochan.db"));
        assert_eq!(path, Path::new("/srv/board/gochan.db.migrate.lock"));
    }

    #[test]
    fn second_holder_times_out_until_first_drops() {
        let dir = tempfile::tempdir().expect("temp dir");
        let db = dir.path().join("board.db");

        let first = MigrationLock::acquire(&db, Duration::ZERO).expect("first lock");
        assert!(first.path().exists());

        let err = MigrationLock::acquire(&db, Duration::from_millis(30)).expect_err("contended");
        assert!(matches!(err, LockError::Timeout { .. }));
        assert_eq!(CliError::from(err).code, "E5002");

        drop(first);
        MigrationLock::acquire(&db, Duration::ZERO).expect("reacquire after drop");
    }
}
