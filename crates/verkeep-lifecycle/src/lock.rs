use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::debug;

use crate::error::LifecycleError;

/// Exclusive advisory lock on the ledger, held for the whole of one lifecycle
/// operation. Released on drop, and by the kernel if the process dies.
#[derive(Debug)]
pub struct LedgerLock {
    file: File,
    path: PathBuf,
}

impl LedgerLock {
    pub fn acquire(path: &Path) -> Result<Self, LifecycleError> {
        let io_err = |detail: String| LifecycleError::LedgerIo {
            path: path.to_path_buf(),
            detail,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| io_err(err.to_string()))?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|err| io_err(format!("failed to open lock file: {err}")))?;

        if let Err(err) = FileExt::try_lock_exclusive(&file) {
            debug!(path = %path.display(), error = %err, "ledger lock is held elsewhere");
            let holder = fs::read_to_string(path)
                .ok()
                .and_then(|raw| raw.trim().parse::<u32>().ok());
            return Err(LifecycleError::Locked {
                path: path.to_path_buf(),
                holder,
            });
        }

        let _ = file.set_len(0);
        let _ = writeln!(file, "{}", std::process::id());
        let _ = file.flush();
        debug!(path = %path.display(), "acquired ledger lock");

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LedgerLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
