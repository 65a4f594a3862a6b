//! Exclusive run lock (`var/apt-mirror.lock`), guarding against two
//! overlapping runs per spec.md §4.G/§5. Reuses the same
//! `proxmox_sys::fs::open_file_locked` primitive the teacher's
//! `Pool::lock` uses.

use std::{
    fmt::{self, Display},
    fs::File,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Error};
use proxmox_sys::fs::CreateOptions;

/// Held for the lifetime of a run; dropping it releases the flock.
pub struct RunLock {
    _file: File,
}

/// Exit code 2 is reserved for "could not acquire the run lock" (spec.md
/// §6); the CLI binary maps this error back to that code by downcasting.
#[derive(Debug)]
pub struct LockContention(pub PathBuf);

impl Display for LockContention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "another apt-mirror run holds the lock at {:?}", self.0)
    }
}

impl std::error::Error for LockContention {}

/// Acquire `var_path/apt-mirror.lock` exclusively, failing fast (no
/// blocking wait) if another run already holds it.
pub fn acquire(var_path: &Path) -> Result<RunLock, Error> {
    let lock_path = var_path.join("apt-mirror.lock");

    let file = proxmox_sys::fs::open_file_locked(
        &lock_path,
        Duration::from_secs(0),
        true,
        CreateOptions::default(),
    )
    .map_err(|_| LockContention(lock_path.clone()))
    .with_context(|| format!("acquiring run lock at {lock_path:?}"))?;

    Ok(RunLock { _file: file })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_can_be_acquired_and_released() {
        let dir = tempfile::tempdir().unwrap();
        {
            let _lock = acquire(dir.path()).unwrap();
            assert!(dir.path().join("apt-mirror.lock").exists());
        }
        // dropped, should be acquirable again
        let _lock2 = acquire(dir.path()).unwrap();
    }
}
