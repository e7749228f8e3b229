// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Advisory locking of the LUKS2 metadata area
//!
//! `cryptsetup` takes an exclusive `flock` while it rewrites a header. Regular
//! files are locked directly, while block devices are locked through a file
//! named after the device number in `<run_dir>/cryptsetup`. Readers take a
//! shared lock using the same convention.

use std::{
    fs::{self, DirBuilder, File, OpenOptions},
    io,
    os::unix::fs::{DirBuilderExt, FileTypeExt, MetadataExt, OpenOptionsExt},
    path::{Path, PathBuf},
};

use log::{debug, trace};
use nix::{
    errno::Errno,
    fcntl::{Flock, FlockArg},
    sys::stat::{major, minor},
};

use crate::Error;

/// How to behave when the header lock is held elsewhere
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    /// Wait until the lock is released, with no timeout
    Blocking,
    /// Fail with [`Error::Locked`] immediately
    NonBlocking,
}

/// A shared lock on the metadata area of a volume, released on drop.
pub struct HeaderLock {
    lock: Flock<File>,
    path: PathBuf,
}

impl HeaderLock {
    /// Acquire a shared lock on the volume at `path`.
    ///
    /// `run_dir` is the runtime directory holding lock files for block devices.
    pub fn acquire(path: impl AsRef<Path>, mode: LockMode, run_dir: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let metadata = fs::metadata(path)?;
        let file_type = metadata.file_type();

        if file_type.is_file() {
            let file = File::open(path)?;
            let lock = flock(file, mode)?;
            debug!("acquired shared lock on {path:?}");
            Ok(Self {
                lock,
                path: path.to_owned(),
            })
        } else if file_type.is_block_device() {
            let rdev = metadata.rdev();
            let dir = run_dir.as_ref().join("cryptsetup");
            DirBuilder::new().recursive(true).mode(0o700).create(&dir)?;
            let lock_path = dir.join(format!("L_{}:{}", major(rdev), minor(rdev)));
            Self::acquire_lock_file(lock_path, mode)
        } else {
            Err(io::Error::new(io::ErrorKind::InvalidInput, format!("{path:?} is not a block device or regular file")).into())
        }
    }

    fn acquire_lock_file(lock_path: PathBuf, mode: LockMode) -> Result<Self, Error> {
        loop {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .mode(0o600)
                .open(&lock_path)?;
            let lock = flock(file, mode)?;

            // The lock file is removed when the last exclusive holder lets go, so
            // a lock on a file that has since been unlinked guards nothing.
            let held = lock.metadata()?;
            match fs::metadata(&lock_path) {
                Ok(current) if current.dev() == held.dev() && current.ino() == held.ino() => {
                    debug!("acquired shared lock {lock_path:?}");
                    return Ok(Self { lock, path: lock_path });
                }
                Ok(_) => trace!("lock file {lock_path:?} was replaced, retrying"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    trace!("lock file {lock_path:?} was removed, retrying")
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// The file the lock is held on
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for HeaderLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeaderLock").field("path", &self.path).finish()
    }
}

impl Drop for HeaderLock {
    fn drop(&mut self) {
        debug!("releasing shared lock {:?}", self.path);
    }
}

fn flock(mut file: File, mode: LockMode) -> Result<Flock<File>, Error> {
    loop {
        let arg = match mode {
            LockMode::Blocking => FlockArg::LockShared,
            LockMode::NonBlocking => FlockArg::LockSharedNonblock,
        };

        match Flock::lock(file, arg) {
            Ok(lock) => return Ok(lock),
            Err((_, Errno::EAGAIN)) => return Err(Error::Locked),
            Err((f, Errno::EINTR)) => file = f,
            Err((_, errno)) => return Err(io::Error::from(errno).into()),
        }
    }
}
