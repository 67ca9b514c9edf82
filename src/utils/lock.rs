//! Advisory locks on output files
//!
//! Held while a pipeline writes a temporary file so two workers cannot
//! stream into the same path. The lock is released when the guard drops,
//! and by the OS if the process dies.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::logging::*;

const RETRY_DELAY: Duration = Duration::from_millis(50);

/// RAII advisory lock on a path
pub struct PathLock {
	path: PathBuf,
	#[allow(dead_code)]
	file: File,
}

impl PathLock {
	/// Wait until the lock on `path` is acquired; creates the file if needed
	///
	/// Never blocks the runtime thread: a held lock is polled with a sleep
	/// in between, so another task of the same runtime can release it.
	pub async fn acquire(path: &Path) -> io::Result<Self> {
		let mut logged = false;
		loop {
			if let Some(lock) = Self::try_acquire(path)? {
				return Ok(lock);
			}
			if !logged {
				debug!("Waiting for the lock on {}", path.display());
				logged = true;
			}
			tokio::time::sleep(RETRY_DELAY).await;
		}
	}

	/// Take the lock if it is free; `None` when someone else holds it
	pub fn try_acquire(path: &Path) -> io::Result<Option<Self>> {
		let file = OpenOptions::new().create(true).append(true).open(path)?;
		match lock_file(&file) {
			Ok(()) => {
				debug!("Locked {}", path.display());
				Ok(Some(PathLock { path: path.to_path_buf(), file }))
			}
			Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
			Err(e) => Err(e),
		}
	}

	pub fn path(&self) -> &Path {
		&self.path
	}
}

impl Drop for PathLock {
	fn drop(&mut self) {
		if let Err(e) = unlock_file(&self.file) {
			warn!("Cannot unlock {}: {}", self.path.display(), e);
		}
	}
}

#[cfg(unix)]
fn lock_file(file: &File) -> io::Result<()> {
	use std::os::unix::io::AsRawFd;
	// SAFETY: the descriptor is owned by `file` and valid for the call
	let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
	if ret == 0 {
		Ok(())
	} else {
		Err(io::Error::last_os_error())
	}
}

#[cfg(unix)]
fn unlock_file(file: &File) -> io::Result<()> {
	use std::os::unix::io::AsRawFd;
	// SAFETY: see lock_file
	let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
	if ret == 0 {
		Ok(())
	} else {
		Err(io::Error::last_os_error())
	}
}

#[cfg(not(unix))]
fn lock_file(_file: &File) -> io::Result<()> {
	Ok(())
}

#[cfg(not(unix))]
fn unlock_file(_file: &File) -> io::Result<()> {
	Ok(())
}


// vim: ts=4
