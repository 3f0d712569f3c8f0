//! Named pipes shared between the crawler and the scheduler.
use std::{os::unix::fs::FileTypeExt, path::Path, time::Duration};

use nix::{errno::Errno, sys::stat::Mode, unistd};
use tokio::net::unix::pipe;

use crate::error::{Error, Result};

/// Create a FIFO at `path`. An existing FIFO is reused.
pub fn create(path: &Path) -> Result<()> {
    let fifo_err = |source| Error::Fifo {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(fifo_err)?;
    }
    match unistd::mkfifo(path, Mode::from_bits_truncate(0o666)) {
        Ok(()) => Ok(()),
        Err(Errno::EEXIST) if is_fifo(path) => Ok(()),
        Err(errno) => Err(fifo_err(errno.into())),
    }
}

pub fn is_fifo(path: &Path) -> bool {
    std::fs::metadata(path).is_ok_and(|m| m.file_type().is_fifo())
}

/// Open the read end without waiting for a writer.
///
/// Holding the write side as well means the pipe never reports EOF when a writer
/// goes away; end of input is signalled by removing the path instead.
pub fn open(path: &Path) -> Result<pipe::Receiver> {
    pipe::OpenOptions::new()
        .read_write(true)
        .open_receiver(path)
        .map_err(Error::io(path))
}

/// Resolves once `path` no longer exists.
pub async fn removed(path: &Path, poll: Duration) {
    while tokio::fs::try_exists(path).await.unwrap_or(true) {
        tokio::time::sleep(poll).await;
    }
}
