//! Filesystem polling that gates search pod startup and shutdown.
//!
//! The scheduler creates both FIFOs before the crawler may start; the keepalive
//! container removes them once the crawler exited and then waits for the marker
//! the scheduler writes after it drained everything.
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    cli::{FifoArgs, KeepaliveArgs},
    error::{Error, Result},
};

const POLL: Duration = Duration::from_millis(250);

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

async fn first_missing(paths: &[&PathBuf]) -> Option<PathBuf> {
    for path in paths {
        if !exists(path).await {
            return Some(path.to_path_buf());
        }
    }
    None
}

/// Succeeds when both FIFOs exist.
pub async fn ready(fifos: &FifoArgs) -> Result<()> {
    match first_missing(&fifos.paths()).await {
        Some(path) => Err(Error::NotReady(path)),
        None => Ok(()),
    }
}

/// Wait until both FIFOs exist, or until cancelled.
pub async fn init(fifos: &FifoArgs, token: CancellationToken) -> Result<()> {
    loop {
        let Some(missing) = first_missing(&fifos.paths()).await else {
            info!("scheduler fifos are in place");
            return Ok(());
        };
        debug!(path = %missing.display(), "waiting for fifo");
        tokio::select! {
            _ = token.cancelled() => return Err(Error::NotReady(missing)),
            _ = tokio::time::sleep(POLL) => {}
        }
    }
}

/// Remove both FIFOs, then wait for the scheduler's completion marker.
///
/// Cancellation stops the wait early; the pod is being torn down anyway.
pub async fn keepalive(args: &KeepaliveArgs, token: CancellationToken) -> Result<()> {
    for path in args.fifos.paths() {
        match tokio::fs::remove_file(path).await {
            Ok(()) => debug!(path = %path.display(), "removed fifo"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(Error::io(path)(err)),
        }
    }
    info!("crawler output closed, waiting for the scheduler to drain");
    loop {
        if exists(&args.complete_path).await {
            info!("scheduler drained");
            return Ok(());
        }
        tokio::select! {
            _ = token.cancelled() => {
                warn!("terminated before the scheduler finished");
                return Ok(());
            }
            _ = tokio::time::sleep(POLL) => {}
        }
    }
}
