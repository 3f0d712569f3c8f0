//! Termination signal handling.
use std::{future::Future, io};

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Resolves once `listener` reports its signal. A listener that failed never resolves.
async fn fired(name: &'static str, listener: impl Future<Output = io::Result<()>>) {
    match listener.await {
        Ok(()) => info!(signal = name, "received termination signal"),
        Err(err) => {
            error!(%err, signal = name, "cannot listen for signal");
            std::future::pending::<()>().await;
        }
    }
}

/// A token cancelled on the first SIGTERM or SIGINT.
pub fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        let term = async {
            signal(SignalKind::terminate())?.recv().await;
            Ok::<_, io::Error>(())
        };
        tokio::select! {
            _ = fired("SIGTERM", term) => {}
            _ = fired("SIGINT", tokio::signal::ctrl_c()) => {}
        }
        cancel.cancel();
    });
    token
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn failed_listener_never_fires() {
        let broken = async { Err(io::Error::other("signal driver unavailable")) };
        let waited = tokio::time::timeout(Duration::from_secs(60), fired("SIGINT", broken)).await;
        assert!(waited.is_err());

        tokio::time::timeout(Duration::from_secs(1), fired("SIGTERM", async { Ok(()) }))
            .await
            .unwrap();
    }
}
