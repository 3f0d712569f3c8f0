use std::{
    collections::BTreeSet,
    io,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};

use axum::{
    body::Body,
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post, put},
    Router,
};
use futures::TryStreamExt;
use serde::Deserialize;
use tokio::{io::AsyncWriteExt, net::TcpListener, sync::Mutex};
use tokio_util::{io::StreamReader, sync::CancellationToken};
use tracing::{debug, info, warn};

use super::{ARTIFACTS_PATH, COMPLETE_PATH, HEALTH_PATH};
use crate::error::{Error, Result};

/// What the receiver got before it stopped.
#[derive(Debug, Default)]
pub struct ReceiveReport {
    pub received: Vec<String>,
    pub missing: Vec<String>,
}

struct Inbox {
    root: PathBuf,
    expected: BTreeSet<String>,
    received: Mutex<BTreeSet<String>>,
    done: CancellationToken,
}

impl Inbox {
    fn destination(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    async fn write(&self, path: &str, body: Body) -> io::Result<u64> {
        let dest = self.destination(path);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(&dest).await?;
        let mut reader = StreamReader::new(body.into_data_stream().map_err(io::Error::other));
        let written = tokio::io::copy(&mut reader, &mut file).await?;
        file.flush().await?;
        Ok(written)
    }
}

#[derive(Deserialize)]
struct ArtifactQuery {
    path: Option<String>,
}

async fn put_artifact(
    State(inbox): State<Arc<Inbox>>,
    Query(query): Query<ArtifactQuery>,
    body: Body,
) -> (StatusCode, String) {
    let Some(path) = query.path.filter(|p| !p.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "missing path".into());
    };
    if !inbox.expected.contains(&path) {
        warn!(%path, "rejecting unexpected artifact");
        return (StatusCode::NOT_FOUND, format!("{path} is not an expected artifact"));
    }
    match inbox.write(&path, body).await {
        Ok(bytes) => {
            info!(%path, bytes, "artifact received");
            let mut received = inbox.received.lock().await;
            received.insert(path);
            if received.len() == inbox.expected.len() {
                inbox.done.cancel();
            }
            (StatusCode::CREATED, String::new())
        }
        Err(err) => {
            warn!(%path, %err, "failed to store artifact");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

async fn complete(State(inbox): State<Arc<Inbox>>) -> StatusCode {
    info!("sender declared completion");
    inbox.done.cancel();
    StatusCode::OK
}

/// HTTP endpoint accepting one upload per expected artifact.
pub struct Receiver {
    listener: TcpListener,
    root: PathBuf,
    expected: BTreeSet<String>,
}

impl Receiver {
    pub async fn bind(addr: SocketAddr, root: &Path, files: Vec<String>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| Error::Bind { addr, source })?;
        Ok(Self {
            listener,
            root: root.to_path_buf(),
            expected: files.into_iter().collect(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(Error::Serve)
    }

    /// Serve until every artifact arrived, the sender declared completion or `token`
    /// is cancelled.
    pub async fn run(self, token: CancellationToken) -> Result<ReceiveReport> {
        let done = token.child_token();
        if self.expected.is_empty() {
            debug!("no artifacts expected");
            done.cancel();
        }
        let inbox = Arc::new(Inbox {
            root: self.root,
            expected: self.expected,
            received: Mutex::new(BTreeSet::new()),
            done: done.clone(),
        });
        let app = Router::new()
            .route(ARTIFACTS_PATH, put(put_artifact))
            .route(COMPLETE_PATH, post(complete))
            .route(HEALTH_PATH, get(|| async { "ok" }))
            .with_state(inbox.clone());

        info!(addr = ?self.listener.local_addr().ok(), expected = inbox.expected.len(), "receiving artifacts");
        axum::serve(self.listener, app)
            .with_graceful_shutdown(async move { done.cancelled().await })
            .await
            .map_err(Error::Serve)?;

        let received = inbox.received.lock().await.clone();
        let missing: Vec<String> = inbox.expected.difference(&received).cloned().collect();
        if !missing.is_empty() {
            warn!(?missing, "stopped before every artifact arrived");
        }
        Ok(ReceiveReport {
            received: received.into_iter().collect(),
            missing,
        })
    }
}
