use std::{convert::Infallible, io, time::Duration};

use bytes::Bytes;
use futures::TryStreamExt;
use http::{Method, Request, StatusCode};
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Empty, StreamBody};
use hyper::body::Frame;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use tokio_util::{io::ReaderStream, sync::CancellationToken};
use tracing::{debug, info, warn};

use super::{ARTIFACTS_PATH, COMPLETE_PATH};
use crate::error::{Error, Result};

type UploadBody = UnsyncBoxBody<Bytes, io::Error>;

const CONNECT_ATTEMPTS: u32 = 5;
const CONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Outcome of pushing the artifact list.
#[derive(Debug, Default)]
pub struct ExtractReport {
    pub delivered: Vec<String>,
    pub failed: Vec<String>,
}

/// Client side of the artifact hand-off.
pub struct Extractor {
    client: Client<HttpConnector, UploadBody>,
    base: String,
}

impl Extractor {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
            base: format!("http://{host}:{port}"),
        }
    }

    fn artifact_uri(&self, path: &str) -> String {
        let query = form_urlencoded::Serializer::new(String::new())
            .append_pair("path", path)
            .finish();
        format!("{}{ARTIFACTS_PATH}?{query}", self.base)
    }

    async fn send(&self, method: Method, uri: String, body: UploadBody) -> Result<StatusCode> {
        let req = Request::builder().method(method).uri(uri).body(body)?;
        let res = self.client.request(req).await?;
        Ok(res.status())
    }

    async fn push(&self, path: &str) -> Result<()> {
        let file = tokio::fs::File::open(path).await.map_err(Error::io(path))?;
        let body = StreamBody::new(ReaderStream::new(file).map_ok(Frame::data));
        let status = self
            .send(Method::PUT, self.artifact_uri(path), body.boxed_unsync())
            .await?;
        if status.is_success() {
            Ok(())
        } else {
            Err(Error::Rejected {
                path: path.to_string(),
                status,
            })
        }
    }

    /// Push one artifact, retrying while the receiver is unreachable.
    async fn push_with_retry(&self, path: &str) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.push(path).await {
                Err(Error::Connect(err)) if err.is_connect() && attempt < CONNECT_ATTEMPTS => {
                    debug!(%path, attempt, %err, "receiver unreachable, retrying");
                    attempt += 1;
                    tokio::time::sleep(CONNECT_BACKOFF).await;
                }
                res => return res,
            }
        }
    }

    async fn declare_complete(&self) {
        let body = Empty::<Bytes>::new()
            .map_err(|never: Infallible| -> io::Error { match never {} })
            .boxed_unsync();
        let uri = format!("{}{COMPLETE_PATH}", self.base);
        match self.send(Method::POST, uri, body).await {
            Ok(status) if status.is_success() => debug!("declared completion"),
            Ok(status) => warn!(%status, "receiver refused completion"),
            Err(err) => warn!(%err, "failed to declare completion"),
        }
    }

    /// Push every artifact in order. The receiver is told to stop waiting when any of
    /// them could not be delivered.
    pub async fn push_all(&self, files: &[String]) -> ExtractReport {
        let mut report = ExtractReport::default();
        for path in files {
            match self.push_with_retry(path).await {
                Ok(()) => {
                    info!(%path, "artifact delivered");
                    report.delivered.push(path.clone());
                }
                Err(err) => {
                    warn!(%path, %err, "artifact not delivered");
                    report.failed.push(path.clone());
                }
            }
        }
        if !report.failed.is_empty() {
            self.declare_complete().await;
        }
        report
    }

    /// Wait for the termination signal, then push everything.
    pub async fn run(&self, files: &[String], token: CancellationToken) -> Result<()> {
        info!(artifacts = files.len(), "waiting for the scanners to finish");
        token.cancelled().await;
        let report = self.push_all(files).await;
        if report.failed.is_empty() {
            Ok(())
        } else {
            Err(Error::Incomplete {
                failed: report.failed.len(),
                total: files.len(),
            })
        }
    }
}
