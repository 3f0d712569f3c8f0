use std::{net::SocketAddr, path::PathBuf};

use thiserror::Error;

/// Everything that makes a sidecar mode exit non-zero.
#[derive(Error, Debug)]
pub enum Error {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("receiver failed: {0}")]
    Serve(#[source] std::io::Error),

    #[error("{failed} of {total} artifacts were not delivered")]
    Incomplete { failed: usize, total: usize },

    #[error("invalid upload request: {0}")]
    Request(#[from] http::Error),

    #[error("upload connection failed: {0}")]
    Connect(#[from] hyper_util::client::legacy::Error),

    #[error("receiver rejected {path} with {status}")]
    Rejected { path: String, status: http::StatusCode },

    #[error("invalid pipeline template {path}: {source}")]
    Template {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to create fifo {path}: {source}")]
    Fifo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} does not exist yet")]
    NotReady(PathBuf),

    #[error("failed to read {kind} records: {source}")]
    Pump {
        kind: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Error::Io { path, source }
    }
}
