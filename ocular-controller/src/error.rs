use thiserror::Error;

/// Errors a reconcile pass hands back to the controller's error policy.
///
/// Problems with a user's spec never show up here; they end in a status condition.
#[derive(Error, Debug)]
pub enum Error {
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    State(#[from] ocular_core::Error),

    #[error("object has no {0}")]
    MissingObjectKey(&'static str),

    #[error("failed to encode pipeline template: {0}")]
    EncodeTemplate(#[source] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Short label used for metrics.
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::Kube(_) => "kube",
            Error::State(_) => "state",
            Error::MissingObjectKey(_) => "missing_key",
            Error::EncodeTemplate(_) => "encode",
        }
    }
}

/// Whether `err` is the apiserver reporting a missing object.
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}

/// Whether `err` is the apiserver reporting a name clash on create.
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 409)
}
