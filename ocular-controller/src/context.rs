use std::sync::Arc;

use kube::Client;

use crate::{
    config::{OperatorConfig, SidecarImage, DEFAULT_SEARCH_CLUSTER_ROLE},
    metrics::Metrics,
};

/// State shared by every reconcile call.
#[derive(Clone)]
pub struct Context {
    pub client: Client,
    pub sidecar: SidecarImage,
    /// ClusterRole bound to search service accounts.
    pub search_cluster_role: String,
    pub metrics: Arc<Metrics>,
}

impl Context {
    pub fn new(client: Client, config: &OperatorConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            client,
            sidecar: config.sidecar(),
            search_cluster_role: config.search_cluster_role.clone(),
            metrics,
        }
    }

    /// A context with default settings and fresh metrics.
    pub fn with_defaults(client: Client) -> Self {
        Self {
            client,
            sidecar: SidecarImage::default(),
            search_cluster_role: DEFAULT_SEARCH_CLUSTER_ROLE.to_string(),
            metrics: Arc::default(),
        }
    }
}
