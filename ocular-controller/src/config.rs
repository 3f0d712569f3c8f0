//! Manager settings, read from the environment.
use std::net::SocketAddr;

use clap::{Parser, ValueEnum};

pub const DEFAULT_SIDECAR_IMAGE: &str = "ghcr.io/crashappsec/ocular-sidecar:latest";
pub const DEFAULT_SEARCH_CLUSTER_ROLE: &str = "ocular-search-scheduler";
pub const DEFAULT_PROBE_ADDR: &str = "0.0.0.0:8080";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Image of the sidecar injected into stage and search pods.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SidecarImage {
    pub image: String,
    pub pull_policy: String,
}

impl Default for SidecarImage {
    fn default() -> Self {
        Self {
            image: DEFAULT_SIDECAR_IMAGE.to_string(),
            pull_policy: "IfNotPresent".to_string(),
        }
    }
}

#[derive(Parser, Clone, Debug)]
#[command(name = "ocular-manager", version, about = "Runs the Ocular controllers")]
pub struct OperatorConfig {
    #[arg(long, env = "OCULAR_SIDECAR_IMAGE", default_value = DEFAULT_SIDECAR_IMAGE)]
    pub sidecar_image: String,

    #[arg(long, env = "OCULAR_SIDECAR_PULL_POLICY", default_value = "IfNotPresent")]
    pub sidecar_pull_policy: String,

    /// ClusterRole bound to every search's service account.
    #[arg(long, env = "OCULAR_SEARCH_CLUSTER_ROLE", default_value = DEFAULT_SEARCH_CLUSTER_ROLE)]
    pub search_cluster_role: String,

    /// Only watch this namespace; all namespaces when unset.
    #[arg(long, env = "OCULAR_WATCH_NAMESPACE")]
    pub namespace: Option<String>,

    /// Address serving `/metrics` and `/healthz`.
    #[arg(long, env = "OCULAR_PROBE_ADDR", default_value = DEFAULT_PROBE_ADDR)]
    pub probe_addr: SocketAddr,

    #[arg(long, env = "OCULAR_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl OperatorConfig {
    pub fn sidecar(&self) -> SidecarImage {
        SidecarImage {
            image: self.sidecar_image.clone(),
            pull_policy: self.sidecar_pull_policy.clone(),
        }
    }
}
