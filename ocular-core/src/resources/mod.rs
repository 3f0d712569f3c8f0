//! Custom resources of the `ocular.crashoverride.run` API group.
use std::collections::BTreeMap;

use k8s_openapi::{
    apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition,
    apimachinery::pkg::apis::meta::v1::Condition,
};
use kube::CustomResourceExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

mod cron_search;
mod pipeline;
mod profile;
mod search;
mod templates;

pub use cron_search::{CronSearch, CronSearchSpec, CronSearchStatus, SearchTemplate};
pub use pipeline::{Pipeline, PipelineSpec, PipelineStatus, PipelineTemplate, ProfileRef, StageStatuses, Target};
pub use profile::{Profile, ProfileSpec, UploaderKind, UploaderRef};
pub use search::{SchedulerSpec, Search, SearchSpec, SearchStatus, DEFAULT_SCHEDULER_INTERVAL_SECONDS};
pub use templates::{
    ClusterCrawler, ClusterCrawlerSpec, ClusterDownloader, ClusterDownloaderSpec, ClusterUploader,
    ClusterUploaderSpec, ContainerTemplate, Crawler, CrawlerKind, CrawlerRef, CrawlerSpec, Downloader,
    DownloaderKind, DownloaderRef, DownloaderSpec, TemplateResource, Uploader, UploaderSpec,
};

pub const GROUP: &str = "ocular.crashoverride.run";
pub const VERSION: &str = "v1beta1";

/// Result of validating a template or profile.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ValidationStatus {
    /// `None` until the validation reconciler has looked at the object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Validation outcome as seen by a referencing object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Validity {
    Valid,
    Invalid,
    /// Not yet validated.
    Pending,
}

impl ValidationStatus {
    pub fn validity(status: Option<&Self>) -> Validity {
        match status.and_then(|s| s.valid) {
            Some(true) => Validity::Valid,
            Some(false) => Validity::Invalid,
            None => Validity::Pending,
        }
    }
}

/// The subset of object metadata a template may carry into the objects it creates.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TemplateMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generate_name: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// Definitions of every custom resource the operator serves.
pub fn crds() -> Vec<CustomResourceDefinition> {
    vec![
        Pipeline::crd(),
        Search::crd(),
        CronSearch::crd(),
        Profile::crd(),
        Downloader::crd(),
        ClusterDownloader::crd(),
        Uploader::crd(),
        ClusterUploader::crd(),
        Crawler::crd(),
        ClusterCrawler::crd(),
    ]
}
