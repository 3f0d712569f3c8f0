use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{DownloaderRef, TemplateMetadata};
use crate::state::{PipelinePhase, PipelineReason, StageStatus};

/// The software a pipeline downloads and scans.
///
/// This is also the record format of the pipeline FIFO.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct Target {
    #[serde(default)]
    pub identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct ProfileRef {
    pub name: String,
}

/// One scan of one target.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(group = "ocular.crashoverride.run", version = "v1beta1", kind = "Pipeline", namespaced)]
#[kube(status = "PipelineStatus", shortname = "pl")]
#[kube(printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#)]
#[kube(printcolumn = r#"{"name":"Target","type":"string","jsonPath":".spec.target.identifier"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSpec {
    /// Overwritten by the scheduler when the pipeline comes from a template.
    #[serde(default)]
    pub target: Target,
    pub profile_ref: ProfileRef,
    pub downloader_ref: DownloaderRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_service_account_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_service_account_name: Option<String>,
    /// Delete the pipeline this many seconds after it finished. Kept forever when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds_after_finished: Option<i32>,
}

/// Progress of the individual stages.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct StageStatuses {
    #[serde(default)]
    pub download: StageStatus,
    #[serde(default)]
    pub scan: StageStatus,
    #[serde(default)]
    pub upload: StageStatus,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStatus {
    #[serde(default)]
    pub phase: PipelinePhase,
    /// Written as `null` once cleared, so a merge patch drops the stale value.
    #[serde(default)]
    pub reason: Option<PipelineReason>,
    #[serde(default)]
    pub stages: StageStatuses,
    /// Decided once from the profile, never re-evaluated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_job_only: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_job_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_job_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_service_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// A pipeline spec plus metadata, instantiated by the search scheduler.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct PipelineTemplate {
    #[serde(default)]
    pub metadata: TemplateMetadata,
    pub spec: PipelineSpec,
}

impl PipelineTemplate {
    /// The template's spec aimed at `target`; the template's own target is never used.
    pub fn spec_for(&self, target: Target) -> PipelineSpec {
        PipelineSpec {
            target,
            ..self.spec.clone()
        }
    }
}
