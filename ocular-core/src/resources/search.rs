use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{CrawlerRef, PipelineTemplate};
use crate::state::{SearchPhase, SearchReason};

pub const DEFAULT_SCHEDULER_INTERVAL_SECONDS: u32 = 60;

fn default_interval() -> u32 {
    DEFAULT_SCHEDULER_INTERVAL_SECONDS
}

/// How the scheduler sidecar turns crawler output into pipelines.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerSpec {
    pub pipeline_template: PipelineTemplate,
    /// Seconds between two drain cycles of the scheduler.
    #[serde(default = "default_interval")]
    pub interval_seconds: u32,
}

/// Runs a crawler and schedules a pipeline for every target it reports.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(group = "ocular.crashoverride.run", version = "v1beta1", kind = "Search", namespaced)]
#[kube(status = "SearchStatus", shortname = "srch")]
#[kube(printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#)]
#[kube(printcolumn = r#"{"name":"Crawler","type":"string","jsonPath":".spec.crawlerRef.name"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
#[serde(rename_all = "camelCase")]
pub struct SearchSpec {
    pub crawler_ref: CrawlerRef,
    pub scheduler: SchedulerSpec,
    /// Run the search pod as this service account instead of a generated one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds_after_finished: Option<i32>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SearchStatus {
    #[serde(default)]
    pub phase: SearchPhase,
    /// Written as `null` once cleared, so a merge patch drops the stale value.
    #[serde(default)]
    pub reason: Option<SearchReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}
