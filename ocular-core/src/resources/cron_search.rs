use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{SearchSpec, TemplateMetadata};

/// Spec and metadata of the searches a [`CronSearch`] creates.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct SearchTemplate {
    #[serde(default)]
    pub metadata: TemplateMetadata,
    pub spec: SearchSpec,
}

/// Creates a [`Search`](super::Search) on a schedule.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(group = "ocular.crashoverride.run", version = "v1beta1", kind = "CronSearch", namespaced)]
#[kube(status = "CronSearchStatus", shortname = "csrch")]
#[kube(printcolumn = r#"{"name":"Schedule","type":"string","jsonPath":".spec.schedule"}"#)]
#[kube(printcolumn = r#"{"name":"Last","type":"date","jsonPath":".status.lastScheduleTime"}"#)]
#[serde(rename_all = "camelCase")]
pub struct CronSearchSpec {
    /// Five field cron expression, evaluated in UTC.
    pub schedule: String,
    pub search_template: SearchTemplate,
    #[serde(default)]
    pub suspend: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CronSearchStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_schedule_time: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_search_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}
