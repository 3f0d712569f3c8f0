use k8s_openapi::api::core::v1::{Container, Volume};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::ValidationStatus;
use crate::params::ParameterSetting;

/// Which uploader resource a reference points at.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum UploaderKind {
    #[default]
    Uploader,
    ClusterUploader,
}

/// Reference to an uploader with the parameter values to run it with.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct UploaderRef {
    pub name: String,
    #[serde(default)]
    pub kind: UploaderKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<ParameterSetting>,
}

/// What runs during the scan stage and what happens with its output.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(group = "ocular.crashoverride.run", version = "v1beta1", kind = "Profile", namespaced)]
#[kube(status = "ValidationStatus", shortname = "prof")]
#[kube(printcolumn = r#"{"name":"Valid","type":"boolean","jsonPath":".status.valid"}"#)]
#[serde(rename_all = "camelCase")]
pub struct ProfileSpec {
    /// Scanners, run in parallel once the target is downloaded.
    pub containers: Vec<Container>,
    /// Result files handed to the uploaders; relative paths live under the results directory.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uploader_refs: Vec<UploaderRef>,
    /// Extra volumes made available to the scan containers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
}

impl ProfileSpec {
    /// A profile without artifacts or without uploaders only needs the scan stage.
    pub fn scan_job_only(&self) -> bool {
        self.artifacts.is_empty() || self.uploader_refs.is_empty()
    }
}
