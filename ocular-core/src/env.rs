//! The environment contract between the operator and the containers it runs.
use k8s_openapi::api::core::v1::EnvVar;

pub const NAMESPACE: &str = "OCULAR_NAMESPACE";
pub const TARGET_IDENTIFIER: &str = "OCULAR_TARGET_IDENTIFIER";
pub const TARGET_VERSION: &str = "OCULAR_TARGET_VERSION";
pub const DOWNLOADER_NAME: &str = "OCULAR_DOWNLOADER_NAME";
pub const PROFILE_NAME: &str = "OCULAR_PROFILE_NAME";
pub const PIPELINE_NAME: &str = "OCULAR_PIPELINE_NAME";
pub const UPLOADER_NAME: &str = "OCULAR_UPLOADER_NAME";
pub const CRAWLER_NAME: &str = "OCULAR_CRAWLER_NAME";
pub const SEARCH_NAME: &str = "OCULAR_SEARCH_NAME";
pub const TARGET_DIR: &str = "OCULAR_TARGET_DIR";
pub const RESULTS_DIR: &str = "OCULAR_RESULTS_DIR";
pub const METADATA_DIR: &str = "OCULAR_METADATA_DIR";

pub const UPLOAD_HOST: &str = "OCULAR_UPLOAD_HOST";
pub const UPLOAD_PORT: &str = "OCULAR_UPLOAD_PORT";

pub const PIPELINE_TEMPLATE_PATH: &str = "OCULAR_PIPELINE_TEMPLATE_PATH";
pub const PIPELINE_FIFO: &str = "OCULAR_PIPELINE_FIFO";
pub const SEARCH_FIFO: &str = "OCULAR_SEARCH_FIFO";
pub const SCHEDULER_INTERVAL_SECONDS: &str = "OCULAR_SCHEDULER_INTERVAL_SECONDS";
pub const SCHEDULER_COMPLETE_PATH: &str = "OCULAR_SCHEDULER_COMPLETE_PATH";

/// Fixed locations inside stage and search pods.
pub mod paths {
    pub const TARGET_DIR: &str = "/mnt/target";
    pub const RESULTS_DIR: &str = "/mnt/results";
    pub const METADATA_DIR: &str = "/mnt/metadata";

    pub const TEMPLATE_DIR: &str = "/etc/ocular/template";
    pub const TEMPLATE_FILE: &str = "pipeline-template.json";
    pub const PIPELINE_TEMPLATE: &str = "/etc/ocular/template/pipeline-template.json";

    pub const FIFO_DIR: &str = "/mnt/fifo";
    pub const PIPELINE_FIFO: &str = "/mnt/fifo/pipelines";
    pub const SEARCH_FIFO: &str = "/mnt/fifo/searches";
    pub const SCHEDULER_COMPLETE: &str = "/mnt/fifo/scheduler-complete";
}

/// Port the receive sidecar listens on and the upload Service publishes.
pub const UPLOAD_PORT_NUMBER: u16 = 2121;

/// Literal environment variable.
pub fn var(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..EnvVar::default()
    }
}

/// Directory variables every stage container receives.
pub fn directories() -> Vec<EnvVar> {
    vec![
        var(TARGET_DIR, paths::TARGET_DIR),
        var(RESULTS_DIR, paths::RESULTS_DIR),
        var(METADATA_DIR, paths::METADATA_DIR),
    ]
}

/// Append `extra` to the container's environment, keeping entries it already declares
/// in front.
pub fn extend(container_env: &mut Option<Vec<EnvVar>>, extra: impl IntoIterator<Item = EnvVar>) {
    container_env.get_or_insert_with(Vec::new).extend(extra);
}
