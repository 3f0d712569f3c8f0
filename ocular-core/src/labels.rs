//! Label keys and selectors for objects the operator creates.
use std::collections::BTreeMap;

use crate::naming;

pub const MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const MANAGER: &str = "ocular";

pub const PIPELINE: &str = "ocular.crashoverride.run/pipeline";
pub const SEARCH: &str = "ocular.crashoverride.run/search";
pub const CRON_SEARCH: &str = "ocular.crashoverride.run/cron-search";
pub const STAGE: &str = "ocular.crashoverride.run/stage";

/// Annotation on the search pod holding the JSON encoded pipeline template.
pub const PIPELINE_TEMPLATE_ANNOTATION: &str = "ocular.crashoverride.run/pipeline-template";

/// The batch workloads of a pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Scan,
    Upload,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Scan => "scan",
            Stage::Upload => "upload",
        }
    }
}

/// Labels identifying one stage of a pipeline; also used as the pod selector.
pub fn pipeline_stage(pipeline: &str, stage: Stage) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_BY.to_string(), MANAGER.to_string()),
        (PIPELINE.to_string(), naming::label_value(pipeline)),
        (STAGE.to_string(), stage.as_str().to_string()),
    ])
}

/// Labels identifying the pod and RBAC objects of a search.
pub fn search(search: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_BY.to_string(), MANAGER.to_string()),
        (SEARCH.to_string(), naming::label_value(search)),
    ])
}

/// Render labels as an equality-based label selector.
pub fn selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_selector_is_stable() {
        let sel = selector(&pipeline_stage("p1", Stage::Upload));
        assert_eq!(
            sel,
            "app.kubernetes.io/managed-by=ocular,ocular.crashoverride.run/pipeline=p1,ocular.crashoverride.run/stage=upload"
        );
    }

    #[test]
    fn long_parent_names_yield_valid_label_values() {
        let name = format!("{}-{}", "weekly-github-organisation-crawl", "x".repeat(46));
        assert_eq!(name.len(), 79);
        let stage = pipeline_stage(&name, Stage::Scan);
        assert!(stage[PIPELINE].len() <= naming::MAX_NAME_LEN);
        assert!(search(&name)[SEARCH].len() <= naming::MAX_NAME_LEN);
        assert_eq!(stage[PIPELINE], search(&name)[SEARCH]);
    }
}
