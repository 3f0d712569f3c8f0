//! The pod running a crawler next to the scheduler sidecar, and its RBAC objects.
use std::collections::BTreeMap;

use k8s_openapi::api::{
    core::v1::{
        Container, DownwardAPIVolumeFile, DownwardAPIVolumeSource, EmptyDirVolumeSource, EnvVar, ExecAction,
        ObjectFieldSelector, Pod, PodSpec, Probe, ServiceAccount, Volume, VolumeMount,
    },
    rbac::v1::{RoleBinding, RoleRef, Subject},
};
use kube::{api::ObjectMeta, ResourceExt};
use ocular_core::{
    env::{self, paths},
    labels, naming,
    resources::Search,
};

use crate::{config::SidecarImage, resolve::ResolvedTemplate};

pub const SCHEDULER_CONTAINER: &str = "scheduler";
pub const SCHEDULER_INIT_CONTAINER: &str = "scheduler-init";
pub const CRAWLER_CONTAINER: &str = "crawler";
pub const KEEPALIVE_CONTAINER: &str = "scheduler-keepalive";

const TEMPLATE_VOLUME: &str = "pipeline-template";
const FIFO_VOLUME: &str = "fifo";

/// Name shared by the generated ServiceAccount and the RoleBinding of a search.
pub fn rbac_name(search: &str) -> String {
    naming::child_name(search, "search")
}

/// Service account the search pod runs as.
pub fn service_account_name(search: &Search) -> String {
    search
        .spec
        .service_account_name
        .clone()
        .unwrap_or_else(|| rbac_name(&search.name_any()))
}

pub fn service_account(search: &Search, namespace: &str) -> ServiceAccount {
    ServiceAccount {
        metadata: ObjectMeta {
            name: Some(rbac_name(&search.name_any())),
            namespace: Some(namespace.to_string()),
            labels: Some(labels::search(&search.name_any())),
            ..ObjectMeta::default()
        },
        ..ServiceAccount::default()
    }
}

/// Grants the search's service account the right to create pipelines and searches.
pub fn role_binding(search: &Search, namespace: &str, cluster_role: &str) -> RoleBinding {
    RoleBinding {
        metadata: ObjectMeta {
            name: Some(rbac_name(&search.name_any())),
            namespace: Some(namespace.to_string()),
            labels: Some(labels::search(&search.name_any())),
            ..ObjectMeta::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: cluster_role.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: service_account_name(search),
            namespace: Some(namespace.to_string()),
            ..Subject::default()
        }]),
    }
}

/// Inputs for rendering the search pod.
pub struct SearchPod<'a> {
    pub search: &'a Search,
    pub namespace: &'a str,
    pub crawler: &'a ResolvedTemplate,
    pub crawler_env: Vec<EnvVar>,
    pub sidecar: &'a SidecarImage,
    /// JSON encoded pipeline template, exposed to the scheduler through the downward API.
    pub pipeline_template: String,
}

impl SearchPod<'_> {
    /// Identity and FIFO locations shared by the crawler and the scheduler sidecars.
    pub fn base_env(&self) -> Vec<EnvVar> {
        vec![
            env::var(env::SEARCH_NAME, self.search.name_any()),
            env::var(env::CRAWLER_NAME, self.crawler.name.clone()),
            env::var(env::NAMESPACE, self.namespace),
            env::var(env::PIPELINE_TEMPLATE_PATH, paths::PIPELINE_TEMPLATE),
            env::var(env::PIPELINE_FIFO, paths::PIPELINE_FIFO),
            env::var(env::SEARCH_FIFO, paths::SEARCH_FIFO),
            env::var(
                env::SCHEDULER_INTERVAL_SECONDS,
                self.search.spec.scheduler.interval_seconds.to_string(),
            ),
            env::var(env::SCHEDULER_COMPLETE_PATH, paths::SCHEDULER_COMPLETE),
        ]
    }

    fn fifo_mount() -> VolumeMount {
        VolumeMount {
            name: FIFO_VOLUME.to_string(),
            mount_path: paths::FIFO_DIR.to_string(),
            ..VolumeMount::default()
        }
    }

    fn sidecar_container(&self, name: &str, mode: &str) -> Container {
        Container {
            name: name.to_string(),
            image: Some(self.sidecar.image.clone()),
            image_pull_policy: Some(self.sidecar.pull_policy.clone()),
            args: Some(vec![mode.to_string()]),
            env: Some(self.base_env()),
            volume_mounts: Some(vec![Self::fifo_mount()]),
            ..Container::default()
        }
    }

    fn volumes() -> Vec<Volume> {
        let annotation_path = format!("metadata.annotations['{}']", labels::PIPELINE_TEMPLATE_ANNOTATION);
        vec![
            Volume {
                name: TEMPLATE_VOLUME.to_string(),
                downward_api: Some(DownwardAPIVolumeSource {
                    items: Some(vec![DownwardAPIVolumeFile {
                        path: paths::TEMPLATE_FILE.to_string(),
                        field_ref: Some(ObjectFieldSelector {
                            field_path: annotation_path,
                            ..ObjectFieldSelector::default()
                        }),
                        ..DownwardAPIVolumeFile::default()
                    }]),
                    ..DownwardAPIVolumeSource::default()
                }),
                ..Volume::default()
            },
            Volume {
                name: FIFO_VOLUME.to_string(),
                empty_dir: Some(EmptyDirVolumeSource {
                    medium: Some("Memory".to_string()),
                    ..EmptyDirVolumeSource::default()
                }),
                ..Volume::default()
            },
        ]
    }

    pub fn pod(&self) -> Pod {
        let mut scheduler = self.sidecar_container(SCHEDULER_CONTAINER, "scheduler");
        scheduler.restart_policy = Some("Always".to_string());
        scheduler.volume_mounts.get_or_insert_with(Vec::new).push(VolumeMount {
            name: TEMPLATE_VOLUME.to_string(),
            mount_path: paths::TEMPLATE_DIR.to_string(),
            read_only: Some(true),
            ..VolumeMount::default()
        });
        scheduler.startup_probe = Some(Probe {
            exec: Some(ExecAction {
                command: Some(vec!["ocular-sidecar".to_string(), "scheduler-ready".to_string()]),
            }),
            period_seconds: Some(1),
            failure_threshold: Some(30),
            ..Probe::default()
        });

        let init = self.sidecar_container(SCHEDULER_INIT_CONTAINER, "scheduler-init");

        let mut crawler = self.crawler.container.clone();
        crawler.name = CRAWLER_CONTAINER.to_string();
        env::extend(&mut crawler.env, self.base_env());
        env::extend(&mut crawler.env, self.crawler_env.iter().cloned());
        crawler.volume_mounts.get_or_insert_with(Vec::new).push(Self::fifo_mount());

        let keepalive = self.sidecar_container(KEEPALIVE_CONTAINER, "scheduler-keepalive");

        let search = self.search.name_any();
        Pod {
            metadata: ObjectMeta {
                generate_name: Some(naming::generate_name(&search)),
                namespace: Some(self.namespace.to_string()),
                labels: Some(labels::search(&search)),
                annotations: Some(BTreeMap::from([(
                    labels::PIPELINE_TEMPLATE_ANNOTATION.to_string(),
                    self.pipeline_template.clone(),
                )])),
                ..ObjectMeta::default()
            },
            spec: Some(PodSpec {
                init_containers: Some(vec![scheduler, init, crawler]),
                containers: vec![keepalive],
                volumes: Some(Self::volumes()),
                restart_policy: Some("Never".to_string()),
                service_account_name: Some(service_account_name(self.search)),
                ..PodSpec::default()
            }),
            ..Pod::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocular_core::resources::{CrawlerRef, SchedulerSpec, SearchSpec, Validity};

    fn search(sa: Option<&str>) -> Search {
        Search::new(
            "weekly",
            SearchSpec {
                crawler_ref: CrawlerRef {
                    name: "github".into(),
                    ..Default::default()
                },
                scheduler: SchedulerSpec {
                    interval_seconds: 15,
                    ..Default::default()
                },
                service_account_name: sa.map(Into::into),
                ttl_seconds_after_finished: None,
            },
        )
    }

    #[test]
    fn pod_layout() {
        let s = search(None);
        let crawler = ResolvedTemplate {
            kind: "Crawler".into(),
            name: "github".into(),
            container: Container {
                name: "whatever".into(),
                image: Some("crawler:1".into()),
                ..Default::default()
            },
            parameters: Vec::new(),
            validity: Validity::Valid,
        };
        let sidecar = SidecarImage::default();
        let pod = SearchPod {
            search: &s,
            namespace: "ns",
            crawler: &crawler,
            crawler_env: vec![env::var("OCULAR_PARAM_ORG", "crashappsec")],
            sidecar: &sidecar,
            pipeline_template: "{}".into(),
        }
        .pod();

        assert_eq!(pod.metadata.generate_name.as_deref(), Some("weekly-"));
        assert_eq!(
            pod.metadata.annotations.as_ref().unwrap()[labels::PIPELINE_TEMPLATE_ANNOTATION],
            "{}"
        );
        let spec = pod.spec.unwrap();
        let init: Vec<&str> = spec.init_containers.as_ref().unwrap().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(init, [SCHEDULER_CONTAINER, SCHEDULER_INIT_CONTAINER, CRAWLER_CONTAINER]);
        let inits = spec.init_containers.unwrap();
        assert_eq!(inits[0].restart_policy.as_deref(), Some("Always"));
        assert!(inits[1].restart_policy.is_none());
        let crawler_env = inits[2].env.as_ref().unwrap();
        assert!(crawler_env.iter().any(|e| e.name == env::SCHEDULER_INTERVAL_SECONDS && e.value.as_deref() == Some("15")));
        assert!(crawler_env.iter().any(|e| e.name == "OCULAR_PARAM_ORG"));
        assert_eq!(spec.containers[0].args.as_deref().unwrap(), ["scheduler-keepalive"]);
        assert_eq!(spec.service_account_name.as_deref(), Some("weekly-search"));

        let fifo = spec.volumes.unwrap().into_iter().find(|v| v.name == FIFO_VOLUME).unwrap();
        assert_eq!(fifo.empty_dir.unwrap().medium.as_deref(), Some("Memory"));
    }

    #[test]
    fn role_binding_targets_effective_service_account() {
        let rb = role_binding(&search(Some("custom")), "ns", "scheduler-role");
        assert_eq!(rb.metadata.name.as_deref(), Some("weekly-search"));
        assert_eq!(rb.role_ref.name, "scheduler-role");
        assert_eq!(rb.subjects.unwrap()[0].name, "custom");
    }
}
