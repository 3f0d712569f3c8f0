//! The Jobs and Service making up the stages of a pipeline.
use std::collections::BTreeSet;

use k8s_openapi::{
    api::{
        batch::v1::{Job, JobSpec},
        core::v1::{
            Container, ContainerPort, EmptyDirVolumeSource, EnvVar, PodSpec, PodTemplateSpec, Service,
            ServicePort, ServiceSpec, Volume, VolumeMount,
        },
    },
    apimachinery::pkg::util::intstr::IntOrString,
};
use kube::{api::ObjectMeta, ResourceExt};
use ocular_core::{
    env::{self, paths, UPLOAD_PORT_NUMBER},
    labels::{self, Stage},
    naming,
    resources::{Pipeline, ProfileSpec},
};

use crate::{config::SidecarImage, resolve::ResolvedTemplate};

pub const DOWNLOADER_CONTAINER: &str = "downloader";
pub const EXTRACTOR_CONTAINER: &str = "extractor";
pub const RECEIVER_CONTAINER: &str = "receiver";
const TRANSFER_PORT_NAME: &str = "transfer";

pub fn scan_job_name(pipeline: &str) -> String {
    naming::child_name(pipeline, "scan")
}

/// Name of the upload Job and of the Service in front of its receiver.
pub fn upload_name(pipeline: &str) -> String {
    naming::child_name(pipeline, "upload")
}

/// Lexically clean a slash separated path: collapse repeated separators, drop `.`
/// elements and resolve `..` against the preceding element.
pub fn clean_path(path: &str) -> String {
    let rooted = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|p| *p != "..") {
                    parts.pop();
                } else if !rooted {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    if rooted {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Where an artifact lives inside stage pods. Relative paths are taken from the
/// results directory.
pub fn artifact_path(artifact: &str) -> String {
    if artifact.starts_with('/') {
        clean_path(artifact)
    } else {
        clean_path(&format!("{}/{artifact}", paths::RESULTS_DIR))
    }
}

/// Trailing arguments naming every artifact, always led by `--`.
pub fn artifact_args(artifacts: &[String]) -> Vec<String> {
    std::iter::once("--".to_string())
        .chain(artifacts.iter().map(|a| artifact_path(a)))
        .collect()
}

const VOLUMES: [(&str, &str); 3] = [
    ("target", paths::TARGET_DIR),
    ("results", paths::RESULTS_DIR),
    ("metadata", paths::METADATA_DIR),
];

fn stage_volumes() -> Vec<Volume> {
    VOLUMES
        .iter()
        .map(|(name, _)| Volume {
            name: (*name).to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Volume::default()
        })
        .collect()
}

fn mount_stage_volumes(container: &mut Container) {
    let mounts = container.volume_mounts.get_or_insert_with(Vec::new);
    for (name, path) in VOLUMES {
        mounts.push(VolumeMount {
            name: name.to_string(),
            mount_path: path.to_string(),
            ..VolumeMount::default()
        });
    }
}

/// Container names within a pod have to be unique; repeat offenders get a numeric suffix.
fn unique_name(used: &mut BTreeSet<String>, base: &str) -> String {
    let base = base.replace('.', "-");
    let mut name = base.clone();
    let mut n = 1;
    while !used.insert(name.clone()) {
        n += 1;
        name = format!("{base}-{n}");
    }
    name
}

/// An uploader together with the parameter values the profile supplies for it.
pub struct ResolvedUploader {
    pub template: ResolvedTemplate,
    pub parameter_env: Vec<EnvVar>,
}

/// Everything needed to render the stage workloads of one pipeline.
pub struct Workloads<'a> {
    pub pipeline: &'a Pipeline,
    pub namespace: &'a str,
    pub profile_name: &'a str,
    pub profile: &'a ProfileSpec,
    pub downloader: &'a ResolvedTemplate,
    pub downloader_env: Vec<EnvVar>,
    pub uploaders: Vec<ResolvedUploader>,
    pub sidecar: &'a SidecarImage,
}

impl Workloads<'_> {
    fn name(&self) -> String {
        self.pipeline.name_any()
    }

    /// Environment shared by every container of every stage.
    pub fn stage_env(&self) -> Vec<EnvVar> {
        let target = &self.pipeline.spec.target;
        let mut vars = vec![
            env::var(env::NAMESPACE, self.namespace),
            env::var(env::PIPELINE_NAME, self.name()),
            env::var(env::TARGET_IDENTIFIER, target.identifier.clone()),
            env::var(env::TARGET_VERSION, target.version.clone().unwrap_or_default()),
            env::var(env::DOWNLOADER_NAME, self.downloader.name.clone()),
            env::var(env::PROFILE_NAME, self.profile_name),
        ];
        vars.extend(env::directories());
        vars
    }

    fn upload_host(&self) -> String {
        format!("{}.{}.svc", upload_name(&self.name()), self.namespace)
    }

    fn sidecar_container(&self, name: &str, args: Vec<String>) -> Container {
        let mut container = Container {
            name: name.to_string(),
            image: Some(self.sidecar.image.clone()),
            image_pull_policy: Some(self.sidecar.pull_policy.clone()),
            args: Some(args),
            env: Some(self.stage_env()),
            ..Container::default()
        };
        mount_stage_volumes(&mut container);
        container
    }

    /// A user supplied container wired into the stage: shared environment first,
    /// then `extra`, plus the stage volumes.
    fn stage_container(&self, mut container: Container, extra: Vec<EnvVar>) -> Container {
        env::extend(&mut container.env, self.stage_env());
        env::extend(&mut container.env, extra);
        mount_stage_volumes(&mut container);
        container
    }

    fn job(&self, name: String, stage: Stage, pod: PodSpec) -> Job {
        let labels = labels::pipeline_stage(&self.name(), stage);
        Job {
            metadata: ObjectMeta {
                name: Some(name),
                namespace: Some(self.namespace.to_string()),
                labels: Some(labels.clone()),
                ..ObjectMeta::default()
            },
            spec: Some(JobSpec {
                backoff_limit: Some(0),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..ObjectMeta::default()
                    }),
                    spec: Some(pod),
                },
                ..JobSpec::default()
            }),
            ..Job::default()
        }
    }

    /// Downloader, then the extractor as a native sidecar, then the profile's scanners.
    pub fn scan_job(&self, scan_job_only: bool) -> Job {
        let mut downloader = self.downloader.container.clone();
        downloader.name = DOWNLOADER_CONTAINER.to_string();
        downloader.working_dir.get_or_insert_with(|| paths::TARGET_DIR.to_string());
        let downloader = self.stage_container(downloader, self.downloader_env.clone());

        let mut extractor = if scan_job_only {
            self.sidecar_container(EXTRACTOR_CONTAINER, vec!["ignore".to_string()])
        } else {
            let mut args = vec!["extract".to_string()];
            args.extend(artifact_args(&self.profile.artifacts));
            let mut c = self.sidecar_container(EXTRACTOR_CONTAINER, args);
            env::extend(
                &mut c.env,
                [
                    env::var(env::UPLOAD_HOST, self.upload_host()),
                    env::var(env::UPLOAD_PORT, UPLOAD_PORT_NUMBER.to_string()),
                ],
            );
            c
        };
        extractor.restart_policy = Some("Always".to_string());

        let scanners = self
            .profile
            .containers
            .iter()
            .cloned()
            .map(|mut c| {
                c.working_dir.get_or_insert_with(|| paths::TARGET_DIR.to_string());
                self.stage_container(c, Vec::new())
            })
            .collect();

        let mut volumes = stage_volumes();
        volumes.extend(self.profile.volumes.iter().cloned());

        let pod = PodSpec {
            init_containers: Some(vec![downloader, extractor]),
            containers: scanners,
            volumes: Some(volumes),
            restart_policy: Some("Never".to_string()),
            service_account_name: self.pipeline.spec.scan_service_account_name.clone(),
            ..PodSpec::default()
        };
        self.job(scan_job_name(&self.name()), Stage::Scan, pod)
    }

    /// The receiver as init container, then every uploader with the artifact list.
    pub fn upload_job(&self) -> Job {
        let mut args = vec!["receive".to_string()];
        args.extend(artifact_args(&self.profile.artifacts));
        let mut receiver = self.sidecar_container(RECEIVER_CONTAINER, args);
        receiver.ports = Some(vec![ContainerPort {
            name: Some(TRANSFER_PORT_NAME.to_string()),
            container_port: i32::from(UPLOAD_PORT_NUMBER),
            ..ContainerPort::default()
        }]);

        let mut used = BTreeSet::from([RECEIVER_CONTAINER.to_string()]);
        let uploaders = self
            .uploaders
            .iter()
            .map(|u| {
                let mut c = u.template.container.clone();
                c.name = unique_name(&mut used, &u.template.name);
                c.args
                    .get_or_insert_with(Vec::new)
                    .extend(artifact_args(&self.profile.artifacts));
                c.working_dir.get_or_insert_with(|| paths::RESULTS_DIR.to_string());
                let mut extra = vec![env::var(env::UPLOADER_NAME, u.template.name.clone())];
                extra.extend(u.parameter_env.iter().cloned());
                self.stage_container(c, extra)
            })
            .collect();

        let pod = PodSpec {
            init_containers: Some(vec![receiver]),
            containers: uploaders,
            volumes: Some(stage_volumes()),
            restart_policy: Some("Never".to_string()),
            service_account_name: self.pipeline.spec.upload_service_account_name.clone(),
            ..PodSpec::default()
        };
        self.job(upload_name(&self.name()), Stage::Upload, pod)
    }

    /// Routes the extractor to the receiver, including while the upload pod is not ready.
    pub fn upload_service(&self) -> Service {
        let selector = labels::pipeline_stage(&self.name(), Stage::Upload);
        Service {
            metadata: ObjectMeta {
                name: Some(upload_name(&self.name())),
                namespace: Some(self.namespace.to_string()),
                labels: Some(selector.clone()),
                ..ObjectMeta::default()
            },
            spec: Some(ServiceSpec {
                selector: Some(selector),
                publish_not_ready_addresses: Some(true),
                ports: Some(vec![ServicePort {
                    name: Some(TRANSFER_PORT_NAME.to_string()),
                    port: i32::from(UPLOAD_PORT_NUMBER),
                    target_port: Some(IntOrString::Int(i32::from(UPLOAD_PORT_NUMBER))),
                    protocol: Some("TCP".to_string()),
                    ..ServicePort::default()
                }]),
                ..ServiceSpec::default()
            }),
            ..Service::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocular_core::{
        params::parameter_env_name,
        resources::{DownloaderRef, PipelineSpec, ProfileRef, Target, UploaderRef, Validity},
    };

    fn pipeline() -> Pipeline {
        let mut p = Pipeline::new(
            "nightly",
            PipelineSpec {
                target: Target {
                    identifier: "github.com/org/repo".into(),
                    version: Some("main".into()),
                },
                profile_ref: ProfileRef { name: "semgrep".into() },
                downloader_ref: DownloaderRef {
                    name: "git".into(),
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        p.metadata.namespace = Some("scans".into());
        p
    }

    fn template(name: &str, container: &str) -> ResolvedTemplate {
        ResolvedTemplate {
            kind: "Uploader".into(),
            name: name.into(),
            container: Container {
                name: container.into(),
                image: Some(format!("{container}:latest")),
                args: Some(vec!["--verbose".into()]),
                ..Default::default()
            },
            parameters: Vec::new(),
            validity: Validity::Valid,
        }
    }

    fn profile() -> ProfileSpec {
        ProfileSpec {
            containers: vec![Container {
                name: "semgrep".into(),
                ..Default::default()
            }],
            artifacts: vec!["out/report.json".into(), "/mnt/metadata/./sbom.json".into()],
            uploader_refs: vec![UploaderRef {
                name: "s3".into(),
                ..Default::default()
            }],
            volumes: Vec::new(),
        }
    }

    fn pod(job: &Job) -> &PodSpec {
        job.spec.as_ref().unwrap().template.spec.as_ref().unwrap()
    }

    fn env_value<'a>(c: &'a Container, name: &str) -> Option<&'a str> {
        c.env.as_ref()?.iter().find(|e| e.name == name)?.value.as_deref()
    }

    #[test]
    fn paths_are_cleaned() {
        assert_eq!(clean_path("/a//b/./c/../d"), "/a/b/d");
        assert_eq!(clean_path("a/../../b"), "../b");
        assert_eq!(clean_path("/../x"), "/x");
        assert_eq!(clean_path(""), ".");
        assert_eq!(artifact_path("report.json"), "/mnt/results/report.json");
        assert_eq!(artifact_path("../metadata/x"), "/mnt/metadata/x");
        assert_eq!(
            artifact_args(&["a".into(), "/b".into()]),
            vec!["--", "/mnt/results/a", "/b"]
        );
        assert_eq!(artifact_args(&[]), vec!["--"]);
    }

    #[test]
    fn scan_job_wires_downloader_extractor_and_scanners() {
        let p = pipeline();
        let profile = profile();
        let downloader = template("git", "git-clone");
        let sidecar = SidecarImage::default();
        let w = Workloads {
            pipeline: &p,
            namespace: "scans",
            profile_name: "semgrep",
            profile: &profile,
            downloader: &downloader,
            downloader_env: vec![env::var(&parameter_env_name("depth"), "1")],
            uploaders: Vec::new(),
            sidecar: &sidecar,
        };

        let job = w.scan_job(false);
        assert_eq!(job.metadata.name.as_deref(), Some("nightly-scan"));
        let scan_pod = pod(&job);
        let init = scan_pod.init_containers.as_ref().unwrap();
        assert_eq!(init.len(), 2);
        assert_eq!(init[0].name, DOWNLOADER_CONTAINER);
        assert_eq!(env_value(&init[0], "OCULAR_PARAM_DEPTH"), Some("1"));
        assert_eq!(env_value(&init[0], env::TARGET_IDENTIFIER), Some("github.com/org/repo"));
        assert_eq!(init[1].restart_policy.as_deref(), Some("Always"));
        assert_eq!(
            init[1].args.as_deref().unwrap(),
            ["extract", "--", "/mnt/results/out/report.json", "/mnt/metadata/sbom.json"]
        );
        assert_eq!(env_value(&init[1], env::UPLOAD_HOST), Some("nightly-upload.scans.svc"));
        assert_eq!(env_value(&init[1], env::UPLOAD_PORT), Some("2121"));
        assert_eq!(scan_pod.containers.len(), 1);
        assert_eq!(scan_pod.restart_policy.as_deref(), Some("Never"));

        let ignore = w.scan_job(true);
        let init = pod(&ignore).init_containers.as_ref().unwrap();
        assert_eq!(init[1].args.as_deref().unwrap(), ["ignore"]);
        assert_eq!(env_value(&init[1], env::UPLOAD_HOST), None);
    }

    #[test]
    fn upload_job_and_service_select_the_same_pods() {
        let p = pipeline();
        let profile = profile();
        let downloader = template("git", "git-clone");
        let sidecar = SidecarImage::default();
        let w = Workloads {
            pipeline: &p,
            namespace: "scans",
            profile_name: "semgrep",
            profile: &profile,
            downloader: &downloader,
            downloader_env: Vec::new(),
            uploaders: vec![
                ResolvedUploader {
                    template: template("s3", "aws"),
                    parameter_env: vec![env::var("OCULAR_PARAM_BUCKET", "b")],
                },
                ResolvedUploader {
                    template: template("s3", "aws"),
                    parameter_env: Vec::new(),
                },
            ],
            sidecar: &sidecar,
        };

        let job = w.upload_job();
        let pod = pod(&job);
        let init = pod.init_containers.as_ref().unwrap();
        assert_eq!(init.len(), 1);
        assert_eq!(init[0].args.as_deref().unwrap()[0], "receive");
        assert_eq!(pod.containers[0].name, "s3");
        assert_eq!(pod.containers[1].name, "s3-2");
        assert_eq!(
            pod.containers[0].args.as_deref().unwrap(),
            ["--verbose", "--", "/mnt/results/out/report.json", "/mnt/metadata/sbom.json"]
        );
        assert_eq!(env_value(&pod.containers[0], env::UPLOADER_NAME), Some("s3"));
        assert_eq!(env_value(&pod.containers[0], "OCULAR_PARAM_BUCKET"), Some("b"));

        let svc = w.upload_service();
        let spec = svc.spec.unwrap();
        let pod_labels = job.spec.unwrap().template.metadata.unwrap().labels.unwrap();
        assert_eq!(spec.selector.unwrap(), pod_labels);
        assert_eq!(spec.publish_not_ready_addresses, Some(true));
        assert_eq!(spec.ports.unwrap()[0].port, 2121);
    }
}
