//! Drives a [`Pipeline`] through download, scan and upload.
//!
//! Every pass starts from the persisted status, looks at the child workloads and
//! moves the status along the phase table. Children are only ever created, never
//! updated: the scan Job, and for two-stage pipelines the upload Job together with
//! the Service the extractor sends artifacts to.
use std::{sync::Arc, time::Duration};

use chrono::Utc;
use k8s_openapi::{
    api::{
        batch::v1::Job,
        core::v1::{Pod, Service},
    },
    apimachinery::pkg::apis::meta::v1::Time,
};
use kube::{
    api::{DeleteParams, ListParams, Patch, PatchParams},
    runtime::controller::Action,
    Api, ResourceExt,
};
use ocular_core::{
    labels::{self, Stage},
    resources::{Pipeline, PipelineStatus, Profile, ValidationStatus, Validity},
    state::{PipelinePhase, PipelineReason, StageStatus},
};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::{
    child::{keep_existing, reconcile_child},
    context::Context,
    error::{is_not_found, Error, Result},
    resolve,
    ttl,
};

pub mod workloads;

use workloads::{ResolvedUploader, Workloads, DOWNLOADER_CONTAINER};

pub const CONTROLLER: &str = "pipeline";

/// Wait between checks of a template that has not been validated yet.
const VALIDATION_RETRY: Duration = Duration::from_secs(5);
/// Safety net for missed watch events while stages run.
const PROGRESS_RESYNC: Duration = Duration::from_secs(60);

/// Terminal outcome of a batch Job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    Running,
    Succeeded,
    Failed,
}

impl JobOutcome {
    pub fn of(job: &Job) -> Self {
        let Some(status) = &job.status else {
            return JobOutcome::Running;
        };
        let has = |type_: &str| {
            status
                .conditions
                .iter()
                .flatten()
                .any(|c| c.type_ == type_ && c.status == "True")
        };
        if has("Failed") {
            JobOutcome::Failed
        } else if has("Complete") || status.completion_time.is_some() {
            JobOutcome::Succeeded
        } else {
            JobOutcome::Running
        }
    }

    pub fn is_finished(self) -> bool {
        self != JobOutcome::Running
    }

    fn stage(self) -> StageStatus {
        match self {
            JobOutcome::Running => StageStatus::Running,
            JobOutcome::Succeeded => StageStatus::Succeeded,
            JobOutcome::Failed => StageStatus::Failed,
        }
    }
}

/// State of the downloader init container across the scan pods.
fn downloader_stage(pods: &[Pod]) -> Option<StageStatus> {
    let states: Vec<StageStatus> = pods
        .iter()
        .filter_map(|p| p.status.as_ref()?.init_container_statuses.as_ref())
        .flatten()
        .filter(|cs| cs.name == DOWNLOADER_CONTAINER)
        .filter_map(|cs| {
            let state = cs.state.as_ref()?;
            if let Some(term) = &state.terminated {
                Some(if term.exit_code == 0 {
                    StageStatus::Succeeded
                } else {
                    StageStatus::Failed
                })
            } else if state.running.is_some() {
                Some(StageStatus::Running)
            } else {
                None
            }
        })
        .collect();
    [StageStatus::Succeeded, StageStatus::Running, StageStatus::Failed]
        .into_iter()
        .find(|s| states.contains(s))
}

/// One reconcile pass over a single pipeline.
struct PipelinePass<'a> {
    ctx: &'a Context,
    pipeline: &'a Pipeline,
    namespace: String,
    status: PipelineStatus,
    now: Time,
}

impl<'a> PipelinePass<'a> {
    /// A broken reference: invalid before anything ran, fatal afterwards.
    fn reject(&mut self, reason: PipelineReason, message: String) -> Result<Action> {
        warn!(%reason, %message, "pipeline cannot proceed");
        match self.status.phase {
            PipelinePhase::Pending | PipelinePhase::Invalid => {
                self.status
                    .transition(PipelinePhase::Invalid, Some(reason), message, &self.now)?;
                Ok(Action::await_change())
            }
            _ => self.finish(PipelinePhase::Failed, Some(reason), message),
        }
    }

    fn finish(&mut self, phase: PipelinePhase, reason: Option<PipelineReason>, message: String) -> Result<Action> {
        self.status.transition(phase, reason, message, &self.now)?;
        self.status.completion_time = Some(self.now.clone());
        self.ctx.metrics.pipeline_finished(phase.as_str());
        info!(%phase, "pipeline finished");
        Ok(Action::await_change())
    }

    async fn apply(&mut self) -> Result<Action> {
        let (ctx, pipeline): (&'a Context, &'a Pipeline) = (self.ctx, self.pipeline);
        let client = &ctx.client;
        let spec = &pipeline.spec;
        let name = pipeline.name_any();
        let namespace = self.namespace.clone();

        let profiles: Api<Profile> = Api::namespaced(client.clone(), &namespace);
        let Some(profile) = profiles.get_opt(&spec.profile_ref.name).await? else {
            let msg = format!("profile {} not found", spec.profile_ref.name);
            return self.reject(PipelineReason::ProfileNotFound, msg);
        };
        match ValidationStatus::validity(profile.status.as_ref()) {
            Validity::Valid => {}
            Validity::Pending => return Ok(Action::requeue(VALIDATION_RETRY)),
            Validity::Invalid => {
                let msg = format!("profile {} is not valid", spec.profile_ref.name);
                return self.reject(PipelineReason::ProfileNotValid, msg);
            }
        }

        let Some(downloader) = resolve::downloader(client, &namespace, &spec.downloader_ref).await? else {
            let msg = format!("{:?} {} not found", spec.downloader_ref.kind, spec.downloader_ref.name);
            return self.reject(PipelineReason::DownloaderNotFound, msg);
        };
        match downloader.validity {
            Validity::Valid => {}
            Validity::Pending => return Ok(Action::requeue(VALIDATION_RETRY)),
            Validity::Invalid => {
                let msg = format!("{} {} is not valid", downloader.kind, downloader.name);
                return self.reject(PipelineReason::DownloaderNotValid, msg);
            }
        }
        let downloader_env = match downloader.parameter_env(&spec.downloader_ref.parameters) {
            Ok(env) => env,
            Err(err) => return self.reject(PipelineReason::InvalidParameters, err.to_string()),
        };

        let scan_job_only = *self
            .status
            .scan_job_only
            .get_or_insert_with(|| profile.spec.scan_job_only());

        let mut uploaders = Vec::new();
        if !scan_job_only {
            for r in &profile.spec.uploader_refs {
                let Some(template) = resolve::uploader(client, &namespace, r).await? else {
                    let msg = format!("{:?} {} not found", r.kind, r.name);
                    return self.reject(PipelineReason::UploaderNotFound, msg);
                };
                match template.validity {
                    Validity::Valid => {}
                    Validity::Pending => return Ok(Action::requeue(VALIDATION_RETRY)),
                    Validity::Invalid => {
                        let msg = format!("{} {} is not valid", template.kind, template.name);
                        return self.reject(PipelineReason::UploaderNotValid, msg);
                    }
                }
                let parameter_env = match template.parameter_env(&r.parameters) {
                    Ok(env) => env,
                    Err(err) => {
                        let msg = format!("uploader {}: {err}", r.name);
                        return self.reject(PipelineReason::InvalidParameters, msg);
                    }
                };
                uploaders.push(ResolvedUploader {
                    template,
                    parameter_env,
                });
            }
        }

        let workloads = Workloads {
            pipeline,
            namespace: &namespace,
            profile_name: &spec.profile_ref.name,
            profile: &profile.spec,
            downloader: &downloader,
            downloader_env,
            uploaders,
            sidecar: &ctx.sidecar,
        };
        self.run_stages(&name, scan_job_only, &workloads).await
    }

    async fn run_stages(&mut self, name: &str, scan_job_only: bool, workloads: &Workloads<'_>) -> Result<Action> {
        let client = &self.ctx.client;
        let jobs: Api<Job> = Api::namespaced(client.clone(), &self.namespace);
        let services: Api<Service> = Api::namespaced(client.clone(), &self.namespace);
        let scan_name = workloads::scan_job_name(name);
        let upload_name = workloads::upload_name(name);

        let scan_job = jobs.get_opt(&scan_name).await?;
        let mut upload_job = None;
        if !scan_job_only {
            upload_job = jobs.get_opt(&upload_name).await?;
            if upload_job.is_none() {
                if scan_job.as_ref().map(JobOutcome::of).is_some_and(JobOutcome::is_finished) {
                    let msg = format!("scan job {scan_name} finished without an upload job");
                    return self.finish(PipelinePhase::Failed, Some(PipelineReason::ScansCompletedNoUploader), msg);
                }
                let created = reconcile_child(&jobs, self.pipeline, workloads.upload_job(), keep_existing).await?;
                upload_job = Some(created.into_inner());
                self.status.upload_job_name = Some(upload_name.clone());
            }
            reconcile_child(&services, self.pipeline, workloads.upload_service(), keep_existing).await?;
            self.status.upload_service_name = Some(upload_name.clone());
        }

        let Some(scan_job) = scan_job else {
            reconcile_child(&jobs, self.pipeline, workloads.scan_job(scan_job_only), keep_existing).await?;
            self.status.scan_job_name = Some(scan_name);
            if self.status.start_time.is_none() {
                self.status.start_time = Some(self.now.clone());
            }
            self.status.stages.download = StageStatus::Running;
            self.status.stages.scan = StageStatus::Running;
            self.status.stages.upload = if scan_job_only {
                StageStatus::Skipped
            } else {
                StageStatus::NotStarted
            };
            self.status
                .transition(PipelinePhase::Scanning, None, "stages scheduled", &self.now)?;
            return Ok(Action::requeue(PROGRESS_RESYNC));
        };

        self.evaluate(name, &jobs, &scan_job, upload_job.as_ref()).await
    }

    /// Fold the state of the stage workloads into the status.
    async fn evaluate(&mut self, name: &str, jobs: &Api<Job>, scan_job: &Job, upload_job: Option<&Job>) -> Result<Action> {
        let scan = JobOutcome::of(scan_job);
        self.status.stages.scan = scan.stage();
        self.status.stages.download = if scan == JobOutcome::Succeeded {
            StageStatus::Succeeded
        } else {
            let pods: Api<Pod> = Api::namespaced(self.ctx.client.clone(), &self.namespace);
            let selector = labels::selector(&labels::pipeline_stage(name, Stage::Scan));
            let pods = pods.list(&ListParams::default().labels(&selector)).await?;
            downloader_stage(&pods.items).unwrap_or(self.status.stages.download)
        };
        let download_failed = self.status.stages.download == StageStatus::Failed;
        debug!(?scan, download = %self.status.stages.download, "scan stage");

        let Some(upload_job) = upload_job else {
            self.status.stages.upload = StageStatus::Skipped;
            return match scan {
                JobOutcome::Running => Ok(Action::requeue(PROGRESS_RESYNC)),
                JobOutcome::Succeeded => self.finish(PipelinePhase::Succeeded, None, "scan completed".into()),
                JobOutcome::Failed if download_failed => {
                    self.finish(PipelinePhase::Failed, Some(PipelineReason::DownloadFailed), "download failed".into())
                }
                JobOutcome::Failed => {
                    self.finish(PipelinePhase::Failed, Some(PipelineReason::ScanFailed), "scan job failed".into())
                }
            };
        };

        let upload = JobOutcome::of(upload_job);
        if download_failed && !upload.is_finished() {
            // the extractor never starts, so the receiver would wait forever
            let upload_name = upload_job.name_any();
            match jobs.delete(&upload_name, &DeleteParams::background()).await {
                Ok(_) => info!(job = %upload_name, "deleted upload job after failed download"),
                Err(err) if is_not_found(&err) => {}
                Err(err) => return Err(err.into()),
            }
            self.status.stages.upload = StageStatus::Skipped;
            return self.finish(PipelinePhase::Failed, Some(PipelineReason::DownloadFailed), "download failed".into());
        }

        self.status.stages.upload = match upload {
            JobOutcome::Running if !scan.is_finished() => StageStatus::NotStarted,
            other => other.stage(),
        };
        match (scan, upload) {
            (JobOutcome::Running, JobOutcome::Failed) => self.finish(
                PipelinePhase::Failed,
                Some(PipelineReason::UploadFailed),
                "upload job failed before scanning finished".into(),
            ),
            (JobOutcome::Running, _) => Ok(Action::requeue(PROGRESS_RESYNC)),
            (_, JobOutcome::Running) => {
                self.status
                    .transition(PipelinePhase::Uploading, None, "uploading artifacts", &self.now)?;
                Ok(Action::requeue(PROGRESS_RESYNC))
            }
            (JobOutcome::Failed, _) => {
                self.finish(PipelinePhase::Failed, Some(PipelineReason::ScanFailed), "scan job failed".into())
            }
            (_, JobOutcome::Failed) => {
                self.finish(PipelinePhase::Failed, Some(PipelineReason::UploadFailed), "upload job failed".into())
            }
            (JobOutcome::Succeeded, JobOutcome::Succeeded) => {
                self.finish(PipelinePhase::Succeeded, None, "artifacts uploaded".into())
            }
        }
    }
}

/// Reconcile a single pipeline.
#[instrument(skip(pipeline, ctx), fields(name = %pipeline.name_any(), namespace = pipeline.namespace()))]
pub async fn reconcile(pipeline: Arc<Pipeline>, ctx: Arc<Context>) -> Result<Action> {
    let _measure = ctx.metrics.reconciled(CONTROLLER);
    let namespace = pipeline
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let api: Api<Pipeline> = Api::namespaced(ctx.client.clone(), &namespace);
    let Some(pipeline) = api.get_opt(&pipeline.name_any()).await? else {
        debug!("pipeline already deleted");
        return Ok(Action::await_change());
    };

    let status = pipeline.status.clone().unwrap_or_default();
    if let Some(completed) = &status.completion_time {
        let ttl = pipeline.spec.ttl_seconds_after_finished;
        return ttl::enforce(&api, &pipeline, completed, ttl, Utc::now(), &ctx.metrics).await;
    }
    if status.awaits_spec_change(pipeline.metadata.generation) {
        debug!("pipeline invalid, waiting for a spec change");
        return Ok(Action::await_change());
    }

    let mut pass = PipelinePass {
        ctx: &ctx,
        pipeline: &pipeline,
        namespace,
        status,
        now: Time(Utc::now()),
    };
    let action = pass.apply().await?;
    let mut status = pass.status;
    status.observed_generation = pipeline.metadata.generation;

    if pipeline.status.as_ref() != Some(&status) {
        let patch = json!({ "status": status });
        api.patch_status(&pipeline.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
    }
    if let Some(completed) = &status.completion_time {
        let ttl = pipeline.spec.ttl_seconds_after_finished;
        return ttl::enforce(&api, &pipeline, completed, ttl, Utc::now(), &ctx.metrics).await;
    }
    Ok(action)
}
