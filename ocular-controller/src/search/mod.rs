//! Runs a [`Search`]: one crawler pod with the scheduler sidecar, plus the service
//! account and role binding the scheduler needs to create pipelines.
use std::{sync::Arc, time::Duration};

use chrono::Utc;
use k8s_openapi::{
    api::{
        core::v1::{Pod, ServiceAccount},
        rbac::v1::RoleBinding,
    },
    apimachinery::pkg::apis::meta::v1::Time,
};
use kube::{
    api::{DeleteParams, ListParams, Patch, PatchParams, PostParams},
    runtime::controller::Action,
    Api, Resource, ResourceExt,
};
use ocular_core::{
    labels,
    resources::{Search, SearchStatus, Validity},
    state::{SearchPhase, SearchReason},
};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::{
    child::{keep_existing, reconcile_child},
    context::Context,
    error::{is_not_found, Error, Result},
    resolve, ttl,
};

pub mod pod;

use pod::SearchPod;

pub const CONTROLLER: &str = "search";

const VALIDATION_RETRY: Duration = Duration::from_secs(5);
/// Recheck interval for pods in a phase we cannot interpret.
const UNKNOWN_PHASE_RETRY: Duration = Duration::from_secs(10);

/// Oldest first, name as tie breaker.
fn sort_pods(pods: &mut [Pod]) {
    pods.sort_by(|a, b| {
        let created = |p: &Pod| p.metadata.creation_timestamp.as_ref().map(|t| t.0);
        created(a).cmp(&created(b)).then_with(|| a.name_any().cmp(&b.name_any()))
    });
}

struct SearchPass<'a> {
    ctx: &'a Context,
    search: &'a Search,
    namespace: String,
    status: SearchStatus,
    now: Time,
}

impl<'a> SearchPass<'a> {
    fn reject(&mut self, reason: SearchReason, message: String) -> Result<Action> {
        warn!(%reason, %message, "search cannot proceed");
        self.status
            .transition(SearchPhase::Invalid, Some(reason), message, &self.now)?;
        Ok(Action::await_change())
    }

    fn finish(&mut self, phase: SearchPhase, reason: Option<SearchReason>, message: String) -> Result<Action> {
        self.status.transition(phase, reason, message, &self.now)?;
        self.status.completion_time = Some(self.now.clone());
        self.ctx.metrics.search_finished(phase.as_str());
        info!(%phase, "search finished");
        Ok(Action::await_change())
    }

    async fn apply(&mut self) -> Result<Action> {
        let (ctx, search): (&'a Context, &'a Search) = (self.ctx, self.search);
        let namespace = self.namespace.clone();
        let spec = &search.spec;

        if !self.status.phase.is_terminal() && self.status.phase != SearchPhase::Running {
            let Some(crawler) = resolve::crawler(&ctx.client, &namespace, &spec.crawler_ref).await? else {
                let msg = format!("{:?} {} not found", spec.crawler_ref.kind, spec.crawler_ref.name);
                return self.reject(SearchReason::CrawlerNotFound, msg);
            };
            match crawler.validity {
                Validity::Valid => {}
                Validity::Pending => return Ok(Action::requeue(VALIDATION_RETRY)),
                Validity::Invalid => {
                    let msg = format!("{} {} is not valid", crawler.kind, crawler.name);
                    return self.reject(SearchReason::CrawlerNotValid, msg);
                }
            }
            let crawler_env = match crawler.parameter_env(&spec.crawler_ref.parameters) {
                Ok(env) => env,
                Err(err) => return self.reject(SearchReason::InvalidParameters, err.to_string()),
            };
            let pipeline_template =
                serde_json::to_string(&spec.scheduler.pipeline_template).map_err(Error::EncodeTemplate)?;

            self.ensure_rbac(&namespace).await?;
            let desired = SearchPod {
                search,
                namespace: &namespace,
                crawler: &crawler,
                crawler_env,
                sidecar: &ctx.sidecar,
                pipeline_template,
            }
            .pod();
            return self.ensure_pod(&namespace, desired).await;
        }
        self.observe_pod(&namespace).await
    }

    async fn ensure_rbac(&mut self, namespace: &str) -> Result<()> {
        let client = &self.ctx.client;
        if self.search.spec.service_account_name.is_none() {
            let accounts: Api<ServiceAccount> = Api::namespaced(client.clone(), namespace);
            let desired = pod::service_account(self.search, namespace);
            reconcile_child(&accounts, self.search, desired, keep_existing).await?;
        }
        let bindings: Api<RoleBinding> = Api::namespaced(client.clone(), namespace);
        let desired = pod::role_binding(self.search, namespace, &self.ctx.search_cluster_role);
        reconcile_child(&bindings, self.search, desired, keep_existing).await?;
        Ok(())
    }

    /// List the search's pods, deleting all but the oldest.
    async fn current_pod(&self, pods: &Api<Pod>) -> Result<Option<Pod>> {
        let selector = labels::selector(&labels::search(&self.search.name_any()));
        let mut found = pods.list(&ListParams::default().labels(&selector)).await?.items;
        sort_pods(&mut found);
        let mut found = found.into_iter();
        let first = found.next();
        for extra in found {
            let name = extra.name_any();
            warn!(pod = %name, "deleting duplicate search pod");
            match pods.delete(&name, &DeleteParams::background()).await {
                Ok(_) => {}
                Err(err) if is_not_found(&err) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(first)
    }

    async fn ensure_pod(&mut self, namespace: &str, mut desired: Pod) -> Result<Action> {
        let pods: Api<Pod> = Api::namespaced(self.ctx.client.clone(), namespace);
        if self.current_pod(&pods).await?.is_some() {
            return self.observe_pod(namespace).await;
        }
        let owner = self
            .search
            .controller_owner_ref(&())
            .ok_or(Error::MissingObjectKey(".metadata.uid"))?;
        desired.owner_references_mut().push(owner);
        let created = pods.create(&PostParams::default(), &desired).await?;
        info!(pod = %created.name_any(), "created search pod");
        self.started(&created)?;
        Ok(Action::await_change())
    }

    fn started(&mut self, pod: &Pod) -> Result<()> {
        self.status.pod_name = Some(pod.name_any());
        if self.status.start_time.is_none() {
            self.status.start_time = Some(self.now.clone());
        }
        self.status
            .transition(SearchPhase::Running, None, format!("pod {}", pod.name_any()), &self.now)?;
        Ok(())
    }

    async fn observe_pod(&mut self, namespace: &str) -> Result<Action> {
        let pods: Api<Pod> = Api::namespaced(self.ctx.client.clone(), namespace);
        let Some(pod) = self.current_pod(&pods).await? else {
            // pod vanished while running; nothing left to wait for
            return self.finish(
                SearchPhase::Failed,
                Some(SearchReason::PodFailed),
                "search pod disappeared".into(),
            );
        };
        if !self.status.phase.is_terminal() {
            self.started(&pod)?;
        }
        let phase = pod.status.as_ref().and_then(|s| s.phase.clone());
        debug!(pod = %pod.name_any(), ?phase, "search pod");
        match phase.as_deref() {
            Some("Succeeded") => self.finish(SearchPhase::Succeeded, None, "crawler finished".into()),
            Some("Failed") => {
                let message = pod
                    .status
                    .as_ref()
                    .and_then(|s| s.message.clone())
                    .unwrap_or_else(|| "search pod failed".into());
                self.finish(SearchPhase::Failed, Some(SearchReason::PodFailed), message)
            }
            Some("Pending" | "Running") => Ok(Action::await_change()),
            _ => Ok(Action::requeue(UNKNOWN_PHASE_RETRY)),
        }
    }
}

/// Reconcile a single search.
#[instrument(skip(search, ctx), fields(name = %search.name_any(), namespace = search.namespace()))]
pub async fn reconcile(search: Arc<Search>, ctx: Arc<Context>) -> Result<Action> {
    let _measure = ctx.metrics.reconciled(CONTROLLER);
    let namespace = search
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let api: Api<Search> = Api::namespaced(ctx.client.clone(), &namespace);
    let Some(search) = api.get_opt(&search.name_any()).await? else {
        debug!("search already deleted");
        return Ok(Action::await_change());
    };

    let status = search.status.clone().unwrap_or_default();
    if let Some(completed) = &status.completion_time {
        let ttl = search.spec.ttl_seconds_after_finished;
        return ttl::enforce(&api, &search, completed, ttl, Utc::now(), &ctx.metrics).await;
    }
    if status.awaits_spec_change(search.metadata.generation) {
        debug!("search invalid, waiting for a spec change");
        return Ok(Action::await_change());
    }

    let mut pass = SearchPass {
        ctx: &ctx,
        search: &search,
        namespace,
        status,
        now: Time(Utc::now()),
    };
    let action = pass.apply().await?;
    let mut status = pass.status;
    status.observed_generation = search.metadata.generation;

    if search.status.as_ref() != Some(&status) {
        let patch = json!({ "status": status });
        api.patch_status(&search.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
    }
    if let Some(completed) = &status.completion_time {
        let ttl = search.spec.ttl_seconds_after_finished;
        return ttl::enforce(&api, &search, completed, ttl, Utc::now(), &ctx.metrics).await;
    }
    Ok(action)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn pod(name: &str, minute: u32) -> Pod {
        let mut p = Pod::default();
        p.metadata.name = Some(name.into());
        p.metadata.creation_timestamp = Some(Time(Utc.with_ymd_and_hms(2024, 1, 1, 0, minute, 0).unwrap()));
        p
    }

    #[test]
    fn oldest_pod_wins() {
        let mut pods = vec![pod("c", 2), pod("b", 1), pod("a", 1)];
        sort_pods(&mut pods);
        let names: Vec<String> = pods.iter().map(|p| p.name_any()).collect();
        assert_eq!(names, ["a", "b", "c"]);
    }
}
