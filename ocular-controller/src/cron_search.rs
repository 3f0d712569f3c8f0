//! Creates [`Search`] objects from a [`CronSearch`] on its schedule.
use std::{str::FromStr, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use cron::Schedule;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{
    api::{ObjectMeta, Patch, PatchParams, PostParams},
    runtime::controller::Action,
    Api, Resource, ResourceExt,
};
use ocular_core::{
    conditions::{self, READY},
    labels, naming,
    resources::{CronSearch, CronSearchStatus, Search},
};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::{
    context::Context,
    error::{Error, Result},
};

pub const CONTROLLER: &str = "cronsearch";

#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("expected 5 fields, found {0}")]
    FieldCount(usize),

    #[error("invalid schedule: {0}")]
    Parse(#[from] cron::error::Error),
}

/// Parse a five field cron expression (minute granularity, UTC).
pub fn parse_schedule(expr: &str) -> Result<Schedule, ScheduleError> {
    let fields = expr.split_whitespace().count();
    if fields != 5 {
        return Err(ScheduleError::FieldCount(fields));
    }
    Ok(Schedule::from_str(&format!("0 {expr}"))?)
}

/// Fire times relative to `now` for a schedule last run at `since`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Due {
    /// Most recent fire time in `(since, now]`, if any.
    pub missed: Option<DateTime<Utc>>,
    /// First fire time after `now`.
    pub next: Option<DateTime<Utc>>,
}

pub fn due(schedule: &Schedule, since: DateTime<Utc>, now: DateTime<Utc>) -> Due {
    // latest fire time at or before `now`
    let missed = schedule
        .after(&(now + chrono::Duration::seconds(1)))
        .next_back()
        .filter(|t| *t > since && *t <= now);
    Due {
        missed,
        next: schedule.after(&now).next(),
    }
}

/// The search a fire of `cron` creates.
pub fn search_for(cron: &CronSearch, namespace: &str) -> Search {
    let template = &cron.spec.search_template;
    let name = cron.name_any();
    let mut search_labels = template.metadata.labels.clone();
    search_labels.insert(labels::CRON_SEARCH.to_string(), naming::label_value(&name));
    let generate_name = template
        .metadata
        .generate_name
        .clone()
        .unwrap_or_else(|| naming::generate_name(&name));
    Search {
        metadata: ObjectMeta {
            generate_name: Some(generate_name),
            namespace: Some(namespace.to_string()),
            labels: Some(search_labels),
            annotations: (!template.metadata.annotations.is_empty()).then(|| template.metadata.annotations.clone()),
            owner_references: cron.controller_owner_ref(&()).map(|o| vec![o]),
            ..ObjectMeta::default()
        },
        spec: template.spec.clone(),
        status: None,
    }
}

fn requeue_until(next: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Action {
    match next.and_then(|n| (n - now).to_std().ok()) {
        Some(wait) => Action::requeue(wait.max(Duration::from_secs(1))),
        None => Action::await_change(),
    }
}

/// Reconcile a single cron search.
#[instrument(skip(cron, ctx), fields(name = %cron.name_any(), namespace = cron.namespace()))]
pub async fn reconcile(cron: Arc<CronSearch>, ctx: Arc<Context>) -> Result<Action> {
    let _measure = ctx.metrics.reconciled(CONTROLLER);
    let namespace = cron.namespace().ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let api: Api<CronSearch> = Api::namespaced(ctx.client.clone(), &namespace);
    let Some(cron) = api.get_opt(&cron.name_any()).await? else {
        return Ok(Action::await_change());
    };

    let now = Utc::now();
    let stamp = Time(now);
    let mut status = cron.status.clone().unwrap_or_default();
    status.observed_generation = cron.metadata.generation;

    let action = match parse_schedule(&cron.spec.schedule) {
        Err(err) => {
            warn!(schedule = %cron.spec.schedule, %err, "invalid schedule");
            set_ready(&mut status, false, "InvalidSchedule", err.to_string(), &stamp);
            Action::await_change()
        }
        Ok(_) if cron.spec.suspend => {
            debug!("suspended");
            set_ready(&mut status, false, "Suspended", "", &stamp);
            Action::await_change()
        }
        Ok(schedule) => {
            let since = status
                .last_schedule_time
                .as_ref()
                .or(cron.metadata.creation_timestamp.as_ref())
                .map_or(now, |t| t.0);
            let due = due(&schedule, since, now);
            if let Some(fire) = due.missed {
                let searches: Api<Search> = Api::namespaced(ctx.client.clone(), &namespace);
                let created = searches
                    .create(&PostParams::default(), &search_for(&cron, &namespace))
                    .await?;
                info!(search = %created.name_any(), scheduled = %fire, "created search");
                ctx.metrics.cron_search_scheduled();
                status.last_schedule_time = Some(Time(fire));
                status.last_search_name = Some(created.name_any());
            }
            set_ready(&mut status, true, "Scheduled", "", &stamp);
            requeue_until(due.next, now)
        }
    };

    if cron.status.as_ref() != Some(&status) {
        let patch = json!({ "status": status });
        api.patch_status(&cron.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
    }
    Ok(action)
}

fn set_ready(status: &mut CronSearchStatus, ready: bool, reason: &str, message: impl Into<String>, now: &Time) {
    let desired = vec![conditions::new(READY, ready, reason, message, now)];
    status.conditions = conditions::merge(&status.conditions, desired);
}
