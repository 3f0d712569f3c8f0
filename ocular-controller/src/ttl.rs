//! Deleting finished pipelines and searches after `ttlSecondsAfterFinished`.
use std::{fmt::Debug, time::Duration};

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{
    api::DeleteParams,
    runtime::controller::Action,
    Api, Resource, ResourceExt,
};
use serde::de::DeserializeOwned;

use crate::{
    error::{is_not_found, Result},
    metrics::Metrics,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    /// No TTL; keep forever.
    Retain,
    Delete,
    /// Check again once the remaining time elapsed.
    RequeueAfter(Duration),
}

/// Decide what happens to an object that completed at `completed`.
///
/// Negative TTLs count as unset. A TTL of zero deletes right away.
pub fn evaluate(completed: &Time, ttl_seconds: Option<i32>, now: DateTime<Utc>) -> Decision {
    let Some(ttl) = ttl_seconds.filter(|t| *t >= 0) else {
        return Decision::Retain;
    };
    let delete_at = completed.0 + chrono::Duration::seconds(i64::from(ttl));
    match (delete_at - now).to_std() {
        Ok(remaining) if !remaining.is_zero() => Decision::RequeueAfter(remaining),
        _ => Decision::Delete,
    }
}

/// Apply the TTL decision for `obj`, deleting it in the background when due.
pub async fn enforce<K>(
    api: &Api<K>,
    obj: &K,
    completed: &Time,
    ttl_seconds: Option<i32>,
    now: DateTime<Utc>,
    metrics: &Metrics,
) -> Result<Action>
where
    K: Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned,
{
    match evaluate(completed, ttl_seconds, now) {
        Decision::Retain => Ok(Action::await_change()),
        Decision::RequeueAfter(remaining) => Ok(Action::requeue(remaining)),
        Decision::Delete => {
            let name = obj.name_any();
            match api.delete(&name, &DeleteParams::background()).await {
                Ok(_) => {
                    tracing::info!(kind = %K::kind(&()), %name, "deleted after ttl");
                    metrics.ttl_deleted(&K::kind(&()));
                }
                Err(err) if is_not_found(&err) => {}
                Err(err) => return Err(err.into()),
            }
            Ok(Action::await_change())
        }
    }
}
