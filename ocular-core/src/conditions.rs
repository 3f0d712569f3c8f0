//! Helpers for `metav1.Condition` lists on Ocular statuses.
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};

pub const READY: &str = "Ready";
pub const STARTED: &str = "Started";
pub const COMPLETE: &str = "Complete";

/// Build a condition stamped with `now`.
pub fn new(type_: &str, status: bool, reason: &str, message: impl Into<String>, now: &Time) -> Condition {
    Condition {
        type_: type_.to_string(),
        status: if status { "True" } else { "False" }.to_string(),
        reason: reason.to_string(),
        message: message.into(),
        last_transition_time: now.clone(),
        observed_generation: None,
    }
}

/// Replace `existing` with `desired`, keeping the previous transition time of every
/// condition whose status did not change.
pub fn merge(existing: &[Condition], desired: Vec<Condition>) -> Vec<Condition> {
    desired
        .into_iter()
        .map(|mut cond| {
            if let Some(prev) = find(existing, &cond.type_) {
                if prev.status == cond.status {
                    cond.last_transition_time = prev.last_transition_time.clone();
                }
            }
            cond
        })
        .collect()
}

/// Look up a condition by type.
pub fn find<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Whether the condition of `type_` is present with status `True`.
pub fn is_true(conditions: &[Condition], type_: &str) -> bool {
    find(conditions, type_).is_some_and(|c| c.status == "True")
}
