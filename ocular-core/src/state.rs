//! Phases of pipelines and searches, the transitions between them and the
//! conditions derived from them.
//!
//! Reconcilers never write conditions directly. They move the status to a new phase
//! with `transition`, which rejects moves the table does not allow and re-projects
//! the conditions.
use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{
    conditions::{self, COMPLETE, READY, STARTED},
    resources::{PipelineStatus, SearchStatus},
    Error, Result,
};

macro_rules! string_enum {
    ($(#[$doc:meta])* $name:ident { $($(#[$vdoc:meta])* $variant:ident $(= $default:ident)?),+ $(,)? }) => {
        $(#[$doc])*
        #[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema)]
        pub enum $name {
            $($(#[$vdoc])* $(#[$default])? $variant),+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => stringify!($variant)),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

string_enum!(
    /// Lifecycle phase of a [`Pipeline`](crate::resources::Pipeline).
    #[derive(Default)]
    PipelinePhase {
        Pending = default,
        /// A reference or parameter is wrong; waits for a spec change.
        Invalid,
        Scanning,
        Uploading,
        Succeeded,
        Failed,
    }
);

string_enum!(
    /// Why a pipeline is invalid or failed.
    PipelineReason {
        ProfileNotFound,
        ProfileNotValid,
        DownloaderNotFound,
        DownloaderNotValid,
        InvalidParameters,
        UploaderNotFound,
        UploaderNotValid,
        ScansCompletedNoUploader,
        DownloadFailed,
        ScanFailed,
        UploadFailed,
    }
);

string_enum!(
    /// Progress marker of a single pipeline stage.
    #[derive(Default)]
    StageStatus {
        NotStarted = default,
        Running,
        Succeeded,
        Failed,
        Skipped,
    }
);

string_enum!(
    /// Lifecycle phase of a [`Search`](crate::resources::Search).
    #[derive(Default)]
    SearchPhase {
        Pending = default,
        Invalid,
        Running,
        Succeeded,
        Failed,
    }
);

string_enum!(
    /// Why a search is invalid or failed.
    SearchReason {
        CrawlerNotFound,
        CrawlerNotValid,
        InvalidParameters,
        InvalidTemplate,
        PodFailed,
    }
);

impl PipelinePhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        use PipelinePhase::*;
        self == next
            || matches!(
                (self, next),
                (Pending, Invalid | Scanning | Failed)
                    | (Invalid, Pending | Scanning)
                    | (Scanning, Uploading | Succeeded | Failed)
                    | (Uploading, Succeeded | Failed)
            )
    }
}

impl SearchPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        use SearchPhase::*;
        self == next
            || matches!(
                (self, next),
                (Pending, Invalid | Running) | (Invalid, Pending | Running) | (Running, Succeeded | Failed)
            )
    }
}

impl StageStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

impl PipelineStatus {
    /// Move to `phase`, re-projecting the conditions.
    pub fn transition(
        &mut self,
        phase: PipelinePhase,
        reason: Option<PipelineReason>,
        message: impl Into<String>,
        now: &Time,
    ) -> Result<()> {
        if !self.phase.can_transition_to(phase) {
            return Err(Error::IllegalTransition {
                kind: "Pipeline",
                from: self.phase.to_string(),
                to: phase.to_string(),
            });
        }
        self.phase = phase;
        self.reason = reason;
        let desired = pipeline_conditions(phase, reason, &message.into(), now);
        self.conditions = conditions::merge(&self.conditions, desired);
        Ok(())
    }

    /// Whether the pipeline is invalid and nobody touched its spec since.
    pub fn awaits_spec_change(&self, generation: Option<i64>) -> bool {
        self.phase == PipelinePhase::Invalid && self.observed_generation == generation
    }
}

impl SearchStatus {
    /// Move to `phase`, re-projecting the conditions.
    pub fn transition(
        &mut self,
        phase: SearchPhase,
        reason: Option<SearchReason>,
        message: impl Into<String>,
        now: &Time,
    ) -> Result<()> {
        if !self.phase.can_transition_to(phase) {
            return Err(Error::IllegalTransition {
                kind: "Search",
                from: self.phase.to_string(),
                to: phase.to_string(),
            });
        }
        self.phase = phase;
        self.reason = reason;
        let desired = search_conditions(phase, reason, &message.into(), now);
        self.conditions = conditions::merge(&self.conditions, desired);
        Ok(())
    }

    /// Whether the search is invalid and nobody touched its spec since.
    pub fn awaits_spec_change(&self, generation: Option<i64>) -> bool {
        self.phase == SearchPhase::Invalid && self.observed_generation == generation
    }
}

fn pipeline_conditions(
    phase: PipelinePhase,
    reason: Option<PipelineReason>,
    message: &str,
    now: &Time,
) -> Vec<Condition> {
    use PipelinePhase::*;
    let reason_or = |fallback: &str| reason.map_or_else(|| fallback.to_string(), |r| r.to_string());
    let ready = match phase {
        Pending => conditions::new(READY, false, "Pending", message, now),
        Invalid => conditions::new(READY, false, &reason_or("Invalid"), message, now),
        Scanning | Uploading | Succeeded | Failed => conditions::new(READY, true, "Scheduled", "", now),
    };
    match phase {
        Pending | Invalid => vec![ready],
        Scanning | Uploading => vec![ready, conditions::new(COMPLETE, false, phase.as_str(), "", now)],
        Succeeded => vec![ready, conditions::new(COMPLETE, true, "Succeeded", message, now)],
        Failed => vec![ready, conditions::new(COMPLETE, false, &reason_or("Failed"), message, now)],
    }
}

fn search_conditions(phase: SearchPhase, reason: Option<SearchReason>, message: &str, now: &Time) -> Vec<Condition> {
    use SearchPhase::*;
    let reason_or = |fallback: &str| reason.map_or_else(|| fallback.to_string(), |r| r.to_string());
    match phase {
        Pending => vec![conditions::new(READY, false, "Pending", message, now)],
        Invalid => vec![conditions::new(READY, false, &reason_or("Invalid"), message, now)],
        Running => vec![
            conditions::new(READY, true, "Scheduled", "", now),
            conditions::new(STARTED, true, "PodCreated", message, now),
            conditions::new(COMPLETE, false, "Running", "", now),
        ],
        Succeeded => vec![
            conditions::new(READY, true, "Scheduled", "", now),
            conditions::new(STARTED, true, "PodCreated", "", now),
            conditions::new(COMPLETE, true, "Succeeded", message, now),
        ],
        Failed => vec![
            conditions::new(READY, true, "Scheduled", "", now),
            conditions::new(STARTED, true, "PodCreated", "", now),
            conditions::new(COMPLETE, false, &reason_or("Failed"), message, now),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn at(day: u32) -> Time {
        Time(Utc.with_ymd_and_hms(2024, 5, day, 12, 0, 0).unwrap())
    }

    #[test]
    fn pipeline_table() {
        use PipelinePhase::*;
        let all = [Pending, Invalid, Scanning, Uploading, Succeeded, Failed];
        let allowed = [
            (Pending, Invalid),
            (Pending, Scanning),
            (Pending, Failed),
            (Invalid, Pending),
            (Invalid, Scanning),
            (Scanning, Uploading),
            (Scanning, Succeeded),
            (Scanning, Failed),
            (Uploading, Succeeded),
            (Uploading, Failed),
        ];
        for from in all {
            for to in all {
                let expected = from == to || allowed.contains(&(from, to));
                assert_eq!(from.can_transition_to(to), expected, "{from} -> {to}");
            }
        }
    }

    #[test]
    fn terminal_pipelines_cannot_restart() {
        let mut status = PipelineStatus::default();
        status.transition(PipelinePhase::Scanning, None, "", &at(1)).unwrap();
        status.transition(PipelinePhase::Succeeded, None, "", &at(2)).unwrap();
        let err = status
            .transition(PipelinePhase::Scanning, None, "", &at(3))
            .unwrap_err();
        assert!(matches!(err, Error::IllegalTransition { kind: "Pipeline", .. }));
        assert_eq!(status.phase, PipelinePhase::Succeeded);
    }

    #[test]
    fn pipeline_conditions_follow_phase() {
        let mut status = PipelineStatus::default();
        status
            .transition(
                PipelinePhase::Invalid,
                Some(PipelineReason::ProfileNotFound),
                "profile missing",
                &at(1),
            )
            .unwrap();
        let ready = conditions::find(&status.conditions, READY).unwrap();
        assert_eq!(ready.status, "False");
        assert_eq!(ready.reason, "ProfileNotFound");
        assert!(conditions::find(&status.conditions, COMPLETE).is_none());

        status.transition(PipelinePhase::Scanning, None, "", &at(2)).unwrap();
        assert!(conditions::is_true(&status.conditions, READY));
        status
            .transition(PipelinePhase::Failed, Some(PipelineReason::ScanFailed), "", &at(3))
            .unwrap();
        let complete = conditions::find(&status.conditions, COMPLETE).unwrap();
        assert_eq!(complete.status, "False");
        assert_eq!(complete.reason, "ScanFailed");
        // Ready stayed True since Scanning.
        assert_eq!(
            conditions::find(&status.conditions, READY).unwrap().last_transition_time,
            at(2)
        );
    }

    #[test]
    fn search_table_and_conditions() {
        use SearchPhase::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Invalid.can_transition_to(Running));
        assert!(!Pending.can_transition_to(Succeeded));
        assert!(!Succeeded.can_transition_to(Running));

        let mut status = SearchStatus::default();
        status.transition(Running, None, "", &at(1)).unwrap();
        assert!(conditions::is_true(&status.conditions, STARTED));
        status.transition(Succeeded, None, "", &at(2)).unwrap();
        assert!(conditions::is_true(&status.conditions, COMPLETE));
        assert!(status.phase.is_terminal());
    }

    #[test]
    fn invalid_waits_for_generation_change() {
        let mut status = PipelineStatus {
            observed_generation: Some(2),
            ..Default::default()
        };
        status
            .transition(PipelinePhase::Invalid, Some(PipelineReason::InvalidParameters), "", &at(1))
            .unwrap();
        assert!(status.awaits_spec_change(Some(2)));
        assert!(!status.awaits_spec_change(Some(3)));
    }

    #[test]
    fn phases_serialize_as_plain_strings() {
        assert_eq!(serde_json::to_string(&StageStatus::NotStarted).unwrap(), r#""NotStarted""#);
        assert_eq!(
            serde_json::from_str::<PipelineReason>(r#""ScansCompletedNoUploader""#).unwrap(),
            PipelineReason::ScansCompletedNoUploader
        );
    }
}
