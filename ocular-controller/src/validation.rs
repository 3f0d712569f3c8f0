//! Validation of container templates and profiles.
//!
//! Pipelines and searches only run against objects whose `status.valid` is `true`.
//! The reconcilers here are the ones setting it.
use std::{collections::BTreeSet, sync::Arc, time::Duration};

use chrono::Utc;
use k8s_openapi::{apimachinery::pkg::apis::meta::v1::Time, ClusterResourceScope, NamespaceResourceScope};
use kube::{
    api::{Patch, PatchParams},
    runtime::controller::Action,
    Api, Resource, ResourceExt,
};
use ocular_core::{
    conditions::{self, READY},
    params::{self, ParameterDefinition},
    resources::{Profile, ProfileSpec, TemplateResource, ValidationStatus, Validity},
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::json;
use tracing::{debug, instrument, warn};

use crate::{
    context::Context,
    error::{Error, Result},
    pipeline::workloads::{DOWNLOADER_CONTAINER, EXTRACTOR_CONTAINER},
    resolve,
};

pub const TEMPLATE_CONTROLLER: &str = "template";
pub const PROFILE_CONTROLLER: &str = "profile";

/// Profiles depend on uploaders and are rechecked on this interval.
const PROFILE_RESYNC: Duration = Duration::from_secs(60);
const UPLOADER_RETRY: Duration = Duration::from_secs(5);

/// Check a parameter schema: names are non-empty, unique and map to distinct variables.
pub fn check_parameters(definitions: &[ParameterDefinition]) -> Result<(), String> {
    let mut names = BTreeSet::new();
    let mut env_names = BTreeSet::new();
    for def in definitions {
        if def.name.trim().is_empty() {
            return Err("parameter with an empty name".into());
        }
        if !names.insert(def.name.as_str()) {
            return Err(format!("parameter {} declared twice", def.name));
        }
        if !env_names.insert(params::parameter_env_name(&def.name)) {
            return Err(format!(
                "parameter {} collides with another parameter's variable {}",
                def.name,
                params::parameter_env_name(&def.name)
            ));
        }
    }
    Ok(())
}

/// Checks on a profile that need no lookups.
pub fn check_profile_shape(spec: &ProfileSpec) -> Result<(), String> {
    if spec.containers.is_empty() {
        return Err("profile has no containers".into());
    }
    let mut names = BTreeSet::new();
    for c in &spec.containers {
        if c.name == DOWNLOADER_CONTAINER || c.name == EXTRACTOR_CONTAINER {
            return Err(format!("container name {} is reserved", c.name));
        }
        if !names.insert(c.name.as_str()) {
            return Err(format!("container {} declared twice", c.name));
        }
    }
    if spec.artifacts.iter().any(|a| a.trim().is_empty()) {
        return Err("artifact with an empty path".into());
    }
    Ok(())
}

fn validation_status(outcome: &Result<(), String>, generation: Option<i64>, previous: Option<&ValidationStatus>) -> ValidationStatus {
    let now = Time(Utc::now());
    let desired = match outcome {
        Ok(()) => conditions::new(READY, true, "Valid", "", &now),
        Err(msg) => conditions::new(READY, false, "Invalid", msg.as_str(), &now),
    };
    let existing = previous.map(|s| s.conditions.as_slice()).unwrap_or_default();
    ValidationStatus {
        valid: Some(outcome.is_ok()),
        observed_generation: generation,
        conditions: conditions::merge(existing, vec![desired]),
    }
}

async fn write_status<K>(api: &Api<K>, obj: &K, previous: Option<&ValidationStatus>, status: ValidationStatus) -> Result<()>
where
    K: Resource<DynamicType = ()> + Clone + std::fmt::Debug + Serialize + DeserializeOwned,
{
    if previous == Some(&status) {
        return Ok(());
    }
    let patch = json!({ "status": status });
    api.patch_status(&obj.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Validate a namespaced downloader, uploader or crawler.
#[instrument(skip(obj, ctx), fields(kind = %K::kind(&()), name = %obj.name_any(), namespace = obj.namespace()))]
pub async fn reconcile_template<K>(obj: Arc<K>, ctx: Arc<Context>) -> Result<Action>
where
    K: TemplateResource + Resource<Scope = NamespaceResourceScope>,
{
    let namespace = obj.namespace().ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    validate_template(Api::<K>::namespaced(ctx.client.clone(), &namespace), &obj.name_any(), &ctx).await
}

/// Validate a cluster-scoped downloader, uploader or crawler.
#[instrument(skip(obj, ctx), fields(kind = %K::kind(&()), name = %obj.name_any()))]
pub async fn reconcile_cluster_template<K>(obj: Arc<K>, ctx: Arc<Context>) -> Result<Action>
where
    K: TemplateResource + Resource<Scope = ClusterResourceScope>,
{
    validate_template(Api::<K>::all(ctx.client.clone()), &obj.name_any(), &ctx).await
}

async fn validate_template<K: TemplateResource>(api: Api<K>, name: &str, ctx: &Context) -> Result<Action> {
    let _measure = ctx.metrics.reconciled(TEMPLATE_CONTROLLER);
    let Some(obj) = api.get_opt(name).await? else {
        return Ok(Action::await_change());
    };
    let outcome = check_parameters(obj.template().parameters());
    if let Err(msg) = &outcome {
        warn!(%msg, "template is not valid");
    }
    let status = validation_status(&outcome, obj.meta().generation, obj.validation());
    write_status(&api, &obj, obj.validation(), status).await?;
    Ok(Action::await_change())
}

/// Validate a profile, including the uploaders it references.
#[instrument(skip(profile, ctx), fields(name = %profile.name_any(), namespace = profile.namespace()))]
pub async fn reconcile_profile(profile: Arc<Profile>, ctx: Arc<Context>) -> Result<Action> {
    let _measure = ctx.metrics.reconciled(PROFILE_CONTROLLER);
    let namespace = profile
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let api: Api<Profile> = Api::namespaced(ctx.client.clone(), &namespace);
    let Some(profile) = api.get_opt(&profile.name_any()).await? else {
        return Ok(Action::await_change());
    };

    let mut outcome = check_profile_shape(&profile.spec);
    if outcome.is_ok() {
        for r in &profile.spec.uploader_refs {
            let Some(uploader) = resolve::uploader(&ctx.client, &namespace, r).await? else {
                outcome = Err(format!("{:?} {} not found", r.kind, r.name));
                break;
            };
            match uploader.validity {
                Validity::Valid => {}
                Validity::Pending => {
                    debug!(uploader = %r.name, "uploader not validated yet");
                    return Ok(Action::requeue(UPLOADER_RETRY));
                }
                Validity::Invalid => {
                    outcome = Err(format!("{} {} is not valid", uploader.kind, uploader.name));
                    break;
                }
            }
            if let Err(err) = uploader.parameter_env(&r.parameters) {
                outcome = Err(format!("uploader {}: {err}", r.name));
                break;
            }
        }
    }
    if let Err(msg) = &outcome {
        warn!(%msg, "profile is not valid");
    }

    let status = validation_status(&outcome, profile.metadata.generation, profile.status.as_ref());
    write_status(&api, &profile, profile.status.as_ref(), status).await?;
    Ok(Action::requeue(PROFILE_RESYNC))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Container;
    use ocular_core::{
        params::ParameterSetting,
        resources::{ClusterDownloader, ClusterDownloaderSpec, Uploader, UploaderRef, UploaderSpec},
    };

    fn param(name: &str, required: bool) -> ParameterDefinition {
        ParameterDefinition {
            name: name.into(),
            required,
            ..Default::default()
        }
    }

    fn container(name: &str) -> Container {
        Container {
            name: name.into(),
            image: Some("scanner:1".into()),
            ..Default::default()
        }
    }

    #[test]
    fn parameter_names() {
        assert!(check_parameters(&[param("TOKEN", true), param("branch", false)]).is_ok());
        assert!(check_parameters(&[param("", false)]).is_err());
        assert!(check_parameters(&[param("a", false), param("a", true)]).is_err());
        let err = check_parameters(&[param("my-param", false), param("my_param", false)]).unwrap_err();
        assert!(err.contains("OCULAR_PARAM_MY_PARAM"), "{err}");
    }

    #[test]
    fn profile_shape() {
        let mut spec = ProfileSpec::default();
        assert!(check_profile_shape(&spec).is_err());
        spec.containers = vec![container("semgrep"), container("trufflehog")];
        assert!(check_profile_shape(&spec).is_ok());
        spec.containers.push(container("semgrep"));
        assert!(check_profile_shape(&spec).is_err());
        spec.containers = vec![container(DOWNLOADER_CONTAINER)];
        assert!(check_profile_shape(&spec).unwrap_err().contains("reserved"));
    }

    #[tokio::test]
    async fn cluster_template_is_marked_valid() {
        let (client, fake) = ocular_test::testcontext();
        let ctx = Arc::new(Context::with_defaults(client));
        let dl = fake.seed(&ClusterDownloader::new(
            "git",
            ClusterDownloaderSpec {
                container: container("git"),
                parameters: vec![param("REF", false)],
            },
        ));

        reconcile_cluster_template(Arc::new(dl), ctx).await.unwrap();
        let status = fake.get::<ClusterDownloader>(None, "git").unwrap().status.unwrap();
        assert_eq!(status.valid, Some(true));
        assert_eq!(status.observed_generation, Some(1));
        assert!(conditions::is_true(&status.conditions, READY));
    }

    #[tokio::test]
    async fn namespaced_template_with_duplicate_parameters_is_invalid() {
        let (client, fake) = ocular_test::testcontext();
        let ctx = Arc::new(Context::with_defaults(client));
        let mut uploader = Uploader::new(
            "s3",
            UploaderSpec {
                container: container("s3"),
                parameters: vec![param("BUCKET", true), param("BUCKET", false)],
            },
        );
        uploader.metadata.namespace = Some("ns".into());
        let uploader = fake.seed(&uploader);

        reconcile_template(Arc::new(uploader), ctx).await.unwrap();
        let status = fake.get::<Uploader>(Some("ns"), "s3").unwrap().status.unwrap();
        assert_eq!(status.valid, Some(false));
        assert!(!conditions::is_true(&status.conditions, READY));
    }

    #[tokio::test]
    async fn profile_follows_uploader_validity() {
        let (client, fake) = ocular_test::testcontext();
        let ctx = Arc::new(Context::with_defaults(client));
        let mut uploader = Uploader::new(
            "s3",
            UploaderSpec {
                container: container("s3"),
                parameters: vec![param("BUCKET", true)],
            },
        );
        uploader.metadata.namespace = Some("ns".into());
        fake.seed(&uploader);

        let mut profile = Profile::new(
            "default",
            ProfileSpec {
                containers: vec![container("semgrep")],
                artifacts: vec!["semgrep.json".into()],
                uploader_refs: vec![UploaderRef {
                    name: "s3".into(),
                    ..Default::default()
                }],
                ..Default::default()
            },
        );
        profile.metadata.namespace = Some("ns".into());
        let profile = Arc::new(fake.seed(&profile));

        // uploader not validated yet
        let action = reconcile_profile(profile.clone(), ctx.clone()).await.unwrap();
        assert_eq!(action, Action::requeue(UPLOADER_RETRY));
        assert!(fake.get::<Profile>(Some("ns"), "default").unwrap().status.is_none());

        // required BUCKET missing
        fake.set_status::<Uploader>(Some("ns"), "s3", json!({ "valid": true }));
        reconcile_profile(profile.clone(), ctx.clone()).await.unwrap();
        let status = fake.get::<Profile>(Some("ns"), "default").unwrap().status.unwrap();
        assert_eq!(status.valid, Some(false));
        assert!(conditions::find(&status.conditions, READY).unwrap().message.contains("BUCKET"));

        fake.patch::<Profile>(
            Some("ns"),
            "default",
            json!({ "spec": { "uploaderRefs": [{ "name": "s3", "parameters": [ParameterSetting::new("BUCKET", "results")] }] } }),
        );
        let action = reconcile_profile(profile, ctx).await.unwrap();
        assert_eq!(action, Action::requeue(PROFILE_RESYNC));
        let status = fake.get::<Profile>(Some("ns"), "default").unwrap().status.unwrap();
        assert_eq!(status.valid, Some(true));
        assert_eq!(status.observed_generation, Some(2));
    }
}
