//! Run a two-stage pipeline against a cluster with the operator installed.
use std::time::Duration;

use kube::{
    api::{Api, DeleteParams, PostParams},
    runtime::wait::await_condition,
    Client,
};
use ocular_core::{
    resources::{Downloader, Pipeline, Profile, Uploader},
    state::PipelinePhase,
};
use serde_json::json;
use tracing::info;

fn is_finished(obj: Option<&Pipeline>) -> bool {
    obj.and_then(|p| p.status.as_ref())
        .is_some_and(|s| s.completion_time.is_some())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let client = Client::try_default().await?;
    let pp = PostParams::default();

    let downloaders: Api<Downloader> = Api::default_namespaced(client.clone());
    let downloader: Downloader = serde_json::from_value(json!({
        "apiVersion": "ocular.crashoverride.run/v1beta1",
        "kind": "Downloader",
        "metadata": { "name": "e2e-echo" },
        "spec": {
            "container": {
                "name": "download",
                "image": "alpine:latest",
                "command": ["sh", "-c", "echo \"$OCULAR_TARGET_IDENTIFIER\" > \"$OCULAR_TARGET_DIR/target\""]
            }
        }
    }))?;
    downloaders.create(&pp, &downloader).await?;

    let uploaders: Api<Uploader> = Api::default_namespaced(client.clone());
    let uploader: Uploader = serde_json::from_value(json!({
        "apiVersion": "ocular.crashoverride.run/v1beta1",
        "kind": "Uploader",
        "metadata": { "name": "e2e-list" },
        "spec": {
            "container": {
                "name": "list",
                "image": "alpine:latest",
                "command": ["sh", "-c", "ls -l \"$@\"", "upload"]
            }
        }
    }))?;
    uploaders.create(&pp, &uploader).await?;

    let profiles: Api<Profile> = Api::default_namespaced(client.clone());
    let profile: Profile = serde_json::from_value(json!({
        "apiVersion": "ocular.crashoverride.run/v1beta1",
        "kind": "Profile",
        "metadata": { "name": "e2e-copy" },
        "spec": {
            "containers": [{
                "name": "scan",
                "image": "alpine:latest",
                "command": ["sh", "-c", "cp \"$OCULAR_TARGET_DIR/target\" \"$OCULAR_RESULTS_DIR/report.txt\""]
            }],
            "artifacts": ["report.txt"],
            "uploaderRefs": [{ "name": "e2e-list" }]
        }
    }))?;
    profiles.create(&pp, &profile).await?;

    let pipelines: Api<Pipeline> = Api::default_namespaced(client);
    let name = "e2e-pipeline";
    let pipeline: Pipeline = serde_json::from_value(json!({
        "apiVersion": "ocular.crashoverride.run/v1beta1",
        "kind": "Pipeline",
        "metadata": { "name": name },
        "spec": {
            "target": { "identifier": "https://github.com/crashappsec/ocular" },
            "profileRef": { "name": "e2e-copy" },
            "downloaderRef": { "name": "e2e-echo" }
        }
    }))?;
    info!("Creating pipeline");
    pipelines.create(&pp, &pipeline).await?;

    info!("Waiting for pipeline to finish");
    let done = await_condition(pipelines.clone(), name, is_finished);
    let finished = tokio::time::timeout(Duration::from_secs(180), done).await??;
    let phase = finished.and_then(|p| p.status).map(|s| s.phase);
    anyhow::ensure!(phase == Some(PipelinePhase::Succeeded), "pipeline ended in {phase:?}");

    info!("Cleaning up");
    let dp = DeleteParams::background();
    pipelines.delete(name, &dp).await?;
    profiles.delete("e2e-copy", &dp).await?;
    uploaders.delete("e2e-list", &dp).await?;
    downloaders.delete("e2e-echo", &dp).await?;
    Ok(())
}
