//! Install the Ocular CRDs and wait until the apiserver serves them.
//!
//! `boot --print` only writes the definitions to stdout as YAML.
use std::time::Duration;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{
    api::{Api, Patch, PatchParams},
    runtime::wait::{await_condition, conditions},
    Client, ResourceExt,
};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let crds = ocular_core::resources::crds();

    if std::env::args().any(|a| a == "--print") {
        for crd in &crds {
            print!("---\n{}", serde_yaml::to_string(crd)?);
        }
        return Ok(());
    }

    let client = Client::try_default().await?;
    let api: Api<CustomResourceDefinition> = Api::all(client);
    let params = PatchParams::apply("ocular-e2e").force();
    for crd in &crds {
        let name = crd.name_any();
        info!("Applying {name}");
        api.patch(&name, &params, &Patch::Apply(crd)).await?;
        let established = await_condition(api.clone(), &name, conditions::is_crd_established());
        let _ = tokio::time::timeout(Duration::from_secs(10), established).await?;
    }
    info!("{} CRDs established", crds.len());
    Ok(())
}
