//! Controllers of the Ocular operator.
//!
//! [`run`] drives one kube-runtime [`Controller`] per custom resource:
//!
//! - pipelines, owning their scan and upload jobs and the upload service
//! - searches, owning the crawler pod
//! - cron searches, owning the searches they create
//! - profiles and the downloader, uploader and crawler templates, which only get
//!   their `status.valid` maintained
//!
//! Every reconciler shares a [`Context`] holding the client, the sidecar image and
//! the [`Metrics`](metrics::Metrics) served by the manager.
use std::{fmt::Debug, sync::Arc, time::Duration};

use futures::{Stream, StreamExt};
use k8s_openapi::{
    api::{
        batch::v1::Job,
        core::v1::{Pod, Service},
    },
    NamespaceResourceScope,
};
use kube::{
    runtime::{
        controller::{self, Action, Controller},
        reflector::ObjectRef,
        watcher,
    },
    Api, Client, Resource, ResourceExt,
};
use ocular_core::resources::{
    ClusterCrawler, ClusterDownloader, ClusterUploader, Crawler, CronSearch, Downloader, Pipeline, Profile, Search,
    Uploader,
};
use tracing::{debug, warn};

pub mod child;
pub mod config;
pub mod context;
pub mod cron_search;
pub mod metrics;
pub mod pipeline;
pub mod resolve;
pub mod search;
pub mod ttl;
pub mod validation;

mod error;
pub use context::Context;
pub use error::{Error, Result};

/// Delay before retrying a pass that returned an error.
const ERROR_RETRY: Duration = Duration::from_secs(5);

/// Error policy shared by every controller: log, count, retry shortly.
fn error_policy<K>(controller: &'static str) -> impl Fn(Arc<K>, &Error, Arc<Context>) -> Action
where
    K: Resource,
{
    move |obj, err, ctx| {
        warn!(controller, name = %obj.name_any(), namespace = obj.namespace(), %err, "reconcile failed");
        ctx.metrics.reconcile_failed(controller, err.metric_label());
        Action::requeue(ERROR_RETRY)
    }
}

/// Api for a namespaced kind, limited to `namespace` when one is given.
fn scoped<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

async fn drain<K, S>(controller: &'static str, results: S)
where
    K: Resource,
    K::DynamicType: Debug,
    S: Stream<Item = Result<(ObjectRef<K>, Action), controller::Error<Error, watcher::Error>>>,
{
    results
        .for_each(|res| async move {
            match res {
                Ok((obj, action)) => debug!(controller, ?obj, ?action, "reconciled"),
                // already reported by the error policy
                Err(controller::Error::ReconcilerFailed(..)) => {}
                Err(err) => warn!(controller, %err, "controller error"),
            }
        })
        .await;
}

/// Run every controller until a termination signal arrives.
pub async fn run(ctx: Arc<Context>, namespace: Option<&str>) {
    let client = ctx.client.clone();
    let cfg = watcher::Config::default;

    let pipelines = Controller::new(scoped::<Pipeline>(&client, namespace), cfg())
        .owns(scoped::<Job>(&client, namespace), cfg())
        .owns(scoped::<Service>(&client, namespace), cfg())
        .shutdown_on_signal()
        .run(pipeline::reconcile, error_policy(pipeline::CONTROLLER), ctx.clone());

    let searches = Controller::new(scoped::<Search>(&client, namespace), cfg())
        .owns(scoped::<Pod>(&client, namespace), cfg())
        .shutdown_on_signal()
        .run(search::reconcile, error_policy(search::CONTROLLER), ctx.clone());

    let cron_searches = Controller::new(scoped::<CronSearch>(&client, namespace), cfg())
        .owns(scoped::<Search>(&client, namespace), cfg())
        .shutdown_on_signal()
        .run(cron_search::reconcile, error_policy(cron_search::CONTROLLER), ctx.clone());

    let profiles = Controller::new(scoped::<Profile>(&client, namespace), cfg())
        .shutdown_on_signal()
        .run(
            validation::reconcile_profile,
            error_policy(validation::PROFILE_CONTROLLER),
            ctx.clone(),
        );

    let template = validation::TEMPLATE_CONTROLLER;
    let downloaders = Controller::new(scoped::<Downloader>(&client, namespace), cfg())
        .shutdown_on_signal()
        .run(validation::reconcile_template, error_policy(template), ctx.clone());
    let uploaders = Controller::new(scoped::<Uploader>(&client, namespace), cfg())
        .shutdown_on_signal()
        .run(validation::reconcile_template, error_policy(template), ctx.clone());
    let crawlers = Controller::new(scoped::<Crawler>(&client, namespace), cfg())
        .shutdown_on_signal()
        .run(validation::reconcile_template, error_policy(template), ctx.clone());
    let cluster_downloaders = Controller::new(Api::<ClusterDownloader>::all(client.clone()), cfg())
        .shutdown_on_signal()
        .run(validation::reconcile_cluster_template, error_policy(template), ctx.clone());
    let cluster_uploaders = Controller::new(Api::<ClusterUploader>::all(client.clone()), cfg())
        .shutdown_on_signal()
        .run(validation::reconcile_cluster_template, error_policy(template), ctx.clone());
    let cluster_crawlers = Controller::new(Api::<ClusterCrawler>::all(client.clone()), cfg())
        .shutdown_on_signal()
        .run(validation::reconcile_cluster_template, error_policy(template), ctx.clone());

    futures::join!(
        drain(pipeline::CONTROLLER, pipelines),
        drain(search::CONTROLLER, searches),
        drain(cron_search::CONTROLLER, cron_searches),
        drain(validation::PROFILE_CONTROLLER, profiles),
        drain(template, downloaders),
        drain(template, uploaders),
        drain(template, crawlers),
        drain(template, cluster_downloaders),
        drain(template, cluster_uploaders),
        drain(template, cluster_crawlers),
    );
}
