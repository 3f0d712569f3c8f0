//! The scheduler sidecar of a search pod.
//!
//! The crawler writes one JSON record per line to two FIFOs: targets on the
//! pipeline FIFO, crawler references on the search FIFO. Each FIFO gets its own
//! pump that turns records into Pipelines and Searches in the search's namespace.
//! Once both pumps drained, the completion marker is written so the keepalive
//! container can exit. The scheduler itself then idles until the pod terminates,
//! as a restarted sidecar would recreate the FIFOs.
use std::{collections::BTreeMap, path::Path, time::Duration};

use async_trait::async_trait;
use kube::{
    api::{ObjectMeta, PostParams},
    Api, Client, ResourceExt,
};
use ocular_core::{
    labels, naming,
    resources::{CrawlerRef, Pipeline, PipelineTemplate, SchedulerSpec, Search, SearchSpec, Target},
};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    cli::SchedulerArgs,
    error::{Error, Result},
};

pub mod fifo;
pub mod pump;

pub use pump::{PumpStats, RecordSink};

const REMOVAL_POLL: Duration = Duration::from_millis(250);

/// Labels of every object the scheduler creates for `search`.
fn search_labels(search: &str, extra: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut merged = extra.clone();
    merged.insert(labels::SEARCH.to_string(), naming::label_value(search));
    merged
}

/// Creates one Pipeline per target.
pub struct PipelineSink {
    api: Api<Pipeline>,
    search: String,
    template: PipelineTemplate,
}

impl PipelineSink {
    pub fn new(client: Client, namespace: &str, search: &str, template: PipelineTemplate) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            search: search.to_string(),
            template,
        }
    }

    pub fn pipeline_for(&self, target: Target) -> Pipeline {
        let meta = &self.template.metadata;
        Pipeline {
            metadata: ObjectMeta {
                generate_name: Some(
                    meta.generate_name
                        .clone()
                        .unwrap_or_else(|| naming::generate_name(&self.search)),
                ),
                labels: Some(search_labels(&self.search, &meta.labels)),
                annotations: (!meta.annotations.is_empty()).then(|| meta.annotations.clone()),
                ..ObjectMeta::default()
            },
            spec: self.template.spec_for(target),
            status: None,
        }
    }
}

#[async_trait]
impl RecordSink for PipelineSink {
    type Record = Target;

    fn kind(&self) -> &'static str {
        "Pipeline"
    }

    async fn submit(&self, target: Target) -> Result<String, kube::Error> {
        let created = self.api.create(&PostParams::default(), &self.pipeline_for(target)).await?;
        Ok(created.name_any())
    }
}

/// Creates one Search per crawler reference, scheduling with the same template.
pub struct SearchSink {
    api: Api<Search>,
    search: String,
    scheduler: SchedulerSpec,
}

impl SearchSink {
    pub fn new(
        client: Client,
        namespace: &str,
        search: &str,
        template: PipelineTemplate,
        interval_seconds: u32,
    ) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            search: search.to_string(),
            scheduler: SchedulerSpec {
                pipeline_template: template,
                interval_seconds,
            },
        }
    }

    pub fn search_for(&self, crawler: CrawlerRef) -> Search {
        Search {
            metadata: ObjectMeta {
                generate_name: Some(naming::generate_name(&self.search)),
                labels: Some(search_labels(&self.search, &BTreeMap::new())),
                ..ObjectMeta::default()
            },
            spec: SearchSpec {
                crawler_ref: crawler,
                scheduler: self.scheduler.clone(),
                service_account_name: None,
                ttl_seconds_after_finished: None,
            },
            status: None,
        }
    }
}

#[async_trait]
impl RecordSink for SearchSink {
    type Record = CrawlerRef;

    fn kind(&self) -> &'static str {
        "Search"
    }

    async fn submit(&self, crawler: CrawlerRef) -> Result<String, kube::Error> {
        let created = self.api.create(&PostParams::default(), &self.search_for(crawler)).await?;
        Ok(created.name_any())
    }
}

/// Read the pipeline template the search pod mounts.
pub async fn load_template(path: &Path) -> Result<PipelineTemplate> {
    let raw = tokio::fs::read(path).await.map_err(Error::io(path))?;
    serde_json::from_slice(&raw).map_err(|source| Error::Template {
        path: path.to_path_buf(),
        source,
    })
}

async fn drain<S: RecordSink>(
    path: &Path,
    sink: S,
    interval: Duration,
    token: CancellationToken,
) -> Result<PumpStats> {
    let reader = fifo::open(path)?;
    let stats = pump::pump(reader, fifo::removed(path, REMOVAL_POLL), &sink, interval, token).await?;
    info!(kind = sink.kind(), ?stats, "fifo drained");
    Ok(stats)
}

/// Write the completion marker, then wait for the pod to shut down.
async fn complete(path: &Path, token: CancellationToken) -> Result<()> {
    tokio::fs::write(path, b"").await.map_err(Error::io(path))?;
    info!(marker = %path.display(), "completion marker written");
    token.cancelled().await;
    Ok(())
}

/// Run both pumps to completion, write the completion marker and idle until shutdown.
pub async fn run(args: &SchedulerArgs, token: CancellationToken) -> Result<()> {
    for path in args.fifos.paths() {
        fifo::create(path)?;
    }
    let template = load_template(&args.template).await?;
    let client = Client::try_default().await?;

    let pipelines = PipelineSink::new(client.clone(), &args.namespace, &args.search, template.clone());
    let searches = SearchSink::new(client, &args.namespace, &args.search, template, args.interval_seconds);
    info!(search = %args.search, interval = ?args.interval(), "scheduling crawler output");

    let (pipelines, searches) = tokio::join!(
        drain(&args.fifos.pipeline_fifo, pipelines, args.interval(), token.clone()),
        drain(&args.fifos.search_fifo, searches, args.interval(), token.clone()),
    );
    let (pipelines, searches) = (pipelines?, searches?);
    info!(
        pipelines = pipelines.created,
        searches = searches.created,
        failed = pipelines.failed + searches.failed,
        "scheduler finished"
    );

    complete(&args.complete_path, token).await
}

#[cfg(test)]
mod tests {
    use ocular_core::resources::{CrawlerKind, DownloaderRef, PipelineSpec, ProfileRef, TemplateMetadata};
    use serde_json::json;

    use super::*;

    fn template() -> PipelineTemplate {
        PipelineTemplate {
            metadata: TemplateMetadata {
                generate_name: Some("nightly-".into()),
                labels: BTreeMap::from([("team".into(), "appsec".into())]),
                ..TemplateMetadata::default()
            },
            spec: PipelineSpec {
                target: Target::default(),
                profile_ref: ProfileRef { name: "semgrep".into() },
                downloader_ref: DownloaderRef {
                    name: "git".into(),
                    ..DownloaderRef::default()
                },
                ttl_seconds_after_finished: Some(600),
                ..PipelineSpec::default()
            },
        }
    }

    #[tokio::test]
    async fn one_pipeline_per_target() {
        let (client, fake) = ocular_test::testcontext();
        let sink = PipelineSink::new(client, "scans", "weekly", template());
        let name = sink
            .submit(Target {
                identifier: "https://github.com/crashappsec/ocular".into(),
                version: Some("main".into()),
            })
            .await
            .unwrap();
        assert!(name.starts_with("nightly-"));

        let created = fake.get::<Pipeline>(Some("scans"), &name).unwrap();
        assert_eq!(created.spec.target.identifier, "https://github.com/crashappsec/ocular");
        assert_eq!(created.spec.profile_ref.name, "semgrep");
        assert_eq!(created.spec.ttl_seconds_after_finished, Some(600));
        assert_eq!(created.labels().get(labels::SEARCH).map(String::as_str), Some("weekly"));
        assert_eq!(created.labels().get("team").map(String::as_str), Some("appsec"));
        assert!(created.owner_references().is_empty());
    }

    #[tokio::test]
    async fn searches_reuse_template_and_interval() {
        let (client, fake) = ocular_test::testcontext();
        let sink = SearchSink::new(client, "scans", "weekly", template(), 30);
        let crawler: CrawlerRef = serde_json::from_value(json!({
            "name": "github-org",
            "kind": "ClusterCrawler",
            "parameters": [{ "name": "ORG", "value": "crashappsec" }]
        }))
        .unwrap();
        let name = sink.submit(crawler).await.unwrap();
        assert!(name.starts_with("weekly-"));

        let created = fake.get::<Search>(Some("scans"), &name).unwrap();
        assert_eq!(created.spec.crawler_ref.name, "github-org");
        assert_eq!(created.spec.crawler_ref.kind, CrawlerKind::ClusterCrawler);
        assert_eq!(created.spec.scheduler.interval_seconds, 30);
        assert_eq!(created.spec.scheduler.pipeline_template, template());
    }

    #[tokio::test]
    async fn long_search_name_yields_valid_labels() {
        let search = format!("crawl-{}", "github-organisation-".repeat(4)).trim_end_matches('-').to_string();
        assert!(search.len() > naming::MAX_NAME_LEN);
        let (client, _) = ocular_test::testcontext();
        let sink = PipelineSink::new(client.clone(), "scans", &search, template());
        let pipeline = sink.pipeline_for(Target::default());
        let label = &pipeline.labels()[labels::SEARCH];
        assert!(label.len() <= naming::MAX_NAME_LEN);
        assert_eq!(label, &labels::search(&search)[labels::SEARCH]);

        let searches = SearchSink::new(client, "scans", &search, template(), 30);
        let child = searches.search_for(CrawlerRef::default());
        assert!(child.metadata.generate_name.unwrap().len() < naming::MAX_NAME_LEN);
    }

    #[tokio::test]
    async fn completion_marker_does_not_end_the_scheduler() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("complete");
        let token = CancellationToken::new();
        let task = tokio::spawn(complete_owned(marker.clone(), token.clone()));

        tokio::time::timeout(Duration::from_secs(5), async {
            while !marker.exists() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished());

        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    async fn complete_owned(path: std::path::PathBuf, token: CancellationToken) -> Result<()> {
        complete(&path, token).await
    }

    #[tokio::test]
    async fn pipeline_without_template_name_is_named_after_search() {
        let mut template = template();
        template.metadata.generate_name = None;
        let (client, _) = ocular_test::testcontext();
        let sink = PipelineSink::new(client, "scans", "weekly", template);
        let pipeline = sink.pipeline_for(Target::default());
        assert_eq!(pipeline.metadata.generate_name.as_deref(), Some("weekly-"));
    }
}
