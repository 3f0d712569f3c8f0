//! Metrics recorded by the controllers and the probe server exposing them.
//!
//! Every [`Metrics`] owns its own Prometheus recorder instead of installing a
//! global one, so each manager (and each test context) renders only what it
//! recorded itself.
use std::{
    fmt,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{extract::State, http::header, response::IntoResponse, routing::get, Router};
use metrics::{counter, describe_counter, describe_histogram, gauge, histogram, with_local_recorder, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle, PrometheusRecorder};

pub const RECONCILES: &str = "ocular_reconciles_total";
pub const RECONCILE_FAILURES: &str = "ocular_reconcile_failures_total";
pub const RECONCILE_DURATION: &str = "ocular_reconcile_duration_seconds";
pub const PIPELINES_FINISHED: &str = "ocular_pipelines_finished_total";
pub const SEARCHES_FINISHED: &str = "ocular_searches_finished_total";
pub const CRON_SEARCHES_SCHEDULED: &str = "ocular_cron_searches_scheduled_total";
pub const TTL_DELETIONS: &str = "ocular_ttl_deletions_total";
const BUILD_INFO: &str = "ocular_build_info";

const UPKEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Counters for every controller, owned by `main` and shared through the context.
pub struct Metrics {
    recorder: PrometheusRecorder,
    handle: PrometheusHandle,
}

impl fmt::Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let metrics = Self { recorder, handle };
        metrics.record(|| {
            describe_counter!(RECONCILES, "Reconcile passes started");
            describe_counter!(RECONCILE_FAILURES, "Reconcile passes that returned an error");
            describe_histogram!(RECONCILE_DURATION, Unit::Seconds, "Time spent in a reconcile pass");
            describe_counter!(PIPELINES_FINISHED, "Pipelines that reached a terminal phase");
            describe_counter!(SEARCHES_FINISHED, "Searches that reached a terminal phase");
            describe_counter!(CRON_SEARCHES_SCHEDULED, "Searches created by cron searches");
            describe_counter!(TTL_DELETIONS, "Finished objects deleted after their TTL");
            gauge!(BUILD_INFO, "version" => env!("CARGO_PKG_VERSION")).set(1.0);
        });
        metrics
    }
}

/// Records the duration of a reconcile pass when dropped.
#[must_use = "the pass is measured until the guard is dropped"]
pub struct ReconcileMeasurer<'a> {
    metrics: &'a Metrics,
    controller: &'static str,
    start: Instant,
}

impl Drop for ReconcileMeasurer<'_> {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed().as_secs_f64();
        let controller = self.controller;
        self.metrics
            .record(|| histogram!(RECONCILE_DURATION, "controller" => controller).record(elapsed));
    }
}

impl Metrics {
    fn record<T>(&self, f: impl FnOnce() -> T) -> T {
        with_local_recorder(&self.recorder, f)
    }

    /// Count a reconcile pass and measure it until the returned guard drops.
    pub fn reconciled(&self, controller: &'static str) -> ReconcileMeasurer<'_> {
        self.record(|| counter!(RECONCILES, "controller" => controller).increment(1));
        ReconcileMeasurer {
            metrics: self,
            controller,
            start: Instant::now(),
        }
    }

    pub fn reconcile_failed(&self, controller: &'static str, error: &'static str) {
        self.record(|| counter!(RECONCILE_FAILURES, "controller" => controller, "error" => error).increment(1));
    }

    pub fn pipeline_finished(&self, phase: &str) {
        let phase = phase.to_string();
        self.record(|| counter!(PIPELINES_FINISHED, "phase" => phase).increment(1));
    }

    pub fn search_finished(&self, phase: &str) {
        let phase = phase.to_string();
        self.record(|| counter!(SEARCHES_FINISHED, "phase" => phase).increment(1));
    }

    pub fn cron_search_scheduled(&self) {
        self.record(|| counter!(CRON_SEARCHES_SCHEDULED).increment(1));
    }

    pub fn ttl_deleted(&self, kind: &str) {
        let kind = kind.to_string();
        self.record(|| counter!(TTL_DELETIONS, "kind" => kind).increment(1));
    }

    /// Everything recorded so far, in the Prometheus text format.
    pub fn render(&self) -> String {
        self.handle.render()
    }

    /// Current value of a counter series, zero when it was never incremented.
    #[cfg(test)]
    pub(crate) fn get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let mut wanted: Vec<String> = labels.iter().map(|(k, v)| format!("{k}=\"{v}\"")).collect();
        wanted.sort();
        self.render()
            .lines()
            .filter(|line| !line.starts_with('#'))
            .filter_map(|line| line.rsplit_once(' '))
            .find_map(|(series, value)| {
                let (series_name, rest) = series.split_once('{').unwrap_or((series, ""));
                let mut got: Vec<String> = rest
                    .trim_end_matches('}')
                    .split(',')
                    .filter(|l| !l.is_empty())
                    .map(String::from)
                    .collect();
                got.sort();
                (series_name == name && got == wanted).then(|| value.parse().ok()).flatten()
            })
            .unwrap_or(0)
    }
}

async fn render_metrics(State(metrics): State<Arc<Metrics>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics.render(),
    )
}

async fn healthz() -> &'static str {
    "ok"
}

pub fn router(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/metrics", get(render_metrics))
        .route("/healthz", get(healthz))
        .with_state(metrics)
}

/// Serve the probe endpoints until the process exits.
pub async fn serve(addr: SocketAddr, metrics: Arc<Metrics>) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "serving metrics and health probes");
    let handle = metrics.handle.clone();
    let upkeep = tokio::spawn(async move {
        loop {
            tokio::time::sleep(UPKEEP_INTERVAL).await;
            handle.run_upkeep();
        }
    });
    let served = axum::serve(listener, router(metrics)).await;
    upkeep.abort();
    served
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_rendered_per_series() {
        let metrics = Metrics::default();
        drop(metrics.reconciled("pipeline"));
        drop(metrics.reconciled("pipeline"));
        drop(metrics.reconciled("search"));
        metrics.reconcile_failed("search", "kube");
        metrics.cron_search_scheduled();

        assert_eq!(metrics.get(RECONCILES, &[("controller", "pipeline")]), 2);
        assert_eq!(metrics.get(RECONCILES, &[("controller", "cron")]), 0);
        assert_eq!(metrics.get(RECONCILE_FAILURES, &[("error", "kube"), ("controller", "search")]), 1);
        assert_eq!(metrics.get(CRON_SEARCHES_SCHEDULED, &[]), 1);

        let text = metrics.render();
        assert!(text.contains("# TYPE ocular_reconciles_total counter"));
        assert!(text.contains(RECONCILE_DURATION));
        assert!(text.contains("ocular_build_info"));
    }

    #[test]
    fn contexts_do_not_share_series() {
        let first = Metrics::default();
        let second = Metrics::default();
        first.ttl_deleted("Pipeline");
        assert_eq!(first.get(TTL_DELETIONS, &[("kind", "Pipeline")]), 1);
        assert_eq!(second.get(TTL_DELETIONS, &[("kind", "Pipeline")]), 0);
    }
}
