use std::sync::Arc;

use clap::Parser;
use kube::Client;
use ocular_controller::{
    config::{LogFormat, OperatorConfig},
    metrics::{self, Metrics},
    Context,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = OperatorConfig::parse();
    init_tracing(config.log_format);

    let client = Client::try_default().await?;
    let metrics = Arc::new(Metrics::default());
    let ctx = Arc::new(Context::new(client, &config, metrics.clone()));

    let probe_addr = config.probe_addr;
    let probes = tokio::spawn(async move {
        if let Err(err) = metrics::serve(probe_addr, metrics).await {
            error!(%err, "probe server stopped");
        }
    });

    info!(
        namespace = config.namespace.as_deref().unwrap_or("*"),
        sidecar = %config.sidecar_image,
        "starting controllers"
    );
    ocular_controller::run(ctx, config.namespace.as_deref()).await;
    probes.abort();
    info!("controllers stopped");
    Ok(())
}
