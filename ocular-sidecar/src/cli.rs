//! Command line of the sidecar binary.
//!
//! Every mode reads its settings from the environment the operator injects, with
//! flags taking precedence for local runs.
use std::{path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand, ValueEnum};
use ocular_core::env::{self, paths, UPLOAD_PORT_NUMBER};

#[derive(Clone, Copy, Debug, Default, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "ocular-sidecar", version, about)]
pub struct Cli {
    #[arg(long, env = "OCULAR_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text, global = true)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub mode: Mode,
}

#[derive(Subcommand, Debug)]
pub enum Mode {
    /// Accept the artifacts of the scan stage and write them to disk.
    Receive(ReceiveArgs),
    /// After the termination signal, push the artifacts to the receiver.
    Extract(ExtractArgs),
    /// Wait for the termination signal and exit.
    Ignore,
    /// Turn crawler output on the FIFOs into pipelines and searches.
    Scheduler(SchedulerArgs),
    /// Exit 0 when both FIFOs exist.
    SchedulerReady(FifoArgs),
    /// Wait until both FIFOs exist.
    SchedulerInit(FifoArgs),
    /// Mark the end of crawler output and wait for the scheduler to drain.
    SchedulerKeepalive(KeepaliveArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ReceiveArgs {
    /// Directory the artifact paths are resolved against.
    #[arg(long, env = "OCULAR_RECEIVE_ROOT", default_value = "/")]
    pub root: PathBuf,

    #[arg(long, env = env::UPLOAD_PORT, default_value_t = UPLOAD_PORT_NUMBER)]
    pub port: u16,

    /// Absolute artifact paths to wait for.
    #[arg(last = true)]
    pub files: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct ExtractArgs {
    #[arg(long, env = env::UPLOAD_HOST)]
    pub host: String,

    #[arg(long, env = env::UPLOAD_PORT, default_value_t = UPLOAD_PORT_NUMBER)]
    pub port: u16,

    /// Absolute artifact paths to push.
    #[arg(last = true)]
    pub files: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct FifoArgs {
    #[arg(long, env = env::PIPELINE_FIFO, default_value = paths::PIPELINE_FIFO)]
    pub pipeline_fifo: PathBuf,

    #[arg(long, env = env::SEARCH_FIFO, default_value = paths::SEARCH_FIFO)]
    pub search_fifo: PathBuf,
}

impl FifoArgs {
    pub fn paths(&self) -> [&PathBuf; 2] {
        [&self.pipeline_fifo, &self.search_fifo]
    }
}

#[derive(Args, Debug, Clone)]
pub struct KeepaliveArgs {
    #[command(flatten)]
    pub fifos: FifoArgs,

    #[arg(long, env = env::SCHEDULER_COMPLETE_PATH, default_value = paths::SCHEDULER_COMPLETE)]
    pub complete_path: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct SchedulerArgs {
    #[command(flatten)]
    pub fifos: FifoArgs,

    #[arg(long, env = env::NAMESPACE)]
    pub namespace: String,

    /// Search owning the pod; names and labels the created objects.
    #[arg(long, env = env::SEARCH_NAME)]
    pub search: String,

    #[arg(long, env = env::PIPELINE_TEMPLATE_PATH, default_value = paths::PIPELINE_TEMPLATE)]
    pub template: PathBuf,

    #[arg(long, env = env::SCHEDULER_INTERVAL_SECONDS, default_value_t = 60)]
    pub interval_seconds: u32,

    #[arg(long, env = env::SCHEDULER_COMPLETE_PATH, default_value = paths::SCHEDULER_COMPLETE)]
    pub complete_path: PathBuf,
}

impl SchedulerArgs {
    /// Drain interval, at least one second.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.interval_seconds.max(1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_list_follows_double_dash() {
        let cli = Cli::try_parse_from([
            "ocular-sidecar",
            "receive",
            "--port",
            "9000",
            "--",
            "/mnt/results/report.json",
            "/mnt/results/sbom.json",
        ])
        .unwrap();
        let Mode::Receive(args) = cli.mode else {
            panic!("expected receive mode");
        };
        assert_eq!(args.port, 9000);
        assert_eq!(args.files, ["/mnt/results/report.json", "/mnt/results/sbom.json"]);
    }

    #[test]
    fn interval_never_zero() {
        let cli = Cli::try_parse_from([
            "ocular-sidecar",
            "scheduler",
            "--namespace",
            "scans",
            "--search",
            "weekly",
            "--interval-seconds",
            "0",
        ])
        .unwrap();
        let Mode::Scheduler(args) = cli.mode else {
            panic!("expected scheduler mode");
        };
        assert_eq!(args.interval(), Duration::from_secs(1));
        assert_eq!(args.fifos.pipeline_fifo, PathBuf::from(paths::PIPELINE_FIFO));
    }
}
