//! The sidecar binary the Ocular operator runs next to user containers.
//!
//! In pipelines it moves artifacts from the scan job to the upload job
//! ([`transfer`]); in search pods it turns crawler output into new Pipelines and
//! Searches ([`scheduler`]) and gates pod startup and shutdown on the FIFOs
//! between the two ([`gate`]).
use std::net::{Ipv4Addr, SocketAddr};

use tokio_util::sync::CancellationToken;
use tracing::info;

pub mod cli;
pub mod gate;
pub mod scheduler;
pub mod signal;
pub mod transfer;

mod error;
pub use error::{Error, Result};

use cli::Mode;
use transfer::{Extractor, Receiver};

/// Run one sidecar mode. `token` is cancelled on the termination signal.
pub async fn run(mode: Mode, token: CancellationToken) -> Result<()> {
    match mode {
        Mode::Receive(args) => {
            let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, args.port));
            let report = Receiver::bind(addr, &args.root, args.files).await?.run(token).await?;
            info!(received = report.received.len(), missing = report.missing.len(), "receiver done");
            Ok(())
        }
        Mode::Extract(args) => Extractor::new(&args.host, args.port).run(&args.files, token).await,
        Mode::Ignore => {
            token.cancelled().await;
            Ok(())
        }
        Mode::Scheduler(args) => scheduler::run(&args, token).await,
        Mode::SchedulerReady(fifos) => gate::ready(&fifos).await,
        Mode::SchedulerInit(fifos) => gate::init(&fifos, token).await,
        Mode::SchedulerKeepalive(args) => gate::keepalive(&args, token).await,
    }
}
