//! Batches newline-delimited JSON records from a reader into a [`RecordSink`].
use std::{future::Future, time::Duration};

use async_trait::async_trait;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use tokio::{
    io::AsyncRead,
    time::{sleep, MissedTickBehavior},
};
use tokio_util::{
    codec::{FramedRead, LinesCodec, LinesCodecError},
    sync::CancellationToken,
};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Longest accepted record.
const MAX_RECORD_LEN: usize = 64 * 1024;

/// How long to keep reading after end of input was signalled, for bytes still in
/// flight.
const FINAL_DRAIN: Duration = Duration::from_millis(100);

/// Where parsed records end up.
#[async_trait]
pub trait RecordSink: Send + Sync {
    type Record: DeserializeOwned + Send;

    /// Kind of object created per record, for logs.
    fn kind(&self) -> &'static str;

    /// Create the object for one record, returning its name.
    async fn submit(&self, record: Self::Record) -> Result<String, kube::Error>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PumpStats {
    pub created: usize,
    pub failed: usize,
    pub malformed: usize,
}

struct Batch<'a, S: RecordSink> {
    sink: &'a S,
    pending: Vec<S::Record>,
    stats: PumpStats,
}

impl<S: RecordSink> Batch<'_, S> {
    fn push_line(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        match serde_json::from_str(line) {
            Ok(record) => self.pending.push(record),
            Err(err) => {
                warn!(kind = self.sink.kind(), %err, line, "skipping malformed record");
                self.stats.malformed += 1;
            }
        }
    }

    async fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        debug!(kind = self.sink.kind(), records = self.pending.len(), "flushing batch");
        for record in std::mem::take(&mut self.pending) {
            match self.sink.submit(record).await {
                Ok(name) => {
                    info!(kind = self.sink.kind(), %name, "created");
                    self.stats.created += 1;
                }
                Err(err) => {
                    warn!(kind = self.sink.kind(), %err, "failed to create object");
                    self.stats.failed += 1;
                }
            }
        }
    }
}

/// Read records until EOF or until `end` resolves, submitting them once per `interval`
/// and once more at the end.
///
/// Records still buffered when `token` is cancelled are dropped.
pub async fn pump<R, E, S>(
    reader: R,
    end: E,
    sink: &S,
    interval: Duration,
    token: CancellationToken,
) -> Result<PumpStats>
where
    R: AsyncRead + Unpin,
    E: Future<Output = ()>,
    S: RecordSink,
{
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_RECORD_LEN));
    let mut batch = Batch {
        sink,
        pending: Vec::new(),
        stats: PumpStats::default(),
    };
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    tokio::pin!(end);

    let mut ended = false;
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                if !batch.pending.is_empty() {
                    warn!(kind = sink.kind(), dropped = batch.pending.len(), "terminated with unsubmitted records");
                }
                return Ok(batch.stats);
            }
            line = lines.next() => match line {
                Some(Ok(line)) => batch.push_line(&line),
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    warn!(kind = sink.kind(), "skipping oversized record");
                    batch.stats.malformed += 1;
                }
                Some(Err(LinesCodecError::Io(source))) => {
                    return Err(Error::Pump { kind: sink.kind(), source });
                }
                None => break,
            },
            _ = ticker.tick() => batch.flush().await,
            _ = &mut end => {
                ended = true;
                break;
            }
        }
    }

    if ended {
        let deadline = sleep(FINAL_DRAIN);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                line = lines.next() => match line {
                    Some(Ok(line)) => batch.push_line(&line),
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => batch.stats.malformed += 1,
                    Some(Err(LinesCodecError::Io(_))) | None => break,
                },
                _ = &mut deadline => break,
            }
        }
        // a writer that exited without a final newline
        let rest = String::from_utf8_lossy(lines.read_buffer()).into_owned();
        batch.push_line(&rest);
    }

    batch.flush().await;
    Ok(batch.stats)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use ocular_core::resources::Target;
    use tokio::io::AsyncWriteExt;

    use super::*;

    #[derive(Default)]
    struct Collect {
        seen: Mutex<Vec<Target>>,
    }

    #[async_trait]
    impl RecordSink for Collect {
        type Record = Target;

        fn kind(&self) -> &'static str {
            "Target"
        }

        async fn submit(&self, record: Target) -> Result<String, kube::Error> {
            let name = record.identifier.clone();
            self.seen.lock().unwrap().push(record);
            Ok(name)
        }
    }

    fn identifiers(sink: &Collect) -> Vec<String> {
        sink.seen.lock().unwrap().iter().map(|t| t.identifier.clone()).collect()
    }

    #[tokio::test]
    async fn blank_and_malformed_lines_are_skipped() {
        let (mut tx, rx) = tokio::io::duplex(1024);
        tx.write_all(b"{\"identifier\":\"a\"}\n\n  \nnot json\n{\"identifier\":\"b\",\"version\":\"v1\"}\n{\"identifier\":\"c\"}")
            .await
            .unwrap();
        drop(tx);

        let sink = Collect::default();
        let stats = pump(rx, std::future::pending(), &sink, Duration::from_secs(3600), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(identifiers(&sink), ["a", "b", "c"]);
        assert_eq!(stats, PumpStats { created: 3, failed: 0, malformed: 1 });
        assert_eq!(sink.seen.lock().unwrap()[1].version.as_deref(), Some("v1"));
    }

    #[tokio::test]
    async fn end_signal_picks_up_unterminated_record() {
        // writer stays open, as with a fifo opened read-write
        let (mut tx, rx) = tokio::io::duplex(1024);
        tx.write_all(b"{\"identifier\":\"a\"}\n{\"identifier\":\"tail\"}").await.unwrap();

        let sink = Collect::default();
        let end = sleep(Duration::from_millis(50));
        let stats = pump(rx, end, &sink, Duration::from_secs(3600), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(identifiers(&sink), ["a", "tail"]);
        assert_eq!(stats.created, 2);
        drop(tx);
    }

    #[tokio::test(start_paused = true)]
    async fn records_are_flushed_every_interval() {
        let (mut tx, rx) = tokio::io::duplex(1024);
        let sink = Collect::default();
        let token = CancellationToken::new();

        let run = pump(rx, std::future::pending(), &sink, Duration::from_secs(10), token.clone());
        let drive = async {
            tx.write_all(b"{\"identifier\":\"a\"}\n").await.unwrap();
            sleep(Duration::from_secs(1)).await;
            assert!(identifiers(&sink).is_empty());
            sleep(Duration::from_secs(10)).await;
            assert_eq!(identifiers(&sink), ["a"]);

            tx.write_all(b"{\"identifier\":\"b\"}\n").await.unwrap();
            sleep(Duration::from_secs(1)).await;
            token.cancel();
        };
        let (stats, ()) = tokio::join!(run, drive);
        // cancelled before the next tick
        assert_eq!(stats.unwrap().created, 1);
        assert_eq!(identifiers(&sink), ["a"]);
    }
}
