use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::crawler::aggregate::TraderAggregate;
use crate::storage::report::{write_report, ReportContext};
use crate::storage::table::write_aggregate_table;

/// Queued checkpoints beyond this are dropped
const PENDING_CHECKPOINTS: usize = 2;

/// Partial aggregate taken mid-run
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub traders: Vec<TraderAggregate>,
    pub context: ReportContext,
}

/// Durable destination for checkpoints
pub trait CheckpointSink: Send + Sync + 'static {
    fn write(&self, checkpoint: &Checkpoint) -> Result<()>;
}

/// Interim CSV plus a regenerated report
pub struct FileCheckpointSink {
    interim_path: PathBuf,
    report_path: PathBuf,
}

impl FileCheckpointSink {
    pub fn new(interim_path: PathBuf, report_path: PathBuf) -> Self {
        Self { interim_path, report_path }
    }
}

impl CheckpointSink for FileCheckpointSink {
    fn write(&self, checkpoint: &Checkpoint) -> Result<()> {
        write_aggregate_table(&self.interim_path, &checkpoint.traders)?;
        write_report(&self.report_path, &checkpoint.traders, &checkpoint.context)?;
        Ok(())
    }
}

/// Hands checkpoints to a background writer so the caller never waits on disk
pub struct CheckpointEmitter {
    tx: mpsc::Sender<Checkpoint>,
    worker: JoinHandle<usize>,
}

impl CheckpointEmitter {
    pub fn spawn(sink: Arc<dyn CheckpointSink>) -> Self {
        let (tx, mut rx) = mpsc::channel::<Checkpoint>(PENDING_CHECKPOINTS);

        let worker = tokio::spawn(async move {
            let mut written = 0;

            while let Some(checkpoint) = rx.recv().await {
                let sink = sink.clone();
                let traders = checkpoint.traders.len();
                let pages = checkpoint.context.successful_pages;

                match tokio::task::spawn_blocking(move || sink.write(&checkpoint)).await {
                    Ok(Ok(())) => {
                        written += 1;
                        info!(traders, pages, "Checkpoint written");
                    }
                    Ok(Err(e)) => warn!("Checkpoint failed: {:#}", e),
                    Err(e) => warn!("Checkpoint writer task failed: {}", e),
                }
            }

            written
        });

        Self { tx, worker }
    }

    /// Queue a checkpoint without waiting
    pub fn emit(&self, checkpoint: Checkpoint) {
        match self.tx.try_send(checkpoint) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => debug!("Checkpoint writer busy, skipping checkpoint"),
            Err(TrySendError::Closed(_)) => warn!("Checkpoint writer stopped, skipping checkpoint"),
        }
    }

    /// Drain queued checkpoints; returns how many were written
    pub async fn finish(self) -> usize {
        drop(self.tx);
        self.worker.await.unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::task::TraderKey;
    use crate::storage::table::read_aggregate_table;
    use rust_decimal_macros::dec;

    struct FailingSink;

    impl CheckpointSink for FailingSink {
        fn write(&self, _checkpoint: &Checkpoint) -> Result<()> {
            anyhow::bail!("disk full")
        }
    }

    fn checkpoint() -> Checkpoint {
        Checkpoint {
            traders: vec![TraderAggregate {
                key: TraderKey { name: "Ann".to_string(), location: "Texas, US".to_string() },
                total_earnings: dec!(42.50),
                pages: vec![1, 2],
            }],
            context: ReportContext { total_pages: 2, successful_pages: 2, interim: true, ..Default::default() },
        }
    }

    #[tokio::test]
    async fn test_file_sink_writes_interim_table_and_report() {
        let dir = tempfile::tempdir().unwrap();
        let interim = dir.path().join("interim.csv");
        let report = dir.path().join("report.html");

        let emitter = CheckpointEmitter::spawn(Arc::new(FileCheckpointSink::new(interim.clone(), report.clone())));
        emitter.emit(checkpoint());
        assert_eq!(emitter.finish().await, 1);

        assert_eq!(read_aggregate_table(&interim).unwrap(), checkpoint().traders);
        assert!(std::fs::read_to_string(&report).unwrap().contains("(interim)"));
    }

    #[tokio::test]
    async fn test_sink_errors_are_swallowed() {
        let emitter = CheckpointEmitter::spawn(Arc::new(FailingSink));
        emitter.emit(checkpoint());
        emitter.emit(checkpoint());
        assert_eq!(emitter.finish().await, 0);
    }
}
