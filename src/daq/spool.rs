//! Raw-data spool: a bounded queue feeding a rolling-file writer task.
//!
//! The DAQ read loop must never block on disk, so record slices are handed
//! to the worker through a bounded single-producer single-consumer queue.
//! When the queue is full the record is dropped and an error is logged.
//! The worker writes `raw<run:06>_<seq:03>` files under the spool
//! directory, rotating to the next sequence number once the current file
//! reaches the rotation threshold.

use std::path::PathBuf;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Capacity of the spool queue in records.
pub const SPOOL_CAPACITY: usize = 1024;
/// Default file rotation threshold: 1024 MiB.
pub const DEFAULT_ROTATE_BYTES: u64 = 1024 * 1024 * 1024;

/// A running spool: the queue sender plus the worker task.
pub struct RawSpool {
    tx: Option<mpsc::Sender<Vec<u8>>>,
    worker: JoinHandle<()>,
}

impl RawSpool {
    /// Spawns the writer task for run `run_no` under `base_dir`.
    pub fn spawn(run_no: u32, base_dir: PathBuf, rotate_bytes: u64) -> RawSpool {
        let (tx, rx) = mpsc::channel(SPOOL_CAPACITY);
        let worker = tokio::spawn(spool_worker(rx, run_no, base_dir, rotate_bytes));
        RawSpool { tx: Some(tx), worker }
    }

    /// Enqueues one record slice. A full queue drops the record and logs an
    /// error; the caller is never blocked.
    pub fn enqueue(&self, data: Vec<u8>) {
        let Some(tx) = &self.tx else { return };
        match tx.try_send(data) {
            Ok(()) => {}
            Err(TrySendError::Full(dropped)) => {
                error!("could not queue raw data, queue full ({} bytes dropped)", dropped.len());
            }
            Err(TrySendError::Closed(_)) => {
                error!("raw data worker is gone");
            }
        }
    }

    /// Number of records currently queued.
    pub fn depth(&self) -> usize {
        self.tx.as_ref().map(|tx| tx.max_capacity() - tx.capacity()).unwrap_or(0)
    }

    /// Waits for the queue to drain, then signals the worker and joins it
    /// with a bounded timeout.
    pub async fn shutdown(mut self) {
        while self.depth() > 0 {
            info!("waiting for raw data writing... {}", self.depth());
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        self.tx.take();
        if tokio::time::timeout(Duration::from_secs(2), &mut self.worker).await.is_err() {
            warn!("raw data worker did not finish in time");
            self.worker.abort();
        }
    }
}

/// Writer task: drain the queue into rolling files.
async fn spool_worker(
    mut rx: mpsc::Receiver<Vec<u8>>,
    run_no: u32,
    base_dir: PathBuf,
    rotate_bytes: u64,
) {
    let mut seq: u32 = 0;
    loop {
        let path = base_dir.join(format!("raw{run_no:06}_{seq:03}"));
        let mut file = match tokio::fs::File::create(&path).await {
            Ok(file) => file,
            Err(err) => {
                error!("could not open raw data file {}: {}", path.display(), err);
                return;
            }
        };
        info!("raw data file {} opened", path.display());

        let mut written: u64 = 0;
        let mut rotate = false;
        while let Some(data) = rx.recv().await {
            if let Err(err) = file.write_all(&data).await {
                error!("raw data write error: {}", err);
                return;
            }
            written += data.len() as u64;
            if written >= rotate_bytes {
                rotate = true;
                break;
            }
        }
        let _ = file.flush().await;
        if !rotate {
            debug!("raw data worker finished after {} files", seq + 1);
            return;
        }
        seq += 1;
    }
}
