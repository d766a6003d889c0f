//! Continuous TCP data acquisition.
//!
//! A [`DaqClient`] connects to the data port of a device and feeds the
//! received byte stream to a [`DaqHandler`]. The core contract is record
//! alignment: `on_daq_data` is only ever invoked with a buffer whose length
//! is an exact multiple of the handler's data unit; trailing bytes shorter
//! than one unit are held until the next receive.
//!
//! [`DaqRecorder`] is the bundled handler: it tracks throughput statistics
//! and can spool the raw stream to rolling files through a bounded queue
//! (see [`RawSpool`]).

mod recorder;
mod spool;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tracing::{debug, error};

use crate::state::{RunStage, RunState};

pub use recorder::{DaqRecorder, NOT_STARTED_STAMP, ZERO_DURATION};
pub use spool::{RawSpool, DEFAULT_ROTATE_BYTES, SPOOL_CAPACITY};

/// Connect timeout of the DAQ client.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
/// Readiness poll ceiling of the DAQ read loop.
pub const READ_POLL: Duration = Duration::from_millis(10);

/// Consumer of an acquisition stream.
#[async_trait]
pub trait DaqHandler: Send + Sync + 'static {
    /// The record unit size in bytes. Buffers passed to
    /// [`DaqHandler::on_daq_data`] are always a multiple of this.
    fn data_unit(&self) -> usize {
        8
    }

    /// Called when acquisition is starting, before the connect.
    async fn on_daq_start(&self);

    /// Called with a record-aligned slice of the stream.
    async fn on_daq_data(&self, data: &[u8]);

    /// Called periodically while the read loop runs, data or not.
    async fn on_daq_running(&self);

    /// Called when acquisition is stopping.
    async fn on_daq_stop(&self);

    /// Called when the connect fails; the client thread exits afterwards.
    async fn on_error(&self, error: &anyhow::Error) {
        error!("DAQ error stop: {:#}", error);
        self.on_daq_stop().await;
    }
}

/// TCP client driving a [`DaqHandler`].
///
/// `start` spawns the acquisition task and returns once it is running (or
/// already failed to connect); `stop` requests shutdown and joins it.
pub struct DaqClient<H: DaqHandler> {
    handler: Arc<H>,
    host: String,
    port: u16,
    state: RunState,
    received_bytes: Arc<AtomicU64>,
    residual_bytes: Arc<AtomicU64>,
    error: Arc<Mutex<Option<String>>>,
}

impl<H: DaqHandler> DaqClient<H> {
    /// Creates a client for the device data port at `host:port`.
    pub fn new(handler: Arc<H>, host: impl Into<String>, port: u16) -> DaqClient<H> {
        DaqClient {
            handler,
            host: host.into(),
            port,
            state: RunState::new(),
            received_bytes: Arc::new(AtomicU64::new(0)),
            residual_bytes: Arc::new(AtomicU64::new(0)),
            error: Arc::new(Mutex::new(None)),
        }
    }

    /// The handler fed by this client.
    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    /// The connect error message, when the acquisition task failed to start.
    pub fn error(&self) -> Option<String> {
        self.error.lock().expect("daq error mutex poisoned").clone()
    }

    /// Lifecycle state of the acquisition task.
    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// Spawns the acquisition task and waits until it runs or has already
    /// stopped on a connect failure.
    pub async fn start(&self) {
        self.state.transit(RunStage::Starting);
        let handler = self.handler.clone();
        let host = self.host.clone();
        let port = self.port;
        let state = self.state.clone();
        let received = self.received_bytes.clone();
        let residual = self.residual_bytes.clone();
        let error = self.error.clone();
        tokio::spawn(async move {
            run(handler, host, port, state, received, residual, error).await;
        });
        self.state.wait(RunStage::Running, None).await;
    }

    /// Requests shutdown and joins the acquisition task, bounded at 10 s.
    pub async fn stop(&self) {
        self.state.transit(RunStage::Stopping);
        self.state.wait(RunStage::Stopped, Some(Duration::from_secs(10))).await;
        debug!("DAQ received bytes: {}", self.received_bytes.load(Ordering::Relaxed));
        debug!("DAQ residual bytes: {}", self.residual_bytes.load(Ordering::Relaxed));
    }
}

/// The acquisition task: connect, read, align, deliver.
async fn run<H: DaqHandler>(
    handler: Arc<H>,
    host: String,
    port: u16,
    state: RunState,
    received: Arc<AtomicU64>,
    residual: Arc<AtomicU64>,
    error_slot: Arc<Mutex<Option<String>>>,
) {
    handler.on_daq_start().await;

    let connected =
        match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host.as_str(), port)))
            .await
        {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(err)) => Err(anyhow::Error::from(err)),
            Err(_) => Err(anyhow!("connect timed out")),
        };
    let mut stream = match connected {
        Ok(stream) => stream,
        Err(err) => {
            error!("device connection error ({}) {} {}", err, host, port);
            *error_slot.lock().expect("daq error mutex poisoned") = Some(err.to_string());
            handler.on_error(&err).await;
            state.transit(RunStage::Stopped);
            return;
        }
    };

    let data_unit = handler.data_unit().max(1);
    let max_buff = data_unit * 1_048_576;
    let mut partial: Vec<u8> = Vec::new();
    let mut chunk = vec![0u8; max_buff];
    let mut ticks: u32 = 0;

    state.transit(RunStage::Running);
    while state.current() == RunStage::Running {
        match tokio::time::timeout(READ_POLL, stream.read(&mut chunk)).await {
            Ok(Ok(0)) => {
                debug!("data stream closed by device");
                break;
            }
            Ok(Ok(count)) => {
                partial.extend_from_slice(&chunk[..count]);
                let complete = partial.len() - partial.len() % data_unit;
                if complete > 0 {
                    handler.on_daq_data(&partial[..complete]).await;
                    received.fetch_add(complete as u64, Ordering::Relaxed);
                    partial.drain(..complete);
                }
            }
            Ok(Err(err)) => {
                error!("internal DAQ process error ({})", err);
                break;
            }
            Err(_) => {}
        }
        ticks += 1;
        if ticks % 2 == 0 {
            handler.on_daq_running().await;
            ticks = 0;
        }
    }

    state.transit(RunStage::Stopping);
    residual.store(partial.len() as u64, Ordering::Relaxed);
    handler.on_daq_stop().await;
    drop(stream);
    state.transit(RunStage::Stopped);
}
