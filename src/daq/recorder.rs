//! The bundled DAQ handler: throughput statistics and raw-data spooling.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use tracing::{debug, info, warn};

use crate::daq::spool::{RawSpool, DEFAULT_ROTATE_BYTES};
use crate::daq::DaqHandler;

/// Timestamp placeholder shown before the first run.
pub const NOT_STARTED_STAMP: &str = "---------- --:--:--.------";
/// Duration placeholder shown before any time has passed.
pub const ZERO_DURATION: &str = "0:00:00.000000";

#[derive(Default)]
struct DaqStats {
    start: Option<DateTime<Local>>,
    end: Option<DateTime<Local>>,
    current: Option<DateTime<Local>>,
    bytes: u64,
}

struct SpoolArming {
    run_no: u32,
    base_dir: PathBuf,
}

/// Rate-measuring [`DaqHandler`] with an optional raw-data spool.
///
/// Statistics cover `{start_time, end_time, current_time, total_bytes}`;
/// the derived rate is `(total_bytes / data_unit) / elapsed_seconds`,
/// frozen at the end time once acquisition stops. Arm the spool with
/// [`DaqRecorder::set_raw_save`] before a run starts; every record slice is
/// then queued to a worker writing rolling `raw<run>_<seq>` files.
pub struct DaqRecorder {
    data_unit: usize,
    rotate_bytes: AtomicU64,
    stats: Mutex<DaqStats>,
    armed: Mutex<Option<SpoolArming>>,
    spool: Mutex<Option<RawSpool>>,
}

impl Default for DaqRecorder {
    fn default() -> Self {
        DaqRecorder::new(8)
    }
}

impl DaqRecorder {
    /// Creates a recorder for streams of `data_unit`-byte records.
    pub fn new(data_unit: usize) -> DaqRecorder {
        DaqRecorder {
            data_unit: data_unit.max(1),
            rotate_bytes: AtomicU64::new(DEFAULT_ROTATE_BYTES),
            stats: Mutex::new(DaqStats::default()),
            armed: Mutex::new(None),
            spool: Mutex::new(None),
        }
    }

    /// Overrides the spool file rotation threshold.
    pub fn set_rotate_bytes(&self, bytes: u64) {
        self.rotate_bytes.store(bytes.max(1), Ordering::Relaxed);
    }

    /// Arms or disarms raw-data saving for the next run.
    ///
    /// `run_no` names the run in the spool file names; `base_dir` is the
    /// directory the files are written to.
    pub fn set_raw_save(&self, enabled: bool, run_no: u32, base_dir: Option<PathBuf>) {
        let mut armed = self.armed.lock().expect("spool arming mutex poisoned");
        if !enabled {
            *armed = None;
            return;
        }
        match base_dir {
            Some(base_dir) => *armed = Some(SpoolArming { run_no, base_dir }),
            None => warn!("raw data save requested without a base directory, not armed"),
        }
    }

    /// Whether raw-data saving is armed.
    pub fn raw_save_armed(&self) -> bool {
        self.armed.lock().expect("spool arming mutex poisoned").is_some()
    }

    /// Records currently queued for the spool worker, when one is running.
    pub fn queue_depth(&self) -> Option<usize> {
        self.spool.lock().expect("spool mutex poisoned").as_ref().map(RawSpool::depth)
    }

    /// Statistics lines in `key=value` form: start time, end time,
    /// duration, events, cps, bytes and the raw-save state.
    pub fn stat_list(&self) -> Vec<String> {
        let stats = self.stats.lock().expect("daq stats mutex poisoned");
        let mut start_time = NOT_STARTED_STAMP.to_string();
        let mut end_time = NOT_STARTED_STAMP.to_string();
        let mut duration = ZERO_DURATION.to_string();
        let mut cps = 0.0f64;

        if let (Some(start), Some(current)) = (stats.start, stats.current) {
            start_time = format_stamp(start);
            let elapsed = seconds_between(start, current);
            if elapsed > 0.0 {
                duration = format_duration(current - start);
                cps = (stats.bytes / self.data_unit as u64) as f64 / elapsed;
            }
        }
        if let (Some(start), Some(end)) = (stats.start, stats.end) {
            end_time = format_stamp(end);
            duration = format_duration(end - start);
        }

        let mut list = vec![
            format!("start time={start_time}"),
            format!("end time={end_time}"),
            format!("duration={duration}"),
            format!("events={}", stats.bytes / self.data_unit as u64),
            format!("cps={cps}"),
            format!("bytes={}", stats.bytes),
        ];
        match self.queue_depth() {
            Some(depth) => list.push(format!("raw data queue={depth}")),
            None => list.push("raw data save=off".to_string()),
        }
        list
    }
}

#[async_trait]
impl DaqHandler for DaqRecorder {
    fn data_unit(&self) -> usize {
        self.data_unit
    }

    async fn on_daq_start(&self) {
        debug!("DaqRecorder.on_daq_start called");
        let arming = self.armed.lock().expect("spool arming mutex poisoned");
        if let Some(arming) = arming.as_ref() {
            let spool = RawSpool::spawn(
                arming.run_no,
                arming.base_dir.clone(),
                self.rotate_bytes.load(Ordering::Relaxed),
            );
            *self.spool.lock().expect("spool mutex poisoned") = Some(spool);
            debug!("started raw data save worker");
        } else {
            debug!("raw data save worker not armed");
        }
        drop(arming);

        let now = Local::now();
        let mut stats = self.stats.lock().expect("daq stats mutex poisoned");
        stats.start = Some(now);
        stats.current = Some(now);
        stats.end = None;
        stats.bytes = 0;
    }

    async fn on_daq_data(&self, data: &[u8]) {
        {
            let mut stats = self.stats.lock().expect("daq stats mutex poisoned");
            stats.bytes += data.len() as u64;
            stats.current = Some(Local::now());
        }
        let spool = self.spool.lock().expect("spool mutex poisoned");
        if let Some(spool) = spool.as_ref() {
            spool.enqueue(data.to_vec());
        }
    }

    async fn on_daq_running(&self) {
        let mut stats = self.stats.lock().expect("daq stats mutex poisoned");
        stats.current = Some(Local::now());
    }

    async fn on_daq_stop(&self) {
        {
            let mut stats = self.stats.lock().expect("daq stats mutex poisoned");
            if let (Some(start), Some(current)) = (stats.start, stats.current) {
                stats.end = Some(current);
                let elapsed = seconds_between(start, current);
                info!("DAQ stopped: {} bytes in {}", stats.bytes, format_duration(current - start));
                if elapsed > 0.0 {
                    let bytes = stats.bytes as f64;
                    info!("MBps: {}", bytes / elapsed / 1_000_000.0);
                    info!("Gbps: {}", bytes * 8.0 / elapsed / 1_000_000_000.0);
                    info!("Mbps: {}", bytes * 8.0 / elapsed / 1_000_000.0);
                }
            }
        }
        let spool = self.spool.lock().expect("spool mutex poisoned").take();
        if let Some(spool) = spool {
            spool.shutdown().await;
        }
    }
}

fn format_stamp(stamp: DateTime<Local>) -> String {
    stamp.format("%Y-%m-%d %H:%M:%S%.6f").to_string()
}

fn format_duration(elapsed: chrono::Duration) -> String {
    let micros = elapsed.num_microseconds().unwrap_or(0).max(0);
    let seconds = micros / 1_000_000;
    let sub = micros % 1_000_000;
    format!("{}:{:02}:{:02}.{:06}", seconds / 3600, (seconds % 3600) / 60, seconds % 60, sub)
}

fn seconds_between(start: DateTime<Local>, end: DateTime<Local>) -> f64 {
    (end - start).num_microseconds().unwrap_or(0).max(0) as f64 / 1_000_000.0
}
