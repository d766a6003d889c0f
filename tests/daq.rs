use std::sync::{Arc, Mutex};
use std::time::Duration;

mod support;

use async_trait::async_trait;

use rbcp_daq::daq::{DaqClient, DaqHandler, DaqRecorder, RawSpool, NOT_STARTED_STAMP};
use rbcp_daq::state::RunStage;

use support::start_emulator;

/// Records the length of every delivered buffer.
struct CaptureHandler {
    lengths: Mutex<Vec<usize>>,
}

impl CaptureHandler {
    fn new() -> CaptureHandler {
        CaptureHandler { lengths: Mutex::new(Vec::new()) }
    }
}

#[async_trait]
impl DaqHandler for CaptureHandler {
    async fn on_daq_start(&self) {}

    async fn on_daq_data(&self, data: &[u8]) {
        self.lengths.lock().unwrap().push(data.len());
    }

    async fn on_daq_running(&self) {}

    async fn on_daq_stop(&self) {}
}

fn stat_value(stats: &[String], key: &str) -> String {
    stats
        .iter()
        .find_map(|line| line.strip_prefix(&format!("{key}=")).map(str::to_string))
        .unwrap_or_else(|| panic!("missing stat {key} in {stats:?}"))
}

#[tokio::test]
async fn delivered_buffers_are_record_aligned() {
    let emulator = start_emulator().await;
    let addr = emulator.data_addr().expect("data addr");

    let handler = Arc::new(CaptureHandler::new());
    let client = DaqClient::new(handler.clone(), addr.ip().to_string(), addr.port());
    client.start().await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    client.stop().await;

    let lengths = handler.lengths.lock().unwrap();
    assert!(!lengths.is_empty(), "no data delivered");
    for &length in lengths.iter() {
        assert!(length > 0 && length % 8 == 0, "unaligned buffer of {length} bytes");
    }

    emulator.stop().await;
}

#[tokio::test]
async fn recorder_tracks_rate_statistics() {
    let emulator = start_emulator().await;
    let addr = emulator.data_addr().expect("data addr");

    let recorder = Arc::new(DaqRecorder::new(8));
    let client = DaqClient::new(recorder.clone(), addr.ip().to_string(), addr.port());
    client.start().await;
    tokio::time::sleep(Duration::from_millis(400)).await;

    let running = recorder.stat_list();
    assert_ne!(stat_value(&running, "start time"), NOT_STARTED_STAMP);
    assert_eq!(stat_value(&running, "end time"), NOT_STARTED_STAMP);
    assert_eq!(stat_value(&running, "raw data save"), "off");

    client.stop().await;

    let stopped = recorder.stat_list();
    let bytes: u64 = stat_value(&stopped, "bytes").parse().expect("bytes value");
    assert!(bytes > 0, "no bytes recorded");
    assert_eq!(bytes % 8, 0, "recorded bytes are not record aligned");
    let events: u64 = stat_value(&stopped, "events").parse().expect("events value");
    assert_eq!(events, bytes / 8);
    let cps: f64 = stat_value(&stopped, "cps").parse().expect("cps value");
    assert!(cps > 0.0, "rate was not computed");
    assert_ne!(stat_value(&stopped, "end time"), NOT_STARTED_STAMP);

    emulator.stop().await;
}

#[tokio::test]
async fn connect_failure_stops_the_client_and_reports_the_error() {
    // grab a loopback port that nothing listens on
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind probe");
    let addr = listener.local_addr().expect("probe addr");
    drop(listener);

    let handler = Arc::new(CaptureHandler::new());
    let client = DaqClient::new(handler.clone(), addr.ip().to_string(), addr.port());
    client.start().await;

    assert!(client.state().wait(RunStage::Stopped, Some(Duration::from_secs(3))).await);
    assert!(client.error().is_some(), "connect failure was not recorded");
    assert!(handler.lengths.lock().unwrap().is_empty());
}

#[tokio::test]
async fn spool_rotates_files_at_the_threshold() {
    let dir = tempfile::tempdir().expect("tempdir");

    let spool = RawSpool::spawn(7, dir.path().to_path_buf(), 64);
    spool.enqueue(vec![0xAB; 32]);
    spool.enqueue(vec![0xCD; 32]);
    spool.enqueue(vec![0xEF; 32]);
    spool.shutdown().await;

    let first = std::fs::read(dir.path().join("raw000007_000")).expect("first file");
    assert_eq!(first.len(), 64);
    assert_eq!(&first[..32], &[0xAB; 32]);
    assert_eq!(&first[32..], &[0xCD; 32]);

    let second = std::fs::read(dir.path().join("raw000007_001")).expect("rotated file");
    assert_eq!(second, vec![0xEF; 32]);
}

#[tokio::test]
async fn recorder_spools_the_stream_when_armed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let recorder = DaqRecorder::new(8);
    recorder.set_raw_save(true, 3, Some(dir.path().to_path_buf()));

    recorder.on_daq_start().await;
    recorder.on_daq_data(&[0x11; 16]).await;
    recorder.on_daq_data(&[0x22; 8]).await;
    recorder.on_daq_stop().await;

    let content = std::fs::read(dir.path().join("raw000003_000")).expect("spool file");
    let mut expected = vec![0x11; 16];
    expected.extend_from_slice(&[0x22; 8]);
    assert_eq!(content, expected);

    let stats = recorder.stat_list();
    assert_eq!(stat_value(&stats, "bytes"), "24");
}

#[tokio::test]
async fn disarmed_recorder_reports_raw_save_off() {
    let recorder = DaqRecorder::new(8);
    recorder.on_daq_start().await;
    recorder.on_daq_data(&[0; 8]).await;
    recorder.on_daq_stop().await;

    let stats = recorder.stat_list();
    assert_eq!(stat_value(&stats, "raw data save"), "off");
    assert_eq!(stat_value(&stats, "bytes"), "8");
}
