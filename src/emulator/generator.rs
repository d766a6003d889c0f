//! Fabricated acquisition data for the emulator's push server.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::tcp::OwnedReadHalf;
use tracing::debug;

use crate::handler::SessionHandler;
use crate::session::Session;
use crate::state::RunStage;

/// Sentinel byte leading every generated data unit.
pub const UNIT_SENTINEL: u8 = 0xA5;

/// Source of fabricated records for the push server.
///
/// A record is `data_unit() * data_unit_count()` bytes; raising the burst
/// count makes the emulator emit larger writes. Generators are shared by
/// every push session, so their state is interior-mutable.
pub trait DataGenerator: Send + Sync + 'static {
    /// Size of one data unit in bytes.
    fn data_unit(&self) -> usize;

    /// Number of units emitted per write.
    fn data_unit_count(&self) -> usize;

    /// Changes the number of units emitted per write.
    fn set_data_unit_count(&self, count: usize);

    /// Produces `data_unit_count` units of data.
    fn create_data(&self, data_unit_count: usize) -> Vec<u8>;
}

/// Default generator: every unit starts with the 0xA5 sentinel and carries
/// a big-endian 32-bit counter at bytes 4..8, incremented per unit and
/// wrapping to zero at 2^32 - 1.
pub struct CounterGenerator {
    data_unit: usize,
    burst: AtomicUsize,
    counter: AtomicU32,
}

impl Default for CounterGenerator {
    fn default() -> Self {
        CounterGenerator::new()
    }
}

impl CounterGenerator {
    /// Creates a generator with the standard 8-byte unit and a burst of 2.
    pub fn new() -> CounterGenerator {
        CounterGenerator { data_unit: 8, burst: AtomicUsize::new(2), counter: AtomicU32::new(0) }
    }

    fn next_count(&self) -> u32 {
        self.counter
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |count| {
                let next = count.wrapping_add(1);
                Some(if next == u32::MAX { 0 } else { next })
            })
            .unwrap_or(0)
    }
}

impl DataGenerator for CounterGenerator {
    fn data_unit(&self) -> usize {
        self.data_unit
    }

    fn data_unit_count(&self) -> usize {
        self.burst.load(Ordering::Relaxed)
    }

    fn set_data_unit_count(&self, count: usize) {
        self.burst.store(count.max(1), Ordering::Relaxed);
    }

    fn create_data(&self, data_unit_count: usize) -> Vec<u8> {
        let mut data = vec![0u8; self.data_unit * data_unit_count];
        for unit in data.chunks_mut(self.data_unit) {
            unit[0] = UNIT_SENTINEL;
            if unit.len() >= 8 {
                unit[4..8].copy_from_slice(&self.next_count().to_be_bytes());
            }
        }
        data
    }
}

/// Generator repeating a fixed ASCII pattern; two 8-byte units per burst
/// count. Useful when the consumer wants a recognizable byte stream.
pub struct PatternGenerator {
    pattern: Vec<u8>,
    burst: AtomicUsize,
}

impl Default for PatternGenerator {
    fn default() -> Self {
        PatternGenerator::new()
    }
}

impl PatternGenerator {
    /// Creates a generator with the standard fixed pattern.
    pub fn new() -> PatternGenerator {
        PatternGenerator { pattern: b"F010200001020304".to_vec(), burst: AtomicUsize::new(2) }
    }
}

impl DataGenerator for PatternGenerator {
    fn data_unit(&self) -> usize {
        8
    }

    fn data_unit_count(&self) -> usize {
        self.burst.load(Ordering::Relaxed)
    }

    fn set_data_unit_count(&self, count: usize) {
        self.burst.store(count.max(1), Ordering::Relaxed);
    }

    fn create_data(&self, data_unit_count: usize) -> Vec<u8> {
        self.pattern.repeat(data_unit_count)
    }
}

/// Push-mode session handler: ignores inbound bytes and continuously writes
/// generated records to every connected client until the session or the
/// server stops. A write failure ends the session cleanly.
pub struct DataPushHandler<G: DataGenerator> {
    generator: Arc<G>,
}

impl<G: DataGenerator> DataPushHandler<G> {
    /// Creates a push handler emitting data from `generator`.
    pub fn new(generator: Arc<G>) -> DataPushHandler<G> {
        DataPushHandler { generator }
    }

    /// The generator feeding this handler.
    pub fn generator(&self) -> &Arc<G> {
        &self.generator
    }
}

#[async_trait]
impl<G: DataGenerator> SessionHandler for DataPushHandler<G> {
    async fn on_data(&self, _session: &Session, _data: &[u8]) -> anyhow::Result<bool> {
        Ok(true)
    }

    async fn run_session(&self, session: Arc<Session>, reader: OwnedReadHalf, _max_buff: usize) {
        drop(reader);
        debug!("starting push session to client {:?}", session.peer());
        session.state().transit(RunStage::Running);
        while session.state().current() == RunStage::Running {
            let data = self.generator.create_data(self.generator.data_unit_count());
            tokio::select! {
                sent = session.send(&data) => {
                    if let Err(err) = sent {
                        debug!("push session closed: {}", err);
                        break;
                    }
                }
                _ = session.state().wait(RunStage::Stopping, None) => break,
            }
        }
        session.close().await;
        session.state().transit(RunStage::Stopped);
        debug!("closed push session {:?}", session.peer());
    }
}
