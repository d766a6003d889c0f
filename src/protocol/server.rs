//! UDP server answering RBCP requests against a register bank.
//!
//! A single listener task handles all datagrams, so register access through
//! the server is totally ordered. There is no retransmit handling and no
//! duplicate suppression: repeating a request with the same id, address and
//! length is idempotent at the register level.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use smallvec::SmallVec;
use tokio::net::UdpSocket;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::protocol::registers::RegisterBank;
use crate::protocol::wire::{self, CommandCode, Header};
use crate::state::{RunStage, RunState};

/// Receive buffer for one datagram.
const RECV_BUFFER: usize = 4096;

/// RBCP server over a shared register bank.
///
/// The bank is behind a mutex so command handlers (the emulator's `read` /
/// `write` / `initreg` commands) can access the same registers the UDP
/// listener serves.
pub struct RbcpServer {
    bank: Arc<Mutex<RegisterBank>>,
    state: RunState,
    host: String,
    udp_port: u16,
    short_datagrams: Arc<AtomicU64>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl RbcpServer {
    /// Creates a server for `bank`, binding `host:udp_port` on start.
    /// Port 0 picks an ephemeral port, reported by
    /// [`RbcpServer::local_addr`] once started.
    pub fn new(bank: Arc<Mutex<RegisterBank>>, host: impl Into<String>, udp_port: u16) -> RbcpServer {
        RbcpServer {
            bank,
            state: RunState::new(),
            host: host.into(),
            udp_port,
            short_datagrams: Arc::new(AtomicU64::new(0)),
            local_addr: Mutex::new(None),
        }
    }

    /// Creates a server with its own fresh bank on `0.0.0.0:4660`.
    pub fn with_defaults() -> RbcpServer {
        RbcpServer::new(
            Arc::new(Mutex::new(RegisterBank::new())),
            "0.0.0.0",
            wire::DEFAULT_UDP_PORT,
        )
    }

    /// The register bank served by this server.
    pub fn bank(&self) -> Arc<Mutex<RegisterBank>> {
        self.bank.clone()
    }

    /// Number of datagrams dropped for being shorter than a header.
    pub fn short_datagram_count(&self) -> u64 {
        self.short_datagrams.load(Ordering::Relaxed)
    }

    /// Address the server is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().expect("local addr mutex poisoned")
    }

    /// Lifecycle state of the listener task.
    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// Binds the UDP socket and spawns the listener task, returning once the
    /// task is serving.
    pub async fn start(&self) -> Result<()> {
        let socket = match UdpSocket::bind((self.host.as_str(), self.udp_port)).await {
            Ok(socket) => socket,
            Err(err) => {
                error!("RBCP server bind error {} @ {} UDP:{}", err, self.host, self.udp_port);
                return Err(err.into());
            }
        };
        let local = socket.local_addr()?;
        info!("RBCP server listening on {}", local);
        *self.local_addr.lock().expect("local addr mutex poisoned") = Some(local);

        self.state.transit(RunStage::Starting);
        let bank = self.bank.clone();
        let state = self.state.clone();
        let short_datagrams = self.short_datagrams.clone();
        tokio::spawn(async move {
            serve(socket, bank, short_datagrams, state.clone()).await;
            state.transit(RunStage::Stopped);
        });
        self.state.wait(RunStage::Running, None).await;
        Ok(())
    }

    /// Requests shutdown and waits for the listener task, bounded at 2 s.
    pub async fn stop(&self) {
        self.state.transit(RunStage::Stopping);
        self.state.wait(RunStage::Stopped, Some(Duration::from_secs(2))).await;
    }
}

/// Listener loop: one task, all datagrams.
async fn serve(
    socket: UdpSocket,
    bank: Arc<Mutex<RegisterBank>>,
    short_datagrams: Arc<AtomicU64>,
    state: RunState,
) {
    state.transit(RunStage::Running);
    let mut buf = [0u8; RECV_BUFFER];
    while state.current() == RunStage::Running {
        tokio::select! {
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, peer)) => {
                    handle_datagram(&socket, &bank, &short_datagrams, &buf[..len], peer).await;
                }
                Err(err) => {
                    error!("RBCP server receive error: {}", err);
                }
            },
            _ = state.wait(RunStage::Stopping, None) => break,
        }
    }
    state.transit(RunStage::Stopping);
}

/// Parses and answers one request datagram.
async fn handle_datagram(
    socket: &UdpSocket,
    bank: &Mutex<RegisterBank>,
    short_datagrams: &AtomicU64,
    msg: &[u8],
    peer: SocketAddr,
) {
    if msg.len() < wire::HEADER_LEN {
        short_datagrams.fetch_add(1, Ordering::Relaxed);
        return;
    }
    if msg[0] != wire::VER_TYPE {
        return;
    }
    let is_read = match CommandCode::from_byte(msg[1]) {
        Some(CommandCode::ReadRequest) => true,
        Some(CommandCode::WriteRequest) => false,
        _ => {
            debug!("unknown RBCP command byte {:#04X}, dropping", msg[1]);
            return;
        }
    };
    let Ok(header) = Header::parse(msg) else { return };
    let payload = &msg[wire::HEADER_LEN..];

    let reply: SmallVec<[u8; 512]> = if is_read {
        let read = bank
            .lock()
            .expect("register bank mutex poisoned")
            .read(header.address, header.length as usize);
        match read {
            Ok(data) => compose_reply(CommandCode::ReadReply, &header, &data),
            Err(err) => {
                error!(
                    "reply (bus error) address:{:08X} length:{:X}: {}",
                    header.address, header.length, err
                );
                bus_error_reply(CommandCode::ReadReplyBusError, &header, payload)
            }
        }
    } else {
        let slice = &payload[..(header.length as usize).min(payload.len())];
        let written = bank.lock().expect("register bank mutex poisoned").write(header.address, slice);
        match written {
            // The request payload is echoed verbatim, even past the
            // declared write length.
            Ok(_) => compose_reply(CommandCode::WriteReply, &header, payload),
            Err(err) => {
                error!(
                    "reply (bus error) address:{:08X} length:{:X}: {}",
                    header.address, header.length, err
                );
                bus_error_reply(CommandCode::WriteReplyBusError, &header, payload)
            }
        }
    };

    if let Err(err) = socket.send_to(&reply, peer).await {
        error!("RBCP server send error to {}: {}", peer, err);
    }
}

/// Success reply: echoed id, address and length, plus the payload.
fn compose_reply(code: CommandCode, request: &Header, payload: &[u8]) -> SmallVec<[u8; 512]> {
    let header = Header::reply(code, request.packet_id, request.address, request.length);
    let mut reply: SmallVec<[u8; 512]> = SmallVec::from_slice(&header.to_bytes());
    reply.extend_from_slice(payload);
    reply
}

/// Bus error reply: the residual request payload is echoed back and the
/// length byte reports that payload's length.
fn bus_error_reply(code: CommandCode, request: &Header, payload: &[u8]) -> SmallVec<[u8; 512]> {
    let length = payload.len().min(wire::MAX_PAYLOAD) as u8;
    let header = Header::reply(code, request.packet_id, request.address, length);
    let mut reply: SmallVec<[u8; 512]> = SmallVec::from_slice(&header.to_bytes());
    reply.extend_from_slice(payload);
    reply
}
