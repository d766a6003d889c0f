//! UDP client for RBCP register access.

use std::net::SocketAddr;
use std::time::Duration;

use smallvec::SmallVec;
use tokio::net::{ToSocketAddrs, UdpSocket};
use tracing::debug;

use crate::error::{Error, Result};
use crate::protocol::wire::{self, CommandCode, Header};

/// Default reply timeout of the client.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// RBCP client: reads and writes device registers over UDP.
///
/// The protocol carries a single request at a time; the client stamps each
/// request with an 8-bit packet id, waits for the matching reply and
/// surfaces bus errors, malformed replies and timeouts as distinct error
/// kinds. The single-in-flight discipline is expressed through `&mut self`
/// rather than a lock: callers needing concurrent access must create
/// separate clients, each with its own independent id counter.
///
/// The socket stays unconnected on purpose: a missing device then shows up
/// as a reply timeout rather than an asynchronous ICMP error.
pub struct RbcpClient {
    socket: UdpSocket,
    device: SocketAddr,
    packet_id: u8,
    timeout: Duration,
}

impl RbcpClient {
    /// Creates a client talking to the given device address, usually
    /// `(ip, 4660)`.
    pub async fn new<A: ToSocketAddrs>(device_addr: A) -> Result<RbcpClient> {
        let device = tokio::net::lookup_host(device_addr)
            .await?
            .next()
            .ok_or_else(|| Error::InvalidArgument("could not resolve device address".to_string()))?;
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        Ok(RbcpClient { socket, device, packet_id: 0, timeout: DEFAULT_TIMEOUT })
    }

    /// Overrides the reply timeout (default 3 s).
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// The device address this client talks to.
    pub fn device_addr(&self) -> SocketAddr {
        self.device
    }

    /// Reads `length` bytes starting at `address`.
    ///
    /// Fails with [`Error::InvalidArgument`] before any I/O when the range
    /// is not expressible, with [`Error::Timeout`] when no reply arrives,
    /// and with [`Error::BusError`] / [`Error::Protocol`] on bad replies.
    pub async fn read(&mut self, address: u32, length: usize) -> Result<Vec<u8>> {
        let header = Header::request(CommandCode::ReadRequest, self.next_id(), address, length)?;
        let packet: SmallVec<[u8; 512]> = SmallVec::from_slice(&header.to_bytes());
        self.exchange(&packet, header.packet_id).await
    }

    /// Writes `data` starting at `address` and returns the payload echoed by
    /// the device (the written bytes on success).
    pub async fn write(&mut self, address: u32, data: &[u8]) -> Result<Vec<u8>> {
        let header =
            Header::request(CommandCode::WriteRequest, self.next_id(), address, data.len())?;
        let mut packet: SmallVec<[u8; 512]> = SmallVec::from_slice(&header.to_bytes());
        packet.extend_from_slice(data);
        self.exchange(&packet, header.packet_id).await
    }

    /// Hands out the id for the next request. Ids cover 0..=255 and wrap.
    fn next_id(&mut self) -> u8 {
        let id = self.packet_id;
        self.packet_id = self.packet_id.wrapping_add(1);
        id
    }

    /// Sends one request packet and receives, validates and strips the reply.
    async fn exchange(&mut self, packet: &[u8], wait_id: u8) -> Result<Vec<u8>> {
        let mut sent = 0;
        while sent < packet.len() {
            sent += self.socket.send_to(&packet[sent..], self.device).await?;
        }

        let mut reply = [0u8; wire::HEADER_LEN + wire::MAX_PAYLOAD + 1];
        let received =
            match tokio::time::timeout(self.timeout, self.socket.recv_from(&mut reply)).await {
                Ok(result) => result?.0,
                Err(_) => return Err(Error::Timeout),
            };
        if received == 0 {
            return Err(Error::Protocol("zero-length RBCP reply datagram".to_string()));
        }
        debug!("RBCP reply: {} bytes for id {}", received, wait_id);

        let payload = wire::validate_reply(&reply[..received], wait_id)?;
        Ok(payload.to_vec())
    }
}
