use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rbcp_daq::protocol::wire::{CommandCode, Header, HEADER_LEN, VER_TYPE};
use rbcp_daq::protocol::{RbcpClient, RbcpServer, RegisterBank};
use rbcp_daq::Error;

async fn start_server() -> (RbcpServer, SocketAddr) {
    let bank = Arc::new(Mutex::new(RegisterBank::new()));
    let server = RbcpServer::new(bank, "127.0.0.1", 0);
    server.start().await.expect("start rbcp server");
    let addr = server.local_addr().expect("server address");
    (server, addr)
}

#[tokio::test]
async fn read_modify_read_on_the_reserved_region() {
    let (server, addr) = start_server().await;
    let mut client = RbcpClient::new(addr).await.expect("client");

    let initial = client.read(0xFFFF_FF00, 8).await.expect("initial read");
    assert_eq!(initial, vec![0; 8]);

    let echoed = client
        .write(0xFFFF_FF00, &[1, 2, 3, 4, 5, 6, 7, 8])
        .await
        .expect("write");
    assert_eq!(echoed, vec![1, 2, 3, 4, 5, 6, 7, 8]);

    let read_back = client.read(0xFFFF_FF00, 8).await.expect("read back");
    assert_eq!(read_back, vec![1, 2, 3, 4, 5, 6, 7, 8]);

    server.stop().await;
}

#[tokio::test]
async fn out_of_range_read_raises_a_bus_error() {
    let (server, addr) = start_server().await;
    let mut client = RbcpClient::new(addr).await.expect("client");

    let err = client.read(0xFE, 4).await.expect_err("read outside every region");
    assert!(matches!(err, Error::BusError), "unexpected error: {err:?}");

    server.stop().await;
}

#[tokio::test]
async fn out_of_range_write_raises_a_bus_error() {
    let (server, addr) = start_server().await;
    let mut client = RbcpClient::new(addr).await.expect("client");

    let err = client.write(0xFE, &[1, 2]).await.expect_err("write outside every region");
    assert!(matches!(err, Error::BusError), "unexpected error: {err:?}");

    server.stop().await;
}

#[tokio::test]
async fn missing_device_raises_a_timeout() {
    // a bound socket that never answers
    let silent = tokio::net::UdpSocket::bind("127.0.0.1:0").await.expect("silent socket");
    let addr = silent.local_addr().expect("silent addr");

    let mut client = RbcpClient::new(addr).await.expect("client");
    client.set_timeout(Duration::from_millis(300));

    let started = Instant::now();
    let err = client.read(0xFFFF_FF00, 1).await.expect_err("no reply");
    assert!(matches!(err, Error::Timeout), "unexpected error: {err:?}");
    assert!(started.elapsed() >= Duration::from_millis(300));
}

#[tokio::test]
async fn oversized_requests_fail_before_any_io() {
    let (server, addr) = start_server().await;
    let mut client = RbcpClient::new(addr).await.expect("client");

    let err = client.read(0xFFFF_FFFF, 2).await.expect_err("range overflow");
    assert!(matches!(err, Error::InvalidArgument(_)), "unexpected error: {err:?}");
    let err = client.write(0, &[0; 256]).await.expect_err("oversized write");
    assert!(matches!(err, Error::InvalidArgument(_)), "unexpected error: {err:?}");

    server.stop().await;
}

#[tokio::test]
async fn packet_ids_cover_the_full_range_and_wrap() {
    // echo server that records every request id
    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.expect("echo socket");
    let addr = socket.local_addr().expect("echo addr");
    let seen: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let record = seen.clone();
    tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        loop {
            let Ok((len, peer)) = socket.recv_from(&mut buf).await else { break };
            if len < HEADER_LEN || buf[0] != VER_TYPE {
                continue;
            }
            record.lock().unwrap().push(buf[2]);
            let request = Header::parse(&buf[..len]).expect("request header");
            let reply = Header::reply(
                CommandCode::ReadReply,
                request.packet_id,
                request.address,
                request.length,
            );
            let mut packet = reply.to_bytes().to_vec();
            packet.extend(std::iter::repeat(0).take(request.length as usize));
            let _ = socket.send_to(&packet, peer).await;
        }
    });

    let mut client = RbcpClient::new(addr).await.expect("client");
    for _ in 0..260 {
        client.read(0x0, 1).await.expect("echoed read");
    }

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 260);
    for (index, &id) in seen.iter().enumerate() {
        assert_eq!(id as usize, index % 256, "id sequence diverges at {index}");
    }
}

#[tokio::test]
async fn short_datagrams_are_counted_and_dropped() {
    let (server, addr) = start_server().await;

    let probe = tokio::net::UdpSocket::bind("127.0.0.1:0").await.expect("probe socket");
    probe.send_to(&[0xFF, 0xC0, 0x00], addr).await.expect("send short datagram");
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(server.short_datagram_count(), 1);
    server.stop().await;
}

#[tokio::test]
async fn write_replies_echo_the_request_payload() {
    let (server, addr) = start_server().await;

    // hand-rolled request so the raw reply is observable
    let probe = tokio::net::UdpSocket::bind("127.0.0.1:0").await.expect("probe socket");
    let header =
        Header::request(CommandCode::WriteRequest, 0x42, 0xFFFF_FF10, 2).expect("header");
    let mut packet = header.to_bytes().to_vec();
    packet.extend_from_slice(&[0xAA, 0xBB]);
    probe.send_to(&packet, addr).await.expect("send write");

    let mut reply = [0u8; 1024];
    let (len, _) = probe.recv_from(&mut reply).await.expect("write reply");
    assert_eq!(&reply[..len], &[0xFF, 0x88, 0x42, 0x02, 0xFF, 0xFF, 0xFF, 0x10, 0xAA, 0xBB]);

    server.stop().await;
}
