use std::time::Duration;

mod support;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

use rbcp_daq::command::CommandClient;
use rbcp_daq::emulator::{self, DataGenerator, UNIT_SENTINEL};
use rbcp_daq::protocol::RbcpClient;

use support::start_emulator;

#[tokio::test]
async fn register_commands_drive_the_shared_bank() {
    let emulator = start_emulator().await;
    let addr = emulator.command_addr().expect("command addr");
    let mut client = CommandClient::connect(addr, emulator::PROMPT).await.expect("connect");

    let reply = client
        .send_command("read FFFFFF00 8", false)
        .await
        .expect("send")
        .expect("reply");
    assert_eq!(reply.trim(), "00 00 00 00 00 00 00 00");

    let reply = client
        .send_command("write FFFFFF00 01 02 03", false)
        .await
        .expect("send")
        .expect("reply");
    assert_eq!(reply.trim(), "write 3 bytes.");

    let reply = client
        .send_command("read FFFFFF00 3", false)
        .await
        .expect("send")
        .expect("reply");
    assert_eq!(reply.trim(), "01 02 03");

    // the same bytes are visible on the UDP face
    let rbcp_addr = emulator.rbcp_addr().expect("rbcp addr");
    let mut rbcp = RbcpClient::new(rbcp_addr).await.expect("rbcp client");
    assert_eq!(rbcp.read(0xFFFF_FF00, 3).await.expect("rbcp read"), vec![1, 2, 3]);

    client.close().await.expect("close");
    emulator.stop().await;
}

#[tokio::test]
async fn read_command_misses_report_a_bus_error() {
    let emulator = start_emulator().await;
    let addr = emulator.command_addr().expect("command addr");
    let mut client = CommandClient::connect(addr, emulator::PROMPT).await.expect("connect");

    let reply = client.send_command("read FE 4", false).await.expect("send").expect("reply");
    assert_eq!(reply.trim(), "NG:Bus error");

    client.close().await.expect("close");
    emulator.stop().await;
}

#[tokio::test]
async fn dataunitcount_reads_and_sets_the_burst() {
    let emulator = start_emulator().await;
    let addr = emulator.command_addr().expect("command addr");
    let mut client = CommandClient::connect(addr, emulator::PROMPT).await.expect("connect");

    let reply = client.send_command("dataunitcount", false).await.expect("send").expect("reply");
    assert_eq!(reply.trim(), "2");

    let reply =
        client.send_command("dataunitcount 4", false).await.expect("send").expect("reply");
    assert_eq!(reply.trim(), "set data unit count 4 = 4");
    assert_eq!(emulator.generator().data_unit_count(), 4);

    client.close().await.expect("close");
    emulator.stop().await;
}

#[tokio::test]
async fn dump_lists_the_reserved_region() {
    let emulator = start_emulator().await;
    let addr = emulator.command_addr().expect("command addr");
    let mut client = CommandClient::connect(addr, emulator::PROMPT).await.expect("connect");

    let reply = client.send_command("dump", false).await.expect("send").expect("reply");
    let first = reply.lines().next().expect("at least one dump line");
    assert!(first.starts_with("FFFF0000:"), "first dump line: {first:?}");

    client.close().await.expect("close");
    emulator.stop().await;
}

#[tokio::test]
async fn initreg_loads_a_register_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("500.bin");
    std::fs::write(&path, [0xCA, 0xFE]).expect("write image");

    let emulator = start_emulator().await;
    let addr = emulator.command_addr().expect("command addr");
    let mut client = CommandClient::connect(addr, emulator::PROMPT).await.expect("connect");

    let command = format!("initreg {}", path.display());
    let reply = client.send_command(&command, false).await.expect("send").expect("reply");
    let lines: Vec<&str> = reply.lines().filter(|line| !line.trim().is_empty()).collect();
    assert_eq!(lines[0], "address area initialized");
    assert_eq!(lines[1], "00000500:2 bytes");

    let reply = client.send_command("read 500 2", false).await.expect("send").expect("reply");
    assert_eq!(reply.trim(), "CA FE");

    client.close().await.expect("close");
    emulator.stop().await;
}

#[tokio::test]
async fn state_command_reports_the_session() {
    let emulator = start_emulator().await;
    let addr = emulator.command_addr().expect("command addr");
    let mut client = CommandClient::connect(addr, emulator::PROMPT).await.expect("connect");

    let reply = client.send_command("state", false).await.expect("send").expect("reply");
    let text = reply.as_str();
    assert!(text.contains("Server address:"), "reply: {text:?}");
    assert!(text.contains("Handler:"), "reply: {text:?}");
    assert!(text.contains("Sessions: 1"), "reply: {text:?}");
    assert!(text.contains("Session[0]:"), "reply: {text:?}");

    client.close().await.expect("close");
    emulator.stop().await;
}

#[tokio::test]
async fn data_port_streams_counter_records() {
    let emulator = start_emulator().await;
    let addr = emulator.data_addr().expect("data addr");
    let mut stream = TcpStream::connect(addr).await.expect("connect data port");

    let mut records = [0u8; 32];
    stream.read_exact(&mut records).await.expect("read four units");

    for unit in records.chunks(8) {
        assert_eq!(unit[0], UNIT_SENTINEL);
    }
    let first = u32::from_be_bytes(records[4..8].try_into().expect("counter bytes"));
    let second = u32::from_be_bytes(records[12..16].try_into().expect("counter bytes"));
    assert_eq!(second, first + 1);

    drop(stream);
    emulator.stop().await;
}

#[tokio::test]
async fn exit_command_releases_wait_exit() {
    let emulator = start_emulator().await;
    let addr = emulator.command_addr().expect("command addr");
    let mut client = CommandClient::connect(addr, emulator::PROMPT).await.expect("connect");

    client.send_command("exit", false).await.expect("send exit");
    tokio::time::timeout(Duration::from_secs(2), emulator.wait_exit())
        .await
        .expect("wait_exit released");
    emulator.stop().await;
}
