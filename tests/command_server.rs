use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

mod support;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use rbcp_daq::command::{CommandClient, CommandHandler};
use rbcp_daq::session::SessionServer;
use rbcp_daq::state::RunStage;

use support::FixedStatCommands;

const PROMPT: &str = "$ ";

async fn start_server() -> (SessionServer<CommandHandler<FixedStatCommands>>, SocketAddr) {
    let server = SessionServer::new(
        CommandHandler::new(PROMPT, FixedStatCommands),
        "127.0.0.1",
        0,
    );
    server.start().await.expect("start command server");
    let addr = server.local_addr().expect("server address");
    (server, addr)
}

fn reply_lines(reply: &str) -> Vec<&str> {
    reply.lines().filter(|line| !line.trim().is_empty()).collect()
}

#[tokio::test]
async fn help_with_arguments_details_each_command() {
    let (server, addr) = start_server().await;
    let mut client = CommandClient::connect(addr, PROMPT).await.expect("connect");

    let reply = client
        .send_command("help close exit", false)
        .await
        .expect("send help")
        .expect("help reply");
    let lines = reply_lines(&reply);
    assert_eq!(lines.len(), 2);
    assert!(lines.iter().any(|line| line.starts_with("close:")), "lines: {lines:?}");
    assert!(lines.iter().any(|line| line.starts_with("exit:")), "lines: {lines:?}");

    client.close().await.expect("close");
    server.stop().await;
}

#[tokio::test]
async fn bare_help_lists_every_command_alphabetically() {
    let (server, addr) = start_server().await;
    let mut client = CommandClient::connect(addr, PROMPT).await.expect("connect");

    let reply = client.send_command("help", false).await.expect("send").expect("reply");
    let lines = reply_lines(&reply);
    // the seven built-ins, one summary line each
    assert_eq!(lines.len(), 7);
    let names: Vec<&str> =
        lines.iter().map(|line| line.split(&[':', ' '][..]).next().unwrap_or("")).collect();
    let mut sorted = names.clone();
    sorted.sort_unstable();
    assert_eq!(names, sorted, "help output is not alphabetical");

    client.close().await.expect("close");
    server.stop().await;
}

#[tokio::test]
async fn stat_json_equals_the_plain_form() {
    let (server, addr) = start_server().await;
    let mut client = CommandClient::connect(addr, PROMPT).await.expect("connect");

    let plain = client.send_command("stat", false).await.expect("send").expect("reply");
    let mut expected = HashMap::new();
    for line in reply_lines(&plain) {
        let (key, value) = line.split_once('=').expect("key=value line");
        expected.insert(key.to_string(), value.to_string());
    }

    let json = client.send_command("stat j", false).await.expect("send").expect("reply");
    let value: serde_json::Value =
        serde_json::from_str(json.trim()).expect("stat j must be one JSON object");
    let object = value.as_object().expect("JSON object");

    assert_eq!(object.len(), expected.len());
    for (key, value) in object {
        let text = value.as_str().expect("all values are strings");
        assert_eq!(Some(&text.to_string()), expected.get(key), "mismatch for {key}");
    }

    client.close().await.expect("close");
    server.stop().await;
}

#[tokio::test]
async fn stat_rejects_unknown_arguments() {
    let (server, addr) = start_server().await;
    let mut client = CommandClient::connect(addr, PROMPT).await.expect("connect");

    let reply = client.send_command("stat x", false).await.expect("send").expect("reply");
    assert!(reply.starts_with("NG:Unknown argument"), "reply: {reply:?}");

    client.close().await.expect("close");
    server.stop().await;
}

#[tokio::test]
async fn pwd_reports_the_current_directory() {
    let (server, addr) = start_server().await;
    let mut client = CommandClient::connect(addr, PROMPT).await.expect("connect");

    let reply = client.send_command("pwd", false).await.expect("send").expect("reply");
    let cwd = std::env::current_dir().expect("cwd");
    assert_eq!(reply.trim(), cwd.display().to_string());

    let reply = client.send_command("pwd extra", false).await.expect("send").expect("reply");
    assert_eq!(reply.trim(), "NG:Too many arguments");

    client.close().await.expect("close");
    server.stop().await;
}

#[tokio::test]
async fn unknown_commands_are_reported() {
    let (server, addr) = start_server().await;
    let mut client = CommandClient::connect(addr, PROMPT).await.expect("connect");

    let reply = client.send_command("bogus", false).await.expect("send").expect("reply");
    assert_eq!(reply.trim(), "NG:Unknown command [bogus]");

    client.close().await.expect("close");
    server.stop().await;
}

#[tokio::test]
async fn semicolons_separate_commands_within_a_line() {
    let (server, addr) = start_server().await;
    let mut client = CommandClient::connect(addr, PROMPT).await.expect("connect");

    let reply = client.send_command("pwd;pwd", false).await.expect("send").expect("reply");
    let cwd = std::env::current_dir().expect("cwd").display().to_string();
    let lines = reply_lines(&reply);
    assert_eq!(lines, vec![cwd.as_str(), cwd.as_str()]);

    client.close().await.expect("close");
    server.stop().await;
}

#[tokio::test]
async fn close_ends_the_session_but_not_the_server() {
    let (server, addr) = start_server().await;

    let client = CommandClient::connect(addr, PROMPT).await.expect("connect");
    client.close().await.expect("close");
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(server.state().current(), RunStage::Running);
    let second = CommandClient::connect(addr, PROMPT).await.expect("reconnect");
    drop(second);

    server.stop().await;
}

#[tokio::test]
async fn exit_requests_server_shutdown() {
    let (server, addr) = start_server().await;
    let mut client = CommandClient::connect(addr, PROMPT).await.expect("connect");

    let reply = client.send_command("exit", false).await.expect("send").expect("reply");
    assert!(reply.contains("exiting"), "reply: {reply:?}");

    assert!(server.state().wait(RunStage::Stopped, Some(Duration::from_secs(2))).await);
    assert!(server.is_exit());
}

#[tokio::test]
async fn cr_terminated_lines_are_answered_with_cr() {
    let (server, addr) = start_server().await;
    let mut stream = TcpStream::connect(addr).await.expect("connect");

    let mut greeting = vec![0u8; PROMPT.len()];
    stream.read_exact(&mut greeting).await.expect("greeting prompt");
    assert_eq!(greeting, PROMPT.as_bytes());

    stream.write_all(b"pwd\r").await.expect("send pwd");
    let mut reply = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let received = stream.read(&mut chunk).await.expect("read reply");
        assert!(received > 0, "server closed unexpectedly");
        reply.extend_from_slice(&chunk[..received]);
        if reply.ends_with(PROMPT.as_bytes()) {
            break;
        }
    }
    let cwd = std::env::current_dir().expect("cwd").display().to_string();
    let expected = format!("{cwd}\r{PROMPT}");
    assert_eq!(String::from_utf8_lossy(&reply), expected);

    server.stop().await;
}

#[tokio::test]
async fn partial_lines_are_kept_until_the_terminator_arrives() {
    let (server, addr) = start_server().await;
    let mut stream = TcpStream::connect(addr).await.expect("connect");

    let mut greeting = vec![0u8; PROMPT.len()];
    stream.read_exact(&mut greeting).await.expect("greeting prompt");

    stream.write_all(b"pw").await.expect("first half");
    tokio::time::sleep(Duration::from_millis(150)).await;
    stream.write_all(b"d\n").await.expect("second half");

    let mut reply = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let received = stream.read(&mut chunk).await.expect("read reply");
        assert!(received > 0, "server closed unexpectedly");
        reply.extend_from_slice(&chunk[..received]);
        if reply.ends_with(PROMPT.as_bytes()) {
            break;
        }
    }
    let text = String::from_utf8_lossy(&reply);
    let cwd = std::env::current_dir().expect("cwd").display().to_string();
    assert!(text.starts_with(&cwd), "reply: {text:?}");

    server.stop().await;
}
