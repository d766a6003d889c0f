//! Prompt-matching client for command servers.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::error::Result;

#[cfg(windows)]
const LINE_SEP: &str = "\r\n";
#[cfg(not(windows))]
const LINE_SEP: &str = "\n";

/// A simple client for [`crate::command::CommandHandler`] based servers.
///
/// The server terminates every reply with a bare prompt; the client reads
/// until that sentinel appears and strips it, so each `send_command` call
/// returns exactly one reply. The prompt is searched in the accumulated
/// reply buffer, so a prompt straddling two reads is still found.
pub struct CommandClient {
    stream: TcpStream,
    prompt: String,
}

impl CommandClient {
    /// Connects and drains the greeting up to the first prompt.
    pub async fn connect<A: ToSocketAddrs>(addr: A, prompt: impl Into<String>) -> Result<CommandClient> {
        let stream = TcpStream::connect(addr).await?;
        let mut client = CommandClient { stream, prompt: prompt.into() };
        client.read_until_prompt().await?;
        Ok(client)
    }

    /// Sends one command line.
    ///
    /// With `no_reply` the call returns `None` immediately after sending;
    /// otherwise it reads until the next prompt and returns the reply text
    /// with the prompt stripped.
    pub async fn send_command(&mut self, command: &str, no_reply: bool) -> Result<Option<String>> {
        let mut line = String::with_capacity(command.len() + LINE_SEP.len());
        line.push_str(command);
        line.push_str(LINE_SEP);
        self.stream.write_all(line.as_bytes()).await?;
        if no_reply {
            return Ok(None);
        }
        Ok(Some(self.read_until_prompt().await?))
    }

    /// Ends the session by sending `close` without waiting for a reply.
    pub async fn close(mut self) -> Result<()> {
        self.send_command("close", true).await?;
        Ok(())
    }

    async fn read_until_prompt(&mut self) -> Result<String> {
        let prompt = self.prompt.as_bytes().to_vec();
        let mut reply: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let received = self.stream.read(&mut chunk).await?;
            if received == 0 {
                break;
            }
            reply.extend_from_slice(&chunk[..received]);
            if let Some(pos) = find_subsequence(&reply, &prompt) {
                reply.truncate(pos);
                break;
            }
        }
        Ok(String::from_utf8_lossy(&reply).into_owned())
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}
