//! The handler seam between the TCP session framework and its applications.
//!
//! A [`SessionHandler`] supplies everything a running session delegates: the
//! framing policy ([`SessionHandler::find_frame`]), the data and lifecycle
//! callbacks, and the server-wide exit flag. One handler instance is shared
//! by the server and all of its sessions, so handlers keep per-session state
//! on the [`Session`] itself and must tolerate concurrent invocation.
//!
//! Three in-crate variants implement the seam: the binary passthrough
//! default behavior baked into the trait, the command dispatcher in
//! [`crate::command`] (text lines split into commands), and the push-mode
//! data generator in [`crate::emulator`] which overrides the whole session
//! loop to write instead of read.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::tcp::OwnedReadHalf;

use crate::session::{run_read_loop, ServerHandle, Session};

/// One delimited message located inside a receive buffer.
///
/// `end` is the exclusive end of the message itself (the terminator is not
/// part of the message); `next` is where the following frame starts, so
/// `next - end` bytes of terminator are consumed silently.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Exclusive end of the message payload.
    pub end: usize,
    /// Start of the residual bytes kept for the next frame.
    pub next: usize,
}

/// Line terminator detected on a text session. Each session remembers the
/// terminator its peer used last and replies with the same one.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum LineSep {
    /// `\r\n`, the default until a peer shows otherwise.
    #[default]
    CrLf,
    /// `\n`
    Lf,
    /// `\r`
    Cr,
}

impl LineSep {
    /// The terminator as a string slice.
    pub fn as_str(self) -> &'static str {
        match self {
            LineSep::CrLf => "\r\n",
            LineSep::Lf => "\n",
            LineSep::Cr => "\r",
        }
    }
}

/// Locates the first line terminator (`\r\n`, `\n` or `\r`) in `data`.
///
/// The scan is left to right, so the earliest terminator in the stream wins
/// regardless of kind. Returns the frame and the detected terminator, or
/// `None` when more bytes are needed. A trailing lone `\r` is treated as a
/// complete terminator; if its `\n` arrives in the next chunk it frames an
/// empty message which dispatchers skip.
pub fn find_line_frame(data: &[u8]) -> Option<(Frame, LineSep)> {
    for (pos, &byte) in data.iter().enumerate() {
        match byte {
            b'\n' => return Some((Frame { end: pos, next: pos + 1 }, LineSep::Lf)),
            b'\r' => {
                return if data.get(pos + 1) == Some(&b'\n') {
                    Some((Frame { end: pos, next: pos + 2 }, LineSep::CrLf))
                } else {
                    Some((Frame { end: pos, next: pos + 1 }, LineSep::Cr))
                };
            }
            _ => {}
        }
    }
    None
}

/// Server-wide exit flag, set by the `exit` command and polled by the
/// accept loop. Handlers embed one and forward `is_exit` / `set_exit` to it.
#[derive(Debug, Default)]
pub struct ExitFlag(AtomicBool);

impl ExitFlag {
    /// Creates a cleared flag.
    pub fn new() -> ExitFlag {
        ExitFlag::default()
    }

    /// Returns whether the flag is set.
    pub fn get(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Sets the flag.
    pub fn set(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// The byte-stream handler driving every session of a
/// [`crate::session::SessionServer`].
///
/// All methods have default behavior, so implementations override only the
/// capabilities they care about. The default `find_frame` passes every
/// received chunk through whole (binary passthrough); `run_session` runs the
/// standard receive loop and is overridden by push-mode handlers that write
/// instead of read.
#[async_trait]
pub trait SessionHandler: Send + Sync + 'static {
    /// Called once, just before the server starts accepting.
    fn on_server_start(&self, _server: &ServerHandle) {}

    /// Locates the next complete message in `data`, or returns `None` when
    /// more bytes are needed. `session` is available so framing detection
    /// can record per-session facts such as the peer's line terminator.
    fn find_frame(&self, _session: &Session, data: &[u8]) -> Option<Frame> {
        if data.is_empty() {
            None
        } else {
            Some(Frame { end: data.len(), next: data.len() })
        }
    }

    /// Called when the session starts, before any data is received. Command
    /// handlers send their first prompt here.
    async fn on_start(&self, _session: &Session) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called with one complete message as delimited by `find_frame`.
    /// Returning `false` ends the session; an error is logged and ends it
    /// too.
    async fn on_data(&self, session: &Session, data: &[u8]) -> anyhow::Result<bool>;

    /// Called once per receive-loop iteration, data or not.
    async fn on_idle(&self, _session: &Session) {}

    /// Called when the owning application shuts the server down.
    fn on_shutdown(&self) {}

    /// Whether server shutdown was requested through this handler.
    fn is_exit(&self) -> bool {
        false
    }

    /// Requests server shutdown. The accept loop polls [`Self::is_exit`].
    fn set_exit(&self) {}

    /// Runs one accepted session to completion. The default is the
    /// receive/dispatch loop; push-mode handlers replace it wholesale.
    async fn run_session(&self, session: Arc<Session>, reader: OwnedReadHalf, max_buff: usize) {
        run_read_loop(self, &session, reader, max_buff).await;
    }
}
