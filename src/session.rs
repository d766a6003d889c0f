//! TCP session framework: a listener spawning one session task per client.
//!
//! [`SessionServer`] owns the listening socket and the list of live
//! sessions; each [`Session`] owns its client socket. The byte-stream policy
//! lives in the [`SessionHandler`] the server was built with: the default
//! receive loop polls the socket with a 100 ms ceiling, assembles frames via
//! the handler's framing callback and feeds complete messages to
//! `on_data`, keeping residual bytes for the next frame.
//!
//! Shutdown converges within one poll interval: `stop()` (or the handler's
//! exit flag) advances the server state, the accept loop observes it, asks
//! every session to stop and joins them with bounded timeouts.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::handler::{LineSep, SessionHandler};
use crate::state::{RunStage, RunState};

/// Poll ceiling of the accept loop and of session receive loops.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Default receive buffer size per session.
pub const DEFAULT_MAX_BUFF: usize = 1024;
/// How long the accept loop waits for each session on shutdown.
const SESSION_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// One client connection.
///
/// A session normally wraps a connected socket; a *detached* session has no
/// socket and writes replies to stdout instead, which is how startup
/// command files and `-x` command strings are executed against a handler
/// before any client connects.
pub struct Session {
    server: Option<Arc<ServerHandle>>,
    peer: Option<SocketAddr>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    line_sep: Mutex<LineSep>,
    state: RunState,
}

impl Session {
    fn connected(server: Arc<ServerHandle>, peer: SocketAddr, writer: OwnedWriteHalf) -> Session {
        Session {
            server: Some(server),
            peer: Some(peer),
            writer: tokio::sync::Mutex::new(Some(writer)),
            line_sep: Mutex::new(LineSep::default()),
            state: RunState::new(),
        }
    }

    /// Creates a session with no socket; replies go to stdout.
    pub fn detached() -> Session {
        Session {
            server: None,
            peer: None,
            writer: tokio::sync::Mutex::new(None),
            line_sep: Mutex::new(LineSep::default()),
            state: RunState::new(),
        }
    }

    /// Peer address, when connected.
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// The server owning this session, when connected.
    pub fn server(&self) -> Option<&Arc<ServerHandle>> {
        self.server.as_ref()
    }

    /// Lifecycle state of the session task.
    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// Line terminator to use for replies on this session.
    pub fn line_sep(&self) -> LineSep {
        *self.line_sep.lock().expect("line sep mutex poisoned")
    }

    /// Records the terminator the peer used last.
    pub fn set_line_sep(&self, sep: LineSep) {
        *self.line_sep.lock().expect("line sep mutex poisoned") = sep;
    }

    /// Sends raw bytes to the peer, or to stdout on a detached session.
    pub async fn send(&self, bytes: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(writer) => writer.write_all(bytes).await?,
            None => {
                let mut stdout = tokio::io::stdout();
                stdout.write_all(bytes).await?;
                stdout.flush().await?;
            }
        }
        Ok(())
    }

    /// Sends `text` followed by the session's line terminator.
    pub async fn reply_text(&self, text: &str) -> Result<()> {
        let mut line = String::with_capacity(text.len() + 2);
        line.push_str(text);
        line.push_str(self.line_sep().as_str());
        self.send(line.as_bytes()).await
    }

    /// Sends `text` with no terminator appended (prompts).
    pub async fn reply_raw(&self, text: &str) -> Result<()> {
        self.send(text.as_bytes()).await
    }

    /// Releases the socket and asks the session loop to stop. Close errors
    /// are swallowed.
    pub async fn close(&self) {
        self.state.transit(RunStage::Stopping);
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }
}

/// Shared server facts available to sessions and handlers: the bound
/// address, a tag naming the handler type, and the live session list.
pub struct ServerHandle {
    local_addr: SocketAddr,
    handler_tag: &'static str,
    sessions: Mutex<Vec<Arc<Session>>>,
}

impl ServerHandle {
    fn new(local_addr: SocketAddr, handler_tag: &'static str) -> ServerHandle {
        ServerHandle { local_addr, handler_tag, sessions: Mutex::new(Vec::new()) }
    }

    /// Address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Short name of the handler type driving this server.
    pub fn handler_tag(&self) -> &'static str {
        self.handler_tag
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.lock().expect("session list mutex poisoned").len()
    }

    /// Human-readable server information for the `state` command: bind
    /// address, handler tag, session count and each session's peer.
    pub fn info_lines(&self) -> Vec<String> {
        let sessions = self.sessions.lock().expect("session list mutex poisoned");
        let mut lines = vec![
            format!("Server address: {}", self.local_addr),
            format!("Handler: {}", self.handler_tag),
            format!("Sessions: {}", sessions.len()),
        ];
        for (index, session) in sessions.iter().enumerate() {
            match session.peer() {
                Some(peer) => lines.push(format!("Session[{index}]: {peer}")),
                None => lines.push(format!("Session[{index}]: detached")),
            }
        }
        lines
    }

    fn add_session(&self, session: Arc<Session>) {
        self.sessions.lock().expect("session list mutex poisoned").push(session);
    }

    /// Drops sessions whose task has stopped. Called from the accept loop
    /// only, so a plain retain over the snapshot is race-free.
    fn cleanup_stopped(&self) {
        self.sessions.lock().expect("session list mutex poisoned").retain(|session| {
            let stopped = session.state().current() == RunStage::Stopped;
            if stopped {
                debug!("dropping stopped session {:?}", session.peer());
            }
            !stopped
        });
    }

    fn take_sessions(&self) -> Vec<Arc<Session>> {
        std::mem::take(&mut *self.sessions.lock().expect("session list mutex poisoned"))
    }
}

/// TCP server running one handler-driven session task per client.
pub struct SessionServer<H: SessionHandler> {
    handler: Arc<H>,
    host: String,
    port: u16,
    max_buff: usize,
    state: RunState,
    handle: Mutex<Option<Arc<ServerHandle>>>,
}

impl<H: SessionHandler> SessionServer<H> {
    /// Creates a server for `handler`, binding `host:port` on start. Port 0
    /// picks an ephemeral port.
    pub fn new(handler: H, host: impl Into<String>, port: u16) -> SessionServer<H> {
        SessionServer {
            handler: Arc::new(handler),
            host: host.into(),
            port,
            max_buff: DEFAULT_MAX_BUFF,
            state: RunState::new(),
            handle: Mutex::new(None),
        }
    }

    /// Overrides the per-session receive buffer size.
    pub fn with_max_buff(mut self, max_buff: usize) -> SessionServer<H> {
        self.max_buff = max_buff;
        self
    }

    /// The handler driving this server's sessions.
    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    /// Address the server is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.handle
            .lock()
            .expect("server handle mutex poisoned")
            .as_ref()
            .map(|handle| handle.local_addr())
    }

    /// Lifecycle state of the accept loop.
    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// Whether shutdown was requested through the handler's exit flag.
    pub fn is_exit(&self) -> bool {
        self.handler.is_exit()
    }

    /// Binds the listener and spawns the accept loop, returning once the
    /// loop is serving. A bind failure sets the handler's exit flag so
    /// run-until-exit callers terminate.
    pub async fn start(&self) -> Result<()> {
        let listener = match TcpListener::bind((self.host.as_str(), self.port)).await {
            Ok(listener) => listener,
            Err(err) => {
                error!("socket error {} @ {} {}", err, self.host, self.port);
                self.handler.set_exit();
                return Err(err.into());
            }
        };
        let local = listener.local_addr()?;
        info!("listening on {}", local);

        let handle = Arc::new(ServerHandle::new(local, std::any::type_name::<H>()));
        *self.handle.lock().expect("server handle mutex poisoned") = Some(handle.clone());
        self.handler.on_server_start(&handle);

        self.state.transit(RunStage::Starting);
        let handler = self.handler.clone();
        let state = self.state.clone();
        let max_buff = self.max_buff;
        tokio::spawn(async move {
            accept_loop(listener, handler, handle, state.clone(), max_buff).await;
            state.transit(RunStage::Stopped);
        });
        self.state.wait(RunStage::Running, None).await;
        Ok(())
    }

    /// Requests shutdown and waits for the accept loop and its sessions,
    /// bounded at 10 s.
    pub async fn stop(&self) {
        self.state.transit(RunStage::Stopping);
        self.state.wait(RunStage::Stopped, Some(Duration::from_secs(10))).await;
    }
}

/// Accept loop: accepts clients, spawns session tasks, cleans up stopped
/// sessions, and polls the handler's exit flag.
async fn accept_loop<H: SessionHandler>(
    listener: TcpListener,
    handler: Arc<H>,
    handle: Arc<ServerHandle>,
    state: RunState,
    max_buff: usize,
) {
    state.transit(RunStage::Running);
    while state.current() == RunStage::Running && !handler.is_exit() {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    info!("accepting connection from {}", peer);
                    let (reader, writer) = stream.into_split();
                    let session = Arc::new(Session::connected(handle.clone(), peer, writer));
                    session.state().transit(RunStage::Starting);
                    handle.add_session(session.clone());
                    let session_handler = handler.clone();
                    tokio::spawn(async move {
                        session_handler.run_session(session, reader, max_buff).await;
                    });
                }
                Err(err) => {
                    error!("accept error: {}", err);
                }
            },
            _ = state.wait(RunStage::Stopping, None) => break,
            _ = tokio::time::sleep(POLL_INTERVAL) => {
                handle.cleanup_stopped();
            }
        }
    }
    state.transit(RunStage::Stopping);

    let sessions = handle.take_sessions();
    for session in &sessions {
        session.state().transit(RunStage::Stopping);
    }
    for session in &sessions {
        session.state().wait(RunStage::Stopped, Some(SESSION_JOIN_TIMEOUT)).await;
    }
    drop(listener);
}

/// Standard receive loop of a session: poll, frame, dispatch.
pub async fn run_read_loop<H: SessionHandler + ?Sized>(
    handler: &H,
    session: &Arc<Session>,
    mut reader: OwnedReadHalf,
    max_buff: usize,
) {
    debug!("starting session from client {:?}", session.peer());
    session.state().transit(RunStage::Running);
    if let Err(err) = handler.on_start(session).await {
        error!("session start error: {:#}", err);
        session.state().transit(RunStage::Stopping);
    }

    let mut residual: Vec<u8> = Vec::new();
    let mut chunk = vec![0u8; max_buff];
    'serve: while session.state().current() == RunStage::Running {
        match tokio::time::timeout(POLL_INTERVAL, reader.read(&mut chunk)).await {
            Ok(Ok(0)) => {
                debug!("peer closed the connection, closing session");
                break;
            }
            Ok(Ok(received)) => {
                residual.extend_from_slice(&chunk[..received]);
                while let Some(frame) = handler.find_frame(session, &residual) {
                    let message: Vec<u8> = residual.drain(..frame.next).take(frame.end).collect();
                    match handler.on_data(session, &message).await {
                        Ok(true) => {}
                        Ok(false) => break 'serve,
                        Err(err) => {
                            error!("session data error: {:#}", err);
                            break 'serve;
                        }
                    }
                    if frame.next == 0 {
                        break;
                    }
                }
            }
            Ok(Err(err)) => {
                error!("session read error: {}", err);
                break;
            }
            Err(_) => {}
        }
        handler.on_idle(session).await;
    }

    session.close().await;
    session.state().transit(RunStage::Stopped);
    debug!("closed session {:?}", session.peer());
}
