//! Source RCON over TCP: per-connection authentication state machine and
//! multi-packet response reassembly.
//!
//! Unlike the UDP query protocols, every RCON frame carries a 32-bit
//! request id, so pending commands are keyed by id. The protocol has no
//! end-of-response marker for commands whose output spans several frames;
//! the established convention is to send an empty follow-up command right
//! after the real one - the server answers strictly in order, so the echo
//! of the follow-up marks the end of the previous response. Servers that
//! reorder responses defeat this; the reassembly timeout is the safety net.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use rustc_hash::FxHashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::codec::rcon::{
    RconFrame, AUTH_FAILURE_ID, MAX_BODY_LEN, MIN_PAYLOAD_LEN, SERVERDATA_AUTH,
    SERVERDATA_AUTH_RESPONSE, SERVERDATA_EXECCOMMAND, SERVERDATA_RESPONSE_VALUE,
};
use crate::config::ClientConfig;
use crate::error::QueryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RconConnectionState {
    Disconnected,
    Connecting,
    Unauthenticated,
    Authenticated,
    Closed,
}

struct PendingCommand {
    completion: oneshot::Sender<Result<String, QueryError>>,
    /// reassembly buffer: bodies of all frames received for this id so far
    buffer: String,
    started_at: Instant,
}

struct RconShared {
    state: RconConnectionState,
    next_request_id: i32,
    pending: FxHashMap<i32, PendingCommand>,
    /// id of an empty follow-up command -> id of the real command whose
    /// response it terminates
    terminators: FxHashMap<i32, i32>,
    auth: Option<(i32, oneshot::Sender<Result<(), QueryError>>)>,
}

impl RconShared {
    fn alloc_request_id(&mut self) -> i32 {
        let id = self.next_request_id;
        self.next_request_id = match self.next_request_id.checked_add(1) {
            Some(next) => next,
            None => 1, // ids must stay positive: -1 is the refusal marker
        };
        id
    }

    /// Resolves every pending handle with `make_error()` and clears all
    /// per-connection state. Used when the connection goes away.
    fn fail_all(&mut self, make_error: impl Fn() -> QueryError) {
        for (_, command) in self.pending.drain() {
            let _ = command.completion.send(Err(make_error()));
        }
        self.terminators.clear();
        if let Some((_, completion)) = self.auth.take() {
            let _ = completion.send(Err(make_error()));
        }
    }

    fn discard_stale_buffers(&mut self, reassembly_timeout: Duration) {
        let stale: Vec<i32> = self
            .pending
            .iter()
            .filter(|(_, command)| command.started_at.elapsed() > reassembly_timeout)
            .map(|(&id, _)| id)
            .collect();
        for id in stale {
            warn!("discarding stale rcon reassembly buffer for request {}", id);
            if let Some(command) = self.pending.remove(&id) {
                let _ = command.completion.send(Err(QueryError::RequestTimedOut));
            }
            self.terminators.retain(|_, &mut real_id| real_id != id);
        }
    }
}

/// One authenticated-capable RCON connection. Command submission is safe
/// from multiple tasks; responses are matched by request id.
pub struct RconConnection {
    shared: Arc<Mutex<RconShared>>,
    writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    read_task: JoinHandle<()>,
}

impl RconConnection {
    /// Connects to an RCON server. The connection starts unauthenticated;
    /// call [`RconConnection::authenticate`] before executing commands.
    pub async fn connect(
        addr: SocketAddr,
        config: Arc<ClientConfig>,
    ) -> Result<RconConnection, QueryError> {
        debug!("connecting to rcon server {:?}", addr);
        let stream = TcpStream::connect(addr).await?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self::open(
            Box::new(read_half),
            Box::new(write_half),
            config,
        ))
    }

    /// Builds a connection on an already established stream.
    pub fn open(
        read: Box<dyn AsyncRead + Send + Unpin>,
        write: Box<dyn AsyncWrite + Send + Unpin>,
        config: Arc<ClientConfig>,
    ) -> RconConnection {
        let shared = Arc::new(Mutex::new(RconShared {
            state: RconConnectionState::Unauthenticated,
            next_request_id: 1,
            pending: FxHashMap::default(),
            terminators: FxHashMap::default(),
            auth: None,
        }));

        let read_task = tokio::spawn(read_loop(
            read,
            shared.clone(),
            config.rcon_reassembly_timeout,
        ));

        RconConnection {
            shared,
            writer: tokio::sync::Mutex::new(write),
            read_task,
        }
    }

    pub fn state(&self) -> RconConnectionState {
        self.shared.lock().unwrap().state
    }

    /// Sends the password with a fresh request id and waits for the
    /// server's verdict. A refusal (auth response id `-1`) resolves with
    /// `AuthenticationFailed` and closes the connection; commands queued
    /// meanwhile fail with a transport error.
    pub async fn authenticate(&self, password: &str) -> Result<(), QueryError> {
        let (tx, rx) = oneshot::channel();
        let auth_id = {
            let mut shared = self.shared.lock().unwrap();
            if shared.state != RconConnectionState::Unauthenticated {
                return Err(QueryError::Transport(format!(
                    "cannot authenticate in state {:?}",
                    shared.state
                )));
            }
            let id = shared.alloc_request_id();
            shared.auth = Some((id, tx));
            id
        };

        trace!("authenticating with request id {}", auth_id);
        if let Err(e) = self
            .write_frame(&RconFrame::new(auth_id, SERVERDATA_AUTH, password))
            .await
        {
            self.shared.lock().unwrap().auth = None;
            return Err(e);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(QueryError::Transport(
                "connection closed during authentication".to_string(),
            )),
        }
    }

    /// Executes a command and returns its full response body, reassembled
    /// across however many frames the server split it into.
    pub async fn execute(&self, command: &str) -> Result<String, QueryError> {
        let (tx, rx) = oneshot::channel();
        let (command_id, terminator_id) = {
            let mut shared = self.shared.lock().unwrap();
            match shared.state {
                RconConnectionState::Unauthenticated | RconConnectionState::Authenticated => {}
                state => {
                    return Err(QueryError::Transport(format!(
                        "connection closed (state {:?})",
                        state
                    )))
                }
            }
            let command_id = shared.alloc_request_id();
            let terminator_id = shared.alloc_request_id();
            shared.pending.insert(
                command_id,
                PendingCommand {
                    completion: tx,
                    buffer: String::new(),
                    started_at: Instant::now(),
                },
            );
            shared.terminators.insert(terminator_id, command_id);
            (command_id, terminator_id)
        };

        trace!(
            "executing rcon command #{} (terminator #{})",
            command_id,
            terminator_id
        );
        // the empty follow-up command: its echo terminates the reassembly
        let written = match self
            .write_frame(&RconFrame::new(command_id, SERVERDATA_EXECCOMMAND, command))
            .await
        {
            Ok(()) => {
                self.write_frame(&RconFrame::new(terminator_id, SERVERDATA_EXECCOMMAND, ""))
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            let mut shared = self.shared.lock().unwrap();
            shared.pending.remove(&command_id);
            shared.terminators.remove(&terminator_id);
            return Err(e);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(QueryError::Transport("connection closed".to_string())),
        }
    }

    /// Idempotent: fails everything pending and tears the connection down.
    pub async fn close(&self) {
        {
            let mut shared = self.shared.lock().unwrap();
            if shared.state == RconConnectionState::Closed {
                return;
            }
            shared.state = RconConnectionState::Closed;
            shared.fail_all(|| QueryError::Transport("connection closed".to_string()));
        }
        self.read_task.abort();
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    async fn write_frame(&self, frame: &RconFrame) -> Result<(), QueryError> {
        let mut buf = BytesMut::new();
        frame.ser(&mut buf);
        let mut writer = self.writer.lock().await;
        writer.write_all(&buf).await?;
        writer.flush().await?;
        Ok(())
    }
}

impl Drop for RconConnection {
    fn drop(&mut self) {
        self.read_task.abort();
    }
}

struct FrameReadFailure {
    /// request id of the offending frame, if enough of it was readable
    id: Option<i32>,
    error: QueryError,
}

async fn read_frame(
    read: &mut (dyn AsyncRead + Send + Unpin),
) -> Result<RconFrame, FrameReadFailure> {
    let mut size_buf = [0u8; 4];
    read.read_exact(&mut size_buf).await.map_err(|e| FrameReadFailure {
        id: None,
        error: e.into(),
    })?;
    let size = i32::from_le_bytes(size_buf);

    if size < MIN_PAYLOAD_LEN as i32 || size as usize > MAX_BODY_LEN + MIN_PAYLOAD_LEN {
        return Err(FrameReadFailure {
            id: None,
            error: QueryError::MalformedPayload(format!("rcon frame size {} out of range", size)),
        });
    }

    let mut payload = vec![0u8; size as usize];
    read.read_exact(&mut payload).await.map_err(|e| FrameReadFailure {
        id: None,
        error: e.into(),
    })?;

    RconFrame::deser_payload(&payload).map_err(|error| FrameReadFailure {
        id: payload_request_id(&payload),
        error,
    })
}

fn payload_request_id(payload: &[u8]) -> Option<i32> {
    let raw: [u8; 4] = payload.get(..4)?.try_into().ok()?;
    Some(i32::from_le_bytes(raw))
}

async fn read_loop(
    mut read: Box<dyn AsyncRead + Send + Unpin>,
    shared: Arc<Mutex<RconShared>>,
    reassembly_timeout: Duration,
) {
    loop {
        match read_frame(read.as_mut()).await {
            Ok(frame) => {
                handle_frame(&shared, frame, reassembly_timeout);
                if shared.lock().unwrap().state == RconConnectionState::Closed {
                    break;
                }
            }
            Err(failure) => {
                let is_malformed = matches!(&failure.error, QueryError::MalformedPayload(_));
                let mut shared = shared.lock().unwrap();
                if is_malformed {
                    warn!("malformed rcon frame - closing connection: {}", failure.error);
                    // surface the decode error to the command the frame
                    // belonged to, if it identified one
                    if let Some(id) = failure.id {
                        let command_id = shared.terminators.remove(&id).unwrap_or(id);
                        if let Some(command) = shared.pending.remove(&command_id) {
                            let _ = command.completion.send(Err(failure.error));
                        }
                    }
                } else {
                    debug!("rcon connection closed: {}", failure.error);
                }
                shared.state = RconConnectionState::Closed;
                shared.fail_all(|| QueryError::Transport("connection closed".to_string()));
                break;
            }
        }
    }
}

fn handle_frame(shared: &Arc<Mutex<RconShared>>, frame: RconFrame, reassembly_timeout: Duration) {
    let mut shared = shared.lock().unwrap();
    shared.discard_stale_buffers(reassembly_timeout);

    if frame.frame_type == SERVERDATA_AUTH_RESPONSE {
        match shared.auth.take() {
            Some((auth_id, completion)) => {
                if frame.id == auth_id {
                    debug!("rcon authentication succeeded");
                    shared.state = RconConnectionState::Authenticated;
                    let _ = completion.send(Ok(()));
                } else if frame.id == AUTH_FAILURE_ID {
                    debug!("rcon authentication refused");
                    shared.state = RconConnectionState::Closed;
                    let _ = completion.send(Err(QueryError::AuthenticationFailed));
                    shared.fail_all(|| QueryError::Transport("connection closed".to_string()));
                } else {
                    warn!(
                        "auth response for unexpected request id {} - ignoring",
                        frame.id
                    );
                    shared.auth = Some((auth_id, completion));
                }
            }
            None => debug!("unsolicited auth response - discarding"),
        }
        return;
    }

    // some servers send an empty response value ahead of the auth response
    if let Some((auth_id, _)) = &shared.auth {
        if frame.frame_type == SERVERDATA_RESPONSE_VALUE && frame.id == *auth_id {
            trace!("empty response preceding the auth response");
            return;
        }
    }

    // the echo of the empty follow-up: the previous command is complete
    if let Some(command_id) = shared.terminators.remove(&frame.id) {
        if let Some(command) = shared.pending.remove(&command_id) {
            trace!(
                "rcon command #{} complete ({} bytes reassembled)",
                command_id,
                command.buffer.len()
            );
            let _ = command.completion.send(Ok(command.buffer));
        }
        return;
    }

    if let Some(command) = shared.pending.get_mut(&frame.id) {
        trace!(
            "buffering {} bytes for rcon command #{}",
            frame.body.len(),
            frame.id
        );
        command.buffer.push_str(&frame.body);
        return;
    }

    debug!(
        "received rcon frame with no matching request (id {}) - discarding",
        frame.id
    );
}

#[cfg(test)]
mod tests {
    use tokio::io::{duplex, DuplexStream};

    use super::*;

    /// Splits the server side of a duplex pipe for manual frame exchange.
    struct TestServer {
        read: tokio::io::ReadHalf<DuplexStream>,
        write: tokio::io::WriteHalf<DuplexStream>,
    }

    impl TestServer {
        async fn read_frame(&mut self) -> RconFrame {
            let mut size_buf = [0u8; 4];
            self.read.read_exact(&mut size_buf).await.unwrap();
            let size = i32::from_le_bytes(size_buf) as usize;
            let mut payload = vec![0u8; size];
            self.read.read_exact(&mut payload).await.unwrap();
            RconFrame::deser_payload(&payload).unwrap()
        }

        async fn write_frame(&mut self, frame: RconFrame) {
            let mut buf = BytesMut::new();
            frame.ser(&mut buf);
            self.write.write_all(&buf).await.unwrap();
        }

        async fn write_raw(&mut self, raw: &[u8]) {
            self.write.write_all(raw).await.unwrap();
        }
    }

    fn connected_pair() -> (RconConnection, TestServer) {
        let (client_stream, server_stream) = duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client_stream);
        let (server_read, server_write) = tokio::io::split(server_stream);

        let connection = RconConnection::open(
            Box::new(client_read),
            Box::new(client_write),
            Arc::new(ClientConfig::new()),
        );
        (
            connection,
            TestServer {
                read: server_read,
                write: server_write,
            },
        )
    }

    async fn authenticate(connection: &RconConnection, server: &mut TestServer) {
        let auth = connection.authenticate("hunter2");
        tokio::pin!(auth);

        // drive the client until the auth frame reaches the server
        let frame = tokio::select! {
            frame = server.read_frame() => frame,
            _ = &mut auth => panic!("authentication resolved before the server answered"),
        };
        assert_eq!(frame.frame_type, SERVERDATA_AUTH);
        assert_eq!(frame.body, "hunter2");

        // empty response value first, as real servers do
        server
            .write_frame(RconFrame::new(frame.id, SERVERDATA_RESPONSE_VALUE, ""))
            .await;
        server
            .write_frame(RconFrame::new(frame.id, SERVERDATA_AUTH_RESPONSE, ""))
            .await;

        auth.await.unwrap();
        assert_eq!(connection.state(), RconConnectionState::Authenticated);
    }

    #[tokio::test]
    async fn test_authentication_success() {
        let (connection, mut server) = connected_pair();
        assert_eq!(connection.state(), RconConnectionState::Unauthenticated);
        authenticate(&connection, &mut server).await;
    }

    /// A refused password carries id -1; the auth handle fails, the
    /// connection closes, and a command queued behind the auth fails with
    /// a transport error.
    #[tokio::test]
    async fn test_authentication_failure_closes_and_fails_queued_commands() {
        let (connection, mut server) = connected_pair();

        let auth = connection.authenticate("wrong password");
        tokio::pin!(auth);
        let auth_frame = tokio::select! {
            frame = server.read_frame() => frame,
            _ = &mut auth => panic!("authentication resolved before the server answered"),
        };

        // a command is queued while authentication is still in flight
        let command = connection.execute("status");
        tokio::pin!(command);
        let command_frame = tokio::select! {
            frame = server.read_frame() => frame,
            _ = &mut command => panic!("command resolved before the server answered"),
        };
        assert_eq!(command_frame.frame_type, SERVERDATA_EXECCOMMAND);

        server
            .write_frame(RconFrame::new(
                AUTH_FAILURE_ID,
                SERVERDATA_AUTH_RESPONSE,
                "",
            ))
            .await;

        assert!(matches!(
            auth.await,
            Err(QueryError::AuthenticationFailed)
        ));
        assert!(matches!(command.await, Err(QueryError::Transport(_))));
        assert_eq!(connection.state(), RconConnectionState::Closed);

        // closed connections reject further commands outright
        assert!(matches!(
            connection.execute("status").await,
            Err(QueryError::Transport(_))
        ));
    }

    /// A response split across two frames, terminated by the echo of the
    /// empty follow-up command; the bodies are concatenated and the
    /// reassembly buffer is cleared.
    #[tokio::test]
    async fn test_multi_packet_response_reassembly() {
        let (connection, mut server) = connected_pair();
        authenticate(&connection, &mut server).await;

        let command = connection.execute("cvarlist");
        tokio::pin!(command);

        let command_frame = tokio::select! {
            frame = server.read_frame() => frame,
            _ = &mut command => panic!("command resolved before the server answered"),
        };
        assert_eq!(command_frame.body, "cvarlist");
        let terminator_frame = server.read_frame().await;
        assert_eq!(terminator_frame.body, "");
        assert_eq!(terminator_frame.frame_type, SERVERDATA_EXECCOMMAND);

        server
            .write_frame(RconFrame::new(
                command_frame.id,
                SERVERDATA_RESPONSE_VALUE,
                "first half, ",
            ))
            .await;
        server
            .write_frame(RconFrame::new(
                command_frame.id,
                SERVERDATA_RESPONSE_VALUE,
                "second half",
            ))
            .await;
        server
            .write_frame(RconFrame::new(
                terminator_frame.id,
                SERVERDATA_RESPONSE_VALUE,
                "",
            ))
            .await;

        assert_eq!(command.await.unwrap(), "first half, second half");

        let shared = connection.shared.lock().unwrap();
        assert!(shared.pending.is_empty());
        assert!(shared.terminators.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_reassembly_buffer_is_discarded() {
        let (connection, mut server) = connected_pair();
        authenticate(&connection, &mut server).await;

        let command = connection.execute("status");
        tokio::pin!(command);
        let command_frame = tokio::select! {
            frame = server.read_frame() => frame,
            _ = &mut command => panic!("command resolved before the server answered"),
        };
        let _terminator_frame = server.read_frame().await;

        server
            .write_frame(RconFrame::new(
                command_frame.id,
                SERVERDATA_RESPONSE_VALUE,
                "partial",
            ))
            .await;

        // no terminator arrives; past the reassembly window, the next
        // inbound frame sweeps the stale buffer
        tokio::time::sleep(Duration::from_millis(10_500)).await;
        server
            .write_frame(RconFrame::new(9999, SERVERDATA_RESPONSE_VALUE, "stray"))
            .await;

        assert!(matches!(command.await, Err(QueryError::RequestTimedOut)));
        assert!(connection.shared.lock().unwrap().pending.is_empty());
    }

    /// a malformed frame surfaces to the command it belonged to and closes
    /// the connection
    #[tokio::test]
    async fn test_malformed_frame_fails_the_matching_command_and_closes() {
        let (connection, mut server) = connected_pair();
        authenticate(&connection, &mut server).await;

        let command = connection.execute("status");
        tokio::pin!(command);
        let command_frame = tokio::select! {
            frame = server.read_frame() => frame,
            _ = &mut command => panic!("command resolved before the server answered"),
        };
        let _terminator_frame = server.read_frame().await;

        // a frame for the command's id with a corrupted trailer
        let mut raw = BytesMut::new();
        raw.extend_from_slice(&12i32.to_le_bytes());
        raw.extend_from_slice(&command_frame.id.to_le_bytes());
        raw.extend_from_slice(&SERVERDATA_RESPONSE_VALUE.to_le_bytes());
        raw.extend_from_slice(b"ab\0\x01");
        server.write_raw(&raw).await;

        assert!(matches!(
            command.await,
            Err(QueryError::MalformedPayload(_))
        ));
        assert_eq!(connection.state(), RconConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_server_disconnect_fails_pending_commands() {
        let (connection, mut server) = connected_pair();
        authenticate(&connection, &mut server).await;

        let command = connection.execute("status");
        tokio::pin!(command);
        let _frames = tokio::select! {
            frame = server.read_frame() => frame,
            _ = &mut command => panic!("command resolved before the server answered"),
        };

        drop(server);

        assert!(matches!(command.await, Err(QueryError::Transport(_))));
        assert_eq!(connection.state(), RconConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (connection, _server) = connected_pair();
        connection.close().await;
        connection.close().await;
        assert_eq!(connection.state(), RconConnectionState::Closed);
    }
}
