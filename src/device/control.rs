//! Control channel: the camera's token-scoped JSON session
//!
//! Requests are single-line JSON objects terminated by `\n`:
//!
//! ```text
//! -> {"msg_id":257,"token":0,"param":""}
//! <- {"rval":0,"msg_id":257,"param":3}
//! ```
//!
//! The camera does not frame its responses, and it interleaves unsolicited
//! notifications (`{"msg_id":7,"type":"battery",...}`) with replies. Replies
//! are therefore decoded with a streaming JSON deserializer that reports the
//! exact end of each value, and messages for other ids are skipped.

use crate::core::config::ControlConfig;
use crate::core::error::{ExportError, OpContext, Result};
use crate::device::net::{self, Teardown};
use crate::device::traits::ConnectionState;
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Message id of the start-session exchange
pub const MSG_START_SESSION: u32 = 257;

/// Message id of the stop-session exchange
pub const MSG_STOP_SESSION: u32 = 258;

/// Token presented on the start-session request
const START_SESSION_TOKEN: i64 = 0;

/// Notifications tolerated before the awaited reply
const MAX_SKIPPED_MESSAGES: usize = 16;

/// Read buffer size for one socket read
const READ_CHUNK: usize = 1024;

/// Control-channel request
#[derive(Debug, Clone, Serialize)]
pub struct ControlRequest {
    pub msg_id: u32,
    pub token: i64,
    pub param: String,
}

/// Control-channel message as sent by the camera
///
/// Replies carry `rval`; notifications usually do not, hence the defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct ControlResponse {
    #[serde(default)]
    pub rval: i32,
    pub msg_id: u32,
    #[serde(default)]
    pub param: Option<serde_json::Value>,
}

/// Pull one complete JSON message off the front of `buf`
///
/// Returns `Ok(None)` when `buf` holds only whitespace or an incomplete
/// value; consumed bytes are drained, trailing bytes stay for the next call.
pub fn decode_message(buf: &mut Vec<u8>) -> std::result::Result<Option<ControlResponse>, serde_json::Error> {
    if buf.iter().all(u8::is_ascii_whitespace) {
        buf.clear();
        return Ok(None);
    }

    let mut stream = serde_json::Deserializer::from_slice(buf).into_iter::<ControlResponse>();
    match stream.next() {
        Some(Ok(message)) => {
            let consumed = stream.byte_offset();
            buf.drain(..consumed);
            Ok(Some(message))
        }
        Some(Err(e)) if e.is_eof() => Ok(None),
        Some(Err(e)) => Err(e),
        None => Ok(None),
    }
}

/// An open control socket plus its undecoded input
#[derive(Debug)]
struct ControlConnection {
    stream: TcpStream,
    pending: Vec<u8>,
    io_timeout: Duration,
    peer: String,
}

impl ControlConnection {
    /// Send one request and wait for the reply with the same `msg_id`
    async fn exchange(&mut self, request: &ControlRequest) -> Result<ControlResponse> {
        const OP: &str = "ControlSession::exchange";

        let mut line = serde_json::to_vec(request)
            .map_err(|e| ExportError::protocol(OP, format!("encode request: {}", e)))?;
        line.push(b'\n');

        trace!("{} -> {}", self.peer, String::from_utf8_lossy(&line).trim_end());
        self.stream
            .write_all(&line)
            .await
            .map_err(|e| ExportError::connection(OP, format!("write msg_id {}", request.msg_id), e))?;

        let limit = self.io_timeout;
        match timeout(limit, self.read_reply(request.msg_id)).await {
            Ok(result) => result,
            Err(_) => Err(ExportError::timeout(
                OP,
                format!("waiting for reply to msg_id {}", request.msg_id),
                limit,
            )),
        }
    }

    async fn read_reply(&mut self, msg_id: u32) -> Result<ControlResponse> {
        const OP: &str = "ControlSession::read_reply";
        let mut skipped = 0usize;

        loop {
            let message = self.read_message().await?;
            if message.msg_id == msg_id {
                if message.rval < 0 {
                    return Err(ExportError::protocol(
                        OP,
                        format!("msg_id {} rejected with rval {}", msg_id, message.rval),
                    ));
                }
                return Ok(message);
            }

            skipped += 1;
            debug!(
                "{}: skipping msg_id {} while waiting for {}",
                self.peer, message.msg_id, msg_id
            );
            if skipped >= MAX_SKIPPED_MESSAGES {
                return Err(ExportError::protocol(
                    OP,
                    format!("no reply to msg_id {} after {} messages", msg_id, skipped),
                ));
            }
        }
    }

    async fn read_message(&mut self) -> Result<ControlResponse> {
        const OP: &str = "ControlSession::read_message";
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            match decode_message(&mut self.pending) {
                Ok(Some(message)) => {
                    trace!("{} <- msg_id {} rval {}", self.peer, message.msg_id, message.rval);
                    return Ok(message);
                }
                Ok(None) => {}
                Err(e) => {
                    let raw = String::from_utf8_lossy(&self.pending).into_owned();
                    self.pending.clear();
                    return Err(ExportError::protocol(
                        OP,
                        format!("malformed message {:?}: {}", raw, e),
                    ));
                }
            }

            let n = self
                .stream
                .read(&mut chunk)
                .await
                .map_err(|e| ExportError::connection(OP, "read", e))?;
            if n == 0 {
                return Err(ExportError::connection(
                    OP,
                    "read",
                    std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "camera closed the control channel",
                    ),
                ));
            }
            self.pending.extend_from_slice(&chunk[..n]);
        }
    }

    async fn stop_session(&mut self, token: i64) -> Result<()> {
        self.exchange(&ControlRequest {
            msg_id: MSG_STOP_SESSION,
            token,
            param: String::new(),
        })
        .await
        .map(|_| ())
    }

    async fn close(mut self) {
        if let Err(e) = self.stream.shutdown().await {
            trace!("{}: control socket shutdown: {}", self.peer, e);
        }
    }
}

/// Token-scoped control session
///
/// `start` opens the socket and obtains a token; a background task then
/// waits for the session's cancellation token and performs the stop-session
/// exchange followed by a close, even if the exchange fails.
#[derive(Debug)]
pub struct ControlSession {
    config: ControlConfig,
    state: ConnectionState,
    token: Option<i64>,
    teardown: Option<Teardown>,
}

impl ControlSession {
    pub fn new(config: ControlConfig) -> Self {
        Self {
            config,
            state: ConnectionState::Unopened,
            token: None,
            teardown: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Token returned by the camera, while the session is open
    pub fn token(&self) -> Option<i64> {
        self.token
    }

    /// Open the control session; teardown is armed on `cancel`
    pub async fn start(&mut self, cancel: CancellationToken) -> Result<i64> {
        const OP: &str = "ControlSession::start";

        if self.state != ConnectionState::Unopened {
            return Err(ExportError::NotOpen { op: OP });
        }

        let peer = format!("{}:{}", self.config.host, self.config.port);
        let stream = net::dial(OP, &self.config.host, self.config.port, self.config.connect_timeout())
            .await
            .op_context(OP, "configure connection")?;

        info!("Control channel connected to {}", peer);

        let mut conn = ControlConnection {
            stream,
            pending: Vec::new(),
            io_timeout: self.config.io_timeout(),
            peer: peer.clone(),
        };

        let reply = match conn
            .exchange(&ControlRequest {
                msg_id: MSG_START_SESSION,
                token: START_SESSION_TOKEN,
                param: String::new(),
            })
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                conn.close().await;
                self.state = ConnectionState::Closed;
                return Err::<i64, _>(e).op_context(OP, "session start");
            }
        };

        let token = match reply.param.as_ref().and_then(|p| p.as_i64()) {
            Some(token) => token,
            None => {
                conn.close().await;
                self.state = ConnectionState::Closed;
                return Err(ExportError::protocol(
                    OP,
                    format!("start-session reply carries no token: {:?}", reply.param),
                ));
            }
        };

        info!("Control session started on {} (token {})", peer, token);
        self.token = Some(token);
        self.state = ConnectionState::Open;

        let handle = tokio::spawn(async move {
            cancel.cancelled().await;
            match conn.stop_session(token).await {
                Ok(()) => info!("Control session stopped on {}", peer),
                Err(e) => warn!("Stop control session on {} failed: {}", peer, e.chain()),
            }
            conn.close().await;
        });
        self.teardown = Some(Teardown::new("control", handle));

        Ok(token)
    }

    /// Wait for the teardown task (bounded) and mark the channel closed
    pub async fn close(&mut self, limit: Duration) {
        if let Some(teardown) = self.teardown.take() {
            teardown.wait(limit).await;
        }
        self.token = None;
        self.state = ConnectionState::Closed;
    }
}
