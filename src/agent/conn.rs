//! Agent wire protocol and session bridging
//!
//! Agents speak JSON text frames over a WebSocket. One connection carries
//! any number of exec/attach sessions, each routed by its `id`.

use crate::api::mux::StreamWriter;
use crate::driver::BoxedConn;
use crate::error::{Result, SockerlessError};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Message type names
pub mod message_types {
    pub const EXEC: &str = "exec";
    pub const ATTACH: &str = "attach";
    pub const STDIN: &str = "stdin";
    pub const CLOSE_STDIN: &str = "close_stdin";
    pub const STDOUT: &str = "stdout";
    pub const STDERR: &str = "stderr";
    pub const EXIT: &str = "exit";
    pub const ERROR: &str = "error";
}

use message_types as mt;

/// Capacity of each session's inbound queue
const SESSION_CAPACITY: usize = 64;

/// Size of stdin reads forwarded to the agent
const STDIN_CHUNK: usize = 32 * 1024;

/// One protocol frame
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub tty: bool,
    /// Base64 payload for stdin/stdout/stderr
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl Message {
    fn new(msg_type: &str, id: &str) -> Self {
        Self {
            msg_type: msg_type.to_string(),
            id: id.to_string(),
            ..Default::default()
        }
    }

    /// Start a command in a new session
    pub fn exec(id: &str, cmd: &[String], env: &[String], workdir: &str, tty: bool) -> Self {
        Self {
            cmd: Some(cmd.to_vec()),
            env: Some(env.to_vec()),
            workdir: (!workdir.is_empty()).then(|| workdir.to_string()),
            tty,
            ..Self::new(mt::EXEC, id)
        }
    }

    /// Attach a session to the main process
    pub fn attach(id: &str) -> Self {
        Self::new(mt::ATTACH, id)
    }

    /// Stdin bytes for a session
    pub fn stdin(id: &str, data: &[u8]) -> Self {
        Self {
            data: BASE64.encode(data),
            ..Self::new(mt::STDIN, id)
        }
    }

    pub fn close_stdin(id: &str) -> Self {
        Self::new(mt::CLOSE_STDIN, id)
    }

    /// Output bytes on `stdout` or `stderr`
    pub fn output(msg_type: &str, id: &str, data: &[u8]) -> Self {
        Self {
            data: BASE64.encode(data),
            ..Self::new(msg_type, id)
        }
    }

    pub fn exit(id: &str, code: i64) -> Self {
        Self {
            code: Some(code),
            ..Self::new(mt::EXIT, id)
        }
    }

    pub fn error(id: &str, message: &str) -> Self {
        Self {
            message: message.to_string(),
            ..Self::new(mt::ERROR, id)
        }
    }
}

/// A live agent connection multiplexing sessions by ID.
///
/// The connection is transport-agnostic: outgoing frames are queued on a
/// channel drained by the socket writer, incoming text frames are handed to
/// [`AgentConn::dispatch`].
pub struct AgentConn {
    outbound: mpsc::UnboundedSender<Message>,
    sessions: Mutex<HashMap<String, mpsc::Sender<Message>>>,
    done: CancellationToken,
}

impl AgentConn {
    /// Create a connection and the queue of frames to send to the agent
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Self {
            outbound: tx,
            sessions: Mutex::new(HashMap::new()),
            done: CancellationToken::new(),
        });
        (conn, rx)
    }

    /// Dial a forward-mode agent at `ws://<addr>/ws`
    pub async fn dial(addr: &str, token: &str) -> Result<Arc<Self>> {
        let mut request = format!("ws://{}/ws", addr)
            .into_client_request()
            .map_err(|e| SockerlessError::Agent(format!("invalid agent address {}: {}", addr, e)))?;
        if !token.is_empty() {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| SockerlessError::Agent(format!("invalid agent token: {}", e)))?;
            request.headers_mut().insert("Authorization", value);
        }

        let (ws, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| SockerlessError::Agent(format!("dial agent {}: {}", addr, e)))?;
        let (mut sink, mut stream) = ws.split();
        let (conn, mut outbound) = Self::channel();

        let done = conn.done.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = outbound.recv() => {
                        let Some(msg) = msg else { break };
                        let Ok(text) = serde_json::to_string(&msg) else { continue };
                        if sink.send(WsMessage::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    _ = done.cancelled() => break,
                }
            }
            let _ = sink.close().await;
        });

        let reader = conn.clone();
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => reader.dispatch(&text),
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            reader.close();
        });

        Ok(conn)
    }

    /// Route one incoming text frame to its session
    pub fn dispatch(&self, text: &str) {
        let msg: Message = match serde_json::from_str(text) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("Ignoring malformed agent frame: {}", e);
                return;
            }
        };
        if msg.id.is_empty() {
            return;
        }
        let sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = sessions.get(&msg.id) {
            // full session queues drop frames
            let _ = tx.try_send(msg);
        }
    }

    /// Queue a frame for the agent
    pub fn send(&self, msg: Message) -> Result<()> {
        if self.done.is_cancelled() {
            return Err(SockerlessError::Agent("agent connection closed".to_string()));
        }
        self.outbound
            .send(msg)
            .map_err(|_| SockerlessError::Agent("agent connection closed".to_string()))
    }

    fn open_session(&self, id: &str) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(SESSION_CAPACITY);
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string(), tx);
        rx
    }

    fn close_session(&self, id: &str) {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    /// Run a command on the agent, bridging `conn` until it exits
    pub async fn bridge_exec(
        self: &Arc<Self>,
        conn: BoxedConn,
        session_id: &str,
        cmd: &[String],
        env: &[String],
        workdir: &str,
        tty: bool,
    ) -> i64 {
        let rx = self.open_session(session_id);
        if let Err(e) = self.send(Message::exec(session_id, cmd, env, workdir, tty)) {
            warn!("Agent exec {} not sent: {}", session_id, e);
        }
        let code = self.bridge(conn, session_id, rx, tty).await;
        self.close_session(session_id);
        code
    }

    /// Attach `conn` to the agent's main process
    pub async fn bridge_attach(self: &Arc<Self>, conn: BoxedConn, session_id: &str, tty: bool) -> i64 {
        let rx = self.open_session(session_id);
        if let Err(e) = self.send(Message::attach(session_id)) {
            warn!("Agent attach {} not sent: {}", session_id, e);
        }
        let code = self.bridge(conn, session_id, rx, tty).await;
        self.close_session(session_id);
        code
    }

    async fn bridge(
        self: &Arc<Self>,
        conn: BoxedConn,
        session_id: &str,
        mut rx: mpsc::Receiver<Message>,
        tty: bool,
    ) -> i64 {
        let (mut read_half, write_half) = tokio::io::split(conn);
        let (stdout, stderr) = StreamWriter::pair(Box::new(write_half), tty);

        let agent = self.clone();
        let id = session_id.to_string();
        let stdin_pump = tokio::spawn(async move {
            let mut buf = vec![0u8; STDIN_CHUNK];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if agent.send(Message::stdin(&id, &buf[..n])).is_err() {
                            break;
                        }
                    }
                }
            }
            let _ = agent.send(Message::close_stdin(&id));
        });

        let code = loop {
            let msg = tokio::select! {
                msg = rx.recv() => msg,
                _ = self.done.cancelled() => None,
            };
            let Some(msg) = msg else { break -1 };
            match msg.msg_type.as_str() {
                mt::STDOUT | mt::STDERR => {
                    let Ok(data) = BASE64.decode(msg.data.as_bytes()) else { continue };
                    let writer = if msg.msg_type == mt::STDERR { &stderr } else { &stdout };
                    if writer.write(&data).await.is_err() {
                        break -1;
                    }
                }
                mt::EXIT => break msg.code.unwrap_or(0),
                mt::ERROR => {
                    warn!("Agent session {} failed: {}", session_id, msg.message);
                    break -1;
                }
                _ => {}
            }
        };

        stdin_pump.abort();
        let _ = stdout.shutdown().await;
        code
    }

    /// Close the connection and end every session
    pub fn close(&self) {
        self.done.cancel();
    }

    /// Cancelled when the connection is lost or closed
    pub fn done(&self) -> CancellationToken {
        self.done.clone()
    }
}
