//! Client-side protocol driver.
//!
//! Mirrors the host's peer session from the other end of the wire: it
//! submits prompts, collects chunks, enforces the inbound silence window,
//! and surfaces terminal events. At most one request is active at a time;
//! the driver rejects a second submission locally rather than letting the
//! host answer `MODEL_BUSY` for its own peer.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::protocol::codec::{encode, FrameDecodeError, FrameDecoder};
use crate::protocol::{
    new_request_id, validate, ErrorCode, FinishReason, Message, RequestId, ServerInfoPayload,
    MAX_PROMPT_BYTES,
};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long the host may go silent mid-request before the driver gives
    /// up on it. Reset on every chunk for the active request.
    pub chunk_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            chunk_timeout: Duration::from_secs(30),
        }
    }
}

/// How an active request ended, from the driver's point of view.
#[derive(Debug, Clone, PartialEq)]
pub enum TerminalOutcome {
    Finished(FinishReason),
    Failed { code: ErrorCode, message: String },
}

/// Events surfaced to the embedding UI.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Host identity, first frame after attach.
    ServerInfo(ServerInfoPayload),
    /// A piece of generated text for the active request, in order.
    Chunk { request_id: RequestId, text: String },
    /// A request ended. Terminals for requests the driver already gave up
    /// on (abort, timeout) are delivered too and are benign.
    Terminal {
        request_id: RequestId,
        outcome: TerminalOutcome,
    },
    /// A session-scoped error frame (no request id), e.g. a refusal from a
    /// full host.
    ServerError { code: ErrorCode, message: String },
    /// The socket closed. The driver never reconnects by itself.
    Disconnected,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("prompt is empty")]
    EmptyPrompt,
    #[error("prompt is {bytes} bytes; maximum is {MAX_PROMPT_BYTES} bytes")]
    PromptTooLarge { bytes: usize },
    #[error("request {0} is still active")]
    RequestActive(RequestId),
    #[error("no active request")]
    NoActiveRequest,
    #[error("driver is disconnected")]
    Disconnected,
}

enum Command {
    ChatStart { request_id: RequestId, prompt: String },
    Abort { request_id: RequestId },
}

/// Handle to a running driver task.
#[derive(Clone)]
pub struct Client {
    cmd_tx: mpsc::Sender<Command>,
    active: Arc<Mutex<Option<RequestId>>>,
}

impl Client {
    /// Wrap a connected peer socket. The driver starts consuming frames
    /// immediately; events arrive on the returned receiver.
    pub fn attach<S>(stream: S, config: ClientConfig) -> (Self, mpsc::Receiver<ClientEvent>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let (event_tx, event_rx) = mpsc::channel(64);
        let active = Arc::new(Mutex::new(None));
        tokio::spawn(run(stream, config, Arc::clone(&active), cmd_rx, event_tx));
        (Self { cmd_tx, active }, event_rx)
    }

    /// Submit a prompt.
    ///
    /// Rejected locally when empty after trimming, over the prompt byte
    /// limit, or while another request is active. On success the returned
    /// id is active until a terminal event (or local abort/timeout).
    pub async fn send_chat_start(&self, prompt: &str) -> Result<RequestId, ClientError> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(ClientError::EmptyPrompt);
        }
        if prompt.len() > MAX_PROMPT_BYTES {
            return Err(ClientError::PromptTooLarge {
                bytes: prompt.len(),
            });
        }

        let request_id = {
            let mut active = lock(&self.active);
            if let Some(current) = active.as_ref() {
                return Err(ClientError::RequestActive(current.clone()));
            }
            let id = new_request_id();
            *active = Some(id.clone());
            id
        };

        self.cmd_tx
            .send(Command::ChatStart {
                request_id: request_id.clone(),
                prompt: prompt.to_owned(),
            })
            .await
            .map_err(|_| {
                lock(&self.active).take();
                ClientError::Disconnected
            })?;
        Ok(request_id)
    }

    /// Abort the active request.
    ///
    /// Local state clears immediately; the driver does not wait for the
    /// host's confirmation. The host's later terminal for this id is
    /// delivered as a benign [`ClientEvent::Terminal`].
    pub async fn send_abort(&self) -> Result<RequestId, ClientError> {
        let request_id = lock(&self.active)
            .take()
            .ok_or(ClientError::NoActiveRequest)?;
        self.cmd_tx
            .send(Command::Abort {
                request_id: request_id.clone(),
            })
            .await
            .map_err(|_| ClientError::Disconnected)?;
        Ok(request_id)
    }

    pub fn active_request(&self) -> Option<RequestId> {
        lock(&self.active).clone()
    }
}

fn lock(active: &Arc<Mutex<Option<RequestId>>>) -> MutexGuard<'_, Option<RequestId>> {
    active.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn write_frame<W>(writer: &mut W, message: &Message) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes =
        encode(message).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    writer.write_all(&bytes).await
}

async fn run<S>(
    stream: S,
    config: ClientConfig,
    active: Arc<Mutex<Option<RequestId>>>,
    mut cmd_rx: mpsc::Receiver<Command>,
    event_tx: mpsc::Sender<ClientEvent>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut decoder = FrameDecoder::new();
    let mut chunk = vec![0u8; 4096];
    // Armed while a request is active; reset on every chunk for it.
    let mut deadline: Option<Instant> = None;

    loop {
        let silence = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = silence => {
                deadline = None;
                let taken = lock(&active).take();
                if let Some(request_id) = taken {
                    warn!(request_id = %request_id, "host went silent mid-request");
                    // The transport stays up; reconnecting is the user's call.
                    let timed_out = ClientEvent::Terminal {
                        request_id,
                        outcome: TerminalOutcome::Failed {
                            code: ErrorCode::TimeoutNoResponse,
                            message: "host stopped responding".to_owned(),
                        },
                    };
                    if event_tx.send(timed_out).await.is_err() {
                        return;
                    }
                }
            }

            cmd = cmd_rx.recv() => match cmd {
                None => return,
                Some(Command::ChatStart { request_id, prompt }) => {
                    let frame = Message::chat_start(request_id, prompt);
                    if write_frame(&mut writer, &frame).await.is_err() {
                        lock(&active).take();
                        let _ = event_tx.send(ClientEvent::Disconnected).await;
                        return;
                    }
                    deadline = Some(Instant::now() + config.chunk_timeout);
                }
                Some(Command::Abort { request_id }) => {
                    deadline = None;
                    let frame = Message::abort(request_id);
                    if write_frame(&mut writer, &frame).await.is_err() {
                        let _ = event_tx.send(ClientEvent::Disconnected).await;
                        return;
                    }
                }
            },

            read = reader.read(&mut chunk) => match read {
                Ok(0) | Err(_) => {
                    // A close mid-generation is terminal for the request too.
                    let taken = lock(&active).take();
                    if let Some(request_id) = taken {
                        let severed = ClientEvent::Terminal {
                            request_id,
                            outcome: TerminalOutcome::Failed {
                                code: ErrorCode::HostDisconnected,
                                message: "connection to host closed".to_owned(),
                            },
                        };
                        if event_tx.send(severed).await.is_err() {
                            return;
                        }
                    }
                    let _ = event_tx.send(ClientEvent::Disconnected).await;
                    return;
                }
                Ok(n) => {
                    let values = match decoder.write(&chunk[..n]) {
                        Ok(values) => values,
                        Err(FrameDecodeError::BufferOverflow) => {
                            warn!("inbound reassembly buffer overflowed; discarded");
                            continue;
                        }
                    };
                    for value in values {
                        match validate(value) {
                            Ok(message) => {
                                if handle_inbound(message, &active, &mut deadline, &config, &event_tx)
                                    .await
                                    .is_err()
                                {
                                    return;
                                }
                            }
                            Err(violation) => {
                                debug!(reason = %violation.reason, "malformed frame from host");
                                let _ = write_frame(&mut writer, &violation.into_frame()).await;
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Returns `Err(())` when the event consumer is gone and the driver should
/// stop.
async fn handle_inbound(
    message: Message,
    active: &Arc<Mutex<Option<RequestId>>>,
    deadline: &mut Option<Instant>,
    config: &ClientConfig,
    event_tx: &mpsc::Sender<ClientEvent>,
) -> Result<(), ()> {
    let event = match message {
        Message::ServerInfo { payload, .. } => ClientEvent::ServerInfo(payload),

        Message::ChatChunk { request_id, payload } => {
            let is_active = lock(active).as_deref() == Some(request_id.as_str());
            if !is_active {
                debug!(request_id = %request_id, "dropping chunk for inactive request");
                return Ok(());
            }
            *deadline = Some(Instant::now() + config.chunk_timeout);
            ClientEvent::Chunk {
                request_id,
                text: payload.text,
            }
        }

        Message::ChatEnd { request_id, payload } => {
            clear_if_active(active, deadline, &request_id);
            ClientEvent::Terminal {
                request_id,
                outcome: TerminalOutcome::Finished(payload.finish_reason),
            }
        }

        Message::Error {
            request_id: Some(request_id),
            payload,
        } => {
            clear_if_active(active, deadline, &request_id);
            ClientEvent::Terminal {
                request_id,
                outcome: TerminalOutcome::Failed {
                    code: payload.code,
                    message: payload.message,
                },
            }
        }

        Message::Error {
            request_id: None,
            payload,
        } => ClientEvent::ServerError {
            code: payload.code,
            message: payload.message,
        },

        // A client only consumes host-direction frames.
        Message::ChatStart { request_id, .. } | Message::Abort { request_id, .. } => {
            debug!(request_id = %request_id, "ignoring non-host frame");
            return Ok(());
        }
    };

    event_tx.send(event).await.map_err(|_| ())
}

fn clear_if_active(
    active: &Arc<Mutex<Option<RequestId>>>,
    deadline: &mut Option<Instant>,
    request_id: &str,
) {
    let mut guard = lock(active);
    if guard.as_deref() == Some(request_id) {
        guard.take();
        *deadline = None;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
