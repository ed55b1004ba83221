//! One attached peer: socket, decoder, dispatch, generation pump.
//!
//! All outbound frames for a session funnel through a single writer task,
//! so provider chunks, error frames and terminals can never interleave
//! partially on the wire. The generation pump is the sole emitter of a
//! request's frames after admission; the inbound dispatcher only flags the
//! active request (abort) or tears the session down, which keeps the
//! chunk-before-terminal ordering trivially true.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::protocol::codec::{encode, FrameDecodeError, FrameDecoder};
use crate::protocol::{validate, ErrorCode, FinishReason, Message, RequestId};
use crate::provider::{GenerationEvent, GenerationStream};

use super::Relay;

/// The request this session has admitted, if any.
#[derive(Debug, Clone)]
struct ActiveRequest {
    id: RequestId,
    /// Set once the provider has acknowledged a client abort; the pump then
    /// finishes the request with `chat_end{abort}` instead of the stream's
    /// natural outcome.
    aborted: bool,
}

type ActiveSlot = Arc<Mutex<Option<ActiveRequest>>>;

fn lock_slot(slot: &ActiveSlot) -> MutexGuard<'_, Option<ActiveRequest>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

fn set_aborted(slot: &ActiveSlot, request_id: &str, aborted: bool) {
    if let Some(active) = lock_slot(slot).as_mut() {
        if active.id == request_id {
            active.aborted = aborted;
        }
    }
}

/// Take the slot if it still belongs to `request_id`.
///
/// Whoever takes it owns the request's finalization; every other path
/// backs off. This is the single decision point that keeps terminal
/// frames unique.
fn take_if_owner(slot: &ActiveSlot, request_id: &str) -> Option<ActiveRequest> {
    let mut guard = lock_slot(slot);
    let owns = guard.as_ref().map(|a| a.id == request_id).unwrap_or(false);
    if owns {
        guard.take()
    } else {
        None
    }
}

/// Serve one peer socket until it closes or the relay shuts down.
pub(crate) async fn run<S>(relay: Relay, session_id: u64, stream: S)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut shutdown = relay.shutdown_rx();
    let (mut reader, mut writer) = tokio::io::split(stream);

    // `server_info` precedes every other outbound frame. A peer that cannot
    // take the write within the flush window is unreachable; destroy the
    // socket rather than serving a half-greeted session.
    let info = relay.server_info();
    match tokio::time::timeout(relay.info_flush_timeout(), write_frame(&mut writer, &info)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!(session_id, error = %e, "server_info write failed; destroying socket");
            relay.deregister(session_id);
            return;
        }
        Err(_) => {
            warn!(session_id, "server_info flush timed out; destroying socket");
            relay.deregister(session_id);
            return;
        }
    }

    let (frame_tx, frame_rx) = mpsc::channel::<Message>(relay.write_queue_capacity());
    let writer_task = spawn_writer(session_id, writer, frame_rx);

    let session = PeerSession {
        relay: relay.clone(),
        session_id,
        frame_tx,
        active: Arc::new(Mutex::new(None)),
    };

    let mut decoder = FrameDecoder::new();
    let mut chunk = vec![0u8; 4096];
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if !*shutdown.borrow() {
                    continue;
                }
                debug!(session_id, "session closing on shutdown");
                break;
            }
            read = reader.read(&mut chunk) => match read {
                Ok(0) => break,
                Err(e) => {
                    debug!(session_id, error = %e, "socket read error");
                    break;
                }
                Ok(n) => {
                    let values = match decoder.write(&chunk[..n]) {
                        Ok(values) => values,
                        Err(FrameDecodeError::BufferOverflow) => {
                            warn!(session_id, "inbound reassembly buffer overflowed; discarded");
                            continue;
                        }
                    };
                    for value in values {
                        match validate(value) {
                            Ok(message) => session.dispatch(message).await,
                            Err(violation) => {
                                debug!(session_id, reason = %violation.reason, "malformed frame");
                                session.send(violation.into_frame()).await;
                            }
                        }
                    }
                }
            }
        }
    }

    session.teardown().await;
    writer_task.abort();
    relay.deregister(session_id);
    debug!(session_id, "peer session closed");
}

struct PeerSession {
    relay: Relay,
    session_id: u64,
    frame_tx: mpsc::Sender<Message>,
    active: ActiveSlot,
}

impl PeerSession {
    /// Enqueue an outbound frame. A closed queue means the socket is gone;
    /// teardown owns the cleanup in that case.
    async fn send(&self, frame: Message) {
        let _ = self.frame_tx.send(frame).await;
    }

    async fn dispatch(&self, message: Message) {
        match message {
            Message::ChatStart { request_id, payload } => {
                self.handle_chat_start(request_id, payload.prompt).await;
            }
            Message::Abort { request_id, .. } => self.handle_abort(request_id).await,
            other => {
                // A host only consumes client-direction frames.
                debug!(session_id = self.session_id, frame = ?other.request_id(), "ignoring non-client frame");
            }
        }
    }

    async fn handle_chat_start(&self, request_id: RequestId, prompt: String) {
        if !self.relay.gate().acquire(&request_id) {
            debug!(
                session_id = self.session_id,
                request_id = %request_id,
                "rejecting chat_start: gate is held"
            );
            self.send(Message::error(
                ErrorCode::ModelBusy,
                "another generation is in progress",
                Some(request_id),
            ))
            .await;
            return;
        }

        *lock_slot(&self.active) = Some(ActiveRequest {
            id: request_id.clone(),
            aborted: false,
        });
        self.relay.publish_status();

        let model = self.relay.model();
        info!(
            session_id = self.session_id,
            request_id = %request_id,
            model = %model,
            prompt_len = prompt.len(),
            "generation admitted"
        );

        match self
            .relay
            .provider()
            .generate(&request_id, &model, &prompt)
            .await
        {
            Ok(stream) => {
                self.relay.mark_provider_reachable(true);
                let pump = tokio::spawn(pump_generation(
                    self.relay.clone(),
                    self.frame_tx.clone(),
                    Arc::clone(&self.active),
                    request_id.clone(),
                    stream,
                ));
                observe_generation(
                    self.relay.clone(),
                    self.frame_tx.clone(),
                    Arc::clone(&self.active),
                    request_id,
                    pump,
                );
            }
            Err(e) => {
                warn!(
                    session_id = self.session_id,
                    request_id = %request_id,
                    code = ?e.code,
                    "generation failed to start: {e}"
                );
                let code = e.code.clone();
                take_if_owner(&self.active, &request_id);
                self.send(Message::error(
                    code.clone(),
                    e.message,
                    Some(request_id.clone()),
                ))
                .await;
                self.relay.gate().release(&request_id);
                self.relay.publish_status();
                if code == ErrorCode::OllamaNotFound {
                    self.relay.mark_provider_reachable(false);
                }
            }
        }
    }

    async fn handle_abort(&self, request_id: RequestId) {
        let is_active = lock_slot(&self.active)
            .as_ref()
            .map(|active| active.id == request_id)
            .unwrap_or(false);
        if !is_active {
            // Stale: the request already terminated (or was never ours).
            debug!(
                session_id = self.session_id,
                request_id = %request_id,
                "ignoring abort for inactive request"
            );
            return;
        }

        // Flag first: the provider may tear the stream down before `abort`
        // even returns, and the pump must already see the flag by then.
        set_aborted(&self.active, &request_id, true);
        if self.relay.provider().abort(&request_id).await {
            info!(
                session_id = self.session_id,
                request_id = %request_id,
                "abort dispatched to provider"
            );
        } else {
            set_aborted(&self.active, &request_id, false);
            debug!(
                session_id = self.session_id,
                request_id = %request_id,
                "abort raced completion; natural terminal stands"
            );
        }
    }

    /// Socket is gone: no frames can be written, but any active generation
    /// must be cancelled and the gate returned.
    async fn teardown(&self) {
        let active = lock_slot(&self.active).take();
        if let Some(request) = active {
            let _ = self.relay.provider().abort(&request.id).await;
            self.relay.gate().release(&request.id);
            self.relay.publish_status();
            info!(
                session_id = self.session_id,
                request_id = %request.id,
                "active generation torn down with its session"
            );
        }
    }
}

// ── Outbound path ─────────────────────────────────────────────────────────────

async fn write_frame<W>(writer: &mut W, message: &Message) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes =
        encode(message).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    writer.write_all(&bytes).await
}

fn spawn_writer<W>(
    session_id: u64,
    mut writer: W,
    mut frame_rx: mpsc::Receiver<Message>,
) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            match encode(&frame) {
                Ok(bytes) => {
                    if let Err(e) = writer.write_all(&bytes).await {
                        debug!(session_id, error = %e, "outbound write failed");
                        break;
                    }
                }
                Err(e) => warn!(session_id, error = %e, "failed to encode outbound frame"),
            }
        }
    })
}

// ── Generation pump ───────────────────────────────────────────────────────────

enum StreamOutcome {
    Completed,
    Failed { code: ErrorCode, message: String },
    /// The stream closed without a final event: the provider tore the
    /// generation down from its own side.
    Severed,
}

/// Forward provider events to the peer and finalize the request.
///
/// The gate is released strictly after the terminal frame has been enqueued
/// on the session's outbound channel.
async fn pump_generation(
    relay: Relay,
    frame_tx: mpsc::Sender<Message>,
    active: ActiveSlot,
    request_id: RequestId,
    mut stream: GenerationStream,
) {
    let mut outcome = StreamOutcome::Severed;
    while let Some(event) = stream.recv().await {
        match event {
            GenerationEvent::Chunk(text) => {
                if frame_tx
                    .send(Message::chat_chunk(request_id.as_str(), text))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            GenerationEvent::Done => {
                outcome = StreamOutcome::Completed;
                break;
            }
            GenerationEvent::Error { code, message } => {
                outcome = StreamOutcome::Failed { code, message };
                break;
            }
        }
    }

    let Some(request) = take_if_owner(&active, &request_id) else {
        // Session teardown already finalized the request.
        return;
    };

    let terminal = if request.aborted {
        Message::chat_end(request_id.as_str(), FinishReason::Abort)
    } else {
        match outcome {
            StreamOutcome::Completed => Message::chat_end(request_id.as_str(), FinishReason::Stop),
            StreamOutcome::Failed { code, message } => {
                Message::error(code, message, Some(request_id.clone()))
            }
            StreamOutcome::Severed => Message::error(
                ErrorCode::GenerationAborted,
                "generation ended before completing",
                Some(request_id.clone()),
            ),
        }
    };

    let escalate = matches!(
        &terminal,
        Message::Error { payload, .. } if payload.code == ErrorCode::OllamaNotFound
    );

    info!(request_id = %request_id, "generation finished");
    frame_tx.send(terminal).await.unwrap_or_else(|_| {
        debug!(request_id = %request_id, "terminal frame undeliverable: socket closed");
    });
    relay.gate().release(&request_id);
    relay.publish_status();
    if escalate {
        relay.mark_provider_reachable(false);
    }
}

/// Watch the pump's join handle so a failed task cannot strand the gate.
fn observe_generation(
    relay: Relay,
    frame_tx: mpsc::Sender<Message>,
    active: ActiveSlot,
    request_id: RequestId,
    pump: JoinHandle<()>,
) {
    tokio::spawn(async move {
        if let Err(e) = pump.await {
            warn!(request_id = %request_id, error = %e, "generation task failed");
            if take_if_owner(&active, &request_id).is_some() {
                let _ = frame_tx
                    .send(Message::error(
                        ErrorCode::GenerationFailed,
                        "generation task failed unexpectedly",
                        Some(request_id.clone()),
                    ))
                    .await;
                relay.gate().release(&request_id);
                relay.publish_status();
            }
        }
    });
}
