//! Connection supervisor: peer cap and shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{info, warn};

use crate::protocol::codec::encode;
use crate::protocol::{ErrorCode, Message};

use super::Relay;

/// Accepts or refuses peer sockets on behalf of a [`Relay`].
///
/// The transport hands every incoming socket to [`Supervisor::offer`]; the
/// supervisor never dials out and does not own the transport itself.
pub struct Supervisor {
    relay: Relay,
    shutting_down: AtomicBool,
}

impl Supervisor {
    pub fn new(relay: Relay) -> Self {
        Self {
            relay,
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn relay(&self) -> &Relay {
        &self.relay
    }

    /// Wire an incoming socket into the relay, or refuse it.
    ///
    /// A socket beyond the peer cap receives a single
    /// `error(CONNECT_FAILED)` frame and is closed; it never counts against
    /// the cap and never reaches the relay.
    pub async fn offer<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        if self.shutting_down.load(Ordering::SeqCst)
            || self.relay.session_count() >= self.relay.max_clients()
        {
            refuse(stream).await;
            return;
        }
        self.relay.attach(stream);
    }

    /// Abort the active generation, close every attached session, clear the
    /// gate. Idempotent, and safe to call while another shutdown runs.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("relay shutting down");
        self.relay.abort_active().await;
        self.relay.close_all_sessions();
        self.relay.gate().force_release();
    }
}

async fn refuse<S>(mut stream: S)
where
    S: AsyncWrite + Unpin,
{
    warn!("refusing peer: max clients reached");
    let frame = Message::error(ErrorCode::ConnectFailed, "Max clients reached", None);
    if let Ok(bytes) = encode(&frame) {
        // Best-effort: a peer that cannot take the refusal quickly is
        // dropped without it.
        let _ = tokio::time::timeout(Duration::from_secs(1), stream.write_all(&bytes)).await;
    }
    let _ = stream.shutdown().await;
}
