//! Host-side streaming relay.
//!
//! The [`Relay`] owns the concurrency [`gate`], the provider handle, and the
//! registry of attached peer sessions. Each accepted socket becomes a
//! [`session`] task; the [`supervisor`] enforces the peer cap and drives
//! shutdown. Status transitions (gate acquire/release, peer count, provider
//! reachability) are published through a `watch` channel, so delivery to
//! observers is best-effort and naturally coalesced.

pub mod gate;
pub(crate) mod session;
pub mod supervisor;

#[cfg(test)]
mod tests;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::protocol::{Message, RequestId, ServerStatus};
use crate::provider::{InferenceProvider, ProviderError};
use gate::Gate;

/// Tuning knobs for the relay. The defaults match production behavior;
/// tests shorten the timers.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Name advertised to peers in `server_info`.
    pub host_name: String,
    /// Model advertised to peers and passed to the provider.
    pub model: String,
    /// Maximum number of attached peer sessions.
    pub max_clients: usize,
    /// How long the initial `server_info` write may take before the peer
    /// is treated as unreachable and its socket destroyed.
    pub info_flush_timeout: Duration,
    /// Outbound frame queue depth per session. A full queue blocks the
    /// producer (natural backpressure); frames are never dropped.
    pub write_queue_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host_name: "tether".to_owned(),
            model: "llama3".to_owned(),
            max_clients: 5,
            info_flush_timeout: Duration::from_secs(5),
            write_queue_capacity: 64,
        }
    }
}

/// Point-in-time view of the relay, published on every transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayStatus {
    pub busy: bool,
    pub active_request_id: Option<RequestId>,
    pub peers: usize,
    pub provider_reachable: bool,
}

struct RelayInner {
    config: RelayConfig,
    model: RwLock<String>,
    gate: Gate,
    provider: Arc<dyn InferenceProvider>,
    sessions: Mutex<HashSet<u64>>,
    next_session_id: AtomicU64,
    provider_reachable: AtomicBool,
    status_tx: watch::Sender<RelayStatus>,
    shutdown_tx: watch::Sender<bool>,
}

/// Cheaply cloneable handle to the host-side relay.
#[derive(Clone)]
pub struct Relay {
    inner: Arc<RelayInner>,
}

impl Relay {
    pub fn new(config: RelayConfig, provider: Arc<dyn InferenceProvider>) -> Self {
        let (status_tx, _) = watch::channel(RelayStatus {
            busy: false,
            active_request_id: None,
            peers: 0,
            provider_reachable: true,
        });
        let (shutdown_tx, _) = watch::channel(false);
        let model = RwLock::new(config.model.clone());
        Self {
            inner: Arc::new(RelayInner {
                config,
                model,
                gate: Gate::new(),
                provider,
                sessions: Mutex::new(HashSet::new()),
                next_session_id: AtomicU64::new(1),
                provider_reachable: AtomicBool::new(true),
                status_tx,
                shutdown_tx,
            }),
        }
    }

    /// Wrap an accepted peer socket in a session task.
    ///
    /// The session immediately advertises `server_info` and then serves the
    /// peer until the socket closes or the relay shuts down. The peer cap is
    /// the supervisor's concern, not this method's.
    pub fn attach<S>(&self, stream: S) -> u64
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let session_id = self.inner.next_session_id.fetch_add(1, Ordering::Relaxed);
        self.lock_sessions().insert(session_id);
        self.publish_status();
        info!(session_id, "peer attached");
        tokio::spawn(session::run(self.clone(), session_id, stream));
        session_id
    }

    pub fn session_count(&self) -> usize {
        self.lock_sessions().len()
    }

    pub fn is_busy(&self) -> bool {
        self.inner.gate.active().is_some()
    }

    pub fn active_request_id(&self) -> Option<RequestId> {
        self.inner.gate.active()
    }

    /// Currently advertised model name.
    pub fn model(&self) -> String {
        self.inner
            .model
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Swap the advertised model. In-flight generations keep the model they
    /// started with.
    pub fn set_model(&self, model: impl Into<String>) {
        let model = model.into();
        info!(model = %model, "model selected");
        *self
            .inner
            .model
            .write()
            .unwrap_or_else(PoisonError::into_inner) = model;
    }

    /// Ask the provider to cancel whatever generation holds the gate.
    ///
    /// The owning session observes the torn-down stream and emits the
    /// terminal frame; this method only dispatches the cancellation.
    pub async fn abort_active(&self) -> bool {
        match self.inner.gate.active() {
            Some(request_id) => self.inner.provider.abort(&request_id).await,
            None => false,
        }
    }

    /// Subscribe to status transitions. Observers that lag only see the
    /// most recent snapshot.
    pub fn subscribe(&self) -> watch::Receiver<RelayStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn current_status(&self) -> RelayStatus {
        RelayStatus {
            busy: self.is_busy(),
            active_request_id: self.active_request_id(),
            peers: self.session_count(),
            provider_reachable: self.inner.provider_reachable.load(Ordering::SeqCst),
        }
    }

    /// Run a health probe and record the outcome.
    pub async fn probe_provider(&self) -> Result<(), ProviderError> {
        let result = self.inner.provider.health().await;
        self.mark_provider_reachable(result.is_ok());
        result
    }

    // ── Session-facing internals ─────────────────────────────────────────────

    pub(crate) fn gate(&self) -> &Gate {
        &self.inner.gate
    }

    pub(crate) fn provider(&self) -> &Arc<dyn InferenceProvider> {
        &self.inner.provider
    }

    pub(crate) fn info_flush_timeout(&self) -> Duration {
        self.inner.config.info_flush_timeout
    }

    pub(crate) fn write_queue_capacity(&self) -> usize {
        self.inner.config.write_queue_capacity
    }

    pub(crate) fn max_clients(&self) -> usize {
        self.inner.config.max_clients
    }

    /// The `server_info` frame for a freshly attached peer, reflecting the
    /// gate at this instant. Not re-sent on later transitions.
    pub(crate) fn server_info(&self) -> Message {
        let status = if self.is_busy() {
            ServerStatus::Busy
        } else {
            ServerStatus::Ready
        };
        Message::server_info(self.inner.config.host_name.clone(), self.model(), status)
    }

    pub(crate) fn deregister(&self, session_id: u64) {
        self.lock_sessions().remove(&session_id);
        self.publish_status();
        debug!(session_id, "peer detached");
    }

    pub(crate) fn publish_status(&self) {
        self.inner.status_tx.send_replace(self.current_status());
    }

    pub(crate) fn mark_provider_reachable(&self, reachable: bool) {
        let was = self
            .inner
            .provider_reachable
            .swap(reachable, Ordering::SeqCst);
        if was != reachable {
            if reachable {
                info!("provider reachable again");
            } else {
                info!("provider unreachable");
            }
            self.publish_status();
        }
    }

    pub(crate) fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.inner.shutdown_tx.subscribe()
    }

    pub(crate) fn close_all_sessions(&self) {
        self.inner.shutdown_tx.send_replace(true);
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashSet<u64>> {
        self.inner
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
