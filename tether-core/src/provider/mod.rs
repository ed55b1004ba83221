//! The inference-provider capability the relay consumes.
//!
//! The relay never talks to an engine directly; it depends on this narrow
//! capability (`generate`, `abort`, `health`) behind an `Arc<dyn …>` so a
//! concrete adapter (or a scripted test double) can be swapped in freely.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::protocol::ErrorCode;

#[cfg(test)]
pub(crate) mod mock;

/// One event on a generation stream.
#[derive(Debug, Clone)]
pub enum GenerationEvent {
    /// A piece of generated text, in order. May be empty if the engine
    /// emits empty deltas.
    Chunk(String),
    /// Generation completed normally. Final event.
    Done,
    /// Generation terminated abnormally. Final event, mutually exclusive
    /// with [`GenerationEvent::Done`].
    Error { code: ErrorCode, message: String },
}

/// Receiver side of a generation.
///
/// Yields ordered [`GenerationEvent`]s; the channel closing without a final
/// `Done`/`Error` means the generation was torn down by an abort.
pub type GenerationStream = mpsc::Receiver<GenerationEvent>;

/// A provider-layer failure, already mapped to a wire-visible code.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ProviderError {
    pub code: ErrorCode,
    pub message: String,
}

impl ProviderError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Abstract streaming text-generation engine.
///
/// Object-safe on purpose (`Arc<dyn InferenceProvider>`). Implementations
/// own their in-flight request table and their chunk-idle watchdog: a
/// generation that goes silent for the provider's idle window must cancel
/// itself and report `TIMEOUT_NO_RESPONSE`.
#[async_trait]
pub trait InferenceProvider: Send + Sync {
    /// Cheap probe confirming the engine is contactable.
    async fn health(&self) -> Result<(), ProviderError>;

    /// Start a streaming generation.
    ///
    /// An `Err` means the generation never started (engine unreachable,
    /// model missing, request rejected). After an `Ok`, all outcomes arrive
    /// on the stream.
    async fn generate(
        &self,
        request_id: &str,
        model: &str,
        prompt: &str,
    ) -> Result<GenerationStream, ProviderError>;

    /// Cancel a previously started generation.
    ///
    /// Returns `true` iff a cancellation was dispatched. Abort and
    /// completion may race; once an abort is acknowledged, no further
    /// [`GenerationEvent::Chunk`] for that request is delivered.
    async fn abort(&self, request_id: &str) -> bool;
}
