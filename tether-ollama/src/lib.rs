//! Ollama adapter for the tether inference-provider capability.
//!
//! Streams newline-delimited JSON deltas from `POST /api/generate` and maps
//! transport and HTTP failures onto the wire-visible provider codes. The
//! adapter owns its in-flight request table and the chunk-idle watchdog: a
//! generation whose HTTP body goes silent for the idle window is cancelled
//! from this side and reported as `TIMEOUT_NO_RESPONSE`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use tether_core::protocol::codec::FrameDecoder;
use tether_core::provider::{GenerationEvent, GenerationStream, InferenceProvider, ProviderError};
use tether_core::ErrorCode;

#[derive(Debug, Clone)]
pub struct OllamaConfig {
    /// Base URL of the Ollama HTTP API.
    pub base_url: String,
    /// How long the response body may go silent before the generation is
    /// cancelled. The timer resets on every byte read, not only on
    /// delivered deltas.
    pub chunk_idle_timeout: Duration,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:11434".to_owned(),
            chunk_idle_timeout: Duration::from_secs(30),
        }
    }
}

type InflightTable = Arc<Mutex<HashMap<String, watch::Sender<bool>>>>;

/// [`InferenceProvider`] backed by a local Ollama instance.
pub struct OllamaProvider {
    client: reqwest::Client,
    config: OllamaConfig,
    inflight: InflightTable,
}

impl OllamaProvider {
    pub fn new(config: OllamaConfig) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("tether/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self {
            client,
            config,
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url.trim_end_matches('/'))
    }

    fn map_request_error(&self, e: reqwest::Error) -> ProviderError {
        if e.is_connect() {
            ProviderError::new(
                ErrorCode::OllamaNotFound,
                format!("Ollama is not reachable at {}", self.config.base_url),
            )
        } else if e.is_timeout() {
            ProviderError::new(ErrorCode::TimeoutNoResponse, e.to_string())
        } else {
            ProviderError::new(ErrorCode::GenerationFailed, e.to_string())
        }
    }
}

// ── Wire types of the Ollama API ──────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateDelta {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

#[async_trait]
impl InferenceProvider for OllamaProvider {
    async fn health(&self) -> Result<(), ProviderError> {
        let response = self
            .client
            .get(self.endpoint("/api/version"))
            .send()
            .await
            .map_err(|e| {
                ProviderError::new(
                    ErrorCode::OllamaNotFound,
                    format!("Ollama is not reachable at {}: {e}", self.config.base_url),
                )
            })?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(ProviderError::new(
                ErrorCode::OllamaNotFound,
                format!("health probe returned {}", response.status()),
            ))
        }
    }

    async fn generate(
        &self,
        request_id: &str,
        model: &str,
        prompt: &str,
    ) -> Result<GenerationStream, ProviderError> {
        let response = self
            .client
            .post(self.endpoint("/api/generate"))
            .json(&GenerateRequest {
                model,
                prompt,
                stream: true,
            })
            .send()
            .await
            .map_err(|e| self.map_request_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorBody>(&body)
                .map(|b| b.error)
                .unwrap_or(body);
            return Err(if status == reqwest::StatusCode::NOT_FOUND {
                ProviderError::new(
                    ErrorCode::OllamaModelNotAvailable,
                    if message.is_empty() {
                        format!("model '{model}' is not available")
                    } else {
                        message
                    },
                )
            } else {
                ProviderError::new(
                    ErrorCode::GenerationFailed,
                    format!("engine returned {status}: {message}"),
                )
            });
        }

        let (event_tx, event_rx) = mpsc::channel(32);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        lock(&self.inflight).insert(request_id.to_owned(), cancel_tx);

        tokio::spawn(stream_generation(
            response,
            event_tx,
            cancel_rx,
            self.config.chunk_idle_timeout,
            request_id.to_owned(),
            Arc::clone(&self.inflight),
        ));
        Ok(event_rx)
    }

    async fn abort(&self, request_id: &str) -> bool {
        match lock(&self.inflight).remove(request_id) {
            Some(cancel_tx) => cancel_tx.send(true).is_ok(),
            None => false,
        }
    }
}

fn lock(inflight: &InflightTable) -> MutexGuard<'_, HashMap<String, watch::Sender<bool>>> {
    inflight.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Forward body deltas as generation events until done, error, cancel, or
/// the idle window expires.
///
/// On cancellation the response is simply dropped, which severs the HTTP
/// request; the event channel closes without a final event, which the relay
/// reads as a torn-down generation.
async fn stream_generation(
    response: reqwest::Response,
    event_tx: mpsc::Sender<GenerationEvent>,
    mut cancel_rx: watch::Receiver<bool>,
    idle: Duration,
    request_id: String,
    inflight: InflightTable,
) {
    let mut body = response.bytes_stream();
    // Ollama deltas are newline-delimited JSON, same framing as the wire.
    let mut decoder = FrameDecoder::new();

    'generation: loop {
        tokio::select! {
            _ = cancel_rx.changed() => {
                if !*cancel_rx.borrow() {
                    continue 'generation;
                }
                debug!(request_id = %request_id, "generation cancelled");
                break 'generation;
            }
            next = tokio::time::timeout(idle, body.next()) => match next {
                Err(_) => {
                    warn!(request_id = %request_id, "engine went silent; cancelling");
                    let _ = event_tx
                        .send(GenerationEvent::Error {
                            code: ErrorCode::TimeoutNoResponse,
                            message: format!("no engine output for {}s", idle.as_secs()),
                        })
                        .await;
                    break 'generation;
                }
                Ok(None) => {
                    let _ = event_tx
                        .send(GenerationEvent::Error {
                            code: ErrorCode::GenerationFailed,
                            message: "engine stream ended unexpectedly".to_owned(),
                        })
                        .await;
                    break 'generation;
                }
                Ok(Some(Err(e))) => {
                    let _ = event_tx
                        .send(GenerationEvent::Error {
                            code: ErrorCode::GenerationFailed,
                            message: e.to_string(),
                        })
                        .await;
                    break 'generation;
                }
                Ok(Some(Ok(bytes))) => {
                    let values = match decoder.write(&bytes) {
                        Ok(values) => values,
                        Err(e) => {
                            let _ = event_tx
                                .send(GenerationEvent::Error {
                                    code: ErrorCode::GenerationFailed,
                                    message: e.to_string(),
                                })
                                .await;
                            break 'generation;
                        }
                    };
                    for value in values {
                        let delta: GenerateDelta = match serde_json::from_value(value) {
                            Ok(delta) => delta,
                            Err(e) => {
                                let _ = event_tx
                                    .send(GenerationEvent::Error {
                                        code: ErrorCode::GenerationFailed,
                                        message: format!("malformed engine delta: {e}"),
                                    })
                                    .await;
                                break 'generation;
                            }
                        };
                        if let Some(message) = delta.error {
                            let _ = event_tx
                                .send(GenerationEvent::Error {
                                    code: ErrorCode::GenerationFailed,
                                    message,
                                })
                                .await;
                            break 'generation;
                        }
                        if !delta.response.is_empty()
                            && event_tx
                                .send(GenerationEvent::Chunk(delta.response))
                                .await
                                .is_err()
                        {
                            break 'generation;
                        }
                        if delta.done {
                            let _ = event_tx.send(GenerationEvent::Done).await;
                            break 'generation;
                        }
                    }
                }
            }
        }
    }

    lock(&inflight).remove(&request_id);
}

// ── Tests ─────────────────────────────────────────────────────────────────────
