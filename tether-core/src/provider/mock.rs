//! Scripted provider for relay and driver tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use super::{GenerationEvent, GenerationStream, InferenceProvider, ProviderError};
use crate::protocol::{ErrorCode, RequestId};

/// One step of a scripted generation.
#[derive(Debug, Clone)]
pub enum MockStep {
    Chunk(&'static str),
    Pause(Duration),
    /// Park until `abort` is called for this request, then close the stream
    /// without a final event.
    HoldUntilAbort,
    Done,
    Fail(ErrorCode, &'static str),
}

#[derive(Default)]
struct MockState {
    scripts: VecDeque<Vec<MockStep>>,
    inflight: HashMap<RequestId, watch::Sender<bool>>,
    aborted: Vec<RequestId>,
}

/// An [`InferenceProvider`] that replays pre-loaded scripts, one per
/// `generate` call, and records every abort it receives.
pub struct MockProvider {
    state: Mutex<MockState>,
    generate_calls: AtomicUsize,
    /// `Some(err)` makes every `generate` fail before producing a stream.
    refuse_with: Option<ProviderError>,
}

impl MockProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState::default()),
            generate_calls: AtomicUsize::new(0),
            refuse_with: None,
        })
    }

    /// A provider whose `generate` always fails with `err`.
    pub fn unreachable_with(err: ProviderError) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState::default()),
            generate_calls: AtomicUsize::new(0),
            refuse_with: Some(err),
        })
    }

    /// Queue the script for the next `generate` call.
    pub fn script(&self, steps: Vec<MockStep>) {
        self.lock().scripts.push_back(steps);
    }

    pub fn generate_calls(&self) -> usize {
        self.generate_calls.load(Ordering::SeqCst)
    }

    /// Request ids for which `abort` found an in-flight generation.
    pub fn aborted(&self) -> Vec<RequestId> {
        self.lock().aborted.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl InferenceProvider for MockProvider {
    async fn health(&self) -> Result<(), ProviderError> {
        match &self.refuse_with {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    async fn generate(
        &self,
        request_id: &str,
        _model: &str,
        _prompt: &str,
    ) -> Result<GenerationStream, ProviderError> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = &self.refuse_with {
            return Err(err.clone());
        }

        let steps = self
            .lock()
            .scripts
            .pop_front()
            .unwrap_or_else(|| vec![MockStep::Done]);
        let (event_tx, event_rx) = mpsc::channel(8);
        let (abort_tx, mut abort_rx) = watch::channel(false);
        self.lock().inflight.insert(request_id.to_owned(), abort_tx);

        tokio::spawn(async move {
            for step in steps {
                match step {
                    MockStep::Chunk(text) => {
                        if event_tx
                            .send(GenerationEvent::Chunk(text.to_owned()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    MockStep::Pause(duration) => tokio::time::sleep(duration).await,
                    MockStep::HoldUntilAbort => {
                        let _ = abort_rx.wait_for(|aborted| *aborted).await;
                        break;
                    }
                    MockStep::Done => {
                        let _ = event_tx.send(GenerationEvent::Done).await;
                        break;
                    }
                    MockStep::Fail(code, message) => {
                        let _ = event_tx
                            .send(GenerationEvent::Error {
                                code,
                                message: message.to_owned(),
                            })
                            .await;
                        break;
                    }
                }
            }
        });

        Ok(event_rx)
    }

    async fn abort(&self, request_id: &str) -> bool {
        let mut state = self.lock();
        match state.inflight.remove(request_id) {
            Some(abort_tx) => {
                state.aborted.push(request_id.to_owned());
                let _ = abort_tx.send(true);
                true
            }
            None => false,
        }
    }
}
