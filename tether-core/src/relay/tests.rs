use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::time::timeout;

use crate::protocol::codec::{encode, FrameDecoder};
use crate::protocol::{
    validate, ErrorCode, FinishReason, Message, ServerInfoPayload, ServerStatus, MAX_PROMPT_BYTES,
};
use crate::provider::mock::{MockProvider, MockStep};
use crate::provider::ProviderError;
use crate::relay::supervisor::Supervisor;
use crate::relay::{Relay, RelayConfig};

const WAIT: Duration = Duration::from_secs(2);

fn test_relay(provider: Arc<MockProvider>) -> Relay {
    Relay::new(
        RelayConfig {
            host_name: "host".into(),
            model: "test-model".into(),
            info_flush_timeout: Duration::from_millis(500),
            ..RelayConfig::default()
        },
        provider,
    )
}

/// The far end of an attached duplex socket, speaking raw frames.
struct TestPeer {
    stream: DuplexStream,
    decoder: FrameDecoder,
    pending: VecDeque<serde_json::Value>,
}

impl TestPeer {
    fn attach(relay: &Relay) -> Self {
        let (near, far) = tokio::io::duplex(64 * 1024);
        relay.attach(near);
        Self::new(far)
    }

    async fn offer(supervisor: &Supervisor) -> Self {
        let (near, far) = tokio::io::duplex(64 * 1024);
        supervisor.offer(near).await;
        Self::new(far)
    }

    fn new(stream: DuplexStream) -> Self {
        Self {
            stream,
            decoder: FrameDecoder::new(),
            pending: VecDeque::new(),
        }
    }

    async fn send(&mut self, message: &Message) {
        self.stream
            .write_all(&encode(message).unwrap())
            .await
            .unwrap();
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    async fn recv(&mut self) -> Message {
        loop {
            if let Some(value) = self.pending.pop_front() {
                return validate(value).unwrap();
            }
            let mut chunk = vec![0u8; 4096];
            let n = timeout(WAIT, self.stream.read(&mut chunk))
                .await
                .expect("timed out waiting for a frame")
                .expect("socket read failed");
            assert!(n > 0, "socket closed while waiting for a frame");
            self.pending.extend(self.decoder.write(&chunk[..n]).unwrap());
        }
    }

    async fn expect_server_info(&mut self) -> ServerInfoPayload {
        match self.recv().await {
            Message::ServerInfo { payload, .. } => payload,
            other => panic!("expected server_info first, got {other:?}"),
        }
    }

    /// Assert that nothing arrives within `window`.
    async fn expect_silence(&mut self, window: Duration) {
        assert!(self.pending.is_empty(), "frames already pending");
        let mut chunk = vec![0u8; 4096];
        match timeout(window, self.stream.read(&mut chunk)).await {
            Err(_) => {}
            Ok(Ok(0)) => panic!("socket closed during expected silence"),
            Ok(Ok(n)) => panic!("unexpected bytes: {:?}", String::from_utf8_lossy(&chunk[..n])),
            Ok(Err(e)) => panic!("socket read failed: {e}"),
        }
    }

    /// Drain remaining frames until the host closes the socket.
    async fn expect_close(&mut self) {
        let mut chunk = vec![0u8; 4096];
        loop {
            match timeout(WAIT, self.stream.read(&mut chunk))
                .await
                .expect("timed out waiting for close")
            {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
        }
    }
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ── Attach / server_info ──────────────────────────────────────────────────────

#[tokio::test]
async fn server_info_is_the_first_frame() {
    let relay = test_relay(MockProvider::new());
    let mut peer = TestPeer::attach(&relay);

    let info = peer.expect_server_info().await;
    assert_eq!(info.host_name, "host");
    assert_eq!(info.model, "test-model");
    assert_eq!(info.status, ServerStatus::Ready);
}

#[tokio::test]
async fn server_info_reports_busy_while_gate_is_held() {
    let provider = MockProvider::new();
    provider.script(vec![MockStep::Chunk("a"), MockStep::HoldUntilAbort]);
    let relay = test_relay(Arc::clone(&provider));

    let mut first = TestPeer::attach(&relay);
    first.expect_server_info().await;
    first.send(&Message::chat_start("r1", "Hi")).await;
    assert!(matches!(first.recv().await, Message::ChatChunk { .. }));

    let mut late = TestPeer::attach(&relay);
    assert_eq!(late.expect_server_info().await.status, ServerStatus::Busy);
}

#[tokio::test]
async fn info_flush_timeout_destroys_the_socket() {
    let relay = Relay::new(
        RelayConfig {
            info_flush_timeout: Duration::from_millis(100),
            ..RelayConfig::default()
        },
        MockProvider::new(),
    );

    // A 4-byte pipe nobody reads: the greeting can never flush.
    let (near, _far) = tokio::io::duplex(4);
    relay.attach(near);
    wait_until(|| relay.session_count() == 0).await;
}

// ── Generation streaming ──────────────────────────────────────────────────────

#[tokio::test]
async fn happy_path_streams_chunks_then_terminal() {
    let provider = MockProvider::new();
    provider.script(vec![
        MockStep::Chunk("Hello"),
        MockStep::Chunk(" there"),
        MockStep::Done,
    ]);
    let relay = test_relay(Arc::clone(&provider));

    let mut peer = TestPeer::attach(&relay);
    peer.expect_server_info().await;
    peer.send(&Message::chat_start("r1", "Hi")).await;

    assert_eq!(peer.recv().await, Message::chat_chunk("r1", "Hello"));
    assert_eq!(peer.recv().await, Message::chat_chunk("r1", " there"));
    assert_eq!(peer.recv().await, Message::chat_end("r1", FinishReason::Stop));

    wait_until(|| !relay.is_busy()).await;
    assert!(relay.active_request_id().is_none());
}

#[tokio::test]
async fn busy_rejection_leaves_the_stream_uninterrupted() {
    let provider = MockProvider::new();
    provider.script(vec![
        MockStep::Chunk("a"),
        MockStep::Pause(Duration::from_millis(400)),
        MockStep::Chunk("b"),
        MockStep::Done,
    ]);
    let relay = test_relay(Arc::clone(&provider));

    let mut holder = TestPeer::attach(&relay);
    let mut rival = TestPeer::attach(&relay);
    holder.expect_server_info().await;
    rival.expect_server_info().await;

    holder.send(&Message::chat_start("r1", "Hi")).await;
    assert_eq!(holder.recv().await, Message::chat_chunk("r1", "a"));

    rival.send(&Message::chat_start("r2", "x")).await;
    match rival.recv().await {
        Message::Error { request_id, payload } => {
            assert_eq!(request_id.as_deref(), Some("r2"));
            assert_eq!(payload.code, ErrorCode::ModelBusy);
        }
        other => panic!("expected MODEL_BUSY, got {other:?}"),
    }

    // The holder's stream continues untouched.
    assert_eq!(holder.recv().await, Message::chat_chunk("r1", "b"));
    assert_eq!(holder.recv().await, Message::chat_end("r1", FinishReason::Stop));
}

#[tokio::test]
async fn abort_mid_stream_frees_the_gate_for_the_next_request() {
    let provider = MockProvider::new();
    provider.script(vec![MockStep::Chunk("a"), MockStep::HoldUntilAbort]);
    provider.script(vec![MockStep::Chunk("x"), MockStep::Done]);
    let relay = test_relay(Arc::clone(&provider));

    let mut peer = TestPeer::attach(&relay);
    peer.expect_server_info().await;
    peer.send(&Message::chat_start("r1", "Hi")).await;
    assert_eq!(peer.recv().await, Message::chat_chunk("r1", "a"));

    peer.send(&Message::abort("r1")).await;
    assert_eq!(peer.recv().await, Message::chat_end("r1", FinishReason::Abort));
    assert_eq!(provider.aborted(), vec!["r1".to_owned()]);

    // Nothing trails the terminal for r1.
    peer.expect_silence(Duration::from_millis(200)).await;
    wait_until(|| !relay.is_busy()).await;

    peer.send(&Message::chat_start("r3", "again")).await;
    assert_eq!(peer.recv().await, Message::chat_chunk("r3", "x"));
    assert_eq!(peer.recv().await, Message::chat_end("r3", FinishReason::Stop));
}

#[tokio::test]
async fn stale_abort_is_silently_ignored() {
    let provider = MockProvider::new();
    let relay = test_relay(Arc::clone(&provider));

    let mut peer = TestPeer::attach(&relay);
    peer.expect_server_info().await;
    peer.send(&Message::abort("ghost")).await;

    peer.expect_silence(Duration::from_millis(200)).await;
    assert!(provider.aborted().is_empty());
}

// ── Validation boundary ───────────────────────────────────────────────────────

#[tokio::test]
async fn oversize_prompt_never_touches_the_gate() {
    let provider = MockProvider::new();
    let relay = test_relay(Arc::clone(&provider));

    let mut peer = TestPeer::attach(&relay);
    peer.expect_server_info().await;

    let prompt = "a".repeat(MAX_PROMPT_BYTES + 1);
    peer.send(&Message::chat_start("r1", prompt)).await;
    match peer.recv().await {
        Message::Error { request_id, payload } => {
            assert_eq!(request_id.as_deref(), Some("r1"));
            assert_eq!(payload.code, ErrorCode::BadMessage);
        }
        other => panic!("expected BAD_MESSAGE, got {other:?}"),
    }
    assert!(!relay.is_busy());
    assert_eq!(provider.generate_calls(), 0);
}

#[tokio::test]
async fn prompt_at_the_exact_limit_is_accepted() {
    let provider = MockProvider::new();
    provider.script(vec![MockStep::Done]);
    let relay = test_relay(Arc::clone(&provider));

    let mut peer = TestPeer::attach(&relay);
    peer.expect_server_info().await;

    let prompt = "a".repeat(MAX_PROMPT_BYTES);
    peer.send(&Message::chat_start("r1", prompt)).await;
    assert_eq!(peer.recv().await, Message::chat_end("r1", FinishReason::Stop));
}

#[tokio::test]
async fn garbage_is_dropped_and_unknown_types_are_answered() {
    let relay = test_relay(MockProvider::new());
    let mut peer = TestPeer::attach(&relay);
    peer.expect_server_info().await;

    // Unparseable bytes are framing noise: no response at all.
    peer.send_raw(b"not json\n").await;
    peer.expect_silence(Duration::from_millis(200)).await;

    // A well-formed frame with an unknown type is a protocol violation.
    peer.send_raw(b"{\"type\":\"bogus\"}\n").await;
    match peer.recv().await {
        Message::Error { request_id, payload } => {
            assert!(request_id.is_none());
            assert_eq!(payload.code, ErrorCode::BadMessage);
        }
        other => panic!("expected BAD_MESSAGE, got {other:?}"),
    }
}

// ── Provider failure paths ────────────────────────────────────────────────────

#[tokio::test]
async fn provider_error_is_relayed_and_releases_the_gate() {
    let provider = MockProvider::new();
    provider.script(vec![
        MockStep::Chunk("a"),
        MockStep::Fail(ErrorCode::GenerationFailed, "boom"),
    ]);
    let relay = test_relay(Arc::clone(&provider));

    let mut peer = TestPeer::attach(&relay);
    peer.expect_server_info().await;
    peer.send(&Message::chat_start("r1", "Hi")).await;

    assert_eq!(peer.recv().await, Message::chat_chunk("r1", "a"));
    match peer.recv().await {
        Message::Error { request_id, payload } => {
            assert_eq!(request_id.as_deref(), Some("r1"));
            assert_eq!(payload.code, ErrorCode::GenerationFailed);
            assert_eq!(payload.message, "boom");
        }
        other => panic!("expected error terminal, got {other:?}"),
    }
    wait_until(|| !relay.is_busy()).await;
}

#[tokio::test]
async fn provider_idle_timeout_is_relayed() {
    let provider = MockProvider::new();
    provider.script(vec![
        MockStep::Chunk("a"),
        MockStep::Fail(ErrorCode::TimeoutNoResponse, "no output for 30s"),
    ]);
    let relay = test_relay(Arc::clone(&provider));

    let mut peer = TestPeer::attach(&relay);
    peer.expect_server_info().await;
    peer.send(&Message::chat_start("r1", "Hi")).await;

    assert_eq!(peer.recv().await, Message::chat_chunk("r1", "a"));
    match peer.recv().await {
        Message::Error { payload, .. } => {
            assert_eq!(payload.code, ErrorCode::TimeoutNoResponse);
        }
        other => panic!("expected timeout terminal, got {other:?}"),
    }
    wait_until(|| !relay.is_busy()).await;
}

#[tokio::test]
async fn unreachable_provider_escalates_to_observers() {
    let provider =
        MockProvider::unreachable_with(ProviderError::new(ErrorCode::OllamaNotFound, "not running"));
    let relay = test_relay(provider);
    let status_rx = relay.subscribe();

    let mut peer = TestPeer::attach(&relay);
    peer.expect_server_info().await;
    peer.send(&Message::chat_start("r1", "Hi")).await;

    match peer.recv().await {
        Message::Error { request_id, payload } => {
            assert_eq!(request_id.as_deref(), Some("r1"));
            assert_eq!(payload.code, ErrorCode::OllamaNotFound);
        }
        other => panic!("expected OLLAMA_NOT_FOUND, got {other:?}"),
    }

    wait_until(|| !relay.is_busy()).await;
    assert!(!status_rx.borrow().provider_reachable);
    assert!(!relay.current_status().provider_reachable);
}

// ── Disconnect / shutdown ─────────────────────────────────────────────────────

#[tokio::test]
async fn disconnect_mid_generation_aborts_the_provider() {
    let provider = MockProvider::new();
    provider.script(vec![MockStep::Chunk("a"), MockStep::HoldUntilAbort]);
    let relay = test_relay(Arc::clone(&provider));

    let mut peer = TestPeer::attach(&relay);
    peer.expect_server_info().await;
    peer.send(&Message::chat_start("r1", "Hi")).await;
    assert_eq!(peer.recv().await, Message::chat_chunk("r1", "a"));

    drop(peer);
    wait_until(|| relay.session_count() == 0).await;
    wait_until(|| !relay.is_busy()).await;
    assert_eq!(provider.aborted(), vec!["r1".to_owned()]);
}

#[tokio::test]
async fn sixth_peer_is_refused_without_touching_the_relay() {
    let relay = test_relay(MockProvider::new());
    let supervisor = Supervisor::new(relay.clone());

    let mut peers = Vec::new();
    for _ in 0..5 {
        let mut peer = TestPeer::offer(&supervisor).await;
        peer.expect_server_info().await;
        peers.push(peer);
    }
    assert_eq!(relay.session_count(), 5);

    let mut extra = TestPeer::offer(&supervisor).await;
    match extra.recv().await {
        Message::Error { request_id, payload } => {
            assert!(request_id.is_none());
            assert_eq!(payload.code, ErrorCode::ConnectFailed);
            assert_eq!(payload.message, "Max clients reached");
        }
        other => panic!("expected CONNECT_FAILED, got {other:?}"),
    }
    extra.expect_close().await;
    assert_eq!(relay.session_count(), 5);
}

#[tokio::test]
async fn shutdown_is_idempotent_and_closes_every_session() {
    let provider = MockProvider::new();
    provider.script(vec![MockStep::Chunk("a"), MockStep::HoldUntilAbort]);
    let relay = test_relay(Arc::clone(&provider));
    let supervisor = Supervisor::new(relay.clone());

    let mut peer = TestPeer::offer(&supervisor).await;
    peer.expect_server_info().await;
    peer.send(&Message::chat_start("r1", "Hi")).await;
    assert_eq!(peer.recv().await, Message::chat_chunk("r1", "a"));

    supervisor.shutdown().await;
    supervisor.shutdown().await;

    peer.expect_close().await;
    wait_until(|| relay.session_count() == 0).await;
    assert!(!relay.is_busy());
    assert_eq!(provider.aborted(), vec!["r1".to_owned()]);
}
