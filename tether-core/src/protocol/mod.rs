//! Line-framed protocol: wire types, structural validation, frame codec.
//!
//! Decoding is a two-stage pipeline. The [`codec`] layer turns an arbitrary
//! byte stream into JSON values (framing errors are advisory and never
//! produce a frame); [`validate`] turns a JSON value into a typed [`Message`]
//! or a [`ProtocolViolation`] that the receiver answers with a `BAD_MESSAGE`
//! error frame while continuing to process subsequent frames.

pub mod codec;
mod types;

use thiserror::Error;

pub use types::{
    new_request_id, ChatChunkPayload, ChatEndPayload, ChatStartPayload, ErrorCode, ErrorPayload,
    FinishReason, Message, RequestId, ServerInfoPayload, ServerStatus, MAX_PROMPT_BYTES,
};

/// A structurally invalid message.
///
/// Carries the offender's `request_id` when one could be extracted from the
/// raw value, so the answering `error` frame can be request-scoped.
#[derive(Debug, Clone, Error)]
#[error("invalid message: {reason}")]
pub struct ProtocolViolation {
    pub request_id: Option<RequestId>,
    pub reason: String,
}

impl ProtocolViolation {
    /// The `error(BAD_MESSAGE)` frame answering this violation.
    pub fn into_frame(self) -> Message {
        Message::error(ErrorCode::BadMessage, self.reason, self.request_id)
    }
}

/// Validate a decoded JSON value into a typed [`Message`].
///
/// Pure function, no I/O. Checks the `type` tag against the fixed variant
/// set, the presence and type of `request_id` where the variant demands it,
/// the payload shape, and the `chat_start` prompt byte limit.
pub fn validate(raw: serde_json::Value) -> Result<Message, ProtocolViolation> {
    // Best-effort id extraction so even shape errors can be request-scoped.
    let raw_request_id = raw
        .get("request_id")
        .and_then(|v| v.as_str())
        .map(str::to_owned);

    let message: Message = serde_json::from_value(raw).map_err(|e| ProtocolViolation {
        request_id: raw_request_id.clone(),
        reason: e.to_string(),
    })?;

    let violation = |reason: String| ProtocolViolation {
        request_id: raw_request_id.clone(),
        reason,
    };

    match &message {
        Message::ChatStart { request_id, payload } => {
            if request_id.is_empty() {
                return Err(violation("request_id must be non-empty".into()));
            }
            if payload.prompt.len() > MAX_PROMPT_BYTES {
                return Err(violation(format!(
                    "prompt is {} bytes; maximum is {MAX_PROMPT_BYTES} bytes",
                    payload.prompt.len()
                )));
            }
        }
        Message::ChatChunk { request_id, .. }
        | Message::ChatEnd { request_id, .. }
        | Message::Abort { request_id, .. } => {
            if request_id.is_empty() {
                return Err(violation("request_id must be non-empty".into()));
            }
        }
        Message::ServerInfo { .. } | Message::Error { .. } => {}
    }

    Ok(message)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
