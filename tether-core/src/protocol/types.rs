//! Wire message types.
//!
//! Every frame on the wire is a JSON object with a `type` tag, an optional
//! `request_id`, and a variant-specific `payload`. The envelope is shared by
//! both sides; direction is a matter of convention (`chat_start` and `abort`
//! flow client→host, `server_info`, `chat_chunk` and `chat_end` host→client,
//! `error` both ways).

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque per-request identifier, unique within a peer session's lifetime.
///
/// Generated values are random 128-bit identifiers rendered in a compact
/// textual form (see [`new_request_id`]); collision probability across
/// sessions is negligible.
pub type RequestId = String;

/// Maximum UTF-8 byte length of a `chat_start` prompt.
pub const MAX_PROMPT_BYTES: usize = 8192;

/// Mint a fresh [`RequestId`].
pub fn new_request_id() -> RequestId {
    uuid::Uuid::new_v4().as_simple().to_string()
}

/// Gate state advertised in `server_info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Ready,
    Busy,
}

/// Why a request's stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishReason {
    /// The generation ran to completion.
    Stop,
    /// The client asked for the generation to be cancelled.
    Abort,
    /// The generation failed; details were carried by a preceding `error`.
    Error,
}

/// Closed set of wire-visible error codes.
///
/// Codes a peer does not recognize parse into [`ErrorCode::Unknown`] and
/// are surfaced opaquely with the original message rather than being
/// treated as malformed input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    // Connection.
    InvalidServerId,
    ConnectFailed,
    HostOffline,
    HostDisconnected,
    UserDisconnected,
    // Provider.
    OllamaNotFound,
    OllamaModelNotAvailable,
    ModelBusy,
    GenerationFailed,
    GenerationAborted,
    // Protocol.
    BadMessage,
    UnsupportedVersion,
    TimeoutNoResponse,
    /// Any code outside the closed set, preserved verbatim.
    Unknown(String),
}

impl ErrorCode {
    pub fn as_str(&self) -> &str {
        match self {
            ErrorCode::InvalidServerId => "INVALID_SERVER_ID",
            ErrorCode::ConnectFailed => "CONNECT_FAILED",
            ErrorCode::HostOffline => "HOST_OFFLINE",
            ErrorCode::HostDisconnected => "HOST_DISCONNECTED",
            ErrorCode::UserDisconnected => "USER_DISCONNECTED",
            ErrorCode::OllamaNotFound => "OLLAMA_NOT_FOUND",
            ErrorCode::OllamaModelNotAvailable => "OLLAMA_MODEL_NOT_AVAILABLE",
            ErrorCode::ModelBusy => "MODEL_BUSY",
            ErrorCode::GenerationFailed => "GENERATION_FAILED",
            ErrorCode::GenerationAborted => "GENERATION_ABORTED",
            ErrorCode::BadMessage => "BAD_MESSAGE",
            ErrorCode::UnsupportedVersion => "UNSUPPORTED_VERSION",
            ErrorCode::TimeoutNoResponse => "TIMEOUT_NO_RESPONSE",
            ErrorCode::Unknown(code) => code.as_str(),
        }
    }

    pub fn parse(code: &str) -> Self {
        match code {
            "INVALID_SERVER_ID" => ErrorCode::InvalidServerId,
            "CONNECT_FAILED" => ErrorCode::ConnectFailed,
            "HOST_OFFLINE" => ErrorCode::HostOffline,
            "HOST_DISCONNECTED" => ErrorCode::HostDisconnected,
            "USER_DISCONNECTED" => ErrorCode::UserDisconnected,
            "OLLAMA_NOT_FOUND" => ErrorCode::OllamaNotFound,
            "OLLAMA_MODEL_NOT_AVAILABLE" => ErrorCode::OllamaModelNotAvailable,
            "MODEL_BUSY" => ErrorCode::ModelBusy,
            "GENERATION_FAILED" => ErrorCode::GenerationFailed,
            "GENERATION_ABORTED" => ErrorCode::GenerationAborted,
            "BAD_MESSAGE" => ErrorCode::BadMessage,
            "UNSUPPORTED_VERSION" => ErrorCode::UnsupportedVersion,
            "TIMEOUT_NO_RESPONSE" => ErrorCode::TimeoutNoResponse,
            other => ErrorCode::Unknown(other.to_owned()),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ErrorCode {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(ErrorCode::parse(&raw))
    }
}

/// Payload of `server_info`, sent once per peer session immediately on attach.
///
/// `status` reflects the gate at send time and is not re-sent on later
/// transitions; clients learn about busy-ness from `MODEL_BUSY` errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfoPayload {
    pub host_name: String,
    pub model: String,
    pub status: ServerStatus,
}

/// Payload of `chat_start`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatStartPayload {
    pub prompt: String,
}

/// Payload of `chat_chunk`. Consumers concatenate `text` in arrival order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatChunkPayload {
    pub text: String,
}

/// Payload of `chat_end`, the normal terminal frame for a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEndPayload {
    pub finish_reason: FinishReason,
}

/// Payload of `error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

/// A validated protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    ServerInfo {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<RequestId>,
        payload: ServerInfoPayload,
    },
    ChatStart {
        request_id: RequestId,
        payload: ChatStartPayload,
    },
    ChatChunk {
        request_id: RequestId,
        payload: ChatChunkPayload,
    },
    ChatEnd {
        request_id: RequestId,
        payload: ChatEndPayload,
    },
    Abort {
        request_id: RequestId,
        /// Carries no information; only `request_id` matters.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<RequestId>,
        payload: ErrorPayload,
    },
}

impl Message {
    pub fn server_info(host_name: impl Into<String>, model: impl Into<String>, status: ServerStatus) -> Self {
        Message::ServerInfo {
            request_id: None,
            payload: ServerInfoPayload {
                host_name: host_name.into(),
                model: model.into(),
                status,
            },
        }
    }

    pub fn chat_start(request_id: impl Into<RequestId>, prompt: impl Into<String>) -> Self {
        Message::ChatStart {
            request_id: request_id.into(),
            payload: ChatStartPayload { prompt: prompt.into() },
        }
    }

    pub fn chat_chunk(request_id: impl Into<RequestId>, text: impl Into<String>) -> Self {
        Message::ChatChunk {
            request_id: request_id.into(),
            payload: ChatChunkPayload { text: text.into() },
        }
    }

    pub fn chat_end(request_id: impl Into<RequestId>, finish_reason: FinishReason) -> Self {
        Message::ChatEnd {
            request_id: request_id.into(),
            payload: ChatEndPayload { finish_reason },
        }
    }

    pub fn abort(request_id: impl Into<RequestId>) -> Self {
        Message::Abort {
            request_id: request_id.into(),
            payload: None,
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>, request_id: Option<RequestId>) -> Self {
        Message::Error {
            request_id,
            payload: ErrorPayload {
                code,
                message: message.into(),
            },
        }
    }

    /// The `request_id` carried by this message, if any.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Message::ServerInfo { request_id, .. } | Message::Error { request_id, .. } => {
                request_id.as_deref()
            }
            Message::ChatStart { request_id, .. }
            | Message::ChatChunk { request_id, .. }
            | Message::ChatEnd { request_id, .. }
            | Message::Abort { request_id, .. } => Some(request_id.as_str()),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
