//! tether-core – protocol and streaming relay for the tether bridge.
//!
//! A **host** exposes a locally-running text-generation engine to a handful
//! of remote peers over an encrypted overlay; **clients** submit prompts and
//! receive token streams. This crate is the transport-agnostic core shared
//! by both sides: the newline-delimited JSON [`protocol`], the host-side
//! [`relay`] (single-slot admission, peer sessions, supervisor), the
//! [`client`] driver, the [`provider`] capability the relay consumes, and
//! the base58 [`topic`] identity.
//!
//! The overlay transport itself, the concrete inference engine, and every
//! UI live outside this crate; sessions are generic over any duplex byte
//! stream.

pub mod client;
pub mod protocol;
pub mod provider;
pub mod relay;
pub mod topic;

pub use client::{Client, ClientConfig, ClientError, ClientEvent, TerminalOutcome};
pub use protocol::{ErrorCode, FinishReason, Message, RequestId};
pub use provider::{GenerationEvent, GenerationStream, InferenceProvider, ProviderError};
pub use relay::supervisor::Supervisor;
pub use relay::{Relay, RelayConfig, RelayStatus};
pub use topic::{Topic, TopicError};
