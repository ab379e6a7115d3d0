//! deferbot: deferred auto-replies for a chat account, with a connection
//! supervisor that repairs corrupted sessions instead of looping on them.

pub mod config;
pub mod connection;
pub mod contacts;
pub mod daemon;
pub mod error;
pub mod generator;
pub mod ingestion;
pub mod ledger;
pub mod policy;
pub mod prompt;
pub mod scheduler;
pub mod transport;
pub mod webhook;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Error, Result};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who authored a message, relative to the account the bot runs on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Sent by a contact to the account.
    Inbound,
    /// Sent by the account owner (or the bot) from the account.
    Outbound,
}

impl Direction {
    pub fn is_outbound(self) -> bool {
        matches!(self, Direction::Outbound)
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Inbound => write!(f, "inbound"),
            Direction::Outbound => write!(f, "outbound"),
        }
    }
}

/// A message event as delivered by the transport, before any gating.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InboundEnvelope {
    /// Transport-assigned message id, unique per account.
    pub id: String,
    pub conversation_id: String,
    pub direction: Direction,
    /// Text body. Media-only and protocol messages carry `None`.
    pub body: Option<String>,
    /// Carries an image, video, audio clip or document.
    #[serde(default)]
    pub has_media: bool,
    pub sender_display_name: Option<String>,
    /// Id of the message this one replies to, if the transport exposes it.
    pub quoted_message_id: Option<String>,
}

/// Connection state reported by a live transport session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Open => write!(f, "open"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Why the transport closed a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DisconnectCause {
    /// Transport status code, when one was reported.
    pub status_code: Option<u16>,
    /// Human-readable error text from the transport.
    pub message: String,
}

impl DisconnectCause {
    pub fn new(status_code: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status_code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for DisconnectCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "{} (status {code})", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Events emitted by a transport session, in arrival order.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A batch of message events.
    Messages(Vec<InboundEnvelope>),
    /// A connection state change. `cause` is set when the state is `Closed`.
    Connection {
        state: ConnectionState,
        cause: Option<DisconnectCause>,
    },
}

/// Wall-clock source. Injected so sweeps and ingestion can be driven
/// deterministically.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
