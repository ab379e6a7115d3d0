//! Connection lifecycle: one [`ConnectionSession`] per connect attempt, a
//! slot lending the live one to the scheduler, and the supervisor that
//! reconnects and repairs.

pub mod manager;
pub mod repair;

pub use manager::{ConnectionManager, LifecycleExit, LifecyclePhase};
pub use repair::{
    CorruptionSignatures, CredentialCategory, CredentialStore, FsCredentialStore, RepairReport,
};

use crate::error::SendError;
use crate::transport::SessionDyn;
use crate::{ConnectionState, DisconnectCause};

use arc_swap::ArcSwapOption;
use tokio::sync::watch;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Transport status code for an explicit logout.
pub const LOGGED_OUT_STATUS: u16 = 401;

/// One connection attempt's session. Moves Connecting -> Open -> Closed,
/// falling back to Connecting while the transport re-handshakes. Closed is
/// final; a reconnect builds a new one.
pub struct ConnectionSession {
    generation: u64,
    sender: Arc<dyn SessionDyn>,
    state: watch::Sender<ConnectionState>,
    credentials_suspect: AtomicBool,
}

impl ConnectionSession {
    pub fn new(generation: u64, sender: Arc<dyn SessionDyn>) -> Self {
        Self {
            generation,
            sender,
            state: watch::Sender::new(ConnectionState::Connecting),
            credentials_suspect: AtomicBool::new(false),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Returns false if the session was already open or closed.
    pub fn mark_open(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Connecting {
                *state = ConnectionState::Open;
                true
            } else {
                false
            }
        })
    }

    /// Open -> Connecting. Returns false in any other state.
    pub fn mark_connecting(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Open {
                *state = ConnectionState::Connecting;
                true
            } else {
                false
            }
        })
    }

    pub fn mark_closed(&self) {
        self.state.send_replace(ConnectionState::Closed);
    }

    /// Note that a send failed in a way that points at damaged credentials.
    pub fn flag_credentials_suspect(&self) {
        self.credentials_suspect.store(true, Ordering::SeqCst);
    }

    pub fn credentials_suspect(&self) -> bool {
        self.credentials_suspect.load(Ordering::SeqCst)
    }

    /// Send through the transport. Refused unless the session is open.
    pub async fn send(&self, conversation_id: &str, text: &str) -> Result<String, SendError> {
        if !self.is_open() {
            return Err(SendError::transient(format!(
                "session {} is {}",
                self.generation,
                self.state()
            )));
        }
        self.sender.send(conversation_id, text).await
    }
}

impl std::fmt::Debug for ConnectionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSession")
            .field("generation", &self.generation)
            .field("state", &self.state())
            .field("credentials_suspect", &self.credentials_suspect())
            .finish()
    }
}

/// Holds the session currently lent out for sending. Readers re-fetch it
/// on every use.
pub struct SessionSlot {
    current: ArcSwapOption<ConnectionSession>,
}

impl SessionSlot {
    pub fn new() -> Self {
        Self {
            current: ArcSwapOption::empty(),
        }
    }

    /// The published session, if it is still open.
    pub fn live(&self) -> Option<Arc<ConnectionSession>> {
        self.current
            .load_full()
            .filter(|session| session.is_open())
    }

    pub fn publish(&self, session: Arc<ConnectionSession>) {
        self.current.store(Some(session));
    }

    /// Withdraw the session of `generation`, leaving a newer one in place.
    pub fn revoke(&self, generation: u64) {
        if self
            .current
            .load_full()
            .is_some_and(|session| session.generation() == generation)
        {
            self.current.store(None);
        }
    }
}

impl Default for SessionSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// How a closed session should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectClass {
    /// The account was logged out. Reconnecting cannot succeed.
    LoggedOut,
    /// Session material is damaged: repair, then reconnect.
    Corrupted,
    /// Anything else: reconnect after the fixed delay.
    Recoverable,
}

pub fn classify_disconnect(
    cause: Option<&DisconnectCause>,
    credentials_suspect: bool,
    signatures: &CorruptionSignatures,
) -> DisconnectClass {
    if cause.is_some_and(|cause| cause.status_code == Some(LOGGED_OUT_STATUS)) {
        return DisconnectClass::LoggedOut;
    }
    if credentials_suspect || cause.is_some_and(|cause| signatures.matches(&cause.message)) {
        return DisconnectClass::Corrupted;
    }
    DisconnectClass::Recoverable
}
