//! Transport and session traits with dynamic dispatch companions.

use crate::TransportEvent;
use crate::error::{Result, SendError};

use futures::Stream;

use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

/// Ordered stream of message batches and connection state changes for one
/// session. Ends when the underlying socket is gone.
pub type EventStream = Pin<Box<dyn Stream<Item = TransportEvent> + Send>>;

/// A freshly established session and its event stream.
pub struct Connected {
    pub session: Arc<dyn SessionDyn>,
    pub events: EventStream,
}

/// Static trait for transports.
/// Use this for type-safe implementations.
pub trait Transport: Send + Sync + 'static {
    /// Unique name for this transport.
    fn name(&self) -> &str;

    /// Open a new session using the credential files in `auth_dir`.
    /// Every call yields an independent session.
    fn connect(&self, auth_dir: &Path) -> impl std::future::Future<Output = Result<Connected>> + Send;
}

/// Static trait for the send side of a session.
pub trait Session: Send + Sync + 'static {
    /// Send `text` to a conversation and return the transport's message id.
    fn send(
        &self,
        conversation_id: &str,
        text: &str,
    ) -> impl std::future::Future<Output = std::result::Result<String, SendError>> + Send;
}

/// Dynamic trait for runtime polymorphism.
/// Use this when you need `Arc<dyn TransportDyn>`.
pub trait TransportDyn: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn connect<'a>(
        &'a self,
        auth_dir: &'a Path,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<Connected>> + Send + 'a>>;
}

/// Blanket implementation: any type implementing Transport automatically implements TransportDyn.
impl<T: Transport> TransportDyn for T {
    fn name(&self) -> &str {
        Transport::name(self)
    }

    fn connect<'a>(
        &'a self,
        auth_dir: &'a Path,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<Connected>> + Send + 'a>> {
        Box::pin(Transport::connect(self, auth_dir))
    }
}

/// Dynamic companion of [`Session`].
pub trait SessionDyn: Send + Sync + 'static {
    fn send<'a>(
        &'a self,
        conversation_id: &'a str,
        text: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = std::result::Result<String, SendError>> + Send + 'a>>;
}

impl<T: Session> SessionDyn for T {
    fn send<'a>(
        &'a self,
        conversation_id: &'a str,
        text: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = std::result::Result<String, SendError>> + Send + 'a>>
    {
        Box::pin(Session::send(self, conversation_id, text))
    }
}
