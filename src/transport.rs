//! Transport abstraction over the duplex connection to the remote endpoint.
//!
//! The orchestrator owns a [`Connector`] and swaps connections when the
//! endpoint fails; the uplink and downlink workers each own one half of an
//! established connection. All failures surface through one taxonomy so the
//! orchestrator alone decides between retry, fallback and giving up.

use crate::events::{InboundEvent, OutboundMessage};
use std::future::Future;

/// Failure classes for transport operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Quota,
    Transient,
    Fatal,
    Disconnected,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Remote capacity or billing limit; advance through the fallback models.
    #[error("quota exhausted: {0}")]
    Quota(String),
    /// Network hiccup; bounded retry against the same model.
    #[error("transient transport failure: {0}")]
    Transient(String),
    /// Malformed session or invalid credentials; terminal, never retried.
    #[error("fatal transport failure: {0}")]
    Fatal(String),
    /// The peer went away.
    #[error("connection closed: {0}")]
    Disconnected(String),
}

impl TransportError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::Quota => TransportError::Quota(message),
            ErrorKind::Transient => TransportError::Transient(message),
            ErrorKind::Fatal => TransportError::Fatal(message),
            ErrorKind::Disconnected => TransportError::Disconnected(message),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            TransportError::Quota(_) => ErrorKind::Quota,
            TransportError::Transient(_) => ErrorKind::Transient,
            TransportError::Fatal(_) => ErrorKind::Fatal,
            TransportError::Disconnected(_) => ErrorKind::Disconnected,
        }
    }
}

/// Factory for sessions against a named model endpoint.
pub trait Connector: Send + Sync + 'static {
    type Conn: Connection;

    /// Establish a session against `model`, including any protocol-level
    /// setup handshake; a returned connection is ready for realtime input.
    fn connect(
        &self,
        model: &str,
    ) -> impl Future<Output = Result<Self::Conn, TransportError>> + Send;
}

/// An established duplex connection, split into independently owned halves
/// so sending and receiving never contend.
pub trait Connection: Send + 'static {
    type Tx: TransportTx;
    type Rx: TransportRx;

    fn split(self) -> (Self::Tx, Self::Rx);
}

pub trait TransportTx: Send + 'static {
    fn send(
        &mut self,
        msg: OutboundMessage,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Best-effort close of the underlying connection.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

pub trait TransportRx: Send + 'static {
    fn receive(&mut self) -> impl Future<Output = Result<InboundEvent, TransportError>> + Send;
}
