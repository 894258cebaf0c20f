//! Realtime transport contract.
//!
//! A transport owns one physical push connection and its *own* short-outage
//! reconnection. It reports everything that happens to it as
//! [`TransportEvent`]s on the channel returned by [`Transport::connect`].

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Produces the bearer token for a connection attempt.
///
/// Called fresh on every attempt, so a token refreshed between attempts is
/// picked up without further coordination.
pub type TokenProvider = Arc<dyn Fn() -> BoxFuture<'static, Option<String>> + Send + Sync>;

/// Receiving half of a transport's event stream.
pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Server pushed `target` with its arguments.
    Message { target: String, args: Vec<Value> },
    /// The connection dropped and the transport is renegotiating.
    Reconnecting { error: Option<String> },
    /// A renegotiation succeeded. Server-side group membership is gone.
    Reconnected,
    /// A renegotiation handshake was rejected with HTTP 401. The transport
    /// stopped without spending the rest of its budget.
    Unauthorized,
    /// The transport stopped for good. `error` is `None` after an explicit
    /// disconnect.
    Closed { error: Option<String> },
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    /// The handshake was rejected with HTTP 401.
    #[error("handshake rejected: unauthorized")]
    Unauthorized,
    #[error("not connected")]
    NotConnected,
    #[error("invocation of {method} failed: {reason}")]
    Invocation { method: String, reason: String },
    #[error("{0} timed out")]
    Timeout(String),
    #[error("connection closed")]
    Closed,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens the connection, resolving once the first handshake completes.
    ///
    /// Implementations bound every handshake, including the ones made while
    /// renegotiating, so a hub that never answers counts as a failed attempt.
    async fn connect(
        &self,
        url: &str,
        tokens: TokenProvider,
    ) -> Result<TransportEvents, TransportError>;

    /// Calls a hub method and waits for its acknowledgement.
    async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value, TransportError>;

    /// Closes the connection without triggering reconnection.
    async fn disconnect(&self);
}
