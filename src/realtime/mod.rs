//! Realtime push channel: transport, connection lifecycle and subscriptions.

mod backoff;
mod connection;
pub mod protocol;
mod state;
mod subscriptions;
mod transport;
mod websocket;

pub use backoff::{OuterBackoff, TransportRetryPolicy};
pub use connection::RealtimeConnection;
pub use state::{Arrival, ConnectionState, ConnectionStateMachine, InvalidTransition, StateChange};
pub use subscriptions::{join, leave, replay, SubscriptionRegistry, Topic, TopicId, TopicKind};
pub use transport::{TokenProvider, Transport, TransportError, TransportEvent, TransportEvents};
pub use websocket::WsTransport;
