//! Client error taxonomy.
//!
//! Every failure that crosses the public surface of the session authority or
//! the realtime connection is expressed as a [`ClientError`]. Plumbing code
//! (cache, encryption, HTTP) uses `anyhow` internally and is mapped here at the
//! component boundary.

use crate::realtime::Topic;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClientError {
    /// No usable credential. The user has to sign in again.
    #[error("not authenticated")]
    NotAuthenticated,

    /// A connect or reconnect attempt failed and will be retried.
    #[error("transient transport failure: {0}")]
    TransientTransportFailure(String),

    /// The retry budget is spent. Only a manual reload recovers.
    #[error("realtime connection failed after {attempts} attempts")]
    TerminalTransportFailure { attempts: u32 },

    /// A join or leave call for one topic failed.
    #[error("subscription to {topic} failed: {reason}")]
    SubscriptionFailure { topic: Topic, reason: String },

    /// The backend rejected the credential (HTTP 401).
    #[error("credential rejected by server")]
    Unauthorized,
}

pub type ClientResult<T> = Result<T, ClientError>;
