// Error taxonomy
pub mod error;

// Configuration
pub mod config;

// Credential store and encrypted session cache
pub mod credentials;

// Session authority and identity providers
pub mod auth;

// Authenticated backend API clients
pub mod http;

// Realtime connection, transport and subscriptions
pub mod realtime;

// Notification presentation
pub mod notifications;

pub use error::{ClientError, ClientResult};
