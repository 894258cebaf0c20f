//! Session authority: owns acquisition, refresh and loss of the bearer token.

use super::{bearer_header, IdentityError, IdentityProvider};
use crate::config::IdentityConfig;
use crate::credentials::{Credential, CredentialStore};
use crate::error::{ClientError, ClientResult};
use crate::realtime::TokenProvider;
use chrono::{Duration, Utc};
use futures::FutureExt;
use reqwest::header::AUTHORIZATION;
use reqwest::StatusCode;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

/// Signals for the application shell.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    /// A credential was established by an interactive sign-in.
    SignedIn { account_id: Option<String> },
    /// A credential was renewed silently.
    Refreshed { account_id: String },
    /// The backend rejected the credential. Protected views must be torn down
    /// and sign-in presented.
    SessionExpired,
    /// The user signed out.
    LoggedOut,
}

/// Guarantees outbound calls carry the freshest credential available.
///
/// # Single-flight unauthorized handling
/// The first 401 clears the store and emits [`SessionEvent::SessionExpired`].
/// Any further 401s are ignored until a new credential is written, whether
/// through [`establish`](Self::establish), a silent refresh or the store
/// directly.
pub struct SessionAuthority {
    store: Arc<CredentialStore>,
    provider: Option<Arc<dyn IdentityProvider>>,
    scopes: Vec<String>,
    expiry_skew: Duration,
    /// Store generation left by the 401 that cleared the session. Any later
    /// write moves the store past it and re-arms the guard.
    expired_at: StdMutex<Option<u64>>,
    /// Serializes silent refreshes
    refresh_gate: Mutex<()>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionAuthority {
    pub fn new(store: Arc<CredentialStore>, config: &IdentityConfig) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            store,
            provider: None,
            scopes: config.scopes.clone(),
            expiry_skew: Duration::seconds(config.expiry_skew_seconds),
            expired_at: StdMutex::new(None),
            refresh_gate: Mutex::new(()),
            events,
        }
    }

    /// Enables silent refresh through `provider`.
    pub fn with_provider(mut self, provider: Arc<dyn IdentityProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    /// Session signals for the application shell.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Records the result of an interactive sign-in.
    pub fn establish(&self, credential: Credential) {
        let account_id = credential.account_id.clone();
        self.store.set(credential);
        info!(account_id = ?account_id, "Session established");
        let _ = self.events.send(SessionEvent::SignedIn { account_id });
    }

    /// Returns a usable credential, refreshing silently when needed.
    ///
    /// On refresh failure the stale credential (if any) stays in the store;
    /// the caller decides whether to use it.
    pub async fn get_token(&self) -> ClientResult<Credential> {
        if let Some(credential) = self.fresh_credential() {
            return Ok(credential);
        }

        let _gate = self.refresh_gate.lock().await;

        // Another caller may have refreshed while we waited
        if let Some(credential) = self.fresh_credential() {
            return Ok(credential);
        }

        let provider = self.provider.as_ref().ok_or(ClientError::NotAuthenticated)?;
        let account_id = self
            .store
            .get()
            .and_then(|credential| credential.account_id)
            .ok_or(ClientError::NotAuthenticated)?;

        let generation = self.store.generation();
        debug!(account_id = %account_id, "Attempting silent token refresh");

        let grant = match provider.acquire_token_silent(&self.scopes, &account_id).await {
            Ok(grant) => grant,
            Err(IdentityError::InteractionRequired) => {
                info!(account_id = %account_id, "Silent refresh needs user interaction");
                return Err(ClientError::NotAuthenticated);
            }
            Err(e) => {
                warn!(account_id = %account_id, error = %e, "Silent refresh failed");
                return Err(ClientError::NotAuthenticated);
            }
        };

        let credential = Credential {
            token: grant.token,
            expires_at: grant.expires_at,
            account_id: Some(account_id.clone()),
        };

        if self.store.replace_if_generation(generation, credential.clone()) {
            info!(account_id = %account_id, "Token refreshed silently");
            let _ = self.events.send(SessionEvent::Refreshed { account_id });
            return Ok(credential);
        }

        // Overtaken by a newer write; that write wins
        debug!(account_id = %account_id, "Discarding refresh result overtaken by a newer write");
        self.store.get().ok_or(ClientError::NotAuthenticated)
    }

    /// Adds `Authorization: Bearer <token>` when a credential is held.
    ///
    /// Without a credential the request goes out unchanged and the server
    /// decides.
    pub fn attach(&self, mut request: reqwest::Request) -> reqwest::Request {
        if let Some(credential) = self.store.get() {
            match bearer_header(&credential.token) {
                Ok(value) => {
                    request.headers_mut().insert(AUTHORIZATION, value);
                }
                Err(_) => warn!("Stored token is not a valid header value, sending without it"),
            }
        }
        request
    }

    /// Reacts to a response status. Only 401 has an effect, and only the
    /// first one since a credential was last written.
    ///
    /// Returns true when this call cleared the session.
    pub fn on_unauthorized(&self, status: StatusCode) -> bool {
        if status != StatusCode::UNAUTHORIZED {
            return false;
        }
        let mut expired_at = self.expired_at.lock().unwrap_or_else(PoisonError::into_inner);
        if *expired_at == Some(self.store.generation()) {
            debug!("Session already expired, ignoring further 401");
            return false;
        }

        self.store.clear();
        *expired_at = Some(self.store.generation());
        drop(expired_at);
        warn!("Credential rejected by server, session cleared");
        let _ = self.events.send(SessionEvent::SessionExpired);
        true
    }

    /// Clears the local session and ends the provider session if one exists.
    pub async fn logout(&self) {
        let account_id = self.store.get().and_then(|credential| credential.account_id);
        self.store.clear();

        if let (Some(provider), Some(account_id)) = (&self.provider, account_id.as_deref()) {
            match provider.sign_out(account_id).await {
                Ok(true) => info!(account_id = %account_id, "Signed out of identity provider"),
                Ok(false) => debug!(account_id = %account_id, "No provider session to end"),
                Err(e) => warn!(account_id = %account_id, error = %e, "Provider sign-out failed"),
            }
        }

        info!("Logged out");
        let _ = self.events.send(SessionEvent::LoggedOut);
    }

    /// Token callback for the realtime transport, evaluated per attempt.
    pub fn token_provider(self: &Arc<Self>) -> TokenProvider {
        let session = Arc::clone(self);
        Arc::new(move || {
            let session = Arc::clone(&session);
            async move { session.get_token().await.ok().map(|c| c.token) }.boxed()
        })
    }

    fn fresh_credential(&self) -> Option<Credential> {
        self.store
            .get()
            .filter(|credential| !credential.is_expired_at(Utc::now(), self.expiry_skew))
    }
}
