//! Identity provider integration.
//!
//! The session authority only ever asks the provider for a token *silently*.
//! When the provider needs the user (expired session, consent, MFA) it answers
//! [`IdentityError::InteractionRequired`] and the authority surfaces
//! `NotAuthenticated` instead of trying to resolve it.

use crate::config::IdentityConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info};

/// Token returned by a silent acquisition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenGrant {
    pub token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    /// The provider cannot issue a token without user interaction.
    #[error("user interaction required")]
    InteractionRequired,
    /// Transport or protocol failure talking to the provider.
    #[error("identity provider error: {0}")]
    Provider(String),
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Acquires a token for `account_id` without user interaction.
    async fn acquire_token_silent(
        &self,
        scopes: &[String],
        account_id: &str,
    ) -> Result<TokenGrant, IdentityError>;

    /// Ends the provider-side session for `account_id`.
    ///
    /// Returns `Ok(false)` when there was no provider session to end.
    async fn sign_out(&self, _account_id: &str) -> Result<bool> {
        Ok(false)
    }
}

#[derive(Deserialize)]
struct TokenRefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Deserialize)]
struct OAuthErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// OAuth error codes meaning "only the user can fix this".
const INTERACTION_ERRORS: [&str; 4] = [
    "invalid_grant",
    "interaction_required",
    "login_required",
    "consent_required",
];

/// OAuth 2.0 provider that refreshes silently with a stored refresh token.
///
/// Refresh tokens are kept per account and rotated whenever the token endpoint
/// returns a new one.
pub struct OAuthRefreshProvider {
    config: IdentityConfig,
    http_client: reqwest::Client,
    refresh_tokens: Mutex<HashMap<String, String>>,
}

impl OAuthRefreshProvider {
    pub fn new(config: IdentityConfig) -> Self {
        Self {
            config,
            http_client: reqwest::Client::new(),
            refresh_tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Records the refresh token obtained from an interactive sign-in.
    pub fn remember(&self, account_id: &str, refresh_token: &str) {
        self.refresh_tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(account_id.to_string(), refresh_token.to_string());
    }

    /// Whether a provider session exists for `account_id`.
    pub fn has_session(&self, account_id: &str) -> bool {
        self.refresh_tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(account_id)
    }

    fn refresh_token(&self, account_id: &str) -> Option<String> {
        self.refresh_tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(account_id)
            .cloned()
    }

    fn forget(&self, account_id: &str) -> Option<String> {
        self.refresh_tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(account_id)
    }

    fn client_form(&self) -> HashMap<&'static str, String> {
        let mut form = HashMap::new();
        form.insert("client_id", self.config.client_id.clone());
        if let Some(secret) = &self.config.client_secret {
            form.insert("client_secret", secret.clone());
        }
        form
    }
}

#[async_trait]
impl IdentityProvider for OAuthRefreshProvider {
    async fn acquire_token_silent(
        &self,
        scopes: &[String],
        account_id: &str,
    ) -> Result<TokenGrant, IdentityError> {
        let refresh_token = self
            .refresh_token(account_id)
            .ok_or(IdentityError::InteractionRequired)?;

        let mut form = self.client_form();
        form.insert("grant_type", "refresh_token".to_string());
        form.insert("refresh_token", refresh_token);
        if !scopes.is_empty() {
            form.insert("scope", scopes.join(" "));
        }

        debug!(account_id = %account_id, "Refreshing token at {}", self.config.token_url);

        let response = self
            .http_client
            .post(&self.config.token_url)
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await
            .map_err(|e| IdentityError::Provider(format!("token request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<failed to read body>".to_string());

            if let Ok(oauth_error) = serde_json::from_str::<OAuthErrorResponse>(&body) {
                if INTERACTION_ERRORS.contains(&oauth_error.error.as_str()) {
                    info!(
                        account_id = %account_id,
                        error = %oauth_error.error,
                        description = ?oauth_error.error_description,
                        "Provider session no longer valid"
                    );
                    self.forget(account_id);
                    return Err(IdentityError::InteractionRequired);
                }
            }

            return Err(IdentityError::Provider(format!(
                "token endpoint returned {}: {}",
                status, body
            )));
        }

        let token_response: TokenRefreshResponse = response
            .json()
            .await
            .map_err(|e| IdentityError::Provider(format!("malformed token response: {}", e)))?;

        if let Some(rotated) = &token_response.refresh_token {
            self.remember(account_id, rotated);
        }

        Ok(TokenGrant {
            token: token_response.access_token,
            expires_at: token_response
                .expires_in
                .map(|secs| Utc::now() + Duration::seconds(secs)),
        })
    }

    async fn sign_out(&self, account_id: &str) -> Result<bool> {
        let refresh_token = match self.forget(account_id) {
            Some(token) => token,
            None => return Ok(false),
        };

        if let Some(revoke_url) = &self.config.revoke_url {
            let mut form = self.client_form();
            form.insert("token", refresh_token);
            form.insert("token_type_hint", "refresh_token".to_string());

            let response = self
                .http_client
                .post(revoke_url)
                .form(&form)
                .send()
                .await
                .context("Failed to send revocation request")?;

            if !response.status().is_success() {
                anyhow::bail!("Token revocation failed with status {}", response.status());
            }
        }

        info!(account_id = %account_id, "Provider session ended");
        Ok(true)
    }
}
