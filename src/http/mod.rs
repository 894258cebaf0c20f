//! Authenticated clients for the backend HTTP APIs.
//!
//! Every request goes through the session authority: the bearer header is
//! attached just before sending and every response status is reported back,
//! so a 401 from any API ends the session exactly once.

use crate::auth::SessionAuthority;
use crate::config::ApiConfig;
use crate::error::ClientError;
use anyhow::Context;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("{method} {url} returned {status}")]
    Status {
        method: Method,
        url: String,
        status: StatusCode,
    },
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Builds one [`ApiClient`] per configured API, all sharing one session.
pub struct ApiClientFactory {
    clients: HashMap<String, ApiClient>,
}

impl ApiClientFactory {
    pub fn new(apis: &[ApiConfig], session: Arc<SessionAuthority>) -> anyhow::Result<Self> {
        let mut clients = HashMap::new();
        for api in apis {
            let http = reqwest::Client::builder()
                .timeout(Duration::from_secs(api.timeout_seconds))
                .build()
                .with_context(|| format!("Failed to build HTTP client for {}", api.name))?;

            clients.insert(
                api.name.clone(),
                ApiClient {
                    name: api.name.clone(),
                    base_url: api.base_url.trim_end_matches('/').to_string(),
                    http,
                    session: Arc::clone(&session),
                },
            );
        }
        Ok(Self { clients })
    }

    pub fn client(&self, name: &str) -> Option<ApiClient> {
        self.clients.get(name).cloned()
    }
}

#[derive(Clone)]
pub struct ApiClient {
    name: String,
    base_url: String,
    http: reqwest::Client,
    session: Arc<SessionAuthority>,
}

impl ApiClient {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let response = self.send(Method::GET, path, None::<&()>).await?;
        Ok(response.json().await?)
    }

    pub async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let response = self.send(Method::POST, path, Some(body)).await?;
        Ok(response.json().await?)
    }

    /// Sends one request with the current bearer token.
    ///
    /// A 401 is reported to the session authority and returned as
    /// [`ClientError::Unauthorized`]. Other non-success statuses become
    /// [`ApiError::Status`].
    pub async fn send<B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<reqwest::Response, ApiError> {
        // Refresh first when the token is about to expire. Without one the
        // request still goes out and the server decides.
        if let Err(e) = self.session.get_token().await {
            debug!(api = %self.name, error = %e, "Sending without a fresh token");
        }

        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let mut builder = self.http.request(method.clone(), &url);
        if let Some(body) = body {
            builder = builder.json(body);
        }
        let request = self.session.attach(builder.build()?);

        let response = self.http.execute(request).await?;
        let status = response.status();
        debug!(api = %self.name, method = %method, url = %url, status = status.as_u16(), "API response");

        if status == StatusCode::UNAUTHORIZED {
            self.session.on_unauthorized(status);
            return Err(ClientError::Unauthorized.into());
        }
        if !status.is_success() {
            return Err(ApiError::Status {
                method,
                url,
                status,
            });
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::SessionEvent;
    use crate::config::IdentityConfig;
    use crate::credentials::{Credential, CredentialStore};
    use serde_json::{json, Value};

    fn session() -> Arc<SessionAuthority> {
        Arc::new(SessionAuthority::new(
            Arc::new(CredentialStore::new()),
            &IdentityConfig::default(),
        ))
    }

    fn factory(server_url: &str, session: &Arc<SessionAuthority>) -> ApiClientFactory {
        let apis = vec![ApiConfig {
            name: "monitor".to_string(),
            base_url: format!("{}/api/", server_url),
            timeout_seconds: 5,
        }];
        ApiClientFactory::new(&apis, Arc::clone(session)).unwrap()
    }

    #[tokio::test]
    async fn test_unknown_api() {
        let factory = ApiClientFactory::new(&[], session()).unwrap();
        assert!(factory.client("monitor").is_none());
    }

    #[tokio::test]
    async fn test_bearer_attached() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/monitors/42")
            .match_header("authorization", "Bearer tok-1")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id":42,"name":"checkout"}"#)
            .create_async()
            .await;

        let session = session();
        session.establish(Credential::new("tok-1"));
        let client = factory(&server.url(), &session).client("monitor").unwrap();

        let body: Value = client.get_json("/monitors/42").await.unwrap();
        assert_eq!(body, json!({"id": 42, "name": "checkout"}));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_no_credential_sends_without_header() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/health")
            .match_header("authorization", mockito::Matcher::Missing)
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let session = session();
        let client = factory(&server.url(), &session).client("monitor").unwrap();
        let _: Value = client.get_json("health").await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_unauthorized_ends_session_once() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/monitors")
            .with_status(401)
            .expect(8)
            .create_async()
            .await;

        let session = session();
        session.establish(Credential::new("revoked"));
        let mut events = session.subscribe();
        let client = factory(&server.url(), &session).client("monitor").unwrap();

        let calls: Vec<_> = (0..8)
            .map(|_| {
                let client = client.clone();
                tokio::spawn(async move { client.get_json::<Value>("monitors").await })
            })
            .collect();
        for call in calls {
            let result = call.await.unwrap();
            assert!(matches!(
                result,
                Err(ApiError::Client(ClientError::Unauthorized))
            ));
        }

        assert!(session.store().get().is_none());
        assert_eq!(events.try_recv().unwrap(), SessionEvent::SessionExpired);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_server_error_keeps_session() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/monitors")
            .with_status(500)
            .create_async()
            .await;

        let session = session();
        session.establish(Credential::new("tok-1"));
        let client = factory(&server.url(), &session).client("monitor").unwrap();

        let result = client
            .post_json::<_, Value>("monitors", &json!({"name": "new"}))
            .await;
        assert!(matches!(
            result,
            Err(ApiError::Status { status, .. }) if status == StatusCode::INTERNAL_SERVER_ERROR
        ));
        assert!(session.store().get().is_some());
    }
}
