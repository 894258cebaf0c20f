use anyhow::{Context, Result};
use beacon::auth::{OAuthRefreshProvider, SessionAuthority, SessionEvent};
use beacon::config::{load_config, BeaconConfig, SessionConfig};
use beacon::credentials::{Credential, CredentialStore, SessionCache};
use beacon::notifications::{LogPresenter, NotificationDispatcher};
use beacon::realtime::{RealtimeConnection, WsTransport};
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::StreamExt;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "beacon=info".into()),
        )
        .init();

    info!("Beacon starting...");

    let config = match std::env::args().nth(1) {
        Some(path) => {
            load_config(&path).with_context(|| format!("Failed to load config from {}", path))?
        }
        None => {
            info!("No config file given, using defaults");
            BeaconConfig::default()
        }
    };

    let store = Arc::new(open_store(&config.session)?);

    let provider = Arc::new(OAuthRefreshProvider::new(config.identity.clone()));
    let session = Arc::new(
        SessionAuthority::new(Arc::clone(&store), &config.identity).with_provider(provider.clone()),
    );
    sign_in_from_env(&session, &provider);

    let mut session_events = session.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = session_events.recv().await {
            if event == SessionEvent::SessionExpired {
                warn!("Session expired, sign in again to resume live updates");
            }
        }
    });

    let dispatcher = Arc::new(NotificationDispatcher::new(
        Arc::new(LogPresenter),
        config.notifications.clone(),
    ));
    let mut envelopes = dispatcher.subscribe();
    tokio::spawn(async move {
        while let Some(envelope) = envelopes.next().await {
            if let Ok(envelope) = envelope {
                if let Some(topic) = envelope.topic() {
                    info!(topic = %topic, id = %envelope.id, "Notification routed");
                }
            }
        }
    });

    let transport = Arc::new(WsTransport::new(
        config.realtime.transport_retry.clone(),
        Duration::from_secs(config.realtime.connect_timeout_seconds),
        Duration::from_secs(config.realtime.invoke_timeout_seconds),
    ));
    let connection = RealtimeConnection::new(
        transport,
        Arc::clone(&session),
        dispatcher,
        config.realtime.clone(),
    );

    for topic in &config.subscriptions {
        connection.subscribe(topic.clone()).await;
    }

    if let Err(e) = connection.connect().await {
        warn!(error = %e, "Realtime connection not established");
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("Shutting down...");
    connection.disconnect().await;

    Ok(())
}

/// Credential store, persisted when a cache path and key are configured.
fn open_store(config: &SessionConfig) -> Result<CredentialStore> {
    let Some(path) = &config.cache_path else {
        return Ok(CredentialStore::new());
    };

    match std::env::var(&config.encryption_key_env) {
        Ok(key) => {
            let cache = SessionCache::open(path, &key)
                .with_context(|| format!("Failed to open session cache at {}", path.display()))?;
            info!(path = %path.display(), "Session cache opened");
            Ok(CredentialStore::with_cache(cache))
        }
        Err(_) => {
            warn!(
                env = %config.encryption_key_env,
                "No encryption key set, session will not be persisted"
            );
            Ok(CredentialStore::new())
        }
    }
}

/// Accepts the result of an out-of-process sign-in.
fn sign_in_from_env(session: &SessionAuthority, provider: &OAuthRefreshProvider) {
    let account_id = std::env::var("BEACON_ACCOUNT_ID").ok();

    if let (Some(account_id), Ok(refresh_token)) =
        (&account_id, std::env::var("BEACON_REFRESH_TOKEN"))
    {
        provider.remember(account_id, &refresh_token);
    }

    if let Ok(token) = std::env::var("BEACON_ACCESS_TOKEN") {
        let mut credential = Credential::new(token);
        if let Some(account_id) = account_id {
            credential = credential.with_account(account_id);
        }
        session.establish(credential);
    } else if session.store().get().is_none() {
        warn!("No session available, set BEACON_ACCESS_TOKEN to sign in");
    }
}
