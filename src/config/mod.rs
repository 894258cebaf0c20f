use serde::Deserialize;
use std::path::PathBuf;

use crate::realtime::{OuterBackoff, Topic, TransportRetryPolicy};

/// Complete client configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BeaconConfig {
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub session: SessionConfig,
    /// Named backend APIs
    #[serde(default)]
    pub api: Vec<ApiConfig>,
    #[serde(default)]
    pub realtime: RealtimeConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    /// Topics to join on startup
    #[serde(default)]
    pub subscriptions: Vec<Topic>,
}

/// Identity provider (OAuth token endpoint) configuration
#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    #[serde(default)]
    pub token_url: String,
    #[serde(default)]
    pub revoke_url: Option<String>,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    /// Scopes requested on every silent acquisition
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Tokens expiring within this window count as expired
    #[serde(default = "default_expiry_skew")]
    pub expiry_skew_seconds: i64,
}

fn default_expiry_skew() -> i64 {
    60
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            token_url: String::new(),
            revoke_url: None,
            client_id: String::new(),
            client_secret: None,
            scopes: Vec::new(),
            expiry_skew_seconds: default_expiry_skew(),
        }
    }
}

/// Persisted session cache
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// SQLite file. No cache when unset.
    #[serde(default)]
    pub cache_path: Option<PathBuf>,
    /// Environment variable holding the base64 AES-256 key
    #[serde(default = "default_encryption_key_env")]
    pub encryption_key_env: String,
}

fn default_encryption_key_env() -> String {
    "BEACON_ENCRYPTION_KEY".to_string()
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cache_path: None,
            encryption_key_env: default_encryption_key_env(),
        }
    }
}

/// One backend API
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub name: String,
    pub base_url: String,
    #[serde(default = "default_api_timeout")]
    pub timeout_seconds: u64,
}

fn default_api_timeout() -> u64 {
    30
}

/// Realtime hub connection
#[derive(Debug, Clone, Deserialize)]
pub struct RealtimeConfig {
    #[serde(default = "default_hub_url")]
    pub hub_url: String,
    /// Hub event carrying notification envelopes
    #[serde(default = "default_notification_target")]
    pub notification_target: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,
    #[serde(default = "default_invoke_timeout")]
    pub invoke_timeout_seconds: u64,
    #[serde(default)]
    pub transport_retry: TransportRetryPolicy,
    #[serde(default)]
    pub outer_retry: OuterBackoff,
}

fn default_hub_url() -> String {
    "ws://localhost:5000/hubs/notifications".to_string()
}

fn default_notification_target() -> String {
    "ReceiveNotification".to_string()
}

fn default_connect_timeout() -> u64 {
    15
}

fn default_invoke_timeout() -> u64 {
    10
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            hub_url: default_hub_url(),
            notification_target: default_notification_target(),
            connect_timeout_seconds: default_connect_timeout(),
            invoke_timeout_seconds: default_invoke_timeout(),
            transport_retry: TransportRetryPolicy::default(),
            outer_retry: OuterBackoff::default(),
        }
    }
}

/// Display durations per severity (milliseconds)
#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
    #[serde(default = "default_toast_ms")]
    pub info_ms: u64,
    #[serde(default = "default_toast_ms")]
    pub success_ms: u64,
    #[serde(default = "default_toast_ms")]
    pub warning_ms: u64,
    #[serde(default = "default_error_ms")]
    pub error_ms: u64,
    /// "Connected" / "Reconnected" confirmation
    #[serde(default = "default_connected_ms")]
    pub connected_ms: u64,
}

fn default_toast_ms() -> u64 {
    4000
}

fn default_error_ms() -> u64 {
    8000
}

fn default_connected_ms() -> u64 {
    3000
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            info_ms: default_toast_ms(),
            success_ms: default_toast_ms(),
            warning_ms: default_toast_ms(),
            error_ms: default_error_ms(),
            connected_ms: default_connected_ms(),
        }
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> anyhow::Result<BeaconConfig> {
    let contents = std::fs::read_to_string(path)?;
    let config: BeaconConfig = toml::from_str(&contents)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BeaconConfig::default();
        assert_eq!(config.identity.expiry_skew_seconds, 60);
        assert_eq!(config.session.encryption_key_env, "BEACON_ENCRYPTION_KEY");
        assert_eq!(config.realtime.notification_target, "ReceiveNotification");
        assert_eq!(config.realtime.connect_timeout_seconds, 15);
        assert_eq!(config.realtime.outer_retry.max_attempts, 5);
        assert_eq!(config.notifications.error_ms, 8000);
        assert!(config.api.is_empty());
        assert!(config.subscriptions.is_empty());
    }

    #[test]
    fn test_config_deserialization() {
        let toml = r#"
            [identity]
            token_url = "https://login.example.com/oauth2/token"
            client_id = "dashboard"
            scopes = ["api://monitor/read"]

            [session]
            cache_path = "/tmp/beacon-session.db"

            [[api]]
            name = "monitor"
            base_url = "https://api.example.com/monitor"

            [[api]]
            name = "billing"
            base_url = "https://api.example.com/billing"
            timeout_seconds = 5

            [realtime]
            hub_url = "wss://hub.example.com/notifications"

            [realtime.transport_retry]
            short_attempts = 2

            [realtime.outer_retry]
            max_delay_ms = 10000

            [notifications]
            error_ms = 12000

            [[subscriptions]]
            kind = "monitor"
            id = 42

            [[subscriptions]]
            kind = "environment"
            id = "prod"
        "#;

        let config: BeaconConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.identity.client_id, "dashboard");
        assert_eq!(config.identity.expiry_skew_seconds, 60);
        assert_eq!(
            config.session.cache_path,
            Some(PathBuf::from("/tmp/beacon-session.db"))
        );
        assert_eq!(config.api.len(), 2);
        assert_eq!(config.api[0].timeout_seconds, 30);
        assert_eq!(config.api[1].timeout_seconds, 5);
        assert_eq!(config.realtime.hub_url, "wss://hub.example.com/notifications");
        assert_eq!(config.realtime.transport_retry.short_attempts, 2);
        assert_eq!(config.realtime.transport_retry.short_delay_ms, 2000);
        assert_eq!(config.realtime.outer_retry.max_delay_ms, 10000);
        assert_eq!(config.notifications.error_ms, 12000);
        assert_eq!(config.notifications.info_ms, 4000);
        assert_eq!(
            config.subscriptions,
            vec![Topic::monitor(42), Topic::environment("prod")]
        );
    }

    #[test]
    fn test_partial_config() {
        // Missing sections use defaults
        let toml = r#"
            [realtime]
            connect_timeout_seconds = 3
        "#;

        let config: BeaconConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.realtime.connect_timeout_seconds, 3);
        assert_eq!(config.realtime.invoke_timeout_seconds, 10); // Default
        assert_eq!(config.notifications.success_ms, 4000); // Default
    }
}
