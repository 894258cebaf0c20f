//! Credential store: the single owner of the current bearer token.
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       CredentialStore                    │
//! │  - one current credential (or none)      │
//! │  - generation counter (last write wins)  │
//! │  - watch channel for change notification │
//! └─────────────────────────────────────────┘
//!          ↓ write-through        ↑ restore
//! ┌─────────────────────────────────────────┐
//! │       SessionCache (optional)            │
//! │  - SQLite key/value, two well-known keys │
//! │  - token sealed with AES-256-GCM         │
//! └─────────────────────────────────────────┘
//! ```
//!
//! Readers never poll: they call [`CredentialStore::subscribe`] and react to
//! changes on the returned `watch::Receiver`.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{PoisonError, RwLock};
use tokio::sync::watch;
use tracing::{debug, warn};

mod cache;
mod encryption;

pub use cache::{SessionCache, ACCOUNT_KEY, TOKEN_KEY};
pub use encryption::validate_key;

/// Bearer credential plus the minimal account identity it belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// Opaque bearer token
    pub token: String,

    /// When the token stops being valid, if known
    pub expires_at: Option<DateTime<Utc>>,

    /// Identity-provider account the token was issued for
    pub account_id: Option<String>,
}

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            expires_at: None,
            account_id: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }

    /// True when the expiry is known and falls within `skew` of `now`.
    ///
    /// A credential with unknown expiry is never considered expired.
    pub fn is_expired_at(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at <= now + skew,
            None => false,
        }
    }
}

#[derive(Default)]
struct Slot {
    credential: Option<Credential>,
    generation: u64,
}

/// Process-wide holder of the current credential.
///
/// Setting a credential replaces the previous one entirely. Every write
/// (set or clear) bumps the generation, which lets a slow silent refresh detect
/// that it has been overtaken.
pub struct CredentialStore {
    slot: RwLock<Slot>,
    changes: watch::Sender<Option<Credential>>,
    cache: Option<SessionCache>,
}

impl CredentialStore {
    /// In-memory store with nothing cached.
    pub fn new() -> Self {
        let (changes, _) = watch::channel(None);
        Self {
            slot: RwLock::new(Slot::default()),
            changes,
            cache: None,
        }
    }

    /// Store that restores from and writes through to `cache`.
    ///
    /// A cache that cannot be read starts the store empty.
    pub fn with_cache(cache: SessionCache) -> Self {
        let restored = match cache.load() {
            Ok(credential) => credential,
            Err(e) => {
                warn!(error = %e, "Failed to restore cached session, starting signed out");
                None
            }
        };
        if restored.is_some() {
            debug!("Restored cached session");
        }

        let (changes, _) = watch::channel(restored.clone());
        Self {
            slot: RwLock::new(Slot {
                credential: restored,
                generation: 0,
            }),
            changes,
            cache: Some(cache),
        }
    }

    /// Current credential, if any.
    pub fn get(&self) -> Option<Credential> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .credential
            .clone()
    }

    /// Generation of the most recent write.
    pub fn generation(&self) -> u64 {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .generation
    }

    /// Replaces the current credential.
    pub fn set(&self, credential: Credential) {
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        self.commit(&mut slot, Some(credential));
    }

    /// Replaces the current credential only if no write happened since
    /// `expected` was read from [`generation`](Self::generation).
    pub fn replace_if_generation(&self, expected: u64, credential: Credential) -> bool {
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        if slot.generation != expected {
            return false;
        }
        self.commit(&mut slot, Some(credential));
        true
    }

    /// Removes the credential and the cached account together.
    ///
    /// Returns whether a credential was present.
    pub fn clear(&self) -> bool {
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        let had = slot.credential.is_some();
        self.commit(&mut slot, None);
        had
    }

    /// Change notifications; the receiver always holds the latest value.
    pub fn subscribe(&self) -> watch::Receiver<Option<Credential>> {
        self.changes.subscribe()
    }

    fn commit(&self, slot: &mut Slot, credential: Option<Credential>) {
        if let Some(cache) = &self.cache {
            let result = match &credential {
                Some(credential) => cache.save(credential),
                None => cache.clear(),
            };
            if let Err(e) = result {
                warn!(error = %e, "Session cache write failed");
            }
        }

        slot.generation += 1;
        slot.credential = credential.clone();
        self.changes.send_replace(credential);
    }
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

    fn cache() -> SessionCache {
        SessionCache::open(":memory:", &BASE64.encode([3u8; 32])).unwrap()
    }

    #[test]
    fn test_set_replaces_entirely() {
        let store = CredentialStore::new();
        store.set(Credential::new("first").with_account("alice"));
        store.set(Credential::new("second"));

        let current = store.get().unwrap();
        assert_eq!(current.token, "second");
        assert_eq!(current.account_id, None);
    }

    #[test]
    fn test_clear_reports_presence() {
        let store = CredentialStore::new();
        assert!(!store.clear());
        store.set(Credential::new("tok"));
        assert!(store.clear());
        assert!(store.get().is_none());
    }

    #[test]
    fn test_generation_bumps_on_every_write() {
        let store = CredentialStore::new();
        assert_eq!(store.generation(), 0);
        store.set(Credential::new("a"));
        store.clear();
        assert_eq!(store.generation(), 2);
    }

    #[test]
    fn test_replace_if_generation() {
        let store = CredentialStore::new();
        let seen = store.generation();
        store.set(Credential::new("newer"));

        assert!(!store.replace_if_generation(seen, Credential::new("stale")));
        assert_eq!(store.get().unwrap().token, "newer");

        let seen = store.generation();
        assert!(store.replace_if_generation(seen, Credential::new("fresh")));
        assert_eq!(store.get().unwrap().token, "fresh");
    }

    #[test]
    fn test_subscribers_see_latest_write() {
        let store = CredentialStore::new();
        let mut rx = store.subscribe();
        assert!(rx.borrow().is_none());

        store.set(Credential::new("tok"));
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().as_ref().unwrap().token, "tok");

        store.clear();
        assert!(rx.borrow_and_update().is_none());
    }

    #[test]
    fn test_expiry_with_skew() {
        let now = Utc::now();
        let cred = Credential::new("t").with_expiry(now + Duration::seconds(30));
        assert!(!cred.is_expired_at(now, Duration::zero()));
        assert!(cred.is_expired_at(now, Duration::seconds(60)));
        assert!(!Credential::new("t").is_expired_at(now, Duration::days(365)));
    }

    #[test]
    fn test_write_through_cache() {
        let store = CredentialStore::with_cache(cache());
        store.set(Credential::new("cached").with_account("bob"));

        let loaded = store.cache.as_ref().unwrap().load().unwrap().unwrap();
        assert_eq!(loaded.token, "cached");
        assert_eq!(loaded.account_id.as_deref(), Some("bob"));

        store.clear();
        assert!(store.cache.as_ref().unwrap().load().unwrap().is_none());
    }

    #[test]
    fn test_restores_from_cache() {
        let cache = cache();
        cache.save(&Credential::new("restored")).unwrap();

        let store = CredentialStore::with_cache(cache);
        assert_eq!(store.get().unwrap().token, "restored");
        assert_eq!(store.subscribe().borrow().as_ref().unwrap().token, "restored");
    }
}
