//! Persisted session cache backed by SQLite.
//!
//! Holds exactly two well-known keys: the sealed bearer token and the account
//! record (id + expiry). Both are written and removed in one transaction so a
//! reader never sees one without the other.

use super::{encryption, Credential};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Mutex, PoisonError};

/// Key holding the sealed bearer token.
pub const TOKEN_KEY: &str = "session.token";

/// Key holding the account record as JSON.
pub const ACCOUNT_KEY: &str = "session.account";

#[derive(Debug, Serialize, Deserialize)]
struct AccountRecord {
    account_id: Option<String>,
    expires_at: Option<DateTime<Utc>>,
}

/// Encrypted key/value session cache.
///
/// # Schema
/// ```sql
/// CREATE TABLE session_kv (
///     key TEXT PRIMARY KEY,
///     value TEXT NOT NULL,
///     updated_at TEXT NOT NULL      -- ISO 8601 timestamp
/// );
/// ```
pub struct SessionCache {
    conn: Mutex<Connection>,
    encryption_key: Vec<u8>,
}

impl SessionCache {
    /// Opens (or creates) the cache at `db_path`.
    ///
    /// `encryption_key` is a base64-encoded 32-byte key. Pass `":memory:"` as
    /// the path for a throwaway cache.
    pub fn open<P: AsRef<Path>>(db_path: P, encryption_key: &str) -> Result<Self> {
        let key_bytes =
            encryption::validate_key(encryption_key).context("Invalid encryption key")?;

        let conn = Connection::open(db_path).context("Failed to open session cache")?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS session_kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            [],
        )
        .context("Failed to create session_kv table")?;

        Ok(Self {
            conn: Mutex::new(conn),
            encryption_key: key_bytes,
        })
    }

    /// Persists `credential`, replacing whatever was cached.
    pub fn save(&self, credential: &Credential) -> Result<()> {
        let sealed = encryption::seal(&credential.token, &self.encryption_key)
            .context("Failed to encrypt bearer token")?;
        let account = serde_json::to_string(&AccountRecord {
            account_id: credential.account_id.clone(),
            expires_at: credential.expires_at,
        })?;
        let now = Utc::now().to_rfc3339();

        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = conn.transaction().context("Failed to begin transaction")?;
        for (key, value) in [(TOKEN_KEY, &sealed), (ACCOUNT_KEY, &account)] {
            tx.execute(
                r#"
                INSERT INTO session_kv (key, value, updated_at)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    updated_at = excluded.updated_at
                "#,
                params![key, value, now],
            )
            .with_context(|| format!("Failed to write {}", key))?;
        }
        tx.commit().context("Failed to commit session cache")?;

        Ok(())
    }

    /// Loads the cached credential.
    ///
    /// Returns `Ok(None)` when nothing is cached or when only one of the two
    /// keys is present.
    pub fn load(&self) -> Result<Option<Credential>> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);

        let read = |key: &str| -> Result<Option<String>> {
            conn.query_row(
                "SELECT value FROM session_kv WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("Failed to read {}", key))
        };

        let (sealed, account) = match (read(TOKEN_KEY)?, read(ACCOUNT_KEY)?) {
            (Some(sealed), Some(account)) => (sealed, account),
            (None, None) => return Ok(None),
            _ => {
                tracing::warn!("Session cache holds a partial entry, ignoring it");
                return Ok(None);
            }
        };

        let token = encryption::open(&sealed, &self.encryption_key)
            .context("Failed to decrypt cached token")?;
        let account: AccountRecord =
            serde_json::from_str(&account).context("Failed to parse cached account")?;

        Ok(Some(Credential {
            token,
            expires_at: account.expires_at,
            account_id: account.account_id,
        }))
    }

    /// Removes both keys.
    pub fn clear(&self) -> Result<()> {
        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = conn.transaction().context("Failed to begin transaction")?;
        tx.execute(
            "DELETE FROM session_kv WHERE key IN (?1, ?2)",
            params![TOKEN_KEY, ACCOUNT_KEY],
        )
        .context("Failed to clear session cache")?;
        tx.commit().context("Failed to commit session cache")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use chrono::Duration;
    use tempfile::TempDir;

    fn test_key() -> String {
        BASE64.encode([42u8; 32])
    }

    fn credential() -> Credential {
        Credential {
            token: "bearer-abc".to_string(),
            expires_at: Some(Utc::now() + Duration::hours(1)),
            account_id: Some("alice@example.com".to_string()),
        }
    }

    #[test]
    fn test_empty_cache_loads_none() {
        let cache = SessionCache::open(":memory:", &test_key()).unwrap();
        assert!(cache.load().unwrap().is_none());
    }

    #[test]
    fn test_save_and_load() {
        let cache = SessionCache::open(":memory:", &test_key()).unwrap();
        let cred = credential();
        cache.save(&cred).unwrap();

        let loaded = cache.load().unwrap().unwrap();
        assert_eq!(loaded.token, cred.token);
        assert_eq!(loaded.account_id, cred.account_id);
        assert_eq!(
            loaded.expires_at.unwrap().timestamp(),
            cred.expires_at.unwrap().timestamp()
        );
    }

    #[test]
    fn test_token_encrypted_at_rest() {
        let cache = SessionCache::open(":memory:", &test_key()).unwrap();
        cache.save(&credential()).unwrap();

        let conn = cache.conn.lock().unwrap();
        let raw: String = conn
            .query_row(
                "SELECT value FROM session_kv WHERE key = ?1",
                params![TOKEN_KEY],
                |row| row.get(0),
            )
            .unwrap();
        assert!(!raw.contains("bearer-abc"));
    }

    #[test]
    fn test_save_replaces_previous() {
        let cache = SessionCache::open(":memory:", &test_key()).unwrap();
        cache.save(&credential()).unwrap();
        cache
            .save(&Credential {
                token: "bearer-new".to_string(),
                expires_at: None,
                account_id: None,
            })
            .unwrap();

        let loaded = cache.load().unwrap().unwrap();
        assert_eq!(loaded.token, "bearer-new");
        assert_eq!(loaded.account_id, None);
        assert_eq!(loaded.expires_at, None);
    }

    #[test]
    fn test_clear_removes_both_keys() {
        let cache = SessionCache::open(":memory:", &test_key()).unwrap();
        cache.save(&credential()).unwrap();
        cache.clear().unwrap();

        assert!(cache.load().unwrap().is_none());
        let conn = cache.conn.lock().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM session_kv", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_partial_entry_ignored() {
        let cache = SessionCache::open(":memory:", &test_key()).unwrap();
        cache.save(&credential()).unwrap();
        cache
            .conn
            .lock()
            .unwrap()
            .execute("DELETE FROM session_kv WHERE key = ?1", params![ACCOUNT_KEY])
            .unwrap();

        assert!(cache.load().unwrap().is_none());
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("session.db");

        SessionCache::open(&path, &test_key())
            .unwrap()
            .save(&credential())
            .unwrap();

        let reopened = SessionCache::open(&path, &test_key()).unwrap();
        assert_eq!(reopened.load().unwrap().unwrap().token, "bearer-abc");
    }

    #[test]
    fn test_wrong_key_fails_to_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("session.db");

        SessionCache::open(&path, &test_key())
            .unwrap()
            .save(&credential())
            .unwrap();

        let other = SessionCache::open(&path, &BASE64.encode([1u8; 32])).unwrap();
        assert!(other.load().is_err());
    }

    #[test]
    fn test_invalid_key_rejected() {
        assert!(SessionCache::open(":memory:", "short").is_err());
    }
}
