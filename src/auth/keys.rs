//! auth/keys.rs
//! Hash-only API key store: creation, validation, rotation, revocation.
//!
//! - Owns a single SQLite connection (WAL) guarded by a mutex.
//! - Only the bcrypt hash of a key is ever written; the plaintext is returned
//!   to the caller exactly once at creation/rotation.
//! - Validation results are cached in a bounded LRU; the only permitted
//!   invalidation is a global clear, performed synchronously by rotate and
//!   revoke before they return.
//! - File permissions are forced to owner-only on every open.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use lru::LruCache;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use thiserror::Error;

use crate::utils::generate_scan_id;

/// Plaintext key prefix. A full key is `ong-<26-char-ULID>`, 30 chars total.
pub const KEY_PREFIX: &str = "ong-";

/// bcrypt cost factor. Fixed: lowering it weakens every stored hash.
const BCRYPT_COST: u32 = 12;

/// Maximum simultaneously active keys per user.
const MAX_KEYS_PER_USER: i64 = 2;

/// Validation cache capacity (plaintext → user_id).
const CACHE_CAPACITY: usize = 1024;

const SCHEMA_VERSION: i32 = 1;

const CREATE_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS api_keys (
    id            TEXT PRIMARY KEY,
    key_hash      TEXT NOT NULL,
    user_id       TEXT NOT NULL,
    created_at    TEXT NOT NULL,
    last_used_at  TEXT,
    active        INTEGER NOT NULL DEFAULT 1
);

CREATE INDEX IF NOT EXISTS idx_keys_user_active ON api_keys (user_id, active);
"#;

// ─── Errors ─────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum KeyStoreError {
    /// The per-user active-key ceiling was hit. Maps to HTTP 400,
    /// code `key_limit_exceeded`.
    #[error("Maximum active keys ({MAX_KEYS_PER_USER}) reached. Revoke an existing key before creating a new one.")]
    KeyLimitExceeded,

    /// The referenced key is absent, revoked, or owned by someone else.
    /// Maps to HTTP 400 on rotate, 404 on revoke.
    #[error("Invalid or revoked API key")]
    InvalidKey,

    /// On-disk schema marker is neither 0 (fresh) nor the expected version.
    /// Startup must refuse to run.
    #[error("unsupported key store schema version {found}; delete the keys database or run a migration")]
    SchemaMismatch { found: i32 },

    #[error(transparent)]
    Db(#[from] rusqlite::Error),

    #[error(transparent)]
    Hash(#[from] bcrypt::BcryptError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Masked listing entry for the dashboard. The plaintext is unrecoverable.
#[derive(Debug, Clone, Serialize)]
pub struct MaskedKey {
    pub id: String,
    pub masked_key: String,
    pub created_at: String,
    pub last_used_at: Option<String>,
}

// ─── KeyStore ───────────────────────────────────────────────────────────────

pub struct KeyStore {
    conn: Mutex<Connection>,
    cache: Mutex<LruCache<String, String>>,
    path: PathBuf,
}

impl KeyStore {
    /// Open (or create) the key store at `path`.
    ///
    /// Idempotent. Enables WAL, applies the schema on a fresh file, forces
    /// owner-only permissions on every call, and enforces the schema-version
    /// guard: a marker other than 0 or 1 is a startup refusal.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, KeyStoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        match version {
            0 => {
                conn.execute_batch(CREATE_SCHEMA_SQL)?;
                conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
                tracing::debug!(path = %path.display(), "key store schema created");
            }
            SCHEMA_VERSION => {}
            other => return Err(KeyStoreError::SchemaMismatch { found: other }),
        }

        // Owner read/write only, regardless of the umask at creation time.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        }

        let capacity = NonZeroUsize::new(CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            conn: Mutex::new(conn),
            cache: Mutex::new(LruCache::new(capacity)),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Generate, hash, and store a new key for `user_id`.
    ///
    /// Returns `(plaintext, hash)`. The plaintext is shown to the caller
    /// exactly once and never persisted.
    ///
    /// # Errors
    /// [`KeyStoreError::KeyLimitExceeded`] once the user holds
    /// `MAX_KEYS_PER_USER` active keys.
    pub fn create_key(&self, user_id: &str) -> Result<(String, String), KeyStoreError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());

        let active: i64 = conn.query_row(
            "SELECT COUNT(*) FROM api_keys WHERE user_id = ?1 AND active = 1",
            [user_id],
            |row| row.get(0),
        )?;
        if active >= MAX_KEYS_PER_USER {
            return Err(KeyStoreError::KeyLimitExceeded);
        }

        let (key_id, plaintext, key_hash) = mint_key()?;
        let now = now_iso();
        conn.execute(
            "INSERT INTO api_keys (id, key_hash, user_id, created_at, active) \
             VALUES (?1, ?2, ?3, ?4, 1)",
            (&key_id, &key_hash, user_id, &now),
        )?;

        tracing::info!(user_id, key_id = %key_id, "API key created");
        Ok((plaintext, key_hash))
    }

    /// Validate a plaintext key. Returns the owning `user_id`, or `None`.
    ///
    /// Flow: format gate → cache lookup → active-row lookup by the ULID
    /// suffix → bcrypt verify (the slow path) → cache insert → fire-and-forget
    /// `last_used_at` touch. Any database error degrades to `None`.
    pub fn validate(&self, key: &str) -> Option<String> {
        if !key.starts_with(KEY_PREFIX) || key.len() < 12 {
            return None;
        }

        if let Ok(mut cache) = self.cache.lock() {
            if let Some(user_id) = cache.get(key) {
                return Some(user_id.clone());
            }
        }

        let key_id = &key[KEY_PREFIX.len()..];
        let row: Option<(String, String)> = {
            let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
            match conn
                .query_row(
                    "SELECT key_hash, user_id FROM api_keys WHERE id = ?1 AND active = 1",
                    [key_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
            {
                Ok(row) => row,
                Err(err) => {
                    tracing::warn!(error = %err, "key validation DB error");
                    return None;
                }
            }
        };
        let (key_hash, user_id) = row?;

        match bcrypt::verify(key, &key_hash) {
            Ok(true) => {}
            Ok(false) => return None,
            Err(err) => {
                tracing::warn!(error = %err, "bcrypt verify error");
                return None;
            }
        }

        if let Ok(mut cache) = self.cache.lock() {
            cache.put(key.to_string(), user_id.clone());
        }

        self.touch_last_used(key_id);
        Some(user_id)
    }

    /// Rotate a key given its full plaintext. One atomic commit inserts the
    /// replacement and deactivates the old row; the validation cache is
    /// cleared before this returns so no stale hit survives.
    pub fn rotate_by_plaintext(
        &self,
        user_id: &str,
        old_key: &str,
    ) -> Result<(String, String), KeyStoreError> {
        if !old_key.starts_with(KEY_PREFIX) || old_key.len() < 30 {
            return Err(KeyStoreError::InvalidKey);
        }
        self.rotate_by_id(user_id, &old_key[KEY_PREFIX.len()..])
    }

    /// Rotate a key by its id (the ULID column value). Used by the dashboard
    /// where the plaintext is long gone.
    pub fn rotate_by_id(
        &self,
        user_id: &str,
        old_key_id: &str,
    ) -> Result<(String, String), KeyStoreError> {
        let (new_key_id, plaintext, key_hash) = mint_key()?;
        {
            let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());

            let owned: Option<String> = conn
                .query_row(
                    "SELECT id FROM api_keys WHERE id = ?1 AND user_id = ?2 AND active = 1",
                    [old_key_id, user_id],
                    |row| row.get(0),
                )
                .optional()?;
            if owned.is_none() {
                return Err(KeyStoreError::InvalidKey);
            }

            let now = now_iso();
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO api_keys (id, key_hash, user_id, created_at, active) \
                 VALUES (?1, ?2, ?3, ?4, 1)",
                (&new_key_id, &key_hash, user_id, &now),
            )?;
            tx.execute(
                "UPDATE api_keys SET active = 0 WHERE id = ?1 AND user_id = ?2",
                [old_key_id, user_id],
            )?;
            tx.commit()?;
        }

        // Synchronous by contract: a cached hit for the old key must not
        // outlive this call.
        self.clear_cache();

        tracing::info!(
            user_id,
            old_key_id = &old_key_id[..old_key_id.len().min(8)],
            new_key_id = &new_key_id[..8],
            "API key rotated"
        );
        Ok((plaintext, key_hash))
    }

    /// Deactivate a key owned by `user_id`. Returns whether a row changed.
    /// Clears the validation cache before returning.
    pub fn revoke(&self, user_id: &str, key_id: &str) -> Result<bool, KeyStoreError> {
        let changed = {
            let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
            conn.execute(
                "UPDATE api_keys SET active = 0 \
                 WHERE id = ?1 AND user_id = ?2 AND active = 1",
                [key_id, user_id],
            )?
        };

        self.clear_cache();

        if changed > 0 {
            tracing::info!(user_id, key_id, "API key revoked");
        }
        Ok(changed > 0)
    }

    /// Active keys for a user, newest first, masked (`ong-...XXXX`).
    pub fn list(&self, user_id: &str) -> Result<Vec<MaskedKey>, KeyStoreError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT id, created_at, last_used_at FROM api_keys \
             WHERE user_id = ?1 AND active = 1 ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map([user_id], |row| {
            let id: String = row.get(0)?;
            let tail = id[id.len().saturating_sub(4)..].to_string();
            Ok(MaskedKey {
                masked_key: format!("{KEY_PREFIX}...{tail}"),
                id,
                created_at: row.get(1)?,
                last_used_at: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Drop every cached validation. The next `validate` for any key hits
    /// the database and the bcrypt verify again.
    pub fn clear_cache(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }
        tracing::debug!("key validation cache cleared");
    }

    // ── Internal ───────────────────────────────────────────────────────────

    /// Best-effort `last_used_at` bump on a separate connection so the
    /// validation path never waits on it.
    fn touch_last_used(&self, key_id: &str) {
        let path = self.path.clone();
        let key_id = key_id.to_string();
        let spawned = std::thread::Builder::new()
            .name("key_last_used".into())
            .spawn(move || {
                let update = || -> Result<(), rusqlite::Error> {
                    let conn = Connection::open(&path)?;
                    conn.busy_timeout(Duration::from_secs(5))?;
                    conn.execute(
                        "UPDATE api_keys SET last_used_at = ?1 WHERE id = ?2",
                        (&now_iso(), &key_id),
                    )?;
                    Ok(())
                };
                if let Err(err) = update() {
                    tracing::debug!(key_id = %key_id, error = %err, "failed to update last_used_at");
                }
            });
        if let Err(err) = spawned {
            tracing::debug!(error = %err, "failed to spawn last_used_at update");
        }
    }
}

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Generate a fresh key id, plaintext, and bcrypt hash.
fn mint_key() -> Result<(String, String, String), KeyStoreError> {
    let key_id = generate_scan_id();
    let plaintext = format!("{KEY_PREFIX}{key_id}");
    // Intentionally slow (~80 ms); paid once per creation or cache miss.
    let key_hash = bcrypt::hash(&plaintext, BCRYPT_COST)?;
    Ok((key_id, plaintext, key_hash))
}
