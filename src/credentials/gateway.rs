//! Durable storage of agent credential records.
//!
//! The gateway deals only in ciphertext; encryption happens in the credential store.
//! Every handshake state change is its own named operation so the invariant-carrying
//! side effects (clearing the other token pair) cannot be skipped by a narrower update.

use super::AgentId;
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use rusqlite::{params, types::Type, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// One row of `agent_credentials`. Secret and access-token columns hold ciphertext.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentCredentialRecord {
    pub agent_id: AgentId,
    pub temporary_request_token: Option<String>,
    pub temporary_request_secret: Option<String>,
    pub permanent_access_token: Option<String>,
    pub permanent_access_secret: Option<String>,
    pub external_user_id: Option<String>,
    pub external_handle: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Permanent pair as written to storage (token and secret already encrypted).
#[derive(Clone, Debug)]
pub struct SealedPermanent {
    pub access_token: String,
    pub access_secret: String,
    pub external_user_id: String,
    pub external_handle: String,
}

/// Storage interface for credential records.
///
/// Mutating transitions return the temporary request token they displaced (if any) so
/// callers can invalidate anything keyed by it.
pub trait PersistenceGateway: Send + Sync {
    /// Starts (or restarts) a handshake.
    ///
    /// Creates the record if absent. On an existing record, sets the temporary pair and
    /// clears the permanent pair and external identity: re-authentication invalidates
    /// the prior session.
    fn begin_handshake(
        &self,
        agent_id: &AgentId,
        request_token: &str,
        sealed_request_secret: &str,
    ) -> Result<Option<String>>;

    /// Stores the permanent pair and clears the temporary pair in one conditional write.
    ///
    /// Applies only while `request_token` is still the agent's in-flight handshake.
    /// Returns false, leaving the record untouched, when it was superseded, consumed
    /// or cleared in the meantime.
    fn complete_handshake(
        &self,
        agent_id: &AgentId,
        request_token: &str,
        permanent: &SealedPermanent,
    ) -> Result<bool>;

    /// Clears the temporary pair only if it still belongs to `request_token`.
    fn abandon_handshake(&self, agent_id: &AgentId, request_token: &str) -> Result<bool>;

    /// Clears the temporary pair. No-op if there is no record or no pair.
    fn clear_temporary(&self, agent_id: &AgentId) -> Result<Option<String>>;

    fn find_by_request_token(&self, request_token: &str) -> Result<Option<AgentCredentialRecord>>;

    fn find_by_agent(&self, agent_id: &AgentId) -> Result<Option<AgentCredentialRecord>>;

    /// Removes the record. Returns what was removed, if anything.
    fn delete(&self, agent_id: &AgentId) -> Result<Option<AgentCredentialRecord>>;

    /// All records holding a permanent pair.
    fn list_connected(&self) -> Result<Vec<AgentCredentialRecord>>;
}

const SELECT_COLUMNS: &str = r#"
    SELECT agent_id,
           temporary_request_token, temporary_request_secret,
           permanent_access_token, permanent_access_secret,
           external_user_id, external_handle,
           created_at, updated_at
    FROM agent_credentials
"#;

/// Credential gateway backed by SQLite.
///
/// # Schema
/// ```sql
/// CREATE TABLE agent_credentials (
///     agent_id TEXT PRIMARY KEY,
///     temporary_request_token TEXT,    -- Plaintext (lookup key)
///     temporary_request_secret TEXT,   -- Encrypted
///     permanent_access_token TEXT,     -- Encrypted
///     permanent_access_secret TEXT,    -- Encrypted
///     external_user_id TEXT,
///     external_handle TEXT,
///     created_at TEXT NOT NULL,        -- ISO 8601 timestamp
///     updated_at TEXT NOT NULL         -- ISO 8601 timestamp
/// );
/// ```
///
/// # Thread Safety
/// - Connection is wrapped in Mutex for safe concurrent access
/// - Read-modify-write transitions run inside a transaction
pub struct SqliteGateway {
    conn: Mutex<Connection>,
}

impl SqliteGateway {
    /// Creates or opens the credential database. `":memory:"` gives a private
    /// in-memory database.
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path).context("Failed to open credential database")?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS agent_credentials (
                agent_id TEXT PRIMARY KEY,
                temporary_request_token TEXT,
                temporary_request_secret TEXT,
                permanent_access_token TEXT,
                permanent_access_secret TEXT,
                external_user_id TEXT,
                external_handle TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            [],
        )
        .context("Failed to create agent_credentials table")?;

        // NULLs don't collide, so only in-flight tokens are constrained
        conn.execute(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_temporary_request_token \
             ON agent_credentials(temporary_request_token)",
            [],
        )
        .context("Failed to create request token index")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("Credential database lock poisoned"))
    }
}

fn map_record(row: &Row<'_>) -> rusqlite::Result<AgentCredentialRecord> {
    let agent_id: String = row.get(0)?;
    let agent_id = agent_id
        .parse::<AgentId>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))?;

    Ok(AgentCredentialRecord {
        agent_id,
        temporary_request_token: row.get(1)?,
        temporary_request_secret: row.get(2)?,
        permanent_access_token: row.get(3)?,
        permanent_access_secret: row.get(4)?,
        external_user_id: row.get(5)?,
        external_handle: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn current_request_token(conn: &Connection, agent_id: &str) -> Result<Option<String>> {
    let token = conn
        .query_row(
            "SELECT temporary_request_token FROM agent_credentials WHERE agent_id = ?1",
            params![agent_id],
            |row| row.get::<_, Option<String>>(0),
        )
        .optional()
        .context("Failed to read current request token")?;

    Ok(token.flatten())
}

impl PersistenceGateway for SqliteGateway {
    fn begin_handshake(
        &self,
        agent_id: &AgentId,
        request_token: &str,
        sealed_request_secret: &str,
    ) -> Result<Option<String>> {
        let agent_id = agent_id.to_string();
        let now = Utc::now().to_rfc3339();

        let mut conn = self.lock()?;
        let tx = conn.transaction().context("Failed to begin transaction")?;

        let previous = current_request_token(&tx, &agent_id)?;

        tx.execute(
            r#"
            INSERT INTO agent_credentials (
                agent_id,
                temporary_request_token, temporary_request_secret,
                permanent_access_token, permanent_access_secret,
                external_user_id, external_handle,
                created_at, updated_at
            )
            VALUES (?1, ?2, ?3, NULL, NULL, NULL, NULL, ?4, ?4)
            ON CONFLICT(agent_id) DO UPDATE SET
                temporary_request_token = excluded.temporary_request_token,
                temporary_request_secret = excluded.temporary_request_secret,
                permanent_access_token = NULL,
                permanent_access_secret = NULL,
                external_user_id = NULL,
                external_handle = NULL,
                updated_at = excluded.updated_at
            "#,
            params![agent_id, request_token, sealed_request_secret, now],
        )
        .context("Failed to store temporary credentials")?;

        tx.commit().context("Failed to commit temporary credentials")?;

        Ok(previous.filter(|token| token != request_token))
    }

    fn complete_handshake(
        &self,
        agent_id: &AgentId,
        request_token: &str,
        permanent: &SealedPermanent,
    ) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let conn = self.lock()?;

        let changed = conn
            .execute(
                r#"
                UPDATE agent_credentials
                SET temporary_request_token = NULL,
                    temporary_request_secret = NULL,
                    permanent_access_token = ?3,
                    permanent_access_secret = ?4,
                    external_user_id = ?5,
                    external_handle = ?6,
                    updated_at = ?7
                WHERE agent_id = ?1 AND temporary_request_token = ?2
                "#,
                params![
                    agent_id.to_string(),
                    request_token,
                    permanent.access_token,
                    permanent.access_secret,
                    permanent.external_user_id,
                    permanent.external_handle,
                    now,
                ],
            )
            .context("Failed to store permanent credentials")?;

        Ok(changed > 0)
    }

    fn abandon_handshake(&self, agent_id: &AgentId, request_token: &str) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let conn = self.lock()?;

        let changed = conn
            .execute(
                r#"
                UPDATE agent_credentials
                SET temporary_request_token = NULL,
                    temporary_request_secret = NULL,
                    updated_at = ?3
                WHERE agent_id = ?1 AND temporary_request_token = ?2
                "#,
                params![agent_id.to_string(), request_token, now],
            )
            .context("Failed to abandon handshake")?;

        Ok(changed > 0)
    }

    fn clear_temporary(&self, agent_id: &AgentId) -> Result<Option<String>> {
        let agent_id = agent_id.to_string();
        let now = Utc::now().to_rfc3339();

        let mut conn = self.lock()?;
        let tx = conn.transaction().context("Failed to begin transaction")?;

        let previous = current_request_token(&tx, &agent_id)?;
        if previous.is_some() {
            tx.execute(
                r#"
                UPDATE agent_credentials
                SET temporary_request_token = NULL,
                    temporary_request_secret = NULL,
                    updated_at = ?2
                WHERE agent_id = ?1
                "#,
                params![agent_id, now],
            )
            .context("Failed to clear temporary credentials")?;
        }

        tx.commit().context("Failed to commit cleared credentials")?;

        Ok(previous)
    }

    fn find_by_request_token(&self, request_token: &str) -> Result<Option<AgentCredentialRecord>> {
        let conn = self.lock()?;
        let sql = format!("{} WHERE temporary_request_token = ?1", SELECT_COLUMNS);

        conn.query_row(&sql, params![request_token], map_record)
            .optional()
            .context("Failed to look up request token")
    }

    fn find_by_agent(&self, agent_id: &AgentId) -> Result<Option<AgentCredentialRecord>> {
        let conn = self.lock()?;
        let sql = format!("{} WHERE agent_id = ?1", SELECT_COLUMNS);

        conn.query_row(&sql, params![agent_id.to_string()], map_record)
            .optional()
            .context("Failed to look up agent credentials")
    }

    fn delete(&self, agent_id: &AgentId) -> Result<Option<AgentCredentialRecord>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().context("Failed to begin transaction")?;

        let sql = format!("{} WHERE agent_id = ?1", SELECT_COLUMNS);
        let existing = tx
            .query_row(&sql, params![agent_id.to_string()], map_record)
            .optional()
            .context("Failed to look up agent credentials")?;

        if existing.is_some() {
            tx.execute(
                "DELETE FROM agent_credentials WHERE agent_id = ?1",
                params![agent_id.to_string()],
            )
            .context("Failed to delete agent credentials")?;
        }

        tx.commit().context("Failed to commit deletion")?;

        Ok(existing)
    }

    fn list_connected(&self) -> Result<Vec<AgentCredentialRecord>> {
        let conn = self.lock()?;
        let sql = format!(
            "{} WHERE permanent_access_token IS NOT NULL ORDER BY agent_id",
            SELECT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql).context("Failed to prepare query")?;

        let records = stmt
            .query_map([], map_record)
            .context("Failed to execute query")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read results")?;

        Ok(records)
    }
}
