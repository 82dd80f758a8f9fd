//! Encrypted credential storage for agent OAuth 1.0a tokens.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       CredentialStore                    │
//! │  - Handshake state transitions           │
//! │  - Transparent encryption/decryption     │
//! │  - Request-token cache maintenance       │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//!    (encrypt)            (decrypt)
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       SecretCipher                       │
//! │  - AES-256-GCM                           │
//! │  - Unique nonce per secret               │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       PersistenceGateway (SQLite)        │
//! │  - Ciphertext at rest                    │
//! │  - One transaction per transition        │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use agentlink::clock::SystemClock;
//! use agentlink::config::Environment;
//! use agentlink::credentials::{AgentId, CredentialStore, SecretCipher, SqliteGateway};
//! use agentlink::token_cache::TemporaryTokenCache;
//! use std::sync::Arc;
//!
//! # fn main() -> anyhow::Result<()> {
//! let cipher = SecretCipher::new("master-secret", Environment::Development)?;
//! let cache = Arc::new(TemporaryTokenCache::new(
//!     chrono::Duration::minutes(10),
//!     Arc::new(SystemClock),
//! ));
//! let store = CredentialStore::new(
//!     Arc::new(SqliteGateway::open("credentials.db")?),
//!     cipher,
//!     cache,
//! );
//!
//! let agent: AgentId = "6f1c2d1e-8d0e-4a53-9a59-3f1f5b8c2a10".parse()?;
//! store.save_temporary(&agent, "request-token", "request-secret")?;
//! let pending = store.get_temporary_secret("request-token")?;
//! assert!(pending.is_some());
//! # Ok(())
//! # }
//! ```
//!
//! # Security
//!
//! - Secrets and access tokens encrypted at rest with AES-256-GCM
//! - Request tokens stored in plaintext (lookup key, already public in the
//!   authorization URL)
//! - Setting the permanent pair clears the temporary pair in the same transaction

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

mod encryption;
mod gateway;
mod storage;

pub use encryption::{is_legacy_plaintext, CipherError, SecretCipher, INSECURE_DEFAULT_SECRET};
pub use gateway::{AgentCredentialRecord, PersistenceGateway, SealedPermanent, SqliteGateway};
pub use storage::CredentialStore;

/// Identifier of the agent a credential belongs to (UUID).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(Uuid);

impl AgentId {
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for AgentId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl FromStr for AgentId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// Decrypted permanent token pair, used to call the platform on the agent's behalf.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessCredentials {
    pub access_token: String,
    pub access_secret: String,
}

impl fmt::Debug for AccessCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessCredentials")
            .field("access_token", &"<redacted>")
            .field("access_secret", &"<redacted>")
            .finish()
    }
}

/// Result of a successful access-token exchange, ready to be persisted.
#[derive(Clone)]
pub struct PermanentCredentials {
    pub access_token: String,
    pub access_secret: String,
    pub external_user_id: String,
    pub external_handle: String,
}

impl fmt::Debug for PermanentCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermanentCredentials")
            .field("external_user_id", &self.external_user_id)
            .field("external_handle", &self.external_handle)
            .finish_non_exhaustive()
    }
}

/// A connected agent as returned by [`CredentialStore::connected_agents`].
#[derive(Clone, Debug)]
pub struct ConnectedAgent {
    pub agent_id: AgentId,
    pub credentials: AccessCredentials,
    pub external_user_id: Option<String>,
    pub external_handle: Option<String>,
}

/// Where an agent is in the authorization lifecycle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    /// Never connected, disconnected, or last handshake was denied/failed
    Disconnected,
    /// A handshake was started and is waiting for the platform callback
    AwaitingAuthorization,
    /// Permanent credentials are stored
    Connected {
        #[serde(rename = "externalUserId", skip_serializing_if = "Option::is_none")]
        external_user_id: Option<String>,
        #[serde(rename = "externalHandle", skip_serializing_if = "Option::is_none")]
        external_handle: Option<String>,
    },
}

/// Credential store failures.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("failed to encrypt secret: {0}")]
    Encryption(#[source] CipherError),

    /// Recoverable: the record is treated as unreadable, other records are unaffected
    #[error("failed to decrypt stored secret for agent {agent_id}: {source}")]
    Decryption {
        agent_id: AgentId,
        #[source]
        source: CipherError,
    },

    #[error("persistence failure: {0:#}")]
    Persistence(anyhow::Error),
}

impl From<anyhow::Error> for CredentialError {
    fn from(err: anyhow::Error) -> Self {
        CredentialError::Persistence(err)
    }
}
