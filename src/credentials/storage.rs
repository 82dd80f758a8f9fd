//! Credential store: the only path to agent credential records.
//!
//! Callers hand in and receive plaintext; everything below this layer is ciphertext.
//! The request-token cache is kept consistent with each transition here.

use super::encryption::SecretCipher;
use super::gateway::{AgentCredentialRecord, PersistenceGateway, SealedPermanent};
use super::{
    AccessCredentials, AgentId, ConnectedAgent, ConnectionState, CredentialError,
    PermanentCredentials,
};
use crate::token_cache::{PendingHandshake, TemporaryTokenCache};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Encrypted credential storage over a [`PersistenceGateway`].
///
/// # Failure semantics
/// - Encryption failures abort the write and propagate
/// - Decryption failures are logged and returned as [`CredentialError::Decryption`];
///   the caller treats that record as absent
/// - Batch reads skip undecryptable records instead of failing
pub struct CredentialStore {
    gateway: Arc<dyn PersistenceGateway>,
    cipher: SecretCipher,
    cache: Arc<TemporaryTokenCache>,
}

impl CredentialStore {
    pub fn new(
        gateway: Arc<dyn PersistenceGateway>,
        cipher: SecretCipher,
        cache: Arc<TemporaryTokenCache>,
    ) -> Self {
        Self {
            gateway,
            cipher,
            cache,
        }
    }

    /// Persists the request-token pair of a new handshake.
    ///
    /// Discards any permanent pair and external identity on the record, and evicts a
    /// superseded request token from the cache so that handshake can no longer complete.
    pub fn save_temporary(
        &self,
        agent_id: &AgentId,
        request_token: &str,
        request_secret: &str,
    ) -> Result<(), CredentialError> {
        let sealed = self
            .cipher
            .encrypt(request_secret)
            .map_err(CredentialError::Encryption)?;

        let superseded = self
            .gateway
            .begin_handshake(agent_id, request_token, &sealed)?;

        if let Some(old_token) = superseded {
            debug!(agent_id = %agent_id, "Superseded an in-flight handshake");
            self.cache.remove(&old_token);
        }

        // Durable write committed; the cache may now serve this token
        self.cache.put(request_token, *agent_id, request_secret);

        Ok(())
    }

    /// Looks up the secret of an in-flight request token.
    ///
    /// Cache first; on a miss, reads storage and repopulates the cache. Returns
    /// `Ok(None)` when no handshake uses this token.
    pub fn get_temporary_secret(
        &self,
        request_token: &str,
    ) -> Result<Option<PendingHandshake>, CredentialError> {
        if let Some(pending) = self.cache.get(request_token) {
            return Ok(Some(pending));
        }

        let Some(record) = self.gateway.find_by_request_token(request_token)? else {
            return Ok(None);
        };
        let Some(sealed) = record.temporary_request_secret.as_deref() else {
            return Ok(None);
        };

        let request_secret = self.open(&record.agent_id, sealed)?;
        self.cache.put(request_token, record.agent_id, &request_secret);

        Ok(Some(PendingHandshake {
            agent_id: record.agent_id,
            request_secret,
        }))
    }

    /// Stores the permanent pair and clears the temporary pair atomically.
    ///
    /// Completes only the handshake identified by `request_token`. Returns `Ok(false)`
    /// and writes nothing when that handshake is no longer current (superseded by a
    /// newer initiation, already consumed, or abandoned).
    pub fn save_permanent(
        &self,
        agent_id: &AgentId,
        request_token: &str,
        permanent: &PermanentCredentials,
    ) -> Result<bool, CredentialError> {
        let sealed = SealedPermanent {
            access_token: self
                .cipher
                .encrypt(&permanent.access_token)
                .map_err(CredentialError::Encryption)?,
            access_secret: self
                .cipher
                .encrypt(&permanent.access_secret)
                .map_err(CredentialError::Encryption)?,
            external_user_id: permanent.external_user_id.clone(),
            external_handle: permanent.external_handle.clone(),
        };

        if !self
            .gateway
            .complete_handshake(agent_id, request_token, &sealed)?
        {
            debug!(agent_id = %agent_id, "Handshake no longer current; permanent pair not stored");
            return Ok(false);
        }
        self.cache.remove(request_token);

        info!(
            agent_id = %agent_id,
            external_handle = %permanent.external_handle,
            "Stored permanent credentials"
        );
        Ok(true)
    }

    /// Clears the temporary pair if it still belongs to `request_token`.
    ///
    /// Returns whether anything was cleared. A newer handshake is never touched.
    pub fn abandon_handshake(
        &self,
        agent_id: &AgentId,
        request_token: &str,
    ) -> Result<bool, CredentialError> {
        let abandoned = self.gateway.abandon_handshake(agent_id, request_token)?;
        if abandoned {
            self.cache.remove(request_token);
            debug!(agent_id = %agent_id, "Abandoned handshake");
        }
        Ok(abandoned)
    }

    /// Clears the temporary pair. Succeeds when there is nothing to clear.
    pub fn clear_temporary(&self, agent_id: &AgentId) -> Result<(), CredentialError> {
        if let Some(token) = self.gateway.clear_temporary(agent_id)? {
            self.cache.remove(&token);
            debug!(agent_id = %agent_id, "Cleared temporary credentials");
        }
        Ok(())
    }

    /// Returns the decrypted permanent pair, or `None` if the agent is not connected.
    pub fn get_permanent(
        &self,
        agent_id: &AgentId,
    ) -> Result<Option<AccessCredentials>, CredentialError> {
        match self.gateway.find_by_agent(agent_id)? {
            Some(record) => self.open_permanent(&record),
            None => Ok(None),
        }
    }

    /// Current lifecycle state of an agent.
    pub fn connection_state(&self, agent_id: &AgentId) -> Result<ConnectionState, CredentialError> {
        let Some(record) = self.gateway.find_by_agent(agent_id)? else {
            return Ok(ConnectionState::Disconnected);
        };

        let state = if record.permanent_access_token.is_some()
            && record.permanent_access_secret.is_some()
        {
            ConnectionState::Connected {
                external_user_id: record.external_user_id,
                external_handle: record.external_handle,
            }
        } else if record.temporary_request_token.is_some() {
            ConnectionState::AwaitingAuthorization
        } else {
            ConnectionState::Disconnected
        };

        Ok(state)
    }

    /// Removes the agent's record entirely. Succeeds when there is no record.
    pub fn delete(&self, agent_id: &AgentId) -> Result<(), CredentialError> {
        match self.gateway.delete(agent_id)? {
            Some(removed) => {
                if let Some(token) = removed.temporary_request_token.as_deref() {
                    self.cache.remove(token);
                }
                info!(agent_id = %agent_id, "Deleted agent credentials");
            }
            None => debug!(agent_id = %agent_id, "No credentials to delete"),
        }
        Ok(())
    }

    /// Every connected agent with its decrypted pair.
    ///
    /// Records that fail to decrypt are logged and skipped.
    pub fn connected_agents(&self) -> Result<Vec<ConnectedAgent>, CredentialError> {
        let records = self.gateway.list_connected()?;
        let mut connected = Vec::with_capacity(records.len());

        for record in records {
            match self.open_permanent(&record) {
                Ok(Some(credentials)) => connected.push(ConnectedAgent {
                    agent_id: record.agent_id,
                    credentials,
                    external_user_id: record.external_user_id,
                    external_handle: record.external_handle,
                }),
                Ok(None) => {}
                // Already logged by open()
                Err(_) => continue,
            }
        }

        Ok(connected)
    }

    fn open_permanent(
        &self,
        record: &AgentCredentialRecord,
    ) -> Result<Option<AccessCredentials>, CredentialError> {
        match (
            record.permanent_access_token.as_deref(),
            record.permanent_access_secret.as_deref(),
        ) {
            (Some(token), Some(secret)) => Ok(Some(AccessCredentials {
                access_token: self.open(&record.agent_id, token)?,
                access_secret: self.open(&record.agent_id, secret)?,
            })),
            _ => Ok(None),
        }
    }

    fn open(&self, agent_id: &AgentId, sealed: &str) -> Result<String, CredentialError> {
        self.cipher.decrypt(sealed).map_err(|source| {
            error!(agent_id = %agent_id, error = %source, "Failed to decrypt stored secret");
            CredentialError::Decryption {
                agent_id: *agent_id,
                source,
            }
        })
    }
}
