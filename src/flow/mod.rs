//! Handshake orchestration.
//!
//! ```text
//! Disconnected ──initiate──► AwaitingAuthorization ──callback──► Connected
//!       ▲                          │                                 │
//!       └──── denied / failure ────┘◄──────── re-initiate ───────────┘
//! ```
//!
//! Every failure is mapped into [`FlowError`] here; nothing below this layer knows
//! about HTTP.

use crate::credentials::{AgentId, ConnectionState, CredentialError, CredentialStore};
use crate::oauth1::{PlatformClient, UpstreamError, UpstreamErrorKind};
use crate::rate_limit::RateLimiter;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Longest request token or verifier accepted on the callback.
const MAX_CALLBACK_VALUE_LEN: usize = 256;

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("rate limit exceeded, retry in {retry_after_seconds}s")]
    RateLimited { retry_after_seconds: u64 },

    #[error("authorization session expired or unknown")]
    ExpiredSession,

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error(transparent)]
    Credential(#[from] CredentialError),
}

impl FlowError {
    /// Machine-readable code returned to API callers.
    pub fn code(&self) -> &'static str {
        match self {
            FlowError::InvalidInput(_) => "invalid_input",
            FlowError::RateLimited { .. } => "rate_limited",
            FlowError::ExpiredSession => "expired_session",
            FlowError::Upstream(e) => match e.kind {
                UpstreamErrorKind::Timeout => "upstream_timeout",
                UpstreamErrorKind::RateLimited => "upstream_rate_limited",
                UpstreamErrorKind::ClientError => "upstream_client_error",
                UpstreamErrorKind::ServerError => "upstream_server_error",
            },
            FlowError::Credential(CredentialError::Encryption(_)) => "encryption_failure",
            FlowError::Credential(CredentialError::Decryption { .. }) => "decryption_failure",
            FlowError::Credential(CredentialError::Persistence(_)) => "persistence_error",
        }
    }

    /// Message safe to show an end user. Never includes upstream bodies or internals.
    pub fn user_message(&self) -> String {
        match self {
            FlowError::InvalidInput(msg) => msg.clone(),
            FlowError::RateLimited {
                retry_after_seconds,
            } => format!(
                "Too many connection attempts. Try again in {} seconds.",
                retry_after_seconds
            ),
            FlowError::ExpiredSession => {
                "Your authorization session has expired. Please start again.".to_string()
            }
            FlowError::Upstream(e) => match e.kind {
                UpstreamErrorKind::Timeout => {
                    "The platform did not respond in time. Please try again.".to_string()
                }
                UpstreamErrorKind::RateLimited => {
                    "The platform is rate limiting requests. Please try again later.".to_string()
                }
                UpstreamErrorKind::ClientError => {
                    "The platform rejected the authorization request.".to_string()
                }
                UpstreamErrorKind::ServerError => {
                    "The platform is unavailable. Please try again later.".to_string()
                }
            },
            FlowError::Credential(_) => "Internal error while storing credentials.".to_string(),
        }
    }
}

/// Query parameters the platform sends back on the callback.
#[derive(Debug, Clone, Default)]
pub struct CallbackParams {
    pub oauth_token: Option<String>,
    pub oauth_verifier: Option<String>,
    pub denied: Option<String>,
    pub agent_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    Connected {
        external_user_id: String,
        external_handle: String,
    },
    Denied,
}

/// Drives the three-legged handshake for agents.
pub struct OAuthFlowOrchestrator {
    store: Arc<CredentialStore>,
    limiter: Arc<dyn RateLimiter>,
    platform: Arc<dyn PlatformClient>,
    callback_base_url: String,
}

impl OAuthFlowOrchestrator {
    pub fn new(
        store: Arc<CredentialStore>,
        limiter: Arc<dyn RateLimiter>,
        platform: Arc<dyn PlatformClient>,
        callback_base_url: impl Into<String>,
    ) -> Self {
        Self {
            store,
            limiter,
            platform,
            callback_base_url: callback_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Starts a handshake and returns the URL the user must visit.
    ///
    /// The limiter is consulted before anything else; a denied caller never reaches
    /// the platform.
    pub async fn initiate(&self, agent_id: &str, caller: &str) -> Result<String, FlowError> {
        if !self.limiter.try_acquire(caller).await {
            let retry_after_seconds = self.limiter.retry_after().num_seconds().max(1) as u64;
            warn!(caller = %caller, "Handshake initiation rate limited");
            return Err(FlowError::RateLimited {
                retry_after_seconds,
            });
        }

        let agent_id = parse_agent_id(agent_id)?;
        let callback_url = format!(
            "{}/api/oauth/callback?agentId={}",
            self.callback_base_url, agent_id
        );

        let request_token = match self.platform.request_token(&callback_url).await {
            Ok(token) => token,
            Err(e) => {
                warn!(agent_id = %agent_id, error = %e, "Request token exchange failed");
                return Err(self.compensate(&agent_id, None, e.into()));
            }
        };
        debug!(agent_id = %agent_id, request_token = %request_token.token, "Obtained request token");

        self.store
            .save_temporary(&agent_id, &request_token.token, &request_token.secret)?;

        info!(agent_id = %agent_id, caller = %caller, "Handshake initiated");
        Ok(self.platform.authorization_url(&request_token.token))
    }

    /// Completes (or abandons) a handshake from the platform's redirect.
    pub async fn callback(&self, params: CallbackParams) -> Result<CallbackOutcome, FlowError> {
        if let Some(denied_token) = params.denied.as_deref() {
            return Ok(self.handle_denied(params.agent_id.as_deref(), denied_token));
        }

        let request_token = required_value(params.oauth_token.as_deref(), "oauth_token")?;
        let verifier = required_value(params.oauth_verifier.as_deref(), "oauth_verifier")?;
        let agent_id = parse_agent_id(params.agent_id.as_deref().unwrap_or(""))?;

        let pending = match self.store.get_temporary_secret(request_token) {
            Ok(Some(pending)) => pending,
            Ok(None) => {
                debug!(agent_id = %agent_id, "Callback for unknown or consumed request token");
                return Err(FlowError::ExpiredSession);
            }
            Err(CredentialError::Decryption { .. }) => {
                // Logged by the store; an unreadable handshake cannot be completed
                return Err(FlowError::ExpiredSession);
            }
            Err(e) => return Err(e.into()),
        };

        if pending.agent_id != agent_id {
            warn!(
                agent_id = %agent_id,
                owner = %pending.agent_id,
                "Callback agent does not own the request token"
            );
            return Err(FlowError::ExpiredSession);
        }

        let permanent = match self
            .platform
            .access_token(request_token, &pending.request_secret, verifier)
            .await
        {
            Ok(permanent) => permanent,
            Err(e) => {
                warn!(agent_id = %agent_id, error = %e, "Access token exchange failed");
                return Err(self.compensate(&agent_id, Some(request_token), e.into()));
            }
        };

        // Another callback may have consumed, or a newer initiation superseded, this
        // handshake while the exchange was in flight
        if !self
            .store
            .save_permanent(&agent_id, request_token, &permanent)?
        {
            warn!(agent_id = %agent_id, "Handshake no longer current after access token exchange");
            return Err(FlowError::ExpiredSession);
        }

        info!(
            agent_id = %agent_id,
            external_handle = %permanent.external_handle,
            "Agent connected"
        );
        Ok(CallbackOutcome::Connected {
            external_user_id: permanent.external_user_id,
            external_handle: permanent.external_handle,
        })
    }

    pub fn status(&self, agent_id: &str) -> Result<ConnectionState, FlowError> {
        let agent_id = parse_agent_id(agent_id)?;
        Ok(self.store.connection_state(&agent_id)?)
    }

    /// Forgets every credential of the agent. Succeeds for unknown agents.
    pub fn disconnect(&self, agent_id: &str) -> Result<(), FlowError> {
        let agent_id = parse_agent_id(agent_id)?;
        self.store.delete(&agent_id)?;
        info!(agent_id = %agent_id, "Agent disconnected");
        Ok(())
    }

    /// The platform reports a denial with `denied=<request token>`. Only that handshake
    /// is abandoned, so a forged denial cannot cancel someone else's.
    fn handle_denied(&self, agent_id: Option<&str>, denied_token: &str) -> CallbackOutcome {
        let agent_id = match agent_id.map(str::parse::<AgentId>) {
            Some(Ok(agent_id)) => agent_id,
            _ => {
                warn!("Authorization denied without a valid agentId; nothing to clean up");
                return CallbackOutcome::Denied;
            }
        };
        info!(agent_id = %agent_id, "User denied authorization");

        let Ok(request_token) = required_value(Some(denied_token), "denied") else {
            warn!(agent_id = %agent_id, "Denial without a usable request token; nothing cleared");
            return CallbackOutcome::Denied;
        };

        match self.store.abandon_handshake(&agent_id, request_token) {
            Ok(true) => {}
            Ok(false) => {
                debug!(agent_id = %agent_id, "Denied token is not the agent's current handshake")
            }
            Err(e) => warn!(agent_id = %agent_id, error = %e, "Failed to abandon denied handshake"),
        }
        CallbackOutcome::Denied
    }

    /// Clears the temporary pair after a failed step and hands back `primary`.
    ///
    /// With a request token only that handshake is cleared; a newer one survives.
    /// A cleanup failure is logged only.
    fn compensate(
        &self,
        agent_id: &AgentId,
        request_token: Option<&str>,
        primary: FlowError,
    ) -> FlowError {
        let cleanup = match request_token {
            Some(token) => self.store.abandon_handshake(agent_id, token).map(|_| ()),
            None => self.store.clear_temporary(agent_id),
        };
        if let Err(cleanup) = cleanup {
            warn!(
                agent_id = %agent_id,
                error = %cleanup,
                primary = %primary,
                "Failed to clear temporary credentials"
            );
        }
        primary
    }
}

fn parse_agent_id(raw: &str) -> Result<AgentId, FlowError> {
    raw.parse::<AgentId>()
        .map_err(|_| FlowError::InvalidInput("agentId must be a UUID".to_string()))
}

/// Request tokens and verifiers are opaque but restricted to URL-safe characters.
fn required_value<'a>(value: Option<&'a str>, name: &str) -> Result<&'a str, FlowError> {
    let value = value.map(str::trim).unwrap_or("");
    if value.is_empty() {
        return Err(FlowError::InvalidInput(format!("missing {}", name)));
    }
    let well_formed = value.len() <= MAX_CALLBACK_VALUE_LEN
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~'));
    if !well_formed {
        return Err(FlowError::InvalidInput(format!("malformed {}", name)));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::Environment;
    use crate::credentials::{PermanentCredentials, SecretCipher, SqliteGateway};
    use crate::oauth1::RequestToken;
    use crate::rate_limit::FixedWindowLimiter;
    use crate::token_cache::TemporaryTokenCache;
    use async_trait::async_trait;
    use chrono::Duration;
    use std::sync::Mutex;

    /// Platform double that hands out sequential tokens or a fixed failure.
    #[derive(Default)]
    struct FakePlatform {
        issued: Mutex<u32>,
        fail_request: Option<UpstreamErrorKind>,
        fail_access: Option<UpstreamErrorKind>,
    }

    #[async_trait]
    impl PlatformClient for FakePlatform {
        async fn request_token(&self, _callback_url: &str) -> Result<RequestToken, UpstreamError> {
            if let Some(kind) = self.fail_request {
                return Err(UpstreamError::new(kind, "request token failed"));
            }
            let mut issued = self.issued.lock().unwrap();
            *issued += 1;
            Ok(RequestToken {
                token: format!("req-{}", issued),
                secret: format!("req-secret-{}", issued),
            })
        }

        async fn access_token(
            &self,
            request_token: &str,
            request_secret: &str,
            _verifier: &str,
        ) -> Result<PermanentCredentials, UpstreamError> {
            if let Some(kind) = self.fail_access {
                return Err(UpstreamError::new(kind, "access token failed"));
            }
            assert_eq!(request_secret, request_token.replace("req-", "req-secret-"));
            Ok(PermanentCredentials {
                access_token: "access-token".to_string(),
                access_secret: "access-secret".to_string(),
                external_user_id: "42".to_string(),
                external_handle: "agent_bot".to_string(),
            })
        }

        fn authorization_url(&self, request_token: &str) -> String {
            format!("https://platform.test/oauth/authorize?oauth_token={}", request_token)
        }
    }

    fn orchestrator(platform: FakePlatform) -> (OAuthFlowOrchestrator, Arc<CredentialStore>) {
        let clock = Arc::new(ManualClock::default());
        let cache = Arc::new(TemporaryTokenCache::new(Duration::minutes(10), clock.clone()));
        let gateway = Arc::new(SqliteGateway::open(":memory:").unwrap());
        let cipher = SecretCipher::new("flow-test-secret", Environment::Development).unwrap();
        let store = Arc::new(CredentialStore::new(gateway, cipher, cache));
        let limiter = Arc::new(FixedWindowLimiter::new(Duration::minutes(5), 10, clock));
        let flow = OAuthFlowOrchestrator::new(
            store.clone(),
            limiter,
            Arc::new(platform),
            "https://agentlink.test/",
        );
        (flow, store)
    }

    fn callback_for(agent: &AgentId, token: &str) -> CallbackParams {
        CallbackParams {
            oauth_token: Some(token.to_string()),
            oauth_verifier: Some("verifier-1".to_string()),
            denied: None,
            agent_id: Some(agent.to_string()),
        }
    }

    #[tokio::test]
    async fn test_initiate_returns_authorization_url() {
        let (flow, store) = orchestrator(FakePlatform::default());
        let agent = AgentId::new_random();

        let url = flow.initiate(&agent.to_string(), "caller").await.unwrap();
        assert_eq!(url, "https://platform.test/oauth/authorize?oauth_token=req-1");
        assert_eq!(
            store.connection_state(&agent).unwrap(),
            ConnectionState::AwaitingAuthorization
        );
    }

    #[tokio::test]
    async fn test_initiate_rejects_non_uuid_agent() {
        let (flow, _) = orchestrator(FakePlatform::default());
        let err = flow.initiate("agent-1", "caller").await.unwrap_err();
        assert!(matches!(err, FlowError::InvalidInput(_)));
        assert_eq!(err.code(), "invalid_input");
    }

    #[tokio::test]
    async fn test_callback_connects_agent() {
        let (flow, store) = orchestrator(FakePlatform::default());
        let agent = AgentId::new_random();
        flow.initiate(&agent.to_string(), "caller").await.unwrap();

        let outcome = flow.callback(callback_for(&agent, "req-1")).await.unwrap();
        assert_eq!(
            outcome,
            CallbackOutcome::Connected {
                external_user_id: "42".to_string(),
                external_handle: "agent_bot".to_string(),
            }
        );
        let creds = store.get_permanent(&agent).unwrap().unwrap();
        assert_eq!(creds.access_token, "access-token");
    }

    #[tokio::test]
    async fn test_callback_for_other_agent_is_expired() {
        let (flow, store) = orchestrator(FakePlatform::default());
        let owner = AgentId::new_random();
        let intruder = AgentId::new_random();
        flow.initiate(&owner.to_string(), "caller").await.unwrap();

        let err = flow.callback(callback_for(&intruder, "req-1")).await.unwrap_err();
        assert!(matches!(err, FlowError::ExpiredSession));
        // The owner's handshake is untouched
        assert!(store.get_temporary_secret("req-1").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_callback_validates_parameters() {
        let (flow, _) = orchestrator(FakePlatform::default());
        let agent = AgentId::new_random();

        let mut params = callback_for(&agent, "req-1");
        params.oauth_verifier = None;
        assert!(matches!(
            flow.callback(params).await.unwrap_err(),
            FlowError::InvalidInput(_)
        ));

        let params = callback_for(&agent, "req 1<script>");
        assert!(matches!(
            flow.callback(params).await.unwrap_err(),
            FlowError::InvalidInput(_)
        ));

        let mut params = callback_for(&agent, "req-1");
        params.agent_id = Some("not-a-uuid".to_string());
        assert!(matches!(
            flow.callback(params).await.unwrap_err(),
            FlowError::InvalidInput(_)
        ));
    }

    #[tokio::test]
    async fn test_denied_without_agent_still_denied() {
        let (flow, _) = orchestrator(FakePlatform::default());
        let params = CallbackParams {
            denied: Some("req-1".to_string()),
            ..CallbackParams::default()
        };
        assert_eq!(flow.callback(params).await.unwrap(), CallbackOutcome::Denied);
    }

    #[tokio::test]
    async fn test_denied_with_foreign_token_keeps_handshake() {
        let (flow, store) = orchestrator(FakePlatform::default());
        let agent = AgentId::new_random();
        flow.initiate(&agent.to_string(), "caller").await.unwrap();

        let params = CallbackParams {
            denied: Some("forged".to_string()),
            agent_id: Some(agent.to_string()),
            ..CallbackParams::default()
        };
        assert_eq!(flow.callback(params).await.unwrap(), CallbackOutcome::Denied);
        assert!(store.get_temporary_secret("req-1").unwrap().is_some());

        let params = CallbackParams {
            denied: Some("req-1".to_string()),
            agent_id: Some(agent.to_string()),
            ..CallbackParams::default()
        };
        assert_eq!(flow.callback(params).await.unwrap(), CallbackOutcome::Denied);
        assert!(store.get_temporary_secret("req-1").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_access_failure_clears_temporary() {
        let (flow, store) = orchestrator(FakePlatform {
            fail_access: Some(UpstreamErrorKind::ServerError),
            ..FakePlatform::default()
        });
        let agent = AgentId::new_random();
        flow.initiate(&agent.to_string(), "caller").await.unwrap();

        let err = flow.callback(callback_for(&agent, "req-1")).await.unwrap_err();
        assert_eq!(err.code(), "upstream_server_error");
        assert_eq!(
            store.connection_state(&agent).unwrap(),
            ConnectionState::Disconnected
        );
    }

    #[tokio::test]
    async fn test_status_and_disconnect() {
        let (flow, _) = orchestrator(FakePlatform::default());
        let agent = AgentId::new_random();
        let id = agent.to_string();

        assert_eq!(flow.status(&id).unwrap(), ConnectionState::Disconnected);
        flow.initiate(&id, "caller").await.unwrap();
        flow.callback(callback_for(&agent, "req-1")).await.unwrap();
        assert!(matches!(
            flow.status(&id).unwrap(),
            ConnectionState::Connected { .. }
        ));

        flow.disconnect(&id).unwrap();
        assert_eq!(flow.status(&id).unwrap(), ConnectionState::Disconnected);
        flow.disconnect(&id).unwrap();
    }

    #[test]
    fn test_user_message_hides_upstream_body() {
        let err = FlowError::Upstream(UpstreamError::from_status(
            401,
            "<?xml?><error>Invalid consumer key abc123</error>",
        ));
        assert!(!err.user_message().contains("abc123"));
        assert_eq!(err.code(), "upstream_client_error");
    }
}
