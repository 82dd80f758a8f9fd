//! Outbound OAuth 1.0a handshake with the social platform.
//!
//! Only the two token exchanges and the authorization URL are covered:
//! 1. POST request_token (signed with consumer credentials, carries `oauth_callback`)
//! 2. User authorizes at `authorize?oauth_token=...`
//! 3. POST access_token (signed with the request-token pair, carries `oauth_verifier`)

mod client;
pub mod signature;

pub use client::OAuth1Client;

use crate::credentials::PermanentCredentials;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Temporary credentials returned by the request-token exchange.
#[derive(Clone, PartialEq, Eq)]
pub struct RequestToken {
    pub token: String,
    pub secret: String,
}

impl fmt::Debug for RequestToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestToken")
            .field("token", &self.token)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Category of a failed platform call. Drives the status and message shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamErrorKind {
    Timeout,
    RateLimited,
    ClientError,
    ServerError,
}

impl fmt::Display for UpstreamErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            UpstreamErrorKind::Timeout => "timeout",
            UpstreamErrorKind::RateLimited => "rate limited",
            UpstreamErrorKind::ClientError => "client error",
            UpstreamErrorKind::ServerError => "server error",
        };
        f.write_str(label)
    }
}

/// Failed call to the platform.
#[derive(Debug, Clone, Error)]
#[error("platform {kind}: {message}")]
pub struct UpstreamError {
    pub kind: UpstreamErrorKind,
    pub status: Option<u16>,
    pub message: String,
}

impl UpstreamError {
    pub fn new(kind: UpstreamErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            message: message.into(),
        }
    }

    /// Classifies a non-success HTTP status.
    pub fn from_status(status: u16, body: &str) -> Self {
        let kind = match status {
            // 420 is the platform's legacy "enhance your calm" rate-limit status
            429 | 420 => UpstreamErrorKind::RateLimited,
            400..=499 => UpstreamErrorKind::ClientError,
            _ => UpstreamErrorKind::ServerError,
        };
        let mut message: String = body.chars().take(200).collect();
        if message.is_empty() {
            message = format!("HTTP {}", status);
        }
        Self {
            kind,
            status: Some(status),
            message,
        }
    }
}

/// The platform side of the handshake.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Obtains a request-token pair. `callback_url` must come back unmodified on the
    /// platform's redirect.
    async fn request_token(&self, callback_url: &str) -> Result<RequestToken, UpstreamError>;

    /// Exchanges an authorized request token and its verifier for permanent credentials.
    async fn access_token(
        &self,
        request_token: &str,
        request_secret: &str,
        verifier: &str,
    ) -> Result<PermanentCredentials, UpstreamError>;

    /// Where the user is sent to approve the request token.
    fn authorization_url(&self, request_token: &str) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(
            UpstreamError::from_status(429, "").kind,
            UpstreamErrorKind::RateLimited
        );
        assert_eq!(
            UpstreamError::from_status(420, "").kind,
            UpstreamErrorKind::RateLimited
        );
        assert_eq!(
            UpstreamError::from_status(401, "bad signature").kind,
            UpstreamErrorKind::ClientError
        );
        assert_eq!(
            UpstreamError::from_status(503, "").kind,
            UpstreamErrorKind::ServerError
        );
        assert_eq!(
            UpstreamError::from_status(302, "").kind,
            UpstreamErrorKind::ServerError
        );
    }

    #[test]
    fn test_status_message() {
        let err = UpstreamError::from_status(500, "");
        assert_eq!(err.message, "HTTP 500");
        assert_eq!(err.status, Some(500));

        let long = "x".repeat(1000);
        assert_eq!(UpstreamError::from_status(400, &long).message.len(), 200);
    }

    #[test]
    fn test_display() {
        let err = UpstreamError::new(UpstreamErrorKind::Timeout, "no response in 10s");
        assert_eq!(err.to_string(), "platform timeout: no response in 10s");
    }

    #[test]
    fn test_request_token_debug_redacts_secret() {
        let token = RequestToken {
            token: "req".to_string(),
            secret: "hidden".to_string(),
        };
        assert!(!format!("{:?}", token).contains("hidden"));
    }
}
