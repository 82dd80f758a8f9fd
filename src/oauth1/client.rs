//! OAuth 1.0a token exchanges over HTTP.

use super::signature::{generate_nonce, percent_encode, Signer, TokenPair};
use super::{PlatformClient, RequestToken, UpstreamError, UpstreamErrorKind};
use crate::config::PlatformConfig;
use crate::credentials::PermanentCredentials;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::AUTHORIZATION;
use serde::Deserialize;
use std::time::Duration;

/// Request-token response (form-encoded)
#[derive(Deserialize, Debug)]
struct RequestTokenResponse {
    oauth_token: String,
    oauth_token_secret: String,
    #[serde(default)]
    oauth_callback_confirmed: Option<String>,
}

/// Access-token response (form-encoded)
#[derive(Deserialize, Debug)]
struct AccessTokenResponse {
    oauth_token: String,
    oauth_token_secret: String,
    user_id: String,
    screen_name: String,
}

/// Platform client signing requests with the application's consumer credentials.
pub struct OAuth1Client {
    http: reqwest::Client,
    consumer_key: String,
    consumer_secret: String,
    request_token_url: String,
    authorize_url: String,
    access_token_url: String,
}

impl OAuth1Client {
    /// Builds a client from platform configuration. Every call is bounded by
    /// `request_timeout_seconds`.
    pub fn new(config: &PlatformConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http,
            consumer_key: config.consumer_key.clone(),
            consumer_secret: config.consumer_secret.clone(),
            request_token_url: config.request_token_url.clone(),
            authorize_url: config.authorize_url.clone(),
            access_token_url: config.access_token_url.clone(),
        })
    }

    /// Signed POST; returns the success body.
    async fn post(
        &self,
        url: &str,
        token: Option<TokenPair<'_>>,
        extra: &[(&str, &str)],
    ) -> Result<String, UpstreamError> {
        let signer = Signer {
            consumer_key: &self.consumer_key,
            consumer_secret: &self.consumer_secret,
        };
        let header = signer
            .authorization_header(
                "POST",
                url,
                token,
                extra,
                &generate_nonce(),
                Utc::now().timestamp(),
            )
            .map_err(|e| {
                UpstreamError::new(UpstreamErrorKind::ClientError, format!("signing failed: {}", e))
            })?;

        let response = self
            .http
            .post(url)
            .header(AUTHORIZATION, header)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(UpstreamError::from_status(status.as_u16(), &body));
        }

        response.text().await.map_err(transport_error)
    }
}

fn transport_error(err: reqwest::Error) -> UpstreamError {
    if err.is_timeout() {
        UpstreamError::new(UpstreamErrorKind::Timeout, "platform did not respond in time")
    } else {
        UpstreamError::new(
            UpstreamErrorKind::ServerError,
            format!("request to platform failed: {}", err.without_url()),
        )
    }
}

fn malformed(what: &str, err: serde_urlencoded::de::Error) -> UpstreamError {
    UpstreamError::new(
        UpstreamErrorKind::ServerError,
        format!("malformed {} response: {}", what, err),
    )
}

#[async_trait]
impl PlatformClient for OAuth1Client {
    async fn request_token(&self, callback_url: &str) -> Result<RequestToken, UpstreamError> {
        tracing::debug!("Requesting request token from {}", self.request_token_url);

        let body = self
            .post(&self.request_token_url, None, &[("oauth_callback", callback_url)])
            .await?;

        let parsed: RequestTokenResponse =
            serde_urlencoded::from_str(&body).map_err(|e| malformed("request token", e))?;

        if parsed.oauth_callback_confirmed.as_deref() != Some("true") {
            return Err(UpstreamError::new(
                UpstreamErrorKind::ServerError,
                "platform did not confirm the callback URL",
            ));
        }

        Ok(RequestToken {
            token: parsed.oauth_token,
            secret: parsed.oauth_token_secret,
        })
    }

    async fn access_token(
        &self,
        request_token: &str,
        request_secret: &str,
        verifier: &str,
    ) -> Result<PermanentCredentials, UpstreamError> {
        tracing::debug!("Exchanging verifier for access token at {}", self.access_token_url);

        let body = self
            .post(
                &self.access_token_url,
                Some(TokenPair {
                    token: request_token,
                    secret: request_secret,
                }),
                &[("oauth_verifier", verifier)],
            )
            .await?;

        let parsed: AccessTokenResponse =
            serde_urlencoded::from_str(&body).map_err(|e| malformed("access token", e))?;

        tracing::debug!(
            user_id = %parsed.user_id,
            screen_name = %parsed.screen_name,
            "Access token exchange successful"
        );

        Ok(PermanentCredentials {
            access_token: parsed.oauth_token,
            access_secret: parsed.oauth_token_secret,
            external_user_id: parsed.user_id,
            external_handle: parsed.screen_name,
        })
    }

    fn authorization_url(&self, request_token: &str) -> String {
        format!(
            "{}?oauth_token={}",
            self.authorize_url,
            percent_encode(request_token)
        )
    }
}
