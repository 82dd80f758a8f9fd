use crate::config::AuthConfig;
use axum::http::HeaderMap;
use std::collections::HashMap;


/// Resolves the identity of the caller behind an inbound request.
///
/// The identity keys the initiation rate limit; it is never an agent id.
pub trait CallerAuthenticator: Send + Sync {
    fn authenticate(&self, headers: &HeaderMap) -> Result<String, TokenError>;
}

/// Bearer tokens configured up front, each mapped to a caller identity.
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, String>,
}

impl StaticTokenAuthenticator {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(config.tokens.clone())
    }
}

impl CallerAuthenticator for StaticTokenAuthenticator {
    fn authenticate(&self, headers: &HeaderMap) -> Result<String, TokenError> {
        let token = extract_bearer_token(headers)?;
        self.tokens
            .get(&token)
            .cloned()
            .ok_or(TokenError::Unknown)
    }
}

/// Extract bearer token from HTTP Authorization header
///
/// Expected format: "Authorization: Bearer <token>"
/// Returns the token string if present and valid.
pub fn extract_bearer_token(headers: &HeaderMap) -> Result<String, TokenError> {
    let auth_header = headers
        .get("authorization")
        .ok_or(TokenError::Missing)?
        .to_str()
        .map_err(|_| TokenError::InvalidFormat)?;

    parse_bearer_token(auth_header)
}

/// Parse bearer token from Authorization header value
fn parse_bearer_token(header_value: &str) -> Result<String, TokenError> {
    let Some((scheme, token)) = header_value.split_once(' ') else {
        return Err(TokenError::InvalidFormat);
    };

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(TokenError::InvalidFormat);
    }

    let token = token.trim();
    if token.is_empty() {
        return Err(TokenError::Empty);
    }

    Ok(token.to_string())
}

/// Token extraction errors
#[derive(Debug, PartialEq, Clone)]
pub enum TokenError {
    /// Authorization header not present
    Missing,
    /// Not "Bearer <token>"
    InvalidFormat,
    /// Token is empty string
    Empty,
    /// Well-formed but not a configured token
    Unknown,
}

impl std::fmt::Display for TokenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenError::Missing => write!(f, "Authorization token not provided"),
            TokenError::InvalidFormat => write!(f, "Invalid authorization token format"),
            TokenError::Empty => write!(f, "Authorization token is empty"),
            TokenError::Unknown => write!(f, "Authorization token not recognized"),
        }
    }
}

impl std::error::Error for TokenError {}
