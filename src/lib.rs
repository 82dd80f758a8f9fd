// Injectable time source
pub mod clock;

// Configuration (TOML + environment)
pub mod config;

// Caller authentication
pub mod auth;

// Encrypted credential storage
pub mod credentials;

// In-memory request-token cache
pub mod token_cache;

// Initiation rate limiting
pub mod rate_limit;

// Outbound OAuth 1.0a client
pub mod oauth1;

// Handshake orchestration
pub mod flow;

// HTTP API
pub mod api;
