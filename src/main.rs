use agentlink::api::{create_router, OAuthAppState};
use agentlink::auth::StaticTokenAuthenticator;
use agentlink::clock::{Clock, SystemClock};
use agentlink::config;
use agentlink::credentials::{CredentialStore, SecretCipher, SqliteGateway};
use agentlink::flow::OAuthFlowOrchestrator;
use agentlink::oauth1::OAuth1Client;
use agentlink::rate_limit::{run_limiter_sweep, FixedWindowLimiter};
use agentlink::token_cache::{run_cache_sweep, TemporaryTokenCache};
use anyhow::{Context, Result};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agentlink=info".into()),
        )
        .init();

    info!("AgentLink starting...");

    let config_path =
        std::env::var("AGENTLINK_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
    let config = config::load(&config_path).context("Failed to load configuration")?;

    info!(
        bind_addr = %config.server.bind_addr,
        database_path = %config.server.database_path,
        environment = ?config.encryption.environment,
        "Configuration loaded"
    );

    if config.auth.tokens.is_empty() {
        warn!("No bearer tokens configured; every management request will be rejected");
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let cipher = SecretCipher::new(
        &config.encryption.master_secret,
        config.encryption.environment,
    )
    .context("Failed to initialize secret cipher")?;

    let gateway = Arc::new(
        SqliteGateway::open(&config.server.database_path)
            .context("Failed to open credential database")?,
    );

    let token_cache = Arc::new(TemporaryTokenCache::new(
        chrono::Duration::seconds(config.token_cache.ttl_seconds),
        Arc::clone(&clock),
    ));
    let credential_store = Arc::new(CredentialStore::new(
        gateway,
        cipher,
        Arc::clone(&token_cache),
    ));
    info!("Credential store initialized");

    let limiter = Arc::new(FixedWindowLimiter::new(
        chrono::Duration::seconds(config.rate_limit.window_seconds),
        config.rate_limit.max_requests,
        Arc::clone(&clock),
    ));

    let platform = Arc::new(
        OAuth1Client::new(&config.platform).context("Failed to initialize platform client")?,
    );

    let flow = Arc::new(OAuthFlowOrchestrator::new(
        Arc::clone(&credential_store),
        limiter.clone(),
        platform,
        config.platform.callback_base_url.clone(),
    ));

    // Background sweeps for expired cache entries and limiter windows
    tokio::spawn(run_cache_sweep(
        Arc::clone(&token_cache),
        config.token_cache.sweep_interval_seconds,
    ));
    tokio::spawn(run_limiter_sweep(
        Arc::clone(&limiter),
        config.rate_limit.sweep_interval_seconds,
    ));

    let state = OAuthAppState {
        flow,
        authenticator: Arc::new(StaticTokenAuthenticator::from_config(&config.auth)),
        app_redirect_url: config.server.app_redirect_url.clone(),
    };
    let router = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind_addr))?;
    info!(addr = %config.server.bind_addr, "HTTP API listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    info!("AgentLink stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
