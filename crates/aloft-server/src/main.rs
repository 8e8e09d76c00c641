//! Aloft server binary — the main entry point for the PTT platform.
//!
//! Starts an axum HTTP server with structured logging, database initialization,
//! and graceful shutdown on SIGTERM/SIGINT.

use aloft_identity::{IdentityVerifier, KeySource, VerifierConfig};
use aloft_registrar::{PermissionRegistrar, RegistrarConfig};
use aloft_server::config;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let config = config::load_config(Some("config.toml"))
        .expect("failed to load configuration — the server cannot start without valid config");

    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let pool = aloft_db::create_pool(&config.database.path)
        .expect("failed to create database pool — check database.path in config");

    {
        let conn = pool
            .get()
            .expect("failed to get database connection for migrations");
        let applied = aloft_db::run_migrations(&conn).expect("failed to run database migrations");
        if applied > 0 {
            tracing::info!(count = applied, "applied database migrations");
        }
    }

    let key_source = match &config.identity.jwks_url {
        Some(jwks_url) => KeySource::Jwks { jwks_url: jwks_url.clone() },
        None => KeySource::Hmac {
            secret: config
                .identity
                .hmac_secret
                .clone()
                .expect("identity.hmac_secret or identity.jwks_url must be set"),
        },
    };
    let identity = IdentityVerifier::new(VerifierConfig {
        issuer: config.identity.issuer.clone(),
        audience: config.identity.audience.clone(),
        key_source,
        jwks_refresh_interval: Duration::from_secs(config.identity.jwks_refresh_interval_secs),
    });

    let registrar = PermissionRegistrar::spawn(RegistrarConfig {
        management_api_url: config.registrar.management_api_url.clone(),
        management_api_token: config.registrar.management_api_token.clone(),
        queue_capacity: config.registrar.queue_capacity,
    });

    let state = aloft_server::build_state(&config, pool, identity, registrar);
    let app = aloft_server::app(state).into_make_service_with_connect_info::<SocketAddr>();
    let addr = SocketAddr::new(config.server.host, config.server.port);

    tracing::info!(%addr, "starting aloft server");

    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind to address — is another process using this port?");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    tracing::info!("aloft server shut down");
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM signal for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
    }
}
