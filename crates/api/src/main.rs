use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use liverelay_api::{routes::create_router, AppState, BroadcastBackend, Config, SessionManager};
use liverelay_shared::{BroadcastChannel, MemoryBroadcast, RedisBroadcast};
use liverelay_worker::WebSocketLiveSource;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("liverelay=info,tower_http=info"));

    if std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        fmt().with_env_filter(filter).json().init();
    } else {
        fmt().with_env_filter(filter).init();
    }
}

/// Periodically stop sessions whose owner lost entitlement without a webhook
async fn entitlement_sweep(sessions: SessionManager, period: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {
                sessions.reconcile_entitlements().await;
            }
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = ?e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    init_tracing();

    let config = Config::from_env().context("Failed to load configuration")?;

    let broadcast: Arc<dyn BroadcastChannel> = match config.broadcast_backend {
        BroadcastBackend::Memory => Arc::new(MemoryBroadcast::new(config.broadcast_capacity)),
        BroadcastBackend::Redis => Arc::new(
            RedisBroadcast::connect(&config.redis_url)
                .await
                .context("Failed to connect to Redis")?,
        ),
    };
    let source = Arc::new(
        WebSocketLiveSource::new(&config.live_source_url).context("Invalid LIVE_SOURCE_URL")?,
    );

    if config.billing_webhook_secret.is_none() {
        tracing::warn!("BILLING_WEBHOOK_SECRET not set; billing webhooks are accepted unsigned");
    }

    let state = AppState::new(config.clone(), broadcast, source);
    let shutdown = CancellationToken::new();

    if let Some(period) = config.entitlement_recheck {
        tokio::spawn(entitlement_sweep(state.sessions.clone(), period, shutdown.clone()));
    }

    let app = create_router(state.clone());
    let listener = TcpListener::bind(&config.bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_address))?;

    tracing::info!(
        bind_address = %config.bind_address,
        broadcast_backend = state.broadcast.backend(),
        "LiveRelay API listening"
    );

    // Stopping sessions closes overlay sockets so the server can drain
    let sessions = state.sessions.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            sessions.stop_all().await;
            tracing::info!("All sessions stopped");
        })
        .await
        .context("Server error")?;

    shutdown.cancel();

    Ok(())
}
