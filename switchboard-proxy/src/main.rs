//! AgentSwitchboard — a governance reverse proxy between autonomous LLM
//! agents and their model providers.
//!
//! Startup sequencing: observability first, then configuration, then
//! storage backends, then the embedder warm-up (the proxy does not accept
//! traffic before `ready()` completes), then background tasks, then the
//! listener. Shutdown drains the recorder buffer through a unified
//! cancellation token.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use switchboard_core::embedding::{Embedder, HashEmbedder};
use switchboard_core::store::{KvStore, MemoryKv, MemoryStore, PgStore, RedisKv, TraceStore};
use switchboard_core::SwitchboardConfig;
use switchboard_proxy::build_router;
use switchboard_proxy::state::AppState;

/// Command-line options. Everything else comes from environment
/// variables, see `SwitchboardConfig`.
#[derive(Parser, Debug)]
#[command(author, version, about = "Semantic firewall and traffic control for LLM agents")]
struct Cli {
    /// Bind address.
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    /// Listen port; overrides the PORT environment variable.
    #[arg(short, long)]
    port: Option<u16>,

    /// Policy document path; overrides POLICIES_CONFIG_PATH.
    #[arg(long, env = "POLICIES_CONFIG_PATH")]
    policies: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Phase 1: observability. Non-blocking writer so logging never stalls
    // the runtime; the guard must live for the whole program.
    let (non_blocking, _guard) = tracing_appender::non_blocking(std::io::stdout());
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .json()
        .with_writer(non_blocking)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    let cli = Cli::parse();
    let mut config = SwitchboardConfig::from_env();
    if let Some(port) = cli.port {
        config.port = port;
    }
    if cli.policies.is_some() {
        config.policies_config_path = cli.policies.clone();
    }

    // Phase 2: storage backends. Either side can run in-memory for
    // development and tests; production wires Redis and TimescaleDB.
    let kv: Arc<dyn KvStore> = match config.redis_url.as_deref() {
        Some(url) => {
            info!(url, "Connecting to Redis");
            Arc::new(RedisKv::connect(url).await?)
        }
        None => {
            warn!("REDIS_URL not set, using in-memory KV store");
            Arc::new(MemoryKv::new())
        }
    };
    let store: Arc<dyn TraceStore> = match config.timescale_url.as_deref() {
        Some(url) => {
            info!("Connecting to TimescaleDB");
            Arc::new(PgStore::connect(url).await?)
        }
        None => {
            warn!(
                token = %config.demo_org_token,
                "TIMESCALE_URL not set, using in-memory store with a demo organisation"
            );
            Arc::new(MemoryStore::with_demo_org(&config.demo_org_token).await)
        }
    };

    // Phase 3: embedder warm-up gates traffic.
    let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new());
    embedder.ready().await?;

    let bind = format!("{}:{}", cli.bind, config.port);
    info!(
        bind = %bind,
        shadow_mode = config.shadow_mode,
        emergency_stop = config.emergency_stop_enabled,
        lock_ttl_secs = config.lock_ttl.as_secs(),
        cache_ttl_secs = config.cache_ttl.as_secs(),
        "AgentSwitchboard starting"
    );

    // Phase 4: wire components and background tasks.
    let state = AppState::build(config, kv, store, embedder).await?;
    let shutdown = CancellationToken::new();
    state.spawn_background(shutdown.clone());
    spawn_signal_handlers(shutdown.clone());

    state.mark_ready();
    let app = build_router(state.clone());

    // Phase 5: serve until cancelled.
    let listener = TcpListener::bind(&bind).await?;
    info!(addr = %bind, "Listening");
    let serve_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            serve_shutdown.cancelled().await;
            info!("Listener shutting down");
        })
        .await?;

    // Phase 6: final drain. The flush task performs its own drain on
    // cancellation; give it a moment to finish.
    shutdown.cancel();
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    let remaining = state.recorder.buffered().await;
    if remaining > 0 {
        warn!(remaining, "Shut down with unflushed traces");
    } else {
        info!("Shutdown complete");
    }
    Ok(())
}

/// SIGINT and SIGTERM both begin a graceful shutdown.
fn spawn_signal_handlers(shutdown: CancellationToken) {
    let sigint_shutdown = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received SIGINT, initiating graceful shutdown");
                sigint_shutdown.cancel();
            }
            Err(e) => error!(error = %e, "Failed to listen for SIGINT"),
        }
    });

    #[cfg(unix)]
    tokio::spawn(async move {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received SIGTERM, initiating graceful shutdown");
                shutdown.cancel();
            }
            Err(e) => error!(error = %e, "Failed to listen for SIGTERM"),
        }
    });
}
